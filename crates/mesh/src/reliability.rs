//! End-to-end reliable delivery for one tunnel endpoint.
//!
//! The sending half keeps a copy of every payload until the far endpoint
//! acknowledges its message id (MID). The receiving half hands payloads to the
//! client strictly in MID order, buffering up to [`LOOKAHEAD`] ids ahead.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::flow_control::is_pid_bigger;
use crate::substrate::TaskId;

/// How far past the next expected MID the receiver buffers.
pub const LOOKAHEAD: u32 = 64;

/// Unacknowledged outbound payload
#[derive(Debug, Clone)]
pub struct SentCopy {
    pub mid: u32,
    pub timestamp: Instant,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct BufferedCopy {
    mid: u32,
    payload: Vec<u8>,
}

/// Outcome of feeding a received payload to the reassembly buffer
#[derive(Debug, PartialEq, Eq)]
pub enum Receipt {
    /// Payloads to hand to the client, in order
    Deliver(Vec<(u32, Vec<u8>)>),
    /// Stored until the gap before it fills
    Buffered,
    /// Already seen or outside the lookahead window
    Dropped,
}

/// Reliability context of one endpoint
#[derive(Debug)]
pub struct Reliability {
    sent: VecDeque<SentCopy>,
    mid_sent: u32,
    recv: VecDeque<BufferedCopy>,
    mid_recv: u32,
    /// Smoothed round-trip estimate
    pub expected_delay: Duration,
    /// Delay used for the next retransmission
    pub retry_timer: Duration,
    /// Pending retransmission
    pub retry_task: Option<TaskId>,
}

impl Reliability {
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            sent: VecDeque::new(),
            mid_sent: 0,
            recv: VecDeque::new(),
            mid_recv: 0,
            expected_delay: initial_delay,
            retry_timer: initial_delay,
            retry_task: None,
        }
    }

    /// Keep a copy of an outbound payload and return the MID it travels with.
    pub fn register_sent(&mut self, payload: Vec<u8>, now: Instant) -> u32 {
        let mid = self.mid_sent;
        self.mid_sent = self.mid_sent.wrapping_add(1);
        self.sent.push_back(SentCopy { mid, timestamp: now, payload });
        mid
    }

    pub fn pending(&self) -> usize {
        self.sent.len()
    }

    pub fn oldest_unacked(&self) -> Option<&SentCopy> {
        self.sent.front()
    }

    /// Restart the clock of the oldest copy after sending it again.
    pub fn mark_retransmitted(&mut self, now: Instant) {
        if let Some(copy) = self.sent.front_mut() {
            copy.timestamp = now;
        }
    }

    pub fn next_expected(&self) -> u32 {
        self.mid_recv
    }

    pub fn buffered(&self) -> usize {
        self.recv.len()
    }

    /// Accept an inbound payload.
    pub fn receive(&mut self, mid: u32, payload: Vec<u8>) -> Receipt {
        let in_window = !is_pid_bigger(self.mid_recv, mid)
            && is_pid_bigger(self.mid_recv.wrapping_add(LOOKAHEAD), mid);
        if !in_window {
            debug!("MID {} outside window {}+{}, dropping", mid, self.mid_recv, LOOKAHEAD);
            return Receipt::Dropped;
        }

        if mid != self.mid_recv {
            return self.buffer(mid, payload);
        }

        let mut delivered = vec![(mid, payload)];
        self.mid_recv = self.mid_recv.wrapping_add(1);
        while let Some(front) = self.recv.front() {
            if front.mid != self.mid_recv {
                break;
            }
            if let Some(copy) = self.recv.pop_front() {
                delivered.push((copy.mid, copy.payload));
                self.mid_recv = self.mid_recv.wrapping_add(1);
            }
        }
        Receipt::Deliver(delivered)
    }

    fn buffer(&mut self, mid: u32, payload: Vec<u8>) -> Receipt {
        let slot = self.recv.iter().position(|copy| !is_pid_bigger(mid, copy.mid));
        match slot {
            Some(i) if self.recv[i].mid == mid => Receipt::Dropped,
            Some(i) => {
                self.recv.insert(i, BufferedCopy { mid, payload });
                Receipt::Buffered
            }
            None => {
                self.recv.push_back(BufferedCopy { mid, payload });
                Receipt::Buffered
            }
        }
    }

    /// Last in-order MID plus the bitmask of buffered ids past it.
    ///
    /// Bit `i` stands for MID `last + 1 + i`.
    pub fn data_ack(&self) -> (u32, u64) {
        let last = self.mid_recv.wrapping_sub(1);
        let mut futures = 0u64;
        for copy in &self.recv {
            let delta = copy.mid.wrapping_sub(self.mid_recv);
            if delta < 64 {
                futures |= 1u64 << delta;
            }
        }
        (last, futures)
    }

    /// Drop every copy covered by an acknowledgment and return how many went.
    ///
    /// Safe to apply repeatedly: copies are matched by MID, so a duplicate or
    /// reordered acknowledgment frees nothing twice.
    pub fn acknowledge(&mut self, last: u32, futures: u64, now: Instant) -> usize {
        let mut freed = 0;

        while let Some(front) = self.sent.front() {
            if is_pid_bigger(front.mid, last) {
                break;
            }
            if let Some(copy) = self.sent.pop_front() {
                self.observe(now.saturating_duration_since(copy.timestamp));
                freed += 1;
            }
        }

        for bit in 0..64u32 {
            if futures & (1u64 << bit) == 0 {
                continue;
            }
            let target = last.wrapping_add(bit).wrapping_add(1);
            if let Some(i) = self.sent.iter().position(|copy| copy.mid == target) {
                if let Some(copy) = self.sent.remove(i) {
                    self.observe(now.saturating_duration_since(copy.timestamp));
                    freed += 1;
                }
            }
        }

        freed
    }

    fn observe(&mut self, rtt: Duration) {
        self.expected_delay = (self.expected_delay * 7 + rtt) / 8;
        self.retry_timer = self.expected_delay;
    }

    /// Delay for a retransmission timer armed from scratch.
    pub fn initial_retry_delay(&self, margin: u32) -> Duration {
        self.expected_delay * margin
    }

    /// Delay until the oldest copy is due, measured from `now`.
    pub fn rearm_delay(&self, margin: u32, now: Instant) -> Option<Duration> {
        let head = self.sent.front()?;
        let due = head.timestamp + self.retry_timer * margin;
        Some(due.saturating_duration_since(now))
    }

    /// Exponential backoff after a retransmission.
    pub fn back_off(&mut self, ceiling: Duration) {
        let base = self.retry_timer.max(Duration::from_millis(1));
        self.retry_timer = (base * 2).min(ceiling);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel() -> Reliability {
        Reliability::new(Duration::from_secs(1))
    }

    fn mids(receipt: Receipt) -> Vec<u32> {
        match receipt {
            Receipt::Deliver(items) => items.into_iter().map(|(mid, _)| mid).collect(),
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[test]
    fn test_in_order_delivery() {
        let mut r = rel();
        assert_eq!(mids(r.receive(0, b"a".to_vec())), vec![0]);
        assert_eq!(mids(r.receive(1, b"b".to_vec())), vec![1]);
        assert_eq!(r.next_expected(), 2);
    }

    #[test]
    fn test_gap_is_buffered_then_drained() {
        let mut r = rel();
        assert_eq!(mids(r.receive(0, vec![0])), vec![0]);
        assert_eq!(r.receive(3, vec![3]), Receipt::Buffered);
        assert_eq!(r.receive(2, vec![2]), Receipt::Buffered);
        assert_eq!(r.buffered(), 2);

        let (last, futures) = r.data_ack();
        assert_eq!(last, 0);
        // MIDs 2 and 3 sit at bits 1 and 2
        assert_eq!(futures, 0b110);

        assert_eq!(mids(r.receive(1, vec![1])), vec![1, 2, 3]);
        assert_eq!(r.buffered(), 0);
        assert_eq!(r.data_ack(), (3, 0));
    }

    #[test]
    fn test_duplicates_and_out_of_window_are_dropped() {
        let mut r = rel();
        assert_eq!(mids(r.receive(0, vec![0])), vec![0]);
        assert_eq!(r.receive(0, vec![0]), Receipt::Dropped);
        assert_eq!(r.receive(5, vec![5]), Receipt::Buffered);
        assert_eq!(r.receive(5, vec![5]), Receipt::Dropped);
        assert_eq!(r.receive(1 + LOOKAHEAD, vec![]), Receipt::Dropped);
        assert_eq!(r.receive(LOOKAHEAD, vec![]), Receipt::Buffered);
    }

    #[test]
    fn test_initial_data_ack_acknowledges_nothing() {
        let mut sender = rel();
        let now = Instant::now();
        sender.register_sent(vec![0], now);

        let receiver = rel();
        let (last, futures) = receiver.data_ack();
        assert_eq!(last, u32::MAX);
        assert_eq!(sender.acknowledge(last, futures, now), 0);
        assert_eq!(sender.pending(), 1);
    }

    #[test]
    fn test_acknowledge_is_idempotent() {
        let mut r = rel();
        let now = Instant::now();
        for i in 0..6u8 {
            r.register_sent(vec![i], now);
        }

        // 0 and 1 in order, 3 and 5 out of order
        let futures = (1 << 1) | (1 << 3);
        assert_eq!(r.acknowledge(1, futures, now), 4);
        assert_eq!(r.pending(), 2);
        assert_eq!(r.acknowledge(1, futures, now), 0);
        assert_eq!(r.pending(), 2);
        assert_eq!(r.oldest_unacked().map(|c| c.mid), Some(2));

        // An older acknowledgment arriving late changes nothing
        assert_eq!(r.acknowledge(0, 0, now), 0);
        assert_eq!(r.acknowledge(4, 0, now), 2);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_rtt_estimate_and_backoff() {
        let mut r = rel();
        let start = Instant::now();
        r.register_sent(vec![], start);
        r.acknowledge(0, 0, start + Duration::from_millis(200));

        // (1000 * 7 + 200) / 8
        assert_eq!(r.expected_delay, Duration::from_millis(900));
        assert_eq!(r.retry_timer, Duration::from_millis(900));
        assert_eq!(r.initial_retry_delay(4), Duration::from_millis(3600));

        r.back_off(Duration::from_secs(1));
        assert_eq!(r.retry_timer, Duration::from_secs(1));
    }

    #[test]
    fn test_rearm_delay_tracks_oldest_copy() {
        let mut r = rel();
        let start = Instant::now();
        assert!(r.rearm_delay(4, start).is_none());
        r.register_sent(vec![], start);
        assert_eq!(r.rearm_delay(4, start + Duration::from_secs(1)), Some(Duration::from_secs(3)));
        assert_eq!(r.rearm_delay(4, start + Duration::from_secs(9)), Some(Duration::ZERO));
    }
}
