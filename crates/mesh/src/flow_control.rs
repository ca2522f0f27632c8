//! Per-hop, per-direction sliding window over payload ids (PIDs).
//!
//! Each tunnel keeps one [`FlowControl`] per side. The block on the side of
//! neighbor `N` records what we sent to `N`, what `N` sent to us, and the
//! admission values exchanged in both directions. When a side has no hop the
//! block stands for the local client attached there.

use std::time::Duration;

use crate::substrate::TaskId;

/// Serial-number comparison over the wrapping PID space.
pub fn is_pid_bigger(bigger: u32, smaller: u32) -> bool {
    let delta = bigger.wrapping_sub(smaller);
    delta != 0 && delta < (1 << 31)
}

/// Larger of two PIDs under wrap-around ordering.
pub fn max_pid(a: u32, b: u32) -> u32 {
    if is_pid_bigger(a, b) {
        a
    } else {
        b
    }
}

/// Flow control state for one tunnel toward one hop
#[derive(Debug, Clone)]
pub struct FlowControl {
    /// Last PID handed to the wire toward this hop
    pub last_pid_sent: u32,
    /// Last PID accepted from this hop
    pub last_pid_recv: u32,
    /// Highest PID we allowed this hop to send us
    pub last_ack_sent: u32,
    /// Highest PID this hop allowed us to send
    pub last_ack_recv: u32,
    /// Payload messages queued toward this hop
    pub queue_n: u32,
    /// Pending stall poll
    pub poll_task: Option<TaskId>,
    /// Current poll interval
    pub poll_time: Duration,
    /// Next admission must be sent even if unchanged
    pub force_ack: bool,
}

impl FlowControl {
    pub fn new(window: u32, poll_time: Duration) -> Self {
        let initial_ack = window.max(1) - 1;
        Self {
            last_pid_sent: u32::MAX,
            last_pid_recv: u32::MAX,
            last_ack_sent: initial_ack,
            last_ack_recv: initial_ack,
            queue_n: 0,
            poll_task: None,
            poll_time,
            force_ack: false,
        }
    }

    /// PID the next appended payload gets: everything queued holds the ids
    /// directly after the last one sent.
    pub fn next_queued_pid(&self) -> u32 {
        self.last_pid_sent.wrapping_add(self.queue_n).wrapping_add(1)
    }

    /// Whether `pid` falls inside the window the hop advertised to us.
    pub fn is_admitted(&self, pid: u32) -> bool {
        !is_pid_bigger(pid, self.last_ack_recv)
    }

    /// Whether the next PID we would send is blocked by the window.
    pub fn is_stalled(&self) -> bool {
        self.queue_n > 0 && !self.is_admitted(self.last_pid_sent.wrapping_add(1))
    }

    /// Whether `pid` from the hop exceeds what we admitted.
    pub fn is_unsolicited(&self, pid: u32) -> bool {
        is_pid_bigger(pid, self.last_ack_sent)
    }

    /// Whether `pid` from the hop is newer than anything seen.
    pub fn is_new(&self, pid: u32) -> bool {
        is_pid_bigger(pid, self.last_pid_recv)
    }

    /// Record an admission value from the hop. Returns true if it moved the window.
    pub fn apply_ack(&mut self, ack: u32, floor: Duration) -> bool {
        if !is_pid_bigger(ack, self.last_ack_recv) {
            return false;
        }
        self.last_ack_recv = ack;
        self.poll_time = floor;
        true
    }

    /// Adopt the PID a polling hop reports as last sent, if it is ahead of us.
    pub fn resync_from_poll(&mut self, pid: u32) {
        self.last_pid_recv = max_pid(pid, self.last_pid_recv);
    }

    /// Double the poll interval, capped.
    pub fn back_off_poll(&mut self, ceiling: Duration) {
        self.poll_time = (self.poll_time * 2).min(ceiling);
    }
}
