//! Outbound message queue toward one neighbor.
//!
//! Per-hop acknowledgments and polls jump to the head; everything else is
//! appended. Payload entries are held back until their PID is admitted by
//! the tunnel's flow control, which the caller checks through a predicate.

use std::collections::VecDeque;

use crate::substrate::WriteToken;
use crate::tunnel::{Direction, TunnelId};
use crate::wire::{MessageType, WireMessage};

/// One queued message
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub tunnel: TunnelId,
    /// Side of the tunnel the message leaves from
    pub direction: Direction,
    pub message: WireMessage,
    /// Encoded size
    pub size: usize,
}

impl QueueEntry {
    pub fn is_payload(&self) -> bool {
        self.message.message_type().is_payload()
    }

    pub fn pid(&self) -> Option<u32> {
        self.message.data().map(|data| data.pid)
    }
}

/// Queue toward one neighbor plus its outstanding write request
#[derive(Debug, Default)]
pub struct PeerQueue {
    entries: VecDeque<QueueEntry>,
    /// Write request handed to the scheduler, if any
    pub write: Option<WriteToken>,
}

impl PeerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue a message at the position its type calls for.
    pub fn push(&mut self, entry: QueueEntry) {
        match entry.message.message_type() {
            MessageType::Ack | MessageType::Poll => self.entries.push_front(entry),
            _ => self.entries.push_back(entry),
        }
    }

    /// Put a retransmitted payload ahead of queued payload of the same tunnel
    /// side. The entry must carry the lowest pending PID; the ones it passes
    /// move up by one.
    pub fn push_retransmission(&mut self, entry: QueueEntry) {
        let slot = self
            .entries
            .iter()
            .position(|queued| queued.is_payload() && queued.tunnel == entry.tunnel && queued.direction == entry.direction);
        let Some(slot) = slot else {
            self.entries.push_back(entry);
            return;
        };
        for queued in self.entries.iter_mut().skip(slot) {
            if queued.tunnel != entry.tunnel || queued.direction != entry.direction {
                continue;
            }
            if let Some(data) = queued.message.data_mut() {
                data.pid = data.pid.wrapping_add(1);
            }
        }
        self.entries.insert(slot, entry);
    }

    /// Index of the first entry that may go out now.
    pub fn next_sendable<F>(&self, mut admitted: F) -> Option<usize>
    where
        F: FnMut(&QueueEntry) -> bool,
    {
        self.entries.iter().position(|entry| !entry.is_payload() || admitted(entry))
    }

    pub fn get(&self, index: usize) -> Option<&QueueEntry> {
        self.entries.get(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<QueueEntry> {
        self.entries.remove(index)
    }

    /// Whether a payload with `mid` for this tunnel side is already waiting.
    pub fn contains_data(&self, tunnel: TunnelId, direction: Direction, mid: u32) -> bool {
        self.entries.iter().any(|entry| {
            entry.tunnel == tunnel
                && entry.direction == direction
                && entry.message.data().map(|data| data.mid) == Some(mid)
        })
    }

    /// Take every entry belonging to `tunnel`.
    pub fn remove_tunnel(&mut self, tunnel: TunnelId) -> Vec<QueueEntry> {
        let (removed, kept): (Vec<_>, Vec<_>) = self.entries.drain(..).partition(|entry| entry.tunnel == tunnel);
        self.entries = kept.into();
        removed
    }

    /// Take everything, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }
}
