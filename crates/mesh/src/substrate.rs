//! Interfaces the service consumes from its environment.
//!
//! The core never blocks and never owns a socket. It asks a [`Scheduler`]
//! for timers and write opportunities and a [`Discovery`] service for paths to
//! unknown peers; both call back into [`crate::MeshService`].

use std::time::{Duration, Instant};

use crate::error::MeshResult;
use crate::peer_id::PeerIdentity;
use crate::tunnel::{Direction, TunnelId};

/// Handle of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// Handle of an outstanding write request toward one neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteToken(pub u64);

/// Handle of a running discovery lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupHandle(pub u64);

/// What a timer was armed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Flow control on one side of a tunnel is stalled
    Poll { tunnel: TunnelId, direction: Direction },
    /// Oldest unacknowledged reliable payload is due
    Retransmit { tunnel: TunnelId },
    /// Owner refreshes the path
    Keepalive { tunnel: TunnelId },
    /// Relay or destination heard nothing from the owner
    Timeout { tunnel: TunnelId },
    /// Local identity is published again
    Announce,
}

/// Timers and the single-slot writer of the network layer
pub trait Scheduler {
    /// Register the local peer with the network layer.
    fn attach(&mut self, local: &PeerIdentity) -> MeshResult<()>;

    fn now(&self) -> Instant;

    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TaskId;

    fn cancel(&mut self, task: TaskId);

    /// Ask to be called back through `handle_write_ready` once at least
    /// `min_size` bytes can be written toward `neighbor`.
    fn request_write(&mut self, neighbor: &PeerIdentity, min_size: usize) -> MeshResult<WriteToken>;

    fn cancel_write(&mut self, token: WriteToken);
}

/// Asynchronous path discovery
pub trait Discovery {
    /// Start looking for paths to `peer`; results arrive through `handle_lookup_result`.
    fn start_lookup(&mut self, peer: &PeerIdentity, replication: u32) -> LookupHandle;

    fn stop_lookup(&mut self, handle: LookupHandle);

    /// Publish the local identity so others can find paths to it.
    fn announce(&mut self, local: &PeerIdentity, replication: u32);
}
