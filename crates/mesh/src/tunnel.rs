//! Tunnel state: identity, chosen path, per-side flow control and the
//! reliability context of a local endpoint.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::ClientId;
use crate::error::{MeshError, MeshResult};
use crate::flow_control::FlowControl;
use crate::path::Path;
use crate::peer_id::{PeerHandle, PeerTable};
use crate::reliability::Reliability;
use crate::substrate::TaskId;

/// Tunnel id in terms of the local interning table
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelId {
    pub owner: PeerHandle,
    pub number: u32,
}

impl fmt::Debug for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.number)
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.number)
    }
}

/// Direction of payload travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Owner toward destination
    Forward,
    /// Destination toward owner
    Backward,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

/// Options chosen by the owning client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOptions {
    /// Retransmit until acknowledged and deliver in order
    pub reliable: bool,
    /// Relays hold at most one payload per direction
    pub no_buffer: bool,
}

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// No path known yet
    Searching,
    /// Path chosen, establishment not yet acknowledged
    Waiting,
    /// Acknowledged, payload flows
    Ready,
    /// Freed once its queued messages drain
    Destroying,
}

/// Events that move a tunnel between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEvent {
    PathSelected,
    PathAcknowledged,
    PathLost,
    DestroyRequested,
}

/// One tunnel as seen by this peer: owner, relay or destination
#[derive(Debug)]
pub struct Tunnel {
    pub id: TunnelId,
    pub port: u32,
    pub options: TunnelOptions,
    state: TunnelState,
    /// Destination peer
    pub dest: PeerHandle,
    pub path: Option<Path>,
    /// Neighbor toward the destination, none at the destination
    pub next_hop: Option<PeerHandle>,
    /// Neighbor toward the owner, none at the owner
    pub prev_hop: Option<PeerHandle>,
    pub next_fc: FlowControl,
    pub prev_fc: FlowControl,
    /// Owner endpoint reliability
    pub fwd_rel: Option<Reliability>,
    /// Destination endpoint reliability
    pub bck_rel: Option<Reliability>,
    /// Client that created the tunnel
    pub owner: Option<ClientId>,
    /// Client bound at the destination
    pub client: Option<ClientId>,
    /// Queue entries not yet written
    pub pending_messages: u32,
    /// Admission window per side
    pub queue_max: u32,
    /// Keepalive at the owner, timeout elsewhere
    pub maintenance_task: Option<TaskId>,
}

impl Tunnel {
    /// The caller hands over one reference each on `id.owner` and `dest`.
    pub fn new(
        id: TunnelId,
        port: u32,
        options: TunnelOptions,
        dest: PeerHandle,
        queue_max: u32,
        poll_time: Duration,
    ) -> Self {
        let queue_max = if options.no_buffer { 1 } else { queue_max.max(1) };
        Self {
            id,
            port,
            options,
            state: TunnelState::Searching,
            dest,
            path: None,
            next_hop: None,
            prev_hop: None,
            next_fc: FlowControl::new(queue_max, poll_time),
            prev_fc: FlowControl::new(queue_max, poll_time),
            fwd_rel: None,
            bck_rel: None,
            owner: None,
            client: None,
            pending_messages: 0,
            queue_max,
            maintenance_task: None,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn is_destroying(&self) -> bool {
        self.state == TunnelState::Destroying
    }

    /// Apply a lifecycle event.
    pub fn transition(&mut self, event: TunnelEvent) -> MeshResult<TunnelState> {
        let next = match (self.state, event) {
            (TunnelState::Destroying, TunnelEvent::DestroyRequested) => TunnelState::Destroying,
            (TunnelState::Destroying, _) => {
                return Err(MeshError::InvalidTransition { from: self.state, event });
            }
            (_, TunnelEvent::DestroyRequested) => TunnelState::Destroying,
            (_, TunnelEvent::PathSelected) => TunnelState::Waiting,
            (TunnelState::Searching, TunnelEvent::PathAcknowledged) => {
                return Err(MeshError::InvalidTransition { from: self.state, event });
            }
            (_, TunnelEvent::PathAcknowledged) => TunnelState::Ready,
            (_, TunnelEvent::PathLost) => TunnelState::Searching,
        };
        if next != self.state {
            debug!("Tunnel {} {:?} -> {:?}", self.id, self.state, next);
        }
        self.state = next;
        Ok(next)
    }

    /// At most one of owner/prev_hop and at most one of client/next_hop.
    pub fn check_endpoints(&self) -> bool {
        !(self.owner.is_some() && self.prev_hop.is_some())
            && !(self.client.is_some() && self.next_hop.is_some())
    }

    /// Direction of payload arriving from `hop`.
    pub fn direction_from(&self, hop: PeerHandle) -> Option<Direction> {
        if self.prev_hop == Some(hop) {
            Some(Direction::Forward)
        } else if self.next_hop == Some(hop) {
            Some(Direction::Backward)
        } else {
            None
        }
    }

    /// Neighbor payload in `direction` is sent to.
    pub fn downstream_hop(&self, direction: Direction) -> Option<PeerHandle> {
        match direction {
            Direction::Forward => self.next_hop,
            Direction::Backward => self.prev_hop,
        }
    }

    /// Neighbor payload in `direction` comes from.
    pub fn upstream_hop(&self, direction: Direction) -> Option<PeerHandle> {
        self.downstream_hop(direction.reverse())
    }

    /// Local client payload in `direction` is delivered to.
    pub fn downstream_client(&self, direction: Direction) -> Option<ClientId> {
        match direction {
            Direction::Forward => self.client,
            Direction::Backward => self.owner,
        }
    }

    /// Local client payload in `direction` originates from.
    pub fn upstream_client(&self, direction: Direction) -> Option<ClientId> {
        self.downstream_client(direction.reverse())
    }

    /// Flow control toward the side payload in `direction` goes to.
    pub fn downstream_fc(&self, direction: Direction) -> &FlowControl {
        match direction {
            Direction::Forward => &self.next_fc,
            Direction::Backward => &self.prev_fc,
        }
    }

    pub fn downstream_fc_mut(&mut self, direction: Direction) -> &mut FlowControl {
        match direction {
            Direction::Forward => &mut self.next_fc,
            Direction::Backward => &mut self.prev_fc,
        }
    }

    /// Flow control toward the side payload in `direction` comes from.
    pub fn upstream_fc(&self, direction: Direction) -> &FlowControl {
        self.downstream_fc(direction.reverse())
    }

    pub fn upstream_fc_mut(&mut self, direction: Direction) -> &mut FlowControl {
        self.downstream_fc_mut(direction.reverse())
    }

    /// Direction a local client sends in, if it is an endpoint of this tunnel.
    pub fn client_direction(&self, client: ClientId) -> Option<Direction> {
        if self.owner == Some(client) {
            Some(Direction::Forward)
        } else if self.client == Some(client) {
            Some(Direction::Backward)
        } else {
            None
        }
    }

    /// Reliability context of whichever endpoint this peer is.
    pub fn reliability_mut(&mut self) -> Option<&mut Reliability> {
        match (&mut self.fwd_rel, &mut self.bck_rel) {
            (Some(rel), _) => Some(rel),
            (None, Some(rel)) => Some(rel),
            (None, None) => None,
        }
    }

    pub fn reliability(&self) -> Option<&Reliability> {
        self.fwd_rel.as_ref().or(self.bck_rel.as_ref())
    }

    /// Adopt `path`, deriving both hops from the local position on it.
    pub fn use_path(&mut self, table: &mut PeerTable, path: Path, local: PeerHandle) -> MeshResult<()> {
        let Some(pos) = path.position(local) else {
            let err = MeshError::ProtocolViolation(format!("local peer not on path for tunnel {}", self.id));
            path.release(table);
            return Err(err);
        };
        let next = path.hops().get(pos + 1).copied();
        let prev = if pos > 0 { path.hops().get(pos - 1).copied() } else { None };

        self.clear_path(table);
        for hop in [next, prev].into_iter().flatten() {
            if let Err(e) = table.retain(hop) {
                path.release(table);
                return Err(e);
            }
        }
        self.next_hop = next;
        self.prev_hop = prev;
        self.path = Some(path);
        Ok(())
    }

    /// Forget the path and both hops.
    pub fn clear_path(&mut self, table: &mut PeerTable) {
        if let Some(path) = self.path.take() {
            path.release(table);
        }
        if let Some(hop) = self.next_hop.take() {
            table.release(hop);
        }
        if let Some(hop) = self.prev_hop.take() {
            table.release(hop);
        }
    }

    /// Return every peer reference the tunnel holds.
    pub fn release(mut self, table: &mut PeerTable) {
        self.clear_path(table);
        table.release(self.dest);
        table.release(self.id.owner);
    }
}
