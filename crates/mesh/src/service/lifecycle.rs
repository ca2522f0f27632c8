//! Tunnel establishment, repair and teardown, plus the link-layer and
//! discovery events that drive them.

use tracing::{debug, info, trace, warn};

use super::transmit::PayloadKind;
use super::MeshService;
use crate::client::ClientEvent;
use crate::error::{MeshError, MeshResult};
use crate::path::Path;
use crate::peer_id::{PeerHandle, PeerIdentity};
use crate::substrate::{Discovery, Scheduler, TimerEvent};
use crate::tunnel::{Direction, TunnelEvent, TunnelId, TunnelState};
use crate::wire::{DataMessage, WireMessage};

/// Wrap a payload in the variant for its direction of travel.
pub(super) fn data_message(direction: Direction, data: DataMessage) -> WireMessage {
    match direction {
        Direction::Forward => WireMessage::DataForward(data),
        Direction::Backward => WireMessage::DataBackward(data),
    }
}

impl<S: Scheduler, D: Discovery> MeshService<S, D> {
    /// Establish along the best usable path, or ask discovery for one.
    pub(super) fn connect_tunnel(&mut self, tid: TunnelId) {
        let Some(tunnel) = self.tunnels.get(&tid) else {
            return;
        };
        if tunnel.is_destroying() {
            return;
        }
        let dest = tunnel.dest;
        match self.registry.best_connected_path(&mut self.peers, dest) {
            Some(path) => {
                if let Err(e) = self.send_path_create(tid, path) {
                    warn!("Tunnel {} could not use its path: {}", tid, e);
                }
            }
            None => self.start_lookup(dest),
        }
    }

    fn start_lookup(&mut self, peer: PeerHandle) {
        let Some(identity) = self.peers.resolve(peer) else {
            return;
        };
        let replication = self.config.dht_replication_level;
        let Some(record) = self.registry.get_mut(peer) else {
            return;
        };
        if record.lookup.is_some() {
            return;
        }
        record.lookup = Some(self.discovery.start_lookup(&identity, replication));
        debug!("Looking up paths to {}", identity);
    }

    fn send_path_create(&mut self, tid: TunnelId, path: Path) -> MeshResult<()> {
        let wire = match self.wire_id(tid) {
            Ok(wire) => wire,
            Err(e) => {
                path.release(&mut self.peers);
                return Err(e);
            }
        };
        self.reset_hop_state(tid);
        let hops = path.identities(&self.peers);
        let Some(tunnel) = self.tunnels.get_mut(&tid) else {
            path.release(&mut self.peers);
            return Err(MeshError::UnknownTunnel(tid.to_string()));
        };
        tunnel.use_path(&mut self.peers, path, self.me)?;
        tunnel.transition(TunnelEvent::PathSelected)?;
        let message = WireMessage::PathCreate {
            tunnel: wire,
            port: tunnel.port,
            options: tunnel.options,
            hops,
        };
        debug!("Tunnel {} establishing over {} hops", tid, tunnel.path.as_ref().map_or(0, |p| p.len()));
        self.send_control(tid, Direction::Forward, message);
        Ok(())
    }

    /// Owner side: drop the current path and establish again.
    pub(super) fn reconnect(&mut self, tid: TunnelId) {
        self.reset_hop_state(tid);
        let Some(tunnel) = self.tunnels.get_mut(&tid) else {
            return;
        };
        if tunnel.is_destroying() {
            return;
        }
        tunnel.clear_path(&mut self.peers);
        if let Err(e) = tunnel.transition(TunnelEvent::PathLost) {
            warn!("Tunnel {}: {}", tid, e);
            return;
        }
        info!("Tunnel {} lost its path, reconnecting", tid);
        self.connect_tunnel(tid);
    }

    /// Retry establishment of local tunnels still looking for a path.
    pub(super) fn retry_searching(&mut self, dest: Option<PeerHandle>) {
        let searching: Vec<TunnelId> = self
            .tunnels
            .values()
            .filter(|t| t.state() == TunnelState::Searching && self.is_local_owner(t.id))
            .filter(|t| dest.map_or(true, |d| t.dest == d))
            .map(|t| t.id)
            .collect();
        for tid in searching {
            self.connect_tunnel(tid);
        }
    }

    /// Notify local endpoints, tell every hop but `except`, and free once drained.
    pub(super) fn tear_down(&mut self, tid: TunnelId, except: Option<PeerHandle>) {
        let Ok(wire) = self.wire_id(tid) else {
            return;
        };
        let Some(tunnel) = self.tunnels.get_mut(&tid) else {
            return;
        };
        if tunnel.is_destroying() {
            return;
        }
        for client in [tunnel.owner.take(), tunnel.client.take()].into_iter().flatten() {
            self.clients.notify(client, ClientEvent::TunnelDestroyed { tunnel: tid });
        }
        let next = tunnel.next_hop;
        let prev = tunnel.prev_hop;
        if let Err(e) = tunnel.transition(TunnelEvent::DestroyRequested) {
            warn!("Tunnel {}: {}", tid, e);
        }
        self.abandon_queued(tid);
        if next.is_some() && next != except {
            self.send_control(tid, Direction::Forward, WireMessage::TunnelDestroy { tunnel: wire });
        }
        if prev.is_some() && prev != except {
            self.send_control(tid, Direction::Backward, WireMessage::TunnelDestroy { tunnel: wire });
        }
        info!("Tunnel {} destroyed", tid);
        self.free_if_drained(tid);
    }

    pub(super) fn free_if_drained(&mut self, tid: TunnelId) {
        let drained = self
            .tunnels
            .get(&tid)
            .map(|t| t.is_destroying() && t.pending_messages == 0)
            .unwrap_or(false);
        if drained {
            self.free_tunnel(tid);
        }
    }

    /// Remove a tunnel, cancelling its timers and queued messages.
    pub(super) fn free_tunnel(&mut self, tid: TunnelId) {
        let Some(mut tunnel) = self.tunnels.remove(&tid) else {
            return;
        };
        let tasks = [
            tunnel.next_fc.poll_task.take(),
            tunnel.prev_fc.poll_task.take(),
            tunnel.maintenance_task.take(),
            tunnel.fwd_rel.as_mut().and_then(|rel| rel.retry_task.take()),
            tunnel.bck_rel.as_mut().and_then(|rel| rel.retry_task.take()),
        ];
        for task in tasks.into_iter().flatten() {
            self.scheduler.cancel(task);
        }
        for hop in [tunnel.next_hop, tunnel.prev_hop].into_iter().flatten() {
            if let Some(record) = self.registry.get_mut(hop) {
                record.queue.remove_tunnel(tid);
            }
        }
        if let Some(record) = self.registry.get_mut(tunnel.dest) {
            record.tunnels.retain(|t| *t != tid);
            if record.tunnels.is_empty() {
                if let Some(lookup) = record.lookup.take() {
                    self.discovery.stop_lookup(lookup);
                }
            }
        }
        tunnel.release(&mut self.peers);
        self.metrics.set_tunnels(self.tunnels.len());
        debug!("Tunnel {} freed", tid);
    }

    /// Relays and destinations restart the silence timer on any tunnel traffic.
    pub(super) fn touch_tunnel(&mut self, tid: TunnelId) {
        if self.is_local_owner(tid) {
            return;
        }
        let timeout = self.config.tunnel_timeout();
        let Some(tunnel) = self.tunnels.get_mut(&tid) else {
            return;
        };
        if tunnel.is_destroying() {
            return;
        }
        if let Some(task) = tunnel.maintenance_task.take() {
            self.scheduler.cancel(task);
        }
        tunnel.maintenance_task = Some(self.scheduler.schedule(timeout, TimerEvent::Timeout { tunnel: tid }));
    }

    pub(super) fn keepalive_expired(&mut self, tid: TunnelId) {
        let interval = self.config.refresh_path_interval();
        let Ok(wire) = self.wire_id(tid) else {
            return;
        };
        let Some(tunnel) = self.tunnels.get_mut(&tid) else {
            return;
        };
        tunnel.maintenance_task = Some(self.scheduler.schedule(interval, TimerEvent::Keepalive { tunnel: tid }));
        if tunnel.state() == TunnelState::Ready {
            trace!("Keepalive on tunnel {}", tid);
            self.send_control(tid, Direction::Forward, WireMessage::Keepalive { tunnel: wire });
        }
    }

    pub(super) fn tunnel_timed_out(&mut self, tid: TunnelId) {
        if let Some(tunnel) = self.tunnels.get_mut(&tid) {
            tunnel.maintenance_task = None;
        }
        warn!("Tunnel {} timed out", tid);
        self.tear_down(tid, None);
    }

    /// Send the oldest unacknowledged reliable payload again and back off.
    pub(super) fn retransmit_expired(&mut self, tid: TunnelId) {
        let ceiling = self.config.max_retransmit_interval();
        let ttl = self.config.default_ttl;
        let now = self.scheduler.now();
        let Ok(wire) = self.wire_id(tid) else {
            return;
        };
        let Some(tunnel) = self.tunnels.get_mut(&tid).filter(|t| !t.is_destroying()) else {
            return;
        };
        let direction = if tunnel.fwd_rel.is_some() { Direction::Forward } else { Direction::Backward };
        let hop = tunnel.downstream_hop(direction);
        let Some(rel) = tunnel.reliability_mut() else {
            return;
        };
        rel.retry_task = None;
        let Some(copy) = rel.oldest_unacked().cloned() else {
            return;
        };
        rel.back_off(ceiling);
        rel.retry_task = Some(self.scheduler.schedule(rel.retry_timer, TimerEvent::Retransmit { tunnel: tid }));

        let Some(hop) = hop else {
            debug!("Tunnel {} has no path, retransmission of mid {} deferred", tid, copy.mid);
            return;
        };
        let queued = self
            .registry
            .get(hop)
            .map(|record| record.queue.contains_data(tid, direction, copy.mid))
            .unwrap_or(false);
        if queued {
            trace!("Mid {} of tunnel {} still queued", copy.mid, tid);
            return;
        }
        rel.mark_retransmitted(now);

        let data = DataMessage { tunnel: wire, mid: copy.mid, ttl, pid: 0, payload: copy.payload };
        if self.send_payload(tid, direction, data_message(direction, data), PayloadKind::Retransmission) {
            self.metrics.record_retransmission();
            debug!("Retransmitting mid {} on tunnel {}", copy.mid, tid);
        }
    }

    /// Link layer reports a new direct neighbor.
    pub fn handle_peer_connected(&mut self, peer: &PeerIdentity) {
        if !self.running || *peer == self.identity {
            return;
        }
        let now = self.scheduler.now();
        let handle = self.registry.get_or_create(&mut self.peers, peer, now);
        if let Some(record) = self.registry.get_mut(handle) {
            record.connected = true;
            record.last_contact = now;
        }
        let direct = Path::from_identities(&mut self.peers, &[self.identity, *peer]);
        self.registry.add_path(&mut self.peers, handle, direct, self.me, true);
        info!("Link to {} up", peer);
        self.metrics.set_peers(self.registry.len());
        self.retry_searching(None);
    }

    /// Link layer reports a neighbor gone.
    pub fn handle_peer_disconnected(&mut self, peer: &PeerIdentity) {
        if !self.running {
            return;
        }
        let Some(handle) = self.peers.search(peer) else {
            return;
        };
        let Some(record) = self.registry.get_mut(handle) else {
            return;
        };
        record.connected = false;
        let token = record.queue.write.take();
        let entries = record.queue.drain();
        if let Some(token) = token {
            self.scheduler.cancel_write(token);
        }
        self.discard_entries(entries, "link_lost");
        let removed = self.registry.remove_edge(&mut self.peers, self.me, handle);
        info!("Link to {} down, {} paths dropped", peer, removed);

        let affected: Vec<TunnelId> = self
            .tunnels
            .values()
            .filter(|t| !t.is_destroying())
            .filter(|t| t.next_hop == Some(handle) || t.prev_hop == Some(handle))
            .map(|t| t.id)
            .collect();
        for tid in affected {
            let lost_next = self.tunnels.get(&tid).map(|t| t.next_hop == Some(handle)).unwrap_or(false);
            if !lost_next {
                // Lost the hop toward the owner; the silence timer cleans up
                continue;
            }
            if self.is_local_owner(tid) {
                self.reconnect(tid);
            } else if let Ok(wire) = self.wire_id(tid) {
                let broken = WireMessage::PathBroken { tunnel: wire, peer_a: self.identity, peer_b: *peer };
                self.send_control(tid, Direction::Backward, broken);
            }
        }

        let drained: Vec<TunnelId> = self
            .tunnels
            .values()
            .filter(|t| t.is_destroying() && t.pending_messages == 0)
            .map(|t| t.id)
            .collect();
        for tid in drained {
            self.free_tunnel(tid);
        }
    }

    /// Discovery found `peer`: learn the path and retry tunnels waiting on it.
    pub fn handle_lookup_result(&mut self, peer: &PeerIdentity, get_path: &[PeerIdentity], put_path: &[PeerIdentity]) {
        if !self.running {
            return;
        }
        let now = self.scheduler.now();
        let path = Path::from_discovery(&mut self.peers, &self.identity, get_path, put_path);
        debug!("Lookup for {} returned a {} hop path", peer, path.len());
        self.registry.add_path_to_peers(&mut self.peers, path, self.me, false, now);
        self.metrics.set_peers(self.registry.len());
        if let Some(handle) = self.peers.search(peer) {
            self.retry_searching(Some(handle));
        }
    }
}
