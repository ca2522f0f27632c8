//! Operations exposed to local clients.

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::lifecycle::data_message;
use super::transmit::{AckTrigger, PayloadKind};
use super::MeshService;
use crate::client::{ClientEvent, ClientId};
use crate::error::{MeshError, MeshResult};
use crate::flow_control::max_pid;
use crate::peer_id::PeerIdentity;
use crate::reliability::Reliability;
use crate::substrate::{Discovery, Scheduler, TimerEvent};
use crate::tunnel::{Tunnel, TunnelId, TunnelOptions};
use crate::wire::DataMessage;

/// Outcome of a client send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Accepted; reliable payloads are retried until acknowledged
    Queued,
    /// Refused by flow control or a full queue
    Dropped,
}

impl<S: Scheduler, D: Discovery> MeshService<S, D> {
    /// Register a client listening on `ports`. Events arrive on the returned receiver.
    pub fn connect_client(&mut self, ports: &[u32]) -> MeshResult<(ClientId, mpsc::UnboundedReceiver<ClientEvent>)> {
        self.clients.connect(ports)
    }

    /// Destroy every tunnel the client owns or terminates, then forget it.
    pub fn disconnect_client(&mut self, client: ClientId) -> MeshResult<()> {
        if !self.clients.contains(client) {
            return Err(MeshError::UnknownClient(client.0));
        }
        let affected: Vec<TunnelId> = self
            .tunnels
            .values()
            .filter(|t| t.owner == Some(client) || t.client == Some(client))
            .map(|t| t.id)
            .collect();
        for tid in affected {
            if let Some(tunnel) = self.tunnels.get_mut(&tid) {
                if tunnel.owner == Some(client) {
                    tunnel.owner = None;
                }
                if tunnel.client == Some(client) {
                    tunnel.client = None;
                }
            }
            self.tear_down(tid, None);
        }
        self.clients.disconnect(client)
    }

    /// Open a tunnel from `client` to `port` on `dest`.
    pub fn create_tunnel(
        &mut self,
        client: ClientId,
        dest: &PeerIdentity,
        port: u32,
        options: TunnelOptions,
    ) -> MeshResult<TunnelId> {
        if !self.running {
            return Err(MeshError::Substrate("service stopped".to_string()));
        }
        if !self.clients.contains(client) {
            return Err(MeshError::UnknownClient(client.0));
        }
        if *dest == self.identity {
            return Err(MeshError::InvalidArgument("tunnel to the local peer".to_string()));
        }
        if self.tunnels.len() >= self.config.max_tunnels as usize {
            return Err(MeshError::InvalidArgument(format!("tunnel limit {} reached", self.config.max_tunnels)));
        }

        let number = loop {
            let candidate = self.next_tunnel_number;
            self.next_tunnel_number = self.next_tunnel_number.wrapping_add(1);
            if !self.tunnels.contains_key(&TunnelId { owner: self.me, number: candidate }) {
                break candidate;
            }
        };
        let tid = TunnelId { owner: self.me, number };
        let now = self.scheduler.now();
        let dest_handle = self.registry.get_or_create(&mut self.peers, dest, now);
        self.peers.retain(dest_handle)?;
        self.peers.retain(self.me)?;

        let mut tunnel = Tunnel::new(
            tid,
            port,
            options,
            dest_handle,
            self.config.queue_max(),
            self.config.initial_poll_interval(),
        );
        tunnel.owner = Some(client);
        if options.reliable {
            tunnel.fwd_rel = Some(Reliability::new(self.config.initial_retransmit_interval()));
        }
        let keepalive = self.config.refresh_path_interval();
        tunnel.maintenance_task = Some(self.scheduler.schedule(keepalive, TimerEvent::Keepalive { tunnel: tid }));
        if let Some(record) = self.registry.get_mut(dest_handle) {
            record.tunnels.push(tid);
        }
        self.tunnels.insert(tid, tunnel);
        self.metrics.set_tunnels(self.tunnels.len());
        self.metrics.set_peers(self.registry.len());
        info!("{} created tunnel {} to {} port {}", client, tid, dest, port);

        self.connect_tunnel(tid);
        Ok(tid)
    }

    /// Close a tunnel the client is an endpoint of.
    pub fn destroy_tunnel(&mut self, client: ClientId, tid: TunnelId) -> MeshResult<()> {
        let tunnel = self.tunnel_mut(tid)?;
        match tunnel.client_direction(client) {
            Some(_) if tunnel.owner == Some(client) => tunnel.owner = None,
            Some(_) => tunnel.client = None,
            None => return Err(MeshError::NotParticipant(client.0, tid.to_string())),
        }
        self.tear_down(tid, None);
        Ok(())
    }

    /// Send a payload to the other end of the tunnel.
    pub fn send(&mut self, client: ClientId, tid: TunnelId, payload: Vec<u8>) -> MeshResult<SendStatus> {
        let now = self.scheduler.now();
        let margin = self.config.retransmit_margin;
        let max_pending = self.config.max_reliable_pending;
        let ttl = self.config.default_ttl;
        if !self.tunnels.contains_key(&tid) {
            return Err(MeshError::UnknownTunnel(tid.to_string()));
        }
        let wire = self.wire_id(tid)?;

        let tunnel = self
            .tunnels
            .get_mut(&tid)
            .ok_or_else(|| MeshError::UnknownTunnel(tid.to_string()))?;
        let direction = tunnel
            .client_direction(client)
            .ok_or_else(|| MeshError::NotParticipant(client.0, tid.to_string()))?;
        if tunnel.is_destroying() {
            return Ok(SendStatus::Dropped);
        }
        let reliable = tunnel.options.reliable;

        let (mid, admission) = if reliable {
            let rel = tunnel
                .reliability_mut()
                .ok_or_else(|| MeshError::ProtocolViolation(format!("tunnel {} lacks reliability state", tid)))?;
            if rel.pending() >= max_pending {
                debug!("{} has {} unacknowledged payloads on tunnel {}", client, rel.pending(), tid);
                self.metrics.record_dropped("reliable_window");
                return Ok(SendStatus::Dropped);
            }
            let mid = rel.register_sent(payload.clone(), now);
            if rel.retry_task.is_none() {
                let delay = rel.initial_retry_delay(margin);
                rel.retry_task = Some(self.scheduler.schedule(delay, TimerEvent::Retransmit { tunnel: tid }));
            }
            (mid, None)
        } else {
            let fc = tunnel.upstream_fc(direction);
            let pid = fc.last_pid_recv.wrapping_add(1);
            if fc.is_unsolicited(pid) {
                debug!("{} sent past its admission {} on tunnel {}", client, fc.last_ack_sent, tid);
                self.metrics.record_dropped("unsolicited");
                return Ok(SendStatus::Dropped);
            }
            (0, Some(pid))
        };

        let data = DataMessage { tunnel: wire, mid, ttl, pid: 0, payload };
        let kind = if reliable { PayloadKind::Exempt } else { PayloadKind::Normal };
        let queued = self.send_payload(tid, direction, data_message(direction, data), kind);
        if reliable {
            // A reliable copy is kept even without a hop and goes out on retransmission
            return Ok(SendStatus::Queued);
        }
        if !queued {
            return Ok(SendStatus::Dropped);
        }
        // The client's admission is spent only by a payload that made it into a queue
        if let (Some(pid), Some(tunnel)) = (admission, self.tunnels.get_mut(&tid)) {
            tunnel.upstream_fc_mut(direction).last_pid_recv = pid;
        }
        Ok(SendStatus::Queued)
    }

    /// The client consumed every delivery so far and can take one more.
    pub fn ack(&mut self, client: ClientId, tid: TunnelId) -> MeshResult<()> {
        let tunnel = self.tunnel_mut(tid)?;
        let direction = tunnel
            .client_direction(client)
            .ok_or_else(|| MeshError::NotParticipant(client.0, tid.to_string()))?;
        let link = tunnel.upstream_fc_mut(direction);
        link.last_ack_recv = max_pid(link.last_ack_recv, link.last_pid_sent.wrapping_add(1));
        self.send_ack(tid, direction.reverse(), AckTrigger::LocalAck);
        Ok(())
    }
}
