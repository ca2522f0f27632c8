//! Messages arriving from neighbors.
//!
//! Every handler validates against local state first and reports anything
//! inconsistent as an error; [`MeshService::handle_message`] logs and drops it.

use tracing::{debug, info, trace, warn};

use super::lifecycle::data_message;
use super::transmit::{AckTrigger, PayloadKind};
use super::MeshService;
use crate::client::{ClientEvent, ClientId};
use crate::error::{MeshError, MeshResult};
use crate::path::Path;
use crate::peer_id::{PeerHandle, PeerIdentity};
use crate::reliability::{Receipt, Reliability};
use crate::substrate::{Discovery, Scheduler, TimerEvent};
use crate::tunnel::{Direction, Tunnel, TunnelEvent, TunnelId, TunnelOptions};
use crate::wire::{DataMessage, WireMessage, WireTunnelId};

impl<S: Scheduler, D: Discovery> MeshService<S, D> {
    /// Decode and dispatch a message received from a direct neighbor.
    pub fn handle_message(&mut self, from: &PeerIdentity, bytes: &[u8]) {
        if !self.running {
            return;
        }
        let message = match WireMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed message from {}: {}", from, e);
                self.metrics.record_dropped("malformed");
                return;
            }
        };
        let Some(sender) = self.peers.search(from).filter(|h| self.registry.get(*h).is_some()) else {
            debug!("Message from unknown neighbor {}", from);
            self.metrics.record_dropped("unknown_neighbor");
            return;
        };
        let now = self.scheduler.now();
        self.registry.touch(sender, now);
        let message_type = message.message_type();
        self.metrics.record_received(message_type);
        trace!("Received {:?} from {}", message_type, from);

        let result = match message {
            WireMessage::PathCreate { tunnel, port, options, hops } => {
                self.handle_path_create(sender, tunnel, port, options, hops)
            }
            WireMessage::PathAck { tunnel, origin, admission } => self.handle_path_ack(sender, tunnel, origin, admission),
            WireMessage::PathBroken { tunnel, peer_a, peer_b } => self.handle_path_broken(sender, tunnel, peer_a, peer_b),
            WireMessage::TunnelDestroy { tunnel } => self.handle_tunnel_destroy(sender, tunnel),
            WireMessage::DataForward(data) => self.handle_data(sender, data, Direction::Forward),
            WireMessage::DataBackward(data) => self.handle_data(sender, data, Direction::Backward),
            WireMessage::DataAck { tunnel, last_in_order, futures } => {
                self.handle_data_ack(sender, tunnel, last_in_order, futures)
            }
            WireMessage::Ack { tunnel, admission } => self.handle_ack(sender, tunnel, admission),
            WireMessage::Poll { tunnel, pid } => self.handle_poll(sender, tunnel, pid),
            WireMessage::Keepalive { tunnel } => self.handle_keepalive(sender, tunnel),
        };
        if let Err(e) = result {
            debug!("Dropping {:?} from {}: {}", message_type, from, e);
            self.metrics.record_dropped("protocol");
        }
    }

    fn known_tunnel(&self, wire: &WireTunnelId) -> MeshResult<TunnelId> {
        self.find_tunnel(wire)
            .ok_or_else(|| MeshError::UnknownTunnel(format!("{:?}", wire)))
    }

    /// Direction a message from `sender` travels in; fails unless it is a hop.
    fn travel_direction(&self, tid: TunnelId, sender: PeerHandle) -> MeshResult<Direction> {
        self.tunnels
            .get(&tid)
            .and_then(|t| t.direction_from(sender))
            .ok_or_else(|| MeshError::ProtocolViolation(format!("{:?} is not a hop of tunnel {}", sender, tid)))
    }

    fn expect_direction(&self, tid: TunnelId, sender: PeerHandle, expected: Direction) -> MeshResult<()> {
        if self.travel_direction(tid, sender)? != expected {
            return Err(MeshError::ProtocolViolation(format!(
                "{:?} message on tunnel {} from the wrong hop",
                expected, tid
            )));
        }
        Ok(())
    }

    fn handle_path_create(
        &mut self,
        sender: PeerHandle,
        wire: WireTunnelId,
        port: u32,
        options: TunnelOptions,
        hops: Vec<PeerIdentity>,
    ) -> MeshResult<()> {
        if hops.len() < 2 {
            return Err(MeshError::ProtocolViolation("path shorter than two hops".to_string()));
        }
        if hops[0] != wire.owner {
            return Err(MeshError::ProtocolViolation("path does not start at the tunnel owner".to_string()));
        }
        let position = hops
            .iter()
            .position(|hop| *hop == self.identity)
            .filter(|pos| *pos > 0)
            .ok_or_else(|| MeshError::ProtocolViolation("local peer not on path".to_string()))?;
        if self.peers.resolve(sender) != Some(hops[position - 1]) {
            return Err(MeshError::ProtocolViolation("sender is not the previous hop".to_string()));
        }

        let tid = match self.find_tunnel(&wire) {
            Some(tid) => {
                self.reset_hop_state(tid);
                tid
            }
            None => self.accept_tunnel(&wire, port, options, &hops)?,
        };

        let now = self.scheduler.now();
        let tunnel = self
            .tunnels
            .get_mut(&tid)
            .ok_or_else(|| MeshError::UnknownTunnel(tid.to_string()))?;
        let path = Path::from_identities(&mut self.peers, &hops);
        tunnel.use_path(&mut self.peers, path, self.me)?;
        tunnel.transition(TunnelEvent::PathSelected)?;
        let next_hop = tunnel.next_hop;
        let copies = tunnel
            .path
            .as_ref()
            .map(|p| (p.duplicate(&mut self.peers), p.duplicate(&mut self.peers)));
        if let Some((to_peers, to_origin)) = copies {
            self.registry.add_path_to_peers(&mut self.peers, to_peers, self.me, false, now);
            self.registry.add_path_to_origin(&mut self.peers, to_origin, self.me, false, now);
        }
        self.touch_tunnel(tid);

        let Some(next) = next_hop else {
            return self.bind_destination(tid, wire, port, options);
        };
        let next_connected = self.registry.get(next).map(|r| r.connected).unwrap_or(false);
        if !next_connected {
            let peer_b = self
                .peers
                .resolve(next)
                .ok_or_else(|| MeshError::InvalidHandle(format!("{:?}", next)))?;
            debug!("Tunnel {} next hop {} unreachable", tid, peer_b);
            let broken = WireMessage::PathBroken { tunnel: wire, peer_a: self.identity, peer_b };
            self.send_control(tid, Direction::Backward, broken);
            return Ok(());
        }
        self.send_control(tid, Direction::Forward, WireMessage::PathCreate { tunnel: wire, port, options, hops });
        Ok(())
    }

    fn accept_tunnel(
        &mut self,
        wire: &WireTunnelId,
        port: u32,
        options: TunnelOptions,
        hops: &[PeerIdentity],
    ) -> MeshResult<TunnelId> {
        if self.tunnels.len() >= self.config.max_tunnels as usize {
            return Err(MeshError::ProtocolViolation(format!("tunnel limit {} reached", self.config.max_tunnels)));
        }
        let dest_identity = hops
            .last()
            .ok_or_else(|| MeshError::ProtocolViolation("empty path".to_string()))?;
        let owner = self.peers.intern(&wire.owner);
        let dest = self.peers.intern(dest_identity);
        let tid = TunnelId { owner, number: wire.number };
        let tunnel = Tunnel::new(
            tid,
            port,
            options,
            dest,
            self.config.queue_max(),
            self.config.initial_poll_interval(),
        );
        self.tunnels.insert(tid, tunnel);
        self.metrics.set_tunnels(self.tunnels.len());
        debug!("Accepted tunnel {} from {}", tid, wire.owner);
        Ok(tid)
    }

    /// Last hop of a new path: hand the tunnel to the port's client or refuse it.
    fn bind_destination(
        &mut self,
        tid: TunnelId,
        wire: WireTunnelId,
        port: u32,
        options: TunnelOptions,
    ) -> MeshResult<()> {
        let listener = self.clients.client_for_port(port);
        let initial_retransmit = self.config.initial_retransmit_interval();
        let tunnel = self
            .tunnels
            .get_mut(&tid)
            .ok_or_else(|| MeshError::UnknownTunnel(tid.to_string()))?;

        let Some(client) = tunnel.client.or(listener) else {
            info!("No client on port {}, refusing tunnel {}", port, tid);
            self.tear_down(tid, None);
            return Ok(());
        };
        if tunnel.client.is_none() {
            tunnel.client = Some(client);
            if options.reliable && tunnel.bck_rel.is_none() {
                tunnel.bck_rel = Some(Reliability::new(initial_retransmit));
            }
            let event = ClientEvent::TunnelCreated { tunnel: tid, initiator: wire.owner, port, options };
            self.clients.notify(client, event);
            info!("Tunnel {} bound to {} on port {}", tid, client, port);
        }
        tunnel.transition(TunnelEvent::PathAcknowledged)?;
        let admission = tunnel.prev_fc.last_ack_sent;
        let ack = WireMessage::PathAck { tunnel: wire, origin: self.identity, admission };
        self.send_control(tid, Direction::Backward, ack);
        Ok(())
    }

    fn handle_path_ack(
        &mut self,
        sender: PeerHandle,
        wire: WireTunnelId,
        origin: PeerIdentity,
        admission: u32,
    ) -> MeshResult<()> {
        let tid = self.known_tunnel(&wire)?;
        self.expect_direction(tid, sender, Direction::Backward)?;
        let floor = self.config.initial_poll_interval();
        let now = self.scheduler.now();

        let tunnel = self
            .tunnels
            .get_mut(&tid)
            .ok_or_else(|| MeshError::UnknownTunnel(tid.to_string()))?;
        tunnel.transition(TunnelEvent::PathAcknowledged)?;
        let moved = tunnel.next_fc.apply_ack(admission, floor);
        let own_admission = tunnel.prev_fc.last_ack_sent;
        let dest = tunnel.dest;
        let confirmed = tunnel.path.as_ref().map(|p| p.duplicate(&mut self.peers));
        if let Some(path) = confirmed {
            self.registry.add_path_to_peers(&mut self.peers, path, self.me, true, now);
        }
        self.touch_tunnel(tid);
        if moved {
            self.kick_queue(sender);
        }

        if self.is_local_owner(tid) {
            if let Some(lookup) = self.registry.get_mut(dest).and_then(|r| r.lookup.take()) {
                self.discovery.stop_lookup(lookup);
            }
            info!("Tunnel {} ready", tid);
        } else {
            let ack = WireMessage::PathAck { tunnel: wire, origin, admission: own_admission };
            self.send_control(tid, Direction::Backward, ack);
        }
        Ok(())
    }

    fn handle_path_broken(
        &mut self,
        sender: PeerHandle,
        wire: WireTunnelId,
        peer_a: PeerIdentity,
        peer_b: PeerIdentity,
    ) -> MeshResult<()> {
        let tid = self.known_tunnel(&wire)?;
        self.expect_direction(tid, sender, Direction::Backward)?;
        if let (Some(a), Some(b)) = (self.peers.search(&peer_a), self.peers.search(&peer_b)) {
            self.registry.remove_edge(&mut self.peers, a, b);
        }
        self.touch_tunnel(tid);

        if self.is_local_owner(tid) {
            info!("Tunnel {} broken between {} and {}", tid, peer_a, peer_b);
            self.reconnect(tid);
        } else {
            self.send_control(tid, Direction::Backward, WireMessage::PathBroken { tunnel: wire, peer_a, peer_b });
        }
        Ok(())
    }

    fn handle_tunnel_destroy(&mut self, sender: PeerHandle, wire: WireTunnelId) -> MeshResult<()> {
        let Some(tid) = self.find_tunnel(&wire) else {
            debug!("Destroy for unknown tunnel {:?}", wire);
            return Ok(());
        };
        self.travel_direction(tid, sender)?;
        self.tear_down(tid, Some(sender));
        Ok(())
    }

    fn handle_data(&mut self, sender: PeerHandle, data: DataMessage, direction: Direction) -> MeshResult<()> {
        let tid = self.known_tunnel(&data.tunnel)?;
        self.expect_direction(tid, sender, direction)?;

        let tunnel = self
            .tunnels
            .get_mut(&tid)
            .ok_or_else(|| MeshError::UnknownTunnel(tid.to_string()))?;
        if tunnel.is_destroying() {
            trace!("Tunnel {} is going away, dropping pid {}", tid, data.pid);
            self.metrics.record_dropped("tunnel_destroyed");
            return Ok(());
        }
        let up = tunnel.upstream_fc_mut(direction);
        if !up.is_new(data.pid) {
            trace!("Duplicate pid {} on tunnel {}", data.pid, tid);
            self.metrics.record_dropped("duplicate");
            return Ok(());
        }
        if up.is_unsolicited(data.pid) {
            debug!("Pid {} on tunnel {} beyond admission {}", data.pid, tid, up.last_ack_sent);
            self.metrics.record_dropped("unsolicited");
            return Ok(());
        }
        up.last_pid_recv = data.pid;
        let down_hop = tunnel.downstream_hop(direction);
        let down_client = tunnel.downstream_client(direction);
        self.touch_tunnel(tid);

        match (down_hop, down_client) {
            (Some(_), _) => self.relay_data(tid, direction, data),
            (None, Some(client)) => self.deliver_data(tid, direction, client, data),
            (None, None) => {
                debug!("Tunnel {} has nowhere to deliver payload", tid);
                self.metrics.record_dropped("no_destination");
            }
        }
        Ok(())
    }

    fn relay_data(&mut self, tid: TunnelId, direction: Direction, mut data: DataMessage) {
        if data.ttl == 0 {
            debug!("TTL expired on tunnel {}", tid);
            self.metrics.record_dropped("ttl");
            self.send_ack(tid, direction, AckTrigger::Dropped);
            return;
        }
        data.ttl -= 1;
        self.send_payload(tid, direction, data_message(direction, data), PayloadKind::Normal);
        self.send_ack(tid, direction, AckTrigger::Data);
    }

    fn deliver_data(&mut self, tid: TunnelId, direction: Direction, client: ClientId, data: DataMessage) {
        let Some(tunnel) = self.tunnels.get_mut(&tid) else {
            return;
        };
        let wire = data.tunnel;
        let payloads = if tunnel.options.reliable {
            let Some(rel) = tunnel.reliability_mut() else {
                return;
            };
            let receipt = rel.receive(data.mid, data.payload);
            let (last_in_order, futures) = rel.data_ack();
            let payloads = match receipt {
                Receipt::Deliver(items) => items.into_iter().map(|(_, payload)| payload).collect(),
                Receipt::Buffered => {
                    trace!("Buffered mid {} on tunnel {}", data.mid, tid);
                    Vec::new()
                }
                Receipt::Dropped => {
                    self.metrics.record_dropped("duplicate_mid");
                    Vec::new()
                }
            };
            let data_ack = WireMessage::DataAck { tunnel: wire, last_in_order, futures };
            self.send_control(tid, direction.reverse(), data_ack);
            payloads
        } else {
            vec![data.payload]
        };

        for payload in payloads {
            if let Some(tunnel) = self.tunnels.get_mut(&tid) {
                let link = tunnel.downstream_fc_mut(direction);
                link.last_pid_sent = link.last_pid_sent.wrapping_add(1);
            }
            self.clients.notify(client, ClientEvent::Data { tunnel: tid, payload });
        }
        self.send_ack(tid, direction, AckTrigger::Data);
    }

    fn handle_data_ack(&mut self, sender: PeerHandle, wire: WireTunnelId, last: u32, futures: u64) -> MeshResult<()> {
        let tid = self.known_tunnel(&wire)?;
        let travel = self.travel_direction(tid, sender)?;
        let now = self.scheduler.now();
        let margin = self.config.retransmit_margin;
        self.touch_tunnel(tid);

        let tunnel = self
            .tunnels
            .get_mut(&tid)
            .ok_or_else(|| MeshError::UnknownTunnel(tid.to_string()))?;
        if tunnel.downstream_hop(travel).is_some() {
            self.send_control(tid, travel, WireMessage::DataAck { tunnel: wire, last_in_order: last, futures });
            return Ok(());
        }
        let destroying = tunnel.is_destroying();
        let rel = tunnel
            .reliability_mut()
            .ok_or_else(|| MeshError::ProtocolViolation(format!("data ack on unreliable tunnel {}", tid)))?;
        let freed = rel.acknowledge(last, futures, now);
        if freed == 0 {
            return Ok(());
        }
        trace!("Data ack freed {} copies on tunnel {}", freed, tid);
        if let Some(task) = rel.retry_task.take() {
            self.scheduler.cancel(task);
        }
        if destroying {
            return Ok(());
        }
        if let Some(delay) = rel.rearm_delay(margin, now) {
            rel.retry_task = Some(self.scheduler.schedule(delay, TimerEvent::Retransmit { tunnel: tid }));
        }
        Ok(())
    }

    fn handle_ack(&mut self, sender: PeerHandle, wire: WireTunnelId, admission: u32) -> MeshResult<()> {
        let tid = self.known_tunnel(&wire)?;
        // An admission from a hop governs the payload we send toward it
        let data_direction = self.travel_direction(tid, sender)?.reverse();
        let floor = self.config.initial_poll_interval();

        let tunnel = self
            .tunnels
            .get_mut(&tid)
            .ok_or_else(|| MeshError::UnknownTunnel(tid.to_string()))?;
        let fc = tunnel.downstream_fc_mut(data_direction);
        if !fc.apply_ack(admission, floor) {
            return Ok(());
        }
        if let Some(task) = fc.poll_task.take() {
            self.scheduler.cancel(task);
        }
        trace!("Tunnel {} {:?} admitted up to {}", tid, data_direction, admission);
        self.kick_queue(sender);
        self.send_ack(tid, data_direction, AckTrigger::Ack);
        Ok(())
    }

    fn handle_poll(&mut self, sender: PeerHandle, wire: WireTunnelId, pid: u32) -> MeshResult<()> {
        let tid = self.known_tunnel(&wire)?;
        let data_direction = self.travel_direction(tid, sender)?;
        let tunnel = self
            .tunnels
            .get_mut(&tid)
            .ok_or_else(|| MeshError::UnknownTunnel(tid.to_string()))?;
        tunnel.upstream_fc_mut(data_direction).resync_from_poll(pid);
        debug!("Poll on tunnel {} at pid {}", tid, pid);
        self.send_ack(tid, data_direction, AckTrigger::Poll);
        Ok(())
    }

    fn handle_keepalive(&mut self, sender: PeerHandle, wire: WireTunnelId) -> MeshResult<()> {
        let tid = self.known_tunnel(&wire)?;
        self.expect_direction(tid, sender, Direction::Forward)?;
        self.touch_tunnel(tid);
        if self.tunnels.get(&tid).and_then(|t| t.next_hop).is_some() {
            self.send_control(tid, Direction::Forward, WireMessage::Keepalive { tunnel: wire });
        }
        Ok(())
    }
}
