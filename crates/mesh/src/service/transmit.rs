//! Neighbor queues, write opportunities and per-hop admission.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use super::MeshService;
use crate::client::ClientEvent;
use crate::flow_control::{is_pid_bigger, max_pid, FlowControl};
use crate::peer_id::{PeerHandle, PeerIdentity};
use crate::queue::QueueEntry;
use crate::substrate::{Discovery, Scheduler, TimerEvent};
use crate::tunnel::{Direction, Tunnel, TunnelId};
use crate::wire::WireMessage;

/// What prompted an admission update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AckTrigger {
    /// Payload arrived from upstream
    Data,
    /// Payload left toward downstream
    Transmitted,
    /// Downstream admission moved
    Ack,
    /// Local client consumed a delivery
    LocalAck,
    /// Upstream asked for the current value
    Poll,
    /// Payload was discarded here
    Dropped,
}

/// How a payload competes for queue space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PayloadKind {
    /// Dropped when the tunnel's share of the queue is full
    Normal,
    /// Reliable data from a local client, never dropped here
    Exempt,
    /// Reliable copy sent again, placed ahead of queued payload
    Retransmission,
}

fn admitted(tunnels: &HashMap<TunnelId, Tunnel>, entry: &QueueEntry) -> bool {
    match (tunnels.get(&entry.tunnel), entry.pid()) {
        (Some(tunnel), Some(pid)) => tunnel.downstream_fc(entry.direction).is_admitted(pid),
        _ => true,
    }
}

impl<S: Scheduler, D: Discovery> MeshService<S, D> {
    /// Queue a control message toward the hop on the `direction` side.
    pub(super) fn send_control(&mut self, tid: TunnelId, direction: Direction, message: WireMessage) -> bool {
        let Some(hop) = self.tunnels.get(&tid).and_then(|t| t.downstream_hop(direction)) else {
            debug!("Tunnel {} has no {:?} hop for {:?}", tid, direction, message.message_type());
            return false;
        };
        self.enqueue(tid, direction, hop, message, None)
    }

    /// Queue a payload toward the hop on the `direction` side, assigning its PID.
    pub(super) fn send_payload(
        &mut self,
        tid: TunnelId,
        direction: Direction,
        message: WireMessage,
        kind: PayloadKind,
    ) -> bool {
        let Some(hop) = self.tunnels.get(&tid).and_then(|t| t.downstream_hop(direction)) else {
            debug!("Tunnel {} has no {:?} hop for payload", tid, direction);
            return false;
        };
        self.enqueue(tid, direction, hop, message, Some(kind))
    }

    fn enqueue(
        &mut self,
        tid: TunnelId,
        direction: Direction,
        hop: PeerHandle,
        mut message: WireMessage,
        kind: Option<PayloadKind>,
    ) -> bool {
        let Some(neighbor) = self.peers.resolve(hop) else {
            return false;
        };
        let Some(record) = self.registry.get_mut(hop).filter(|record| record.connected) else {
            debug!("{} is not connected, dropping {:?}", neighbor, message.message_type());
            self.metrics.record_dropped("not_connected");
            return false;
        };
        let Some(tunnel) = self.tunnels.get_mut(&tid) else {
            return false;
        };
        let size = match message.encoded_len() {
            Ok(size) => size,
            Err(e) => {
                warn!("Cannot size {:?} for tunnel {}: {}", message.message_type(), tid, e);
                return false;
            }
        };

        if let Some(kind) = kind {
            let queue_max = tunnel.queue_max;
            let fc = tunnel.downstream_fc_mut(direction);
            if fc.queue_n >= queue_max && kind == PayloadKind::Normal {
                debug!("Tunnel {} queue toward {} full, dropping payload", tid, neighbor);
                self.metrics.record_dropped("buffer_full");
                return false;
            }
            let pid = match kind {
                PayloadKind::Retransmission => fc.last_pid_sent.wrapping_add(1),
                _ => fc.next_queued_pid(),
            };
            if let Some(data) = message.data_mut() {
                data.pid = pid;
            }
            fc.queue_n += 1;
            if !fc.is_admitted(pid) && fc.poll_task.is_none() {
                let task = self.scheduler.schedule(fc.poll_time, TimerEvent::Poll { tunnel: tid, direction });
                fc.poll_task = Some(task);
            }
        }
        tunnel.pending_messages += 1;

        let entry = QueueEntry { tunnel: tid, direction, message, size };
        trace!("Queued {:?} for tunnel {} toward {}", entry.message.message_type(), tid, neighbor);
        if kind == Some(PayloadKind::Retransmission) {
            record.queue.push_retransmission(entry);
        } else {
            record.queue.push(entry);
        }
        if record.queue.write.is_none() {
            match self.scheduler.request_write(&neighbor, size) {
                Ok(token) => record.queue.write = Some(token),
                Err(e) => warn!("Write request toward {} failed: {}", neighbor, e),
            }
        }
        true
    }

    /// Fill `buf` with the next sendable message toward `neighbor`.
    ///
    /// Returns the number of bytes written. An empty buffer means the link
    /// went away and nothing is taken from the queue.
    pub fn handle_write_ready(&mut self, neighbor: &PeerIdentity, buf: &mut [u8]) -> usize {
        if !self.running {
            return 0;
        }
        let Some(hop) = self.peers.search(neighbor) else {
            return 0;
        };
        let Some(record) = self.registry.get_mut(hop) else {
            return 0;
        };
        record.queue.write = None;
        if buf.is_empty() {
            debug!("Write toward {} failed, link lost", neighbor);
            return 0;
        }

        let tunnels = &self.tunnels;
        let Some(index) = record.queue.next_sendable(|entry| admitted(tunnels, entry)) else {
            trace!("Nothing sendable toward {}", neighbor);
            return 0;
        };
        let size = record.queue.get(index).map(|entry| entry.size).unwrap_or(0);
        if size > buf.len() {
            match self.scheduler.request_write(neighbor, size) {
                Ok(token) => record.queue.write = Some(token),
                Err(e) => warn!("Write request toward {} failed: {}", neighbor, e),
            }
            return 0;
        }
        let Some(entry) = record.queue.remove(index) else {
            return 0;
        };

        let written = match entry.message.to_bytes() {
            Ok(bytes) if bytes.len() <= buf.len() => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                self.metrics.record_sent(entry.message.message_type());
                bytes.len()
            }
            Ok(bytes) => {
                warn!("Encoded {} bytes into a {} byte buffer, discarding", bytes.len(), buf.len());
                0
            }
            Err(e) => {
                warn!("Discarding unencodable message: {}", e);
                0
            }
        };
        trace!("Wrote {:?} ({} bytes) toward {}", entry.message.message_type(), written, neighbor);

        self.after_transmit(&entry);
        self.kick_queue(hop);
        written
    }

    fn after_transmit(&mut self, entry: &QueueEntry) {
        let tid = entry.tunnel;
        let direction = entry.direction;
        let Some(tunnel) = self.tunnels.get_mut(&tid) else {
            return;
        };
        tunnel.pending_messages = tunnel.pending_messages.saturating_sub(1);

        if let Some(pid) = entry.pid() {
            let fc = tunnel.downstream_fc_mut(direction);
            fc.last_pid_sent = pid;
            fc.queue_n = fc.queue_n.saturating_sub(1);
            if fc.queue_n == 0 {
                if let Some(task) = fc.poll_task.take() {
                    self.scheduler.cancel(task);
                }
            } else if fc.poll_task.is_none() && fc.is_stalled() {
                let task = self.scheduler.schedule(fc.poll_time, TimerEvent::Poll { tunnel: tid, direction });
                fc.poll_task = Some(task);
            }
            self.send_ack(tid, direction, AckTrigger::Transmitted);
        }
        self.free_if_drained(tid);
    }

    /// Ask for a write toward `hop` if something is sendable and none is pending.
    pub(super) fn kick_queue(&mut self, hop: PeerHandle) {
        let Some(neighbor) = self.peers.resolve(hop) else {
            return;
        };
        let Some(record) = self.registry.get_mut(hop) else {
            return;
        };
        if record.queue.write.is_some() || !record.connected {
            return;
        }
        let tunnels = &self.tunnels;
        let Some(size) = record
            .queue
            .next_sendable(|entry| admitted(tunnels, entry))
            .and_then(|index| record.queue.get(index))
            .map(|entry| entry.size)
        else {
            return;
        };
        match self.scheduler.request_write(&neighbor, size) {
            Ok(token) => record.queue.write = Some(token),
            Err(e) => warn!("Write request toward {} failed: {}", neighbor, e),
        }
    }

    /// Recompute the admission for payload flowing in `direction` and pass it
    /// upstream when it moved or must be repeated.
    pub(super) fn send_ack(&mut self, tid: TunnelId, direction: Direction, trigger: AckTrigger) {
        let Some(tunnel) = self.tunnels.get_mut(&tid) else {
            return;
        };
        if tunnel.options.no_buffer && matches!(trigger, AckTrigger::Data | AckTrigger::Transmitted) {
            return;
        }

        let queue_max = tunnel.queue_max;
        let down = tunnel.downstream_fc(direction);
        let down_queue = down.queue_n;
        let delta = match tunnel.downstream_hop(direction) {
            Some(_) => queue_max.saturating_sub(down_queue),
            // Local client: one more once it consumed everything delivered
            None => u32::from(is_pid_bigger(down.last_ack_recv, down.last_pid_sent)),
        };
        let up_hop = tunnel.upstream_hop(direction);
        let up_client = tunnel.upstream_client(direction);

        let up = tunnel.upstream_fc_mut(direction);
        let force = up.force_ack || matches!(trigger, AckTrigger::Poll | AckTrigger::Dropped);
        if !force && queue_max > down_queue.saturating_mul(4) && is_pid_bigger(up.last_ack_sent, up.last_pid_recv) {
            return;
        }
        let ack = max_pid(up.last_pid_recv.wrapping_add(delta), up.last_ack_sent);
        if ack == up.last_ack_sent && !force {
            return;
        }
        up.last_ack_sent = ack;
        up.force_ack = false;
        trace!("Tunnel {} {:?} admission {} ({:?})", tid, direction, ack, trigger);

        match (up_hop, up_client) {
            (Some(_), _) => {
                let Ok(wire) = self.wire_id(tid) else {
                    return;
                };
                self.send_control(tid, direction.reverse(), WireMessage::Ack { tunnel: wire, admission: ack });
            }
            (None, Some(client)) => {
                self.clients.notify(client, ClientEvent::Ack { tunnel: tid, admission: ack });
            }
            (None, None) => {}
        }
    }

    /// Stalled side of a tunnel asks its hop for a fresh admission.
    pub(super) fn poll_expired(&mut self, tid: TunnelId, direction: Direction) {
        let max_poll = self.config.max_poll_interval();
        let Ok(wire) = self.wire_id(tid) else {
            return;
        };
        let Some(tunnel) = self.tunnels.get_mut(&tid) else {
            return;
        };
        let destroying = tunnel.is_destroying();
        let fc = tunnel.downstream_fc_mut(direction);
        fc.poll_task = None;
        if fc.queue_n == 0 || destroying {
            return;
        }
        let pid = fc.last_pid_sent;
        fc.back_off_poll(max_poll);
        let task = self.scheduler.schedule(fc.poll_time, TimerEvent::Poll { tunnel: tid, direction });
        fc.poll_task = Some(task);

        debug!("Polling {:?} side of tunnel {} at pid {}", direction, tid, pid);
        self.metrics.record_poll();
        self.send_control(tid, direction, WireMessage::Poll { tunnel: wire, pid });
    }

    /// Forget per-hop state toward both current hops: queued entries go and
    /// the windows restart. Used when the path is rebuilt.
    pub(super) fn reset_hop_state(&mut self, tid: TunnelId) {
        let poll_time = self.config.initial_poll_interval();
        let Some(tunnel) = self.tunnels.get_mut(&tid) else {
            return;
        };
        let window = tunnel.queue_max;
        for direction in [Direction::Forward, Direction::Backward] {
            let Some(hop) = tunnel.downstream_hop(direction) else {
                continue;
            };
            let fc = tunnel.downstream_fc_mut(direction);
            if let Some(task) = fc.poll_task.take() {
                self.scheduler.cancel(task);
            }
            *fc = FlowControl::new(window, poll_time);
            if let Some(record) = self.registry.get_mut(hop) {
                let removed = record.queue.remove_tunnel(tid).len() as u32;
                tunnel.pending_messages = tunnel.pending_messages.saturating_sub(removed);
            }
        }
    }

    /// Drop everything queued for `tid` and stop its poll and retransmission
    /// timers. Nothing of a destroyed tunnel may wait on an admission.
    pub(super) fn abandon_queued(&mut self, tid: TunnelId) {
        let Some(tunnel) = self.tunnels.get_mut(&tid) else {
            return;
        };
        let tasks = [
            tunnel.next_fc.poll_task.take(),
            tunnel.prev_fc.poll_task.take(),
            tunnel.fwd_rel.as_mut().and_then(|rel| rel.retry_task.take()),
            tunnel.bck_rel.as_mut().and_then(|rel| rel.retry_task.take()),
        ];
        let hops = [tunnel.next_hop, tunnel.prev_hop];
        for task in tasks.into_iter().flatten() {
            self.scheduler.cancel(task);
        }
        let mut entries = Vec::new();
        for hop in hops.into_iter().flatten() {
            if let Some(record) = self.registry.get_mut(hop) {
                entries.extend(record.queue.remove_tunnel(tid));
            }
        }
        if !entries.is_empty() {
            debug!("Tunnel {} abandons {} queued messages", tid, entries.len());
        }
        self.discard_entries(entries, "tunnel_destroyed");
    }

    /// Undo the bookkeeping of queue entries that will never be written.
    pub(super) fn discard_entries(&mut self, entries: Vec<QueueEntry>, reason: &str) {
        for entry in entries {
            let Some(tunnel) = self.tunnels.get_mut(&entry.tunnel) else {
                continue;
            };
            tunnel.pending_messages = tunnel.pending_messages.saturating_sub(1);
            if entry.is_payload() {
                let fc = tunnel.downstream_fc_mut(entry.direction);
                fc.queue_n = fc.queue_n.saturating_sub(1);
                self.metrics.record_dropped(reason);
            }
        }
    }
}
