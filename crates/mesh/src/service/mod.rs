//! The mesh service: one instance per local peer.
//!
//! All state lives in [`MeshService`] and is mutated only from its entry
//! points: client calls, inbound messages, write opportunities, link events,
//! discovery results and timers. None of them block.

mod inbound;
mod lifecycle;
mod local;
mod transmit;

use std::collections::HashMap;

use icn_mesh_config::MeshConfig;
use tracing::{debug, info};

use crate::client::ClientRegistry;
use crate::error::{MeshError, MeshResult};
use crate::metrics::MeshMetrics;
use crate::peer::PeerRegistry;
use crate::peer_id::{PeerHandle, PeerIdentity, PeerTable};
use crate::substrate::{Discovery, Scheduler, TaskId, TimerEvent};
use crate::tunnel::{Tunnel, TunnelId};
use crate::wire::WireTunnelId;

pub use local::SendStatus;

/// Mesh service state for one local peer
pub struct MeshService<S: Scheduler, D: Discovery> {
    config: MeshConfig,
    identity: PeerIdentity,
    /// Reference held for the lifetime of the service
    me: PeerHandle,
    peers: PeerTable,
    registry: PeerRegistry,
    tunnels: HashMap<TunnelId, Tunnel>,
    clients: ClientRegistry,
    next_tunnel_number: u32,
    announce_task: Option<TaskId>,
    running: bool,
    scheduler: S,
    discovery: D,
    metrics: MeshMetrics,
}

impl<S: Scheduler, D: Discovery> MeshService<S, D> {
    /// Validate the configuration, register with the network layer and start
    /// announcing the local identity.
    pub fn start(config: MeshConfig, identity: PeerIdentity, mut scheduler: S, discovery: D) -> MeshResult<Self> {
        config.validate()?;
        scheduler.attach(&identity)?;
        let metrics = MeshMetrics::new()?;

        let mut peers = PeerTable::new();
        let me = peers.intern(&identity);
        let registry = PeerRegistry::new(config.max_peers);

        let mut service = Self {
            config,
            identity,
            me,
            peers,
            registry,
            tunnels: HashMap::new(),
            clients: ClientRegistry::new(),
            next_tunnel_number: 0,
            announce_task: None,
            running: true,
            scheduler,
            discovery,
            metrics,
        };
        service.announce();
        info!("Mesh service started as {}", service.identity);
        Ok(service)
    }

    /// Free every tunnel and peer record and drop the local identity.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        let tunnels: Vec<TunnelId> = self.tunnels.keys().copied().collect();
        for tid in tunnels {
            self.free_tunnel(tid);
        }
        for handle in self.registry.handles() {
            let Some(mut record) = self.registry.remove(handle) else {
                continue;
            };
            if let Some(lookup) = record.lookup.take() {
                self.discovery.stop_lookup(lookup);
            }
            if let Some(token) = record.queue.write.take() {
                self.scheduler.cancel_write(token);
            }
            PeerRegistry::release_record(&mut self.peers, record);
        }
        if let Some(task) = self.announce_task.take() {
            self.scheduler.cancel(task);
        }
        self.peers.release(self.me);
        self.metrics.set_tunnels(0);
        self.metrics.set_peers(0);
        info!("Mesh service {} stopped", self.identity);
    }

    /// Dispatch a fired timer. Timers whose owner moved on are ignored.
    pub fn handle_timer(&mut self, task: TaskId, event: TimerEvent) {
        if !self.running {
            return;
        }
        match event {
            TimerEvent::Poll { tunnel, direction } => {
                let current = self.tunnels.get(&tunnel).and_then(|t| t.downstream_fc(direction).poll_task);
                if current == Some(task) {
                    self.poll_expired(tunnel, direction);
                }
            }
            TimerEvent::Retransmit { tunnel } => {
                let current = self
                    .tunnels
                    .get(&tunnel)
                    .and_then(|t| t.reliability())
                    .and_then(|rel| rel.retry_task);
                if current == Some(task) {
                    self.retransmit_expired(tunnel);
                }
            }
            TimerEvent::Keepalive { tunnel } => {
                if self.tunnels.get(&tunnel).and_then(|t| t.maintenance_task) == Some(task) {
                    self.keepalive_expired(tunnel);
                }
            }
            TimerEvent::Timeout { tunnel } => {
                if self.tunnels.get(&tunnel).and_then(|t| t.maintenance_task) == Some(task) {
                    self.tunnel_timed_out(tunnel);
                }
            }
            TimerEvent::Announce => {
                if self.announce_task == Some(task) {
                    self.announce();
                }
            }
        }
    }

    fn announce(&mut self) {
        self.discovery.announce(&self.identity, self.config.dht_replication_level);
        let task = self.scheduler.schedule(self.config.id_announce_interval(), TimerEvent::Announce);
        self.announce_task = Some(task);
        debug!("Announced {}", self.identity);
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MeshMetrics {
        &self.metrics
    }

    pub fn peer_table(&self) -> &PeerTable {
        &self.peers
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn tunnel(&self, tid: TunnelId) -> Option<&Tunnel> {
        self.tunnels.get(&tid)
    }

    pub fn tunnel_ids(&self) -> Vec<TunnelId> {
        self.tunnels.keys().copied().collect()
    }

    /// Local tunnel matching a wire id, if known.
    pub fn find_tunnel(&self, wire: &WireTunnelId) -> Option<TunnelId> {
        let owner = self.peers.search(&wire.owner)?;
        let tid = TunnelId { owner, number: wire.number };
        self.tunnels.contains_key(&tid).then_some(tid)
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn wire_id(&self, tid: TunnelId) -> MeshResult<WireTunnelId> {
        let owner = self
            .peers
            .resolve(tid.owner)
            .ok_or_else(|| MeshError::InvalidHandle(format!("owner of tunnel {}", tid)))?;
        Ok(WireTunnelId { owner, number: tid.number })
    }

    fn tunnel_mut(&mut self, tid: TunnelId) -> MeshResult<&mut Tunnel> {
        self.tunnels.get_mut(&tid).ok_or_else(|| MeshError::UnknownTunnel(tid.to_string()))
    }

    /// Tunnels created by a local client
    fn is_local_owner(&self, tid: TunnelId) -> bool {
        tid.owner == self.me
    }
}
