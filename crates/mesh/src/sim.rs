//! Deterministic in-memory network of mesh services.
//!
//! Every node gets a [`SimNode`] as both its scheduler and its discovery
//! service. Timers, write opportunities, deliveries and lookup answers are
//! events on one virtual clock, processed in (time, sequence) order. The
//! shared state is never borrowed while a service runs.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use icn_mesh_config::MeshConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::client::{ClientEvent, ClientId};
use crate::error::{MeshError, MeshResult};
use crate::peer_id::PeerIdentity;
use crate::service::{MeshService, SendStatus};
use crate::substrate::{Discovery, LookupHandle, Scheduler, TaskId, TimerEvent, WriteToken};
use crate::tunnel::{TunnelId, TunnelOptions};
use crate::wire::{WireMessage, MAX_MESSAGE_SIZE};

/// Delay before a scripted lookup answer arrives
pub const LOOKUP_DELAY: Duration = Duration::from_millis(50);

/// Returns true to drop a message written from one node toward another
pub type DropRule = Box<dyn FnMut(usize, usize, &WireMessage) -> bool>;

type EventKey = (Duration, u64);

#[derive(Debug)]
enum SimEvent {
    Timer { node: usize, task: TaskId, event: TimerEvent },
    WriteReady { node: usize, neighbor: usize },
    Deliver { from: usize, to: usize, bytes: Vec<u8> },
    LookupResult { node: usize, peer: PeerIdentity, get_path: Vec<PeerIdentity>, put_path: Vec<PeerIdentity> },
}

type Answer = (Vec<PeerIdentity>, Vec<PeerIdentity>);

#[derive(Debug, Default)]
struct SimState {
    clock: Duration,
    seq: u64,
    events: BTreeMap<EventKey, SimEvent>,
    /// Task, token and lookup ids to their pending event
    pending: HashMap<u64, EventKey>,
    identities: Vec<PeerIdentity>,
    /// Directed links with their latency
    links: HashMap<(usize, usize), Duration>,
    /// One-shot lookup answers per (node, sought peer)
    answers: HashMap<(usize, PeerIdentity), VecDeque<Answer>>,
    lookups: Vec<(usize, PeerIdentity)>,
    announcements: usize,
}

impl SimState {
    fn push(&mut self, delay: Duration, event: SimEvent) -> u64 {
        self.seq += 1;
        let key = (self.clock + delay, self.seq);
        self.events.insert(key, event);
        self.pending.insert(self.seq, key);
        self.seq
    }

    fn cancel(&mut self, id: u64) {
        if let Some(key) = self.pending.remove(&id) {
            self.events.remove(&key);
        }
    }

    fn pop(&mut self, until: Duration) -> Option<SimEvent> {
        let key = *self.events.keys().next()?;
        if key.0 > until {
            return None;
        }
        self.clock = key.0;
        self.pending.remove(&key.1);
        self.events.remove(&key)
    }

    fn node_of(&self, identity: &PeerIdentity) -> Option<usize> {
        self.identities.iter().position(|id| id == identity)
    }
}

/// Scheduler and discovery adapter for one simulated node
#[derive(Debug, Clone)]
pub struct SimNode {
    node: usize,
    base: Instant,
    state: Rc<RefCell<SimState>>,
}

impl Scheduler for SimNode {
    fn attach(&mut self, local: &PeerIdentity) -> MeshResult<()> {
        let state = self.state.borrow();
        match state.identities.get(self.node) {
            Some(id) if id == local => Ok(()),
            _ => Err(MeshError::Substrate(format!("{} is not node {}", local, self.node))),
        }
    }

    fn now(&self) -> Instant {
        self.base + self.state.borrow().clock
    }

    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TaskId {
        let mut state = self.state.borrow_mut();
        // The id is the event's own sequence number
        let id = state.seq + 1;
        state.push(delay, SimEvent::Timer { node: self.node, task: TaskId(id), event });
        TaskId(id)
    }

    fn cancel(&mut self, task: TaskId) {
        self.state.borrow_mut().cancel(task.0);
    }

    fn request_write(&mut self, neighbor: &PeerIdentity, _min_size: usize) -> MeshResult<WriteToken> {
        let mut state = self.state.borrow_mut();
        let target = state
            .node_of(neighbor)
            .filter(|target| state.links.contains_key(&(self.node, *target)))
            .ok_or_else(|| MeshError::Substrate(format!("no link from node {} to {}", self.node, neighbor)))?;
        let id = state.push(Duration::ZERO, SimEvent::WriteReady { node: self.node, neighbor: target });
        Ok(WriteToken(id))
    }

    fn cancel_write(&mut self, token: WriteToken) {
        self.state.borrow_mut().cancel(token.0);
    }
}

impl Discovery for SimNode {
    fn start_lookup(&mut self, peer: &PeerIdentity, _replication: u32) -> LookupHandle {
        let mut state = self.state.borrow_mut();
        state.lookups.push((self.node, *peer));
        let answer = state.answers.get_mut(&(self.node, *peer)).and_then(|queue| queue.pop_front());
        match answer {
            Some((get_path, put_path)) => {
                let event = SimEvent::LookupResult { node: self.node, peer: *peer, get_path, put_path };
                LookupHandle(state.push(LOOKUP_DELAY, event))
            }
            None => {
                state.seq += 1;
                LookupHandle(state.seq)
            }
        }
    }

    fn stop_lookup(&mut self, handle: LookupHandle) {
        self.state.borrow_mut().cancel(handle.0);
    }

    fn announce(&mut self, _local: &PeerIdentity, _replication: u32) {
        self.state.borrow_mut().announcements += 1;
    }
}

struct ClientLog {
    node: usize,
    client: ClientId,
    receiver: mpsc::UnboundedReceiver<ClientEvent>,
    events: Vec<ClientEvent>,
    auto_ack: bool,
}

/// Counters kept by the simulator itself
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub written: usize,
    pub delivered: usize,
    pub dropped_by_rule: usize,
    pub lost: usize,
}

/// A network of simulated mesh services
pub struct Sim {
    base: Instant,
    state: Rc<RefCell<SimState>>,
    nodes: Vec<MeshService<SimNode, SimNode>>,
    clients: Vec<ClientLog>,
    drop_rules: Vec<DropRule>,
    loss: f64,
    rng: StdRng,
    stats: SimStats,
}

impl Sim {
    pub fn new(seed: u64) -> Self {
        Self {
            base: Instant::now(),
            state: Rc::new(RefCell::new(SimState::default())),
            nodes: Vec::new(),
            clients: Vec::new(),
            drop_rules: Vec::new(),
            loss: 0.0,
            rng: StdRng::seed_from_u64(seed),
            stats: SimStats::default(),
        }
    }

    /// Start a service on a new node and return its index.
    pub fn add_node(&mut self, config: MeshConfig) -> MeshResult<usize> {
        let node = self.nodes.len();
        let identity = PeerIdentity::from_seed(node as u32 + 1);
        self.state.borrow_mut().identities.push(identity);
        let adapter = SimNode { node, base: self.base, state: Rc::clone(&self.state) };
        match MeshService::start(config, identity, adapter.clone(), adapter) {
            Ok(service) => {
                self.nodes.push(service);
                Ok(node)
            }
            Err(e) => {
                self.state.borrow_mut().identities.pop();
                Err(e)
            }
        }
    }

    pub fn identity(&self, node: usize) -> PeerIdentity {
        self.state.borrow().identities[node]
    }

    pub fn service(&self, node: usize) -> &MeshService<SimNode, SimNode> {
        &self.nodes[node]
    }

    pub fn service_mut(&mut self, node: usize) -> &mut MeshService<SimNode, SimNode> {
        &mut self.nodes[node]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Virtual time since the simulation started
    pub fn elapsed(&self) -> Duration {
        self.state.borrow().clock
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }

    /// Bring up a bidirectional link and tell both services.
    pub fn link(&mut self, a: usize, b: usize, latency: Duration) {
        {
            let mut state = self.state.borrow_mut();
            state.links.insert((a, b), latency);
            state.links.insert((b, a), latency);
        }
        let (id_a, id_b) = (self.identity(a), self.identity(b));
        self.nodes[a].handle_peer_connected(&id_b);
        self.nodes[b].handle_peer_connected(&id_a);
        self.pump_clients();
    }

    /// Cut a link; messages in flight on it are lost.
    pub fn unlink(&mut self, a: usize, b: usize) {
        {
            let mut state = self.state.borrow_mut();
            state.links.remove(&(a, b));
            state.links.remove(&(b, a));
        }
        let (id_a, id_b) = (self.identity(a), self.identity(b));
        self.nodes[a].handle_peer_disconnected(&id_b);
        self.nodes[b].handle_peer_disconnected(&id_a);
        self.pump_clients();
    }

    /// Answer the next lookup `node` starts for `dest` with the path
    /// `node -> via... -> dest`.
    pub fn script_lookup(&mut self, node: usize, dest: usize, via: &[usize]) {
        let dest_id = self.identity(dest);
        let mut get_path: Vec<PeerIdentity> = via.iter().map(|n| self.identity(*n)).collect();
        get_path.push(dest_id);
        get_path.reverse();
        self.state
            .borrow_mut()
            .answers
            .entry((node, dest_id))
            .or_default()
            .push_back((get_path, vec![dest_id]));
    }

    /// Lookups `node` has started so far
    pub fn lookups_started(&self, node: usize) -> usize {
        self.state.borrow().lookups.iter().filter(|(n, _)| *n == node).count()
    }

    pub fn announcements(&self) -> usize {
        self.state.borrow().announcements
    }

    /// Randomly lose this fraction of payload messages.
    pub fn set_loss(&mut self, rate: f64) {
        self.loss = rate.clamp(0.0, 1.0);
    }

    pub fn add_drop_rule(&mut self, rule: DropRule) {
        self.drop_rules.push(rule);
    }

    /// Connect a client on `node`; with `auto_ack` every delivery is acknowledged.
    pub fn connect_client(&mut self, node: usize, ports: &[u32], auto_ack: bool) -> MeshResult<ClientId> {
        let (client, receiver) = self.nodes[node].connect_client(ports)?;
        self.clients.push(ClientLog { node, client, receiver, events: Vec::new(), auto_ack });
        Ok(client)
    }

    pub fn create_tunnel(
        &mut self,
        node: usize,
        client: ClientId,
        dest: usize,
        port: u32,
        options: TunnelOptions,
    ) -> MeshResult<TunnelId> {
        let dest_id = self.identity(dest);
        let tid = self.nodes[node].create_tunnel(client, &dest_id, port, options)?;
        self.pump_clients();
        Ok(tid)
    }

    pub fn send(&mut self, node: usize, client: ClientId, tunnel: TunnelId, payload: Vec<u8>) -> MeshResult<SendStatus> {
        let status = self.nodes[node].send(client, tunnel, payload)?;
        self.pump_clients();
        Ok(status)
    }

    /// Every event a client has received so far
    pub fn client_events(&self, node: usize, client: ClientId) -> Vec<ClientEvent> {
        self.clients
            .iter()
            .filter(|log| log.node == node && log.client == client)
            .flat_map(|log| log.events.iter().cloned())
            .collect()
    }

    /// Payloads delivered to a client, in delivery order
    pub fn delivered(&self, node: usize, client: ClientId) -> Vec<Vec<u8>> {
        self.client_events(node, client)
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Data { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    /// Process one event. Returns false when none is due by `until`.
    fn step(&mut self, until: Duration) -> bool {
        let event = self.state.borrow_mut().pop(until);
        let Some(event) = event else {
            return false;
        };
        match event {
            SimEvent::Timer { node, task, event } => self.nodes[node].handle_timer(task, event),
            SimEvent::WriteReady { node, neighbor } => self.write(node, neighbor),
            SimEvent::Deliver { from, to, bytes } => {
                let linked = self.state.borrow().links.contains_key(&(from, to));
                if linked {
                    self.stats.delivered += 1;
                    let sender = self.identity(from);
                    self.nodes[to].handle_message(&sender, &bytes);
                } else {
                    self.stats.lost += 1;
                }
            }
            SimEvent::LookupResult { node, peer, get_path, put_path } => {
                self.nodes[node].handle_lookup_result(&peer, &get_path, &put_path);
            }
        }
        self.pump_clients();
        true
    }

    fn write(&mut self, node: usize, neighbor: usize) {
        let target = self.identity(neighbor);
        let latency = self.state.borrow().links.get(&(node, neighbor)).copied();
        let Some(latency) = latency else {
            self.nodes[node].handle_write_ready(&target, &mut []);
            return;
        };
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let written = self.nodes[node].handle_write_ready(&target, &mut buf);
        if written == 0 {
            return;
        }
        self.stats.written += 1;
        buf.truncate(written);

        if let Ok(message) = WireMessage::from_bytes(&buf) {
            let mut dropped = false;
            for rule in self.drop_rules.iter_mut() {
                if rule(node, neighbor, &message) {
                    dropped = true;
                }
            }
            if dropped {
                debug!("Sim dropped {:?} from node {} to {}", message.message_type(), node, neighbor);
                self.stats.dropped_by_rule += 1;
                return;
            }
            if message.message_type().is_payload() && self.loss > 0.0 && self.rng.gen_bool(self.loss) {
                trace!("Sim lost payload from node {} to {}", node, neighbor);
                self.stats.lost += 1;
                return;
            }
        }
        self.state
            .borrow_mut()
            .push(latency, SimEvent::Deliver { from: node, to: neighbor, bytes: buf });
    }

    fn pump_clients(&mut self) {
        loop {
            let mut progressed = false;
            for index in 0..self.clients.len() {
                while let Ok(event) = self.clients[index].receiver.try_recv() {
                    progressed = true;
                    let log = &self.clients[index];
                    if let (true, ClientEvent::Data { tunnel, .. }) = (log.auto_ack, &event) {
                        let (node, client, tunnel) = (log.node, log.client, *tunnel);
                        if let Err(e) = self.nodes[node].ack(client, tunnel) {
                            debug!("Auto ack on node {} failed: {}", node, e);
                        }
                    }
                    self.clients[index].events.push(event);
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Process every event due up to `elapsed()` + `duration`.
    pub fn run_for(&mut self, duration: Duration) {
        let until = self.elapsed() + duration;
        while self.step(until) {}
        let mut state = self.state.borrow_mut();
        if state.clock < until {
            state.clock = until;
        }
    }

    /// Shut every service down.
    pub fn shutdown(&mut self) {
        for node in self.nodes.iter_mut() {
            node.shutdown();
        }
    }
}
