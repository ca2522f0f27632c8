use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::MeshResult;
use crate::wire::MessageType;

/// Mesh service metrics collector
#[derive(Clone)]
pub struct MeshMetrics {
    registry: Registry,

    // Message metrics
    messages_sent: IntCounterVec,
    messages_received: IntCounterVec,
    dropped: IntCounterVec,

    // Flow control and reliability
    retransmissions: IntCounter,
    polls: IntCounter,

    // Table sizes
    tunnels: IntGauge,
    peers: IntGauge,
}

impl MeshMetrics {
    /// Create a collector with its own registry
    pub fn new() -> MeshResult<Self> {
        let registry = Registry::new();

        let messages_sent = IntCounterVec::new(
            Opts::new("mesh_messages_sent", "Number of messages written to neighbors"),
            &["message_type"],
        )?;
        let messages_received = IntCounterVec::new(
            Opts::new("mesh_messages_received", "Number of messages received from neighbors"),
            &["message_type"],
        )?;
        let dropped = IntCounterVec::new(
            Opts::new("mesh_messages_dropped", "Number of messages dropped"),
            &["reason"],
        )?;
        let retransmissions = IntCounter::new("mesh_retransmissions", "Number of reliable payload retransmissions")?;
        let polls = IntCounter::new("mesh_polls_sent", "Number of flow control polls sent")?;
        let tunnels = IntGauge::new("mesh_tunnels", "Number of tunnels known locally")?;
        let peers = IntGauge::new("mesh_peers", "Number of peer records")?;

        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(retransmissions.clone()))?;
        registry.register(Box::new(polls.clone()))?;
        registry.register(Box::new(tunnels.clone()))?;
        registry.register(Box::new(peers.clone()))?;

        Ok(Self {
            registry,
            messages_sent,
            messages_received,
            dropped,
            retransmissions,
            polls,
            tunnels,
            peers,
        })
    }

    pub fn record_sent(&self, message_type: MessageType) {
        self.messages_sent.with_label_values(&[message_type.as_str()]).inc();
    }

    pub fn record_received(&self, message_type: MessageType) {
        self.messages_received.with_label_values(&[message_type.as_str()]).inc();
    }

    pub fn record_dropped(&self, reason: &str) {
        self.dropped.with_label_values(&[reason]).inc();
    }

    pub fn record_retransmission(&self) {
        self.retransmissions.inc();
    }

    pub fn record_poll(&self) {
        self.polls.inc();
    }

    pub fn set_tunnels(&self, count: usize) {
        self.tunnels.set(count as i64);
    }

    pub fn set_peers(&self, count: usize) {
        self.peers.set(count as i64);
    }

    pub fn sent(&self, message_type: MessageType) -> u64 {
        self.messages_sent.with_label_values(&[message_type.as_str()]).get()
    }

    pub fn received(&self, message_type: MessageType) -> u64 {
        self.messages_received.with_label_values(&[message_type.as_str()]).get()
    }

    pub fn dropped(&self, reason: &str) -> u64 {
        self.dropped.with_label_values(&[reason]).get()
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions.get()
    }

    pub fn polls(&self) -> u64 {
        self.polls.get()
    }

    /// Prometheus text exposition of every metric
    pub fn render(&self) -> MeshResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
