use thiserror::Error;

use crate::tunnel::{TunnelEvent, TunnelState};

/// Mesh service error types
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshError {
    /// Wire encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message is structurally valid but violates the protocol
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Tunnel id is not known locally
    #[error("Unknown tunnel: {0}")]
    UnknownTunnel(String),

    /// Peer is not known locally
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Client id is not registered
    #[error("Unknown client: {0}")]
    UnknownClient(u32),

    /// Client tried to use a tunnel it is not an endpoint of
    #[error("Client {0} is not an endpoint of tunnel {1}")]
    NotParticipant(u32, String),

    /// Port is already claimed by another client
    #[error("Port {0} already registered")]
    PortInUse(u32),

    /// Invalid argument supplied by a caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Tunnel state machine rejected an event
    #[error("Invalid transition from {from:?} on {event:?}")]
    InvalidTransition { from: TunnelState, event: TunnelEvent },

    /// Stale or released peer handle
    #[error("Invalid peer handle: {0}")]
    InvalidHandle(String),

    /// Network or scheduler substrate failure
    #[error("Substrate error: {0}")]
    Substrate(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

impl From<bincode::Error> for MeshError {
    fn from(err: bincode::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

impl From<prometheus::Error> for MeshError {
    fn from(err: prometheus::Error) -> Self {
        MeshError::Metrics(err.to_string())
    }
}

impl From<icn_mesh_config::ConfigError> for MeshError {
    fn from(err: icn_mesh_config::ConfigError) -> Self {
        MeshError::Config(err.to_string())
    }
}
