//! Peer-to-peer wire messages and their binary codec.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};
use crate::peer_id::PeerIdentity;
use crate::tunnel::TunnelOptions;

/// Largest encoded message accepted from a neighbor.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Globally unique tunnel id as it travels between peers
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WireTunnelId {
    pub owner: PeerIdentity,
    pub number: u32,
}

impl fmt::Debug for WireTunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.number)
    }
}

/// End-to-end payload with its per-hop and per-tunnel sequence numbers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    pub tunnel: WireTunnelId,
    /// End-to-end message id
    pub mid: u32,
    /// Remaining hops
    pub ttl: u32,
    /// Per-hop payload id
    pub pid: u32,
    pub payload: Vec<u8>,
}

/// Messages exchanged between mesh peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Establish a tunnel along the full hop list, origin first
    PathCreate {
        tunnel: WireTunnelId,
        port: u32,
        options: TunnelOptions,
        hops: Vec<PeerIdentity>,
    },
    /// Destination accepted the tunnel
    PathAck {
        tunnel: WireTunnelId,
        origin: PeerIdentity,
        admission: u32,
    },
    /// The link between two peers on the path went down
    PathBroken {
        tunnel: WireTunnelId,
        peer_a: PeerIdentity,
        peer_b: PeerIdentity,
    },
    TunnelDestroy { tunnel: WireTunnelId },
    /// Payload travelling from the owner toward the destination
    DataForward(DataMessage),
    /// Payload travelling from the destination toward the owner
    DataBackward(DataMessage),
    /// End-to-end acknowledgment of reliable payloads
    DataAck {
        tunnel: WireTunnelId,
        last_in_order: u32,
        futures: u64,
    },
    /// Per-hop admission value
    Ack { tunnel: WireTunnelId, admission: u32 },
    /// Stalled sender asking for an admission value
    Poll { tunnel: WireTunnelId, pid: u32 },
    Keepalive { tunnel: WireTunnelId },
}

/// Discriminant of [`WireMessage`], used for queue scans and metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    PathCreate,
    PathAck,
    PathBroken,
    TunnelDestroy,
    DataForward,
    DataBackward,
    DataAck,
    Ack,
    Poll,
    Keepalive,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::PathCreate => "path_create",
            MessageType::PathAck => "path_ack",
            MessageType::PathBroken => "path_broken",
            MessageType::TunnelDestroy => "tunnel_destroy",
            MessageType::DataForward => "data_forward",
            MessageType::DataBackward => "data_backward",
            MessageType::DataAck => "data_ack",
            MessageType::Ack => "ack",
            MessageType::Poll => "poll",
            MessageType::Keepalive => "keepalive",
        }
    }

    /// Payload types are subject to flow-control admission.
    pub fn is_payload(&self) -> bool {
        matches!(self, MessageType::DataForward | MessageType::DataBackward)
    }
}

impl WireMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            WireMessage::PathCreate { .. } => MessageType::PathCreate,
            WireMessage::PathAck { .. } => MessageType::PathAck,
            WireMessage::PathBroken { .. } => MessageType::PathBroken,
            WireMessage::TunnelDestroy { .. } => MessageType::TunnelDestroy,
            WireMessage::DataForward(_) => MessageType::DataForward,
            WireMessage::DataBackward(_) => MessageType::DataBackward,
            WireMessage::DataAck { .. } => MessageType::DataAck,
            WireMessage::Ack { .. } => MessageType::Ack,
            WireMessage::Poll { .. } => MessageType::Poll,
            WireMessage::Keepalive { .. } => MessageType::Keepalive,
        }
    }

    pub fn tunnel(&self) -> &WireTunnelId {
        match self {
            WireMessage::PathCreate { tunnel, .. }
            | WireMessage::PathAck { tunnel, .. }
            | WireMessage::PathBroken { tunnel, .. }
            | WireMessage::TunnelDestroy { tunnel }
            | WireMessage::DataAck { tunnel, .. }
            | WireMessage::Ack { tunnel, .. }
            | WireMessage::Poll { tunnel, .. }
            | WireMessage::Keepalive { tunnel } => tunnel,
            WireMessage::DataForward(data) | WireMessage::DataBackward(data) => &data.tunnel,
        }
    }

    pub fn data(&self) -> Option<&DataMessage> {
        match self {
            WireMessage::DataForward(data) | WireMessage::DataBackward(data) => Some(data),
            _ => None,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut DataMessage> {
        match self {
            WireMessage::DataForward(data) | WireMessage::DataBackward(data) => Some(data),
            _ => None,
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> MeshResult<usize> {
        Ok(bincode::serialized_size(self)? as usize)
    }

    /// Serialize the message to bytes
    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| MeshError::Serialization(format!("Failed to encode message: {}", e)))
    }

    /// Deserialize a message received from a neighbor
    pub fn from_bytes(bytes: &[u8]) -> MeshResult<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(MeshError::Serialization(format!(
                "Message of {} bytes exceeds limit of {}",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        bincode::deserialize(bytes)
            .map_err(|e| MeshError::Serialization(format!("Failed to decode message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid() -> WireTunnelId {
        WireTunnelId { owner: PeerIdentity::from_seed(1), number: 42 }
    }

    #[test]
    fn test_round_trip_each_message_type() {
        let messages = vec![
            WireMessage::PathCreate {
                tunnel: tid(),
                port: 7,
                options: TunnelOptions { reliable: true, no_buffer: false },
                hops: vec![PeerIdentity::from_seed(1), PeerIdentity::from_seed(2)],
            },
            WireMessage::PathAck { tunnel: tid(), origin: PeerIdentity::from_seed(2), admission: 9 },
            WireMessage::PathBroken {
                tunnel: tid(),
                peer_a: PeerIdentity::from_seed(2),
                peer_b: PeerIdentity::from_seed(3),
            },
            WireMessage::TunnelDestroy { tunnel: tid() },
            WireMessage::DataForward(DataMessage {
                tunnel: tid(),
                mid: 3,
                ttl: 64,
                pid: u32::MAX,
                payload: b"hello".to_vec(),
            }),
            WireMessage::DataBackward(DataMessage {
                tunnel: tid(),
                mid: 0,
                ttl: 1,
                pid: 0,
                payload: vec![],
            }),
            WireMessage::DataAck { tunnel: tid(), last_in_order: 5, futures: 0b1010 },
            WireMessage::Ack { tunnel: tid(), admission: 17 },
            WireMessage::Poll { tunnel: tid(), pid: 16 },
            WireMessage::Keepalive { tunnel: tid() },
        ];

        for message in messages {
            let bytes = message.to_bytes().unwrap();
            assert_eq!(bytes.len(), message.encoded_len().unwrap());
            let decoded = WireMessage::from_bytes(&bytes).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(decoded.tunnel(), &tid());
        }
    }

    #[test]
    fn test_truncated_message_is_rejected() {
        let message = WireMessage::Ack { tunnel: tid(), admission: 1 };
        let bytes = message.to_bytes().unwrap();
        let result = WireMessage::from_bytes(&bytes[..bytes.len() - 2]);
        assert!(matches!(result, Err(MeshError::Serialization(_))));
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let bytes = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(WireMessage::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_pid_rewrite_keeps_size() {
        let mut message = WireMessage::DataForward(DataMessage {
            tunnel: tid(),
            mid: 0,
            ttl: 64,
            pid: 0,
            payload: vec![1, 2, 3],
        });
        let before = message.encoded_len().unwrap();
        if let Some(data) = message.data_mut() {
            data.pid = u32::MAX;
        }
        assert_eq!(message.encoded_len().unwrap(), before);
        assert!(message.message_type().is_payload());
    }
}
