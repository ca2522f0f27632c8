//! Mesh service core for the InterCooperative Network
//!
//! This crate carries application traffic between peers over multi-hop
//! tunnels, including:
//! - Peer interning and per-peer path registries
//! - Tunnel creation, maintenance and teardown along a chosen path
//! - Per-hop flow control with packet ids, acknowledgments and polls
//! - Optional end-to-end reliable, in-order delivery with retransmission
//!
//! The core is single-threaded and event driven. It never owns a socket: a
//! [`Scheduler`] and a [`Discovery`] implementation supply timers, write
//! opportunities and paths, and call back into [`MeshService`]. The [`sim`]
//! module provides a deterministic in-memory implementation of both.

pub mod client;
pub mod error;
pub mod flow_control;
pub mod metrics;
pub mod path;
pub mod peer;
pub mod peer_id;
pub mod queue;
pub mod reliability;
pub mod service;
pub mod sim;
pub mod substrate;
pub mod tunnel;
pub mod wire;

pub use client::{ClientEvent, ClientId};
pub use error::{MeshError, MeshResult};
pub use metrics::MeshMetrics;
pub use path::Path;
pub use peer_id::{PeerHandle, PeerIdentity, PeerTable};
pub use service::{MeshService, SendStatus};
pub use substrate::{Discovery, LookupHandle, Scheduler, TaskId, TimerEvent, WriteToken};
pub use tunnel::{Direction, TunnelId, TunnelOptions, TunnelState};
pub use wire::{WireMessage, WireTunnelId};

pub use icn_mesh_config::MeshConfig;
