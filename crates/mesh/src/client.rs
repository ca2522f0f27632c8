//! Local clients of the mesh service and the events delivered to them.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{MeshError, MeshResult};
use crate::peer_id::PeerIdentity;
use crate::tunnel::{TunnelId, TunnelOptions};

/// Id of a connected local client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Notification pushed to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A remote peer opened a tunnel to one of the client's ports
    TunnelCreated {
        tunnel: TunnelId,
        initiator: PeerIdentity,
        port: u32,
        options: TunnelOptions,
    },
    Data { tunnel: TunnelId, payload: Vec<u8> },
    TunnelDestroyed { tunnel: TunnelId },
    /// The client may send up to and including `admission`
    Ack { tunnel: TunnelId, admission: u32 },
}

#[derive(Debug)]
struct ClientEntry {
    ports: Vec<u32>,
    sender: mpsc::UnboundedSender<ClientEvent>,
}

/// Connected clients and the ports they listen on
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientEntry>,
    ports: HashMap<u32, ClientId>,
    next_id: u32,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Register a client listening on `ports`.
    pub fn connect(&mut self, ports: &[u32]) -> MeshResult<(ClientId, mpsc::UnboundedReceiver<ClientEvent>)> {
        if let Some(port) = ports.iter().find(|port| self.ports.contains_key(port)) {
            return Err(MeshError::PortInUse(*port));
        }
        let id = ClientId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        let (sender, receiver) = mpsc::unbounded_channel();
        for port in ports {
            self.ports.insert(*port, id);
        }
        self.clients.insert(id, ClientEntry { ports: ports.to_vec(), sender });
        debug!("{} connected on ports {:?}", id, ports);
        Ok((id, receiver))
    }

    pub fn disconnect(&mut self, id: ClientId) -> MeshResult<()> {
        let entry = self.clients.remove(&id).ok_or(MeshError::UnknownClient(id.0))?;
        for port in entry.ports {
            self.ports.remove(&port);
        }
        debug!("{} disconnected", id);
        Ok(())
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn client_for_port(&self, port: u32) -> Option<ClientId> {
        self.ports.get(&port).copied()
    }

    /// Push an event; a client whose receiver is gone is skipped.
    pub fn notify(&self, id: ClientId, event: ClientEvent) -> bool {
        let Some(entry) = self.clients.get(&id) else {
            return false;
        };
        if entry.sender.send(event).is_err() {
            debug!("{} dropped its event receiver", id);
            return false;
        }
        true
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }
}
