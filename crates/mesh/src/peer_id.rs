//! Peer identity interning
//!
//! Full peer identities are 32 bytes. Every other component works on small
//! [`PeerHandle`]s handed out by a [`PeerTable`]. Handles are reference counted
//! explicitly: whoever stores a handle holds one reference and gives it back
//! with [`PeerTable::release`]. Slots carry a generation so a handle that
//! outlived its slot never resolves to the identity that reuses it.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MeshError, MeshResult};

/// Full identity of a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity(pub [u8; 32]);

impl PeerIdentity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Deterministic identity derived from a small number, used by tests and the simulator.
    pub fn from_seed(seed: u32) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&seed.to_be_bytes());
        bytes[4..8].copy_from_slice(&seed.wrapping_mul(0x9E37_79B9).to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short printable prefix
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({})", self.short())
    }
}

/// Interned peer reference. Cheap to copy; only valid while referenced.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle {
    index: u32,
    generation: u32,
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

#[derive(Debug)]
struct Slot {
    identity: PeerIdentity,
    refcount: u32,
    generation: u32,
}

/// Interning table for peer identities
#[derive(Debug, Default)]
pub struct PeerTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_identity: HashMap<PeerIdentity, u32>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an identity, taking one reference on the returned handle.
    pub fn intern(&mut self, identity: &PeerIdentity) -> PeerHandle {
        if let Some(&index) = self.by_identity.get(identity) {
            let slot = &mut self.slots[index as usize];
            slot.refcount += 1;
            return PeerHandle { index, generation: slot.generation };
        }

        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.identity = *identity;
                slot.refcount = 1;
                index
            }
            None => {
                self.slots.push(Slot { identity: *identity, refcount: 1, generation: 0 });
                (self.slots.len() - 1) as u32
            }
        };
        self.by_identity.insert(*identity, index);
        PeerHandle { index, generation: self.slots[index as usize].generation }
    }

    /// Look up an identity without taking a reference.
    pub fn search(&self, identity: &PeerIdentity) -> Option<PeerHandle> {
        self.by_identity.get(identity).map(|&index| PeerHandle {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    /// Take an additional reference on a live handle.
    pub fn retain(&mut self, handle: PeerHandle) -> MeshResult<()> {
        match self.slot_mut(handle) {
            Some(slot) => {
                slot.refcount += 1;
                Ok(())
            }
            None => Err(MeshError::InvalidHandle(format!("{:?}", handle))),
        }
    }

    /// Give back one reference; the slot is recycled when the last one goes.
    pub fn release(&mut self, handle: PeerHandle) {
        let Some(slot) = self.slot_mut(handle) else {
            warn!("Release of stale peer handle {:?}", handle);
            return;
        };
        slot.refcount -= 1;
        if slot.refcount > 0 {
            return;
        }
        slot.generation = slot.generation.wrapping_add(1);
        let identity = slot.identity;
        self.by_identity.remove(&identity);
        self.free.push(handle.index);
    }

    pub fn resolve(&self, handle: PeerHandle) -> Option<PeerIdentity> {
        self.slot(handle).map(|slot| slot.identity)
    }

    /// Current reference count, zero for stale handles.
    pub fn refcount(&self, handle: PeerHandle) -> u32 {
        self.slot(handle).map(|slot| slot.refcount).unwrap_or(0)
    }

    /// Number of live interned identities.
    pub fn live(&self) -> usize {
        self.by_identity.len()
    }

    fn slot(&self, handle: PeerHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.refcount > 0)
    }

    fn slot_mut(&mut self, handle: PeerHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.refcount > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_shared_and_counted() {
        let mut table = PeerTable::new();
        let id = PeerIdentity::from_seed(7);

        let a = table.intern(&id);
        let b = table.intern(&id);
        assert_eq!(a, b);
        assert_eq!(table.refcount(a), 2);
        assert_eq!(table.search(&id), Some(a));
        assert_eq!(table.resolve(a), Some(id));

        table.release(a);
        assert_eq!(table.refcount(b), 1);
        table.release(b);
        assert_eq!(table.live(), 0);
        assert!(table.search(&id).is_none());
    }

    #[test]
    fn test_stale_handle_does_not_alias_reused_slot() {
        let mut table = PeerTable::new();
        let first = table.intern(&PeerIdentity::from_seed(1));
        table.release(first);

        // Same slot index, next generation
        let second = table.intern(&PeerIdentity::from_seed(2));
        assert_ne!(first, second);
        assert!(table.resolve(first).is_none());
        assert_eq!(table.resolve(second), Some(PeerIdentity::from_seed(2)));
        assert!(table.retain(first).is_err());

        // Releasing the stale handle must not touch the new owner
        table.release(first);
        assert_eq!(table.refcount(second), 1);
    }

    #[test]
    fn test_identity_display_is_short_hex() {
        let id = PeerIdentity::from_seed(0x0102_0304);
        assert_eq!(id.short(), "01020304");
        assert_eq!(format!("{}", id), "01020304");
    }
}
