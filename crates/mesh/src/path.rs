//! Hop sequences between the local peer and a destination.

use tracing::debug;

use crate::peer_id::{PeerHandle, PeerIdentity, PeerTable};

/// Ordered hop list. Holds one reference per hop in the [`PeerTable`] it was
/// built from; hand it back with [`Path::release`] when it is not stored.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a path holds peer references and must be stored or released"]
pub struct Path {
    hops: Vec<PeerHandle>,
}

impl Path {
    /// Intern every identity into a new path.
    pub fn from_identities(table: &mut PeerTable, identities: &[PeerIdentity]) -> Self {
        let hops = identities.iter().map(|id| table.intern(id)).collect();
        Self { hops }
    }

    /// Build a path from handles the caller already has, taking new references.
    pub fn from_handles(table: &mut PeerTable, hops: &[PeerHandle]) -> Self {
        for hop in hops {
            // Handles come from live records; a stale one is a bookkeeping bug upstream
            if table.retain(*hop).is_err() {
                debug!("Path built over stale handle {:?}", hop);
            }
        }
        Self { hops: hops.to_vec() }
    }

    /// Build the path to a peer found by a discovery lookup.
    ///
    /// The GET path runs from the storing peer back to us and the PUT path
    /// from the announcing peer to the storing peer, so both are walked in
    /// reverse. Consecutive repeats collapse, and a PUT path crossing the local
    /// peer restarts the path there.
    pub fn from_discovery(
        table: &mut PeerTable,
        local: &PeerIdentity,
        get_path: &[PeerIdentity],
        put_path: &[PeerIdentity],
    ) -> Self {
        let mut ids: Vec<PeerIdentity> = vec![*local];
        for id in get_path.iter().rev() {
            if ids.last() != Some(id) {
                ids.push(*id);
            }
        }
        for id in put_path.iter().rev() {
            if id == local {
                ids.clear();
            }
            if ids.last() != Some(id) {
                ids.push(*id);
            }
        }
        Self::from_identities(table, &ids)
    }

    /// Copy with fresh references.
    pub fn duplicate(&self, table: &mut PeerTable) -> Self {
        Self::from_handles(table, &self.hops)
    }

    /// Copy of the first `len` hops.
    pub fn prefix(&self, table: &mut PeerTable, len: usize) -> Self {
        Self::from_handles(table, &self.hops[..len.min(self.hops.len())])
    }

    pub fn release(self, table: &mut PeerTable) {
        for hop in self.hops {
            table.release(hop);
        }
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn hops(&self) -> &[PeerHandle] {
        &self.hops
    }

    pub fn first(&self) -> Option<PeerHandle> {
        self.hops.first().copied()
    }

    pub fn last(&self) -> Option<PeerHandle> {
        self.hops.last().copied()
    }

    pub fn position(&self, peer: PeerHandle) -> Option<usize> {
        self.hops.iter().position(|hop| *hop == peer)
    }

    pub fn invert(&mut self) {
        self.hops.reverse();
    }

    /// True if `a` and `b` are adjacent on the path, in either order.
    pub fn contains_edge(&self, a: PeerHandle, b: PeerHandle) -> bool {
        self.hops
            .windows(2)
            .any(|pair| (pair[0] == a && pair[1] == b) || (pair[0] == b && pair[1] == a))
    }

    /// Drop everything before the last appearance of `local` after the first
    /// hop, so the path starts at the local peer without looping through it.
    pub fn strip_local_loop(&mut self, table: &mut PeerTable, local: PeerHandle) {
        let Some(pos) = self.hops.iter().skip(1).rposition(|hop| *hop == local) else {
            return;
        };
        let cut = pos + 1;
        for hop in self.hops.drain(..cut) {
            table.release(hop);
        }
    }

    pub fn identities(&self, table: &PeerTable) -> Vec<PeerIdentity> {
        self.hops.iter().filter_map(|hop| table.resolve(*hop)).collect()
    }
}
