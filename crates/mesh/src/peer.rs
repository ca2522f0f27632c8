//! Per-peer records: known paths, pending lookup, outbound queue and the
//! tunnels that end at the peer.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, warn};

use crate::path::Path;
use crate::peer_id::{PeerHandle, PeerIdentity, PeerTable};
use crate::queue::PeerQueue;
use crate::substrate::LookupHandle;
use crate::tunnel::TunnelId;

/// Everything known about one remote peer
#[derive(Debug)]
pub struct PeerRecord {
    /// The record holds one reference on its own handle
    pub handle: PeerHandle,
    pub last_contact: Instant,
    /// Shortest first
    paths: Vec<Path>,
    pub lookup: Option<LookupHandle>,
    /// Tunnels whose destination is this peer
    pub tunnels: Vec<TunnelId>,
    pub queue: PeerQueue,
    /// Direct link is up
    pub connected: bool,
}

impl PeerRecord {
    fn new(handle: PeerHandle, now: Instant) -> Self {
        Self {
            handle,
            last_contact: now,
            paths: Vec::new(),
            lookup: None,
            tunnels: Vec::new(),
            queue: PeerQueue::new(),
            connected: false,
        }
    }

    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    pub fn best_path(&self) -> Option<&Path> {
        self.paths.first()
    }

    fn is_idle(&self) -> bool {
        self.tunnels.is_empty() && self.queue.is_empty() && self.lookup.is_none() && !self.connected
    }

    fn release(self, table: &mut PeerTable) {
        for path in self.paths {
            path.release(table);
        }
        table.release(self.handle);
    }
}

/// All peer records, keyed by handle
#[derive(Debug)]
pub struct PeerRegistry {
    records: HashMap<PeerHandle, PeerRecord>,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self { records: HashMap::new(), max_peers }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, peer: PeerHandle) -> Option<&PeerRecord> {
        self.records.get(&peer)
    }

    pub fn get_mut(&mut self, peer: PeerHandle) -> Option<&mut PeerRecord> {
        self.records.get_mut(&peer)
    }

    pub fn handles(&self) -> Vec<PeerHandle> {
        self.records.keys().copied().collect()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut PeerRecord> {
        self.records.values_mut()
    }

    /// Record for `identity`, created if needed.
    pub fn get_or_create(&mut self, table: &mut PeerTable, identity: &PeerIdentity, now: Instant) -> PeerHandle {
        let handle = table.intern(identity);
        if self.records.contains_key(&handle) {
            table.release(handle);
            return handle;
        }
        self.insert(table, handle, now);
        handle
    }

    /// Record for a handle the caller already holds.
    pub fn ensure(&mut self, table: &mut PeerTable, handle: PeerHandle, now: Instant) -> bool {
        if self.records.contains_key(&handle) {
            return true;
        }
        if table.retain(handle).is_err() {
            warn!("Cannot create record for stale handle {:?}", handle);
            return false;
        }
        self.insert(table, handle, now);
        true
    }

    fn insert(&mut self, table: &mut PeerTable, handle: PeerHandle, now: Instant) {
        if self.records.len() >= self.max_peers {
            self.evict_one(table);
        }
        self.records.insert(handle, PeerRecord::new(handle, now));
    }

    fn evict_one(&mut self, table: &mut PeerTable) {
        let victim = self
            .records
            .values()
            .filter(|record| record.is_idle())
            .min_by_key(|record| record.last_contact)
            .map(|record| record.handle);
        match victim {
            Some(handle) => {
                debug!("Evicting idle peer record {:?}", handle);
                if let Some(record) = self.records.remove(&handle) {
                    record.release(table);
                }
            }
            None => warn!("Peer table full ({}) and no idle record to evict", self.max_peers),
        }
    }

    /// Remove a record, returning it so the caller can drain its queue.
    pub fn remove(&mut self, peer: PeerHandle) -> Option<PeerRecord> {
        self.records.remove(&peer)
    }

    /// Hand back every reference a removed record holds.
    pub fn release_record(table: &mut PeerTable, record: PeerRecord) {
        record.release(table);
    }

    pub fn touch(&mut self, peer: PeerHandle, now: Instant) {
        if let Some(record) = self.records.get_mut(&peer) {
            record.last_contact = now;
        }
    }

    /// Store `path` as a way to reach `peer`. The path is consumed either way.
    ///
    /// Untrusted paths of two hops or fewer are refused: a direct link is only
    /// believed when the link layer reports it.
    pub fn add_path(
        &mut self,
        table: &mut PeerTable,
        peer: PeerHandle,
        mut path: Path,
        local: PeerHandle,
        trusted: bool,
    ) -> bool {
        if path.last() != Some(peer) {
            path.release(table);
            return false;
        }
        path.strip_local_loop(table, local);
        if path.first() != Some(local) || path.len() < 2 || (!trusted && path.len() <= 2) {
            path.release(table);
            return false;
        }

        let Some(record) = self.records.get_mut(&peer) else {
            path.release(table);
            return false;
        };
        if record.paths.iter().any(|known| known.hops() == path.hops()) {
            path.release(table);
            return false;
        }
        let slot = record
            .paths
            .iter()
            .position(|known| known.len() > path.len())
            .unwrap_or(record.paths.len());
        record.paths.insert(slot, path);
        true
    }

    /// Offer every prefix of a path starting at the local peer to the peer it ends at.
    pub fn add_path_to_peers(
        &mut self,
        table: &mut PeerTable,
        path: Path,
        local: PeerHandle,
        trusted: bool,
        now: Instant,
    ) {
        for len in 2..=path.len() {
            let prefix = path.prefix(table, len);
            let Some(peer) = prefix.last() else {
                prefix.release(table);
                continue;
            };
            if peer == local || !self.ensure(table, peer, now) {
                prefix.release(table);
                continue;
            }
            self.add_path(table, peer, prefix, local, trusted);
        }
        path.release(table);
    }

    /// Store the reverse of a path that arrived from its origin.
    pub fn add_path_to_origin(&mut self, table: &mut PeerTable, mut path: Path, local: PeerHandle, trusted: bool, now: Instant) {
        path.invert();
        let Some(origin) = path.last() else {
            path.release(table);
            return;
        };
        if !self.ensure(table, origin, now) {
            path.release(table);
            return;
        }
        self.add_path(table, origin, path, local, trusted);
    }

    /// Shortest known path to `peer`, copied with fresh references.
    pub fn best_path(&self, table: &mut PeerTable, peer: PeerHandle) -> Option<Path> {
        let best = self.records.get(&peer)?.best_path()?;
        Some(best.duplicate(table))
    }

    /// Shortest known path to `peer` whose first hop is a connected neighbor.
    pub fn best_connected_path(&self, table: &mut PeerTable, peer: PeerHandle) -> Option<Path> {
        let usable = self.records.get(&peer)?.paths.iter().find(|path| {
            path.hops()
                .get(1)
                .and_then(|first_hop| self.records.get(first_hop))
                .map(|record| record.connected)
                .unwrap_or(false)
        })?;
        Some(usable.duplicate(table))
    }

    /// Drop every stored path crossing the link between `a` and `b`.
    pub fn remove_edge(&mut self, table: &mut PeerTable, a: PeerHandle, b: PeerHandle) -> usize {
        let mut removed = 0;
        for record in self.records.values_mut() {
            let (broken, kept): (Vec<_>, Vec<_>) =
                record.paths.drain(..).partition(|path| path.contains_edge(a, b));
            record.paths = kept;
            removed += broken.len();
            for path in broken {
                path.release(table);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (PeerTable, PeerRegistry, PeerHandle, Instant) {
        let mut table = PeerTable::new();
        let me = table.intern(&PeerIdentity::from_seed(1));
        (table, PeerRegistry::new(16), me, Instant::now())
    }

    fn path(table: &mut PeerTable, seeds: &[u32]) -> Path {
        let ids: Vec<_> = seeds.iter().map(|s| PeerIdentity::from_seed(*s)).collect();
        Path::from_identities(table, &ids)
    }

    fn teardown(mut table: PeerTable, mut registry: PeerRegistry, me: PeerHandle) {
        for handle in registry.handles() {
            if let Some(record) = registry.remove(handle) {
                PeerRegistry::release_record(&mut table, record);
            }
        }
        table.release(me);
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn test_paths_sorted_shortest_first() {
        let (mut table, mut registry, me, now) = setup();
        let dest = registry.get_or_create(&mut table, &PeerIdentity::from_seed(5), now);

        let long = path(&mut table, &[1, 2, 3, 4, 5]);
        assert!(registry.add_path(&mut table, dest, long, me, false));
        let short = path(&mut table, &[1, 3, 5]);
        assert!(registry.add_path(&mut table, dest, short, me, false));
        let same_len = path(&mut table, &[1, 4, 5]);
        assert!(registry.add_path(&mut table, dest, same_len, me, false));
        let duplicate = path(&mut table, &[1, 3, 5]);
        assert!(!registry.add_path(&mut table, dest, duplicate, me, false));

        let lens: Vec<_> = registry.get(dest).unwrap().paths().iter().map(|p| p.len()).collect();
        assert_eq!(lens, vec![3, 3, 5]);
        let best = registry.best_path(&mut table, dest).unwrap();
        assert_eq!(best.identities(&table)[1], PeerIdentity::from_seed(3));
        best.release(&mut table);

        teardown(table, registry, me);
    }

    #[test]
    fn test_untrusted_direct_path_refused() {
        let (mut table, mut registry, me, now) = setup();
        let peer = registry.get_or_create(&mut table, &PeerIdentity::from_seed(2), now);

        let direct = path(&mut table, &[1, 2]);
        assert!(!registry.add_path(&mut table, peer, direct, me, false));
        let direct = path(&mut table, &[1, 2]);
        assert!(registry.add_path(&mut table, peer, direct, me, true));

        // Wrong endpoint and not starting at the local peer
        let wrong_end = path(&mut table, &[1, 3]);
        assert!(!registry.add_path(&mut table, peer, wrong_end, me, true));
        let foreign = path(&mut table, &[7, 8, 2]);
        assert!(!registry.add_path(&mut table, peer, foreign, me, true));

        teardown(table, registry, me);
    }

    #[test]
    fn test_add_path_to_peers_and_remove_edge() {
        let (mut table, mut registry, me, now) = setup();
        let full = path(&mut table, &[1, 2, 3, 4]);
        registry.add_path_to_peers(&mut table, full, me, false, now);

        // 2 only gets an untrusted direct path, which is refused
        let two = table.search(&PeerIdentity::from_seed(2)).unwrap();
        let three = table.search(&PeerIdentity::from_seed(3)).unwrap();
        let four = table.search(&PeerIdentity::from_seed(4)).unwrap();
        assert!(registry.get(two).unwrap().best_path().is_none());
        assert_eq!(registry.get(three).unwrap().paths().len(), 1);
        assert_eq!(registry.get(four).unwrap().paths().len(), 1);

        assert_eq!(registry.remove_edge(&mut table, three, two), 2);
        assert!(registry.get(four).unwrap().best_path().is_none());

        teardown(table, registry, me);
    }

    #[test]
    fn test_add_path_to_origin_inverts() {
        let (mut table, mut registry, me, now) = setup();
        let incoming = path(&mut table, &[9, 8, 1]);
        registry.add_path_to_origin(&mut table, incoming, me, true, now);

        let origin = table.search(&PeerIdentity::from_seed(9)).unwrap();
        let best = registry.best_path(&mut table, origin).unwrap();
        assert_eq!(
            best.identities(&table),
            vec![PeerIdentity::from_seed(1), PeerIdentity::from_seed(8), PeerIdentity::from_seed(9)]
        );
        best.release(&mut table);
        teardown(table, registry, me);
    }

    #[test]
    fn test_best_connected_path_skips_unreachable_first_hop() {
        let (mut table, mut registry, me, now) = setup();
        let dest = registry.get_or_create(&mut table, &PeerIdentity::from_seed(5), now);
        for via in [2, 3] {
            registry.get_or_create(&mut table, &PeerIdentity::from_seed(via), now);
        }
        let via_two = path(&mut table, &[1, 2, 5]);
        assert!(registry.add_path(&mut table, dest, via_two, me, false));
        let via_three = path(&mut table, &[1, 3, 4, 5]);
        assert!(registry.add_path(&mut table, dest, via_three, me, false));

        assert!(registry.best_connected_path(&mut table, dest).is_none());

        let three = table.search(&PeerIdentity::from_seed(3)).unwrap();
        registry.get_mut(three).unwrap().connected = true;
        let chosen = registry.best_connected_path(&mut table, dest).unwrap();
        assert_eq!(chosen.len(), 4);
        assert_eq!(chosen.hops()[1], three);
        chosen.release(&mut table);

        teardown(table, registry, me);
    }

    #[test]
    fn test_eviction_prefers_oldest_idle() {
        let mut table = PeerTable::new();
        let mut registry = PeerRegistry::new(2);
        let start = Instant::now();
        let a = registry.get_or_create(&mut table, &PeerIdentity::from_seed(1), start);
        let b = registry.get_or_create(&mut table, &PeerIdentity::from_seed(2), start + std::time::Duration::from_secs(1));
        registry.get_mut(a).unwrap().connected = true;

        let c = registry.get_or_create(&mut table, &PeerIdentity::from_seed(3), start + std::time::Duration::from_secs(2));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(a).is_some());
        assert!(registry.get(b).is_none());
        assert!(registry.get(c).is_some());
        assert!(table.resolve(b).is_none());
    }
}
