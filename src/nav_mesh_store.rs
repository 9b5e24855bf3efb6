//! In-memory store of built tile state, with budget-based eviction.
//!
//! Holds the most recently built tiles per agent-bounds bucket, evicting
//! the tiles farthest from the relevant agent's last reported position
//! once the store exceeds its configured budget. Grounded on the teacher's
//! `cache.rs::TileCache`: a `DashMap` of entries plus eviction bookkeeping,
//! generalized from the teacher's strict FIFO (`VecDeque` pop-front) to a
//! farthest-first policy, since spec §4.5 ties eviction to distance from
//! the player rather than insertion order.

use crate::shape::BuiltTile;
use crate::tiles::TilePosition;
use crate::tile_db::RowKey;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default)]
pub struct TileStoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident_tiles: usize,
}

struct Entry {
    tile: BuiltTile,
    revision: u64,
    last_touched_position: TilePosition,
    /// Monotonic counter stamped on every read/write touch, used as the LRU
    /// tiebreak (spec §3's "last-access counter") when two candidates for
    /// eviction are equally far from the reference position.
    last_access: u64,
}

/// Stores built tiles keyed by [`RowKey`] (worldspace + tile + agent-bounds
/// bucket), bounded by a maximum tile count *per agent-bounds bucket*
/// rather than a byte budget or a single global count: spec §4.3/§6 ties
/// `maxTilesNumber` to each agent's own navmesh, and since tiles are shared
/// by every agent whose bounds quantise to the same bucket, the bucket is
/// this store's unit of "per agent" accounting.
pub struct TileStateStore {
    entries: DashMap<RowKey, Entry>,
    /// Insertion-independent ordering key: recency isn't the primary
    /// eviction driver here, so unlike the teacher's `VecDeque` this only
    /// tracks membership for the "evict farthest" scan.
    known_keys: Mutex<Vec<RowKey>>,
    max_tiles_per_agent: usize,
    access_counter: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl TileStateStore {
    pub fn new(max_tiles_per_agent: usize) -> Self {
        Self {
            entries: DashMap::new(),
            known_keys: Mutex::new(Vec::new()),
            max_tiles_per_agent,
            access_counter: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn group_of(key: &RowKey) -> (crate::tiles::WorldspaceId, (u8, [i64; 3])) {
        (key.worldspace, key.agent_bucket)
    }

    pub fn get(&self, key: &RowKey) -> Option<BuiltTile> {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.last_access = self.access_counter.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.tile.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn revision_of(&self, key: &RowKey) -> Option<u64> {
        self.entries.get(key).map(|e| e.revision)
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Tile positions currently resident for one worldspace/agent-bounds
    /// bucket, used by the navigator to prune tiles that fell out of an
    /// agent's active window (spec §4.7's `update` pruning step).
    pub fn resident_tiles_for(
        &self,
        worldspace: crate::tiles::WorldspaceId,
        agent_bucket: (u8, [i64; 3]),
    ) -> Vec<TilePosition> {
        self.entries
            .iter()
            .filter(|e| e.key().worldspace == worldspace && e.key().agent_bucket == agent_bucket)
            .map(|e| e.key().tile)
            .collect()
    }

    /// Insert or refresh a built tile. Evicts tile(s) sharing `key`'s
    /// worldspace/agent-bounds bucket, farthest first from
    /// `reference_position` (typically the requesting agent's last known
    /// tile), with ties broken by least-recently-used, until that bucket is
    /// back under its per-agent budget.
    pub fn insert(
        &self,
        key: RowKey,
        tile: BuiltTile,
        revision: u64,
        reference_position: TilePosition,
    ) {
        let is_new = !self.entries.contains_key(&key);
        let last_access = self.access_counter.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key,
            Entry {
                tile,
                revision,
                last_touched_position: reference_position,
                last_access,
            },
        );
        if is_new {
            self.known_keys.lock().push(key);
        }
        self.evict_if_needed(&key, reference_position);
    }

    pub fn remove(&self, key: &RowKey) {
        if self.entries.remove(key).is_some() {
            self.known_keys.lock().retain(|k| k != key);
        }
    }

    pub fn remove_worldspace(&self, worldspace: crate::tiles::WorldspaceId) {
        let to_remove: Vec<RowKey> = self
            .entries
            .iter()
            .filter(|e| e.key().worldspace == worldspace)
            .map(|e| *e.key())
            .collect();
        for key in to_remove {
            self.remove(&key);
        }
    }

    fn evict_if_needed(&self, inserted_key: &RowKey, reference_position: TilePosition) {
        let group = Self::group_of(inserted_key);
        loop {
            let group_len = self
                .known_keys
                .lock()
                .iter()
                .filter(|k| Self::group_of(k) == group)
                .count();
            if group_len <= self.max_tiles_per_agent {
                break;
            }
            let farthest = {
                let keys = self.known_keys.lock();
                keys.iter()
                    .filter(|k| Self::group_of(k) == group)
                    .filter_map(|k| {
                        self.entries.get(k).map(|e| {
                            let dist = e.last_touched_position.chebyshev_distance(reference_position);
                            (*k, dist, e.last_access)
                        })
                    })
                    // Farthest first; among equidistant tiles, the least
                    // recently used (smallest `last_access`) goes first.
                    .max_by_key(|(_, dist, last_access)| (*dist, std::cmp::Reverse(*last_access)))
                    .map(|(k, _, _)| k)
            };
            match farthest {
                Some(key) => {
                    self.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    pub fn stats(&self) -> TileStoreStats {
        TileStoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident_tiles: self.entries.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{AgentBounds, CollisionShapeKind};
    use crate::tiles::WorldspaceId;

    fn bounds() -> AgentBounds {
        AgentBounds::new(CollisionShapeKind::Cylinder, [0.3, 0.3, 0.9])
    }

    fn tile_at(_x: i32, _y: i32) -> BuiltTile {
        BuiltTile {
            data: bytes::Bytes::from_static(&[0u8; 8]),
        }
    }

    #[test]
    fn evicts_farthest_tile_first() {
        let store = TileStateStore::new(2);
        let ws = WorldspaceId(1);
        let b = bounds();

        let near = RowKey::new(ws, TilePosition::new(0, 0), &b);
        let mid = RowKey::new(ws, TilePosition::new(5, 0), &b);
        let far = RowKey::new(ws, TilePosition::new(100, 0), &b);

        let player = TilePosition::new(0, 0);
        store.insert(near, tile_at(0, 0), 1, player);
        store.insert(mid, tile_at(5, 0), 1, player);
        store.insert(far, tile_at(100, 0), 1, player);

        // Inserting the third tile over budget evicts the one farthest from
        // the current reference position (the player's tile).
        assert!(store.len() <= 2);
        assert!(!store.contains(&far), "farthest tile should be evicted");
    }

    #[test]
    fn budget_is_tracked_per_agent_bucket_not_globally() {
        let store = TileStateStore::new(1);
        let ws = WorldspaceId(1);
        let a = bounds();
        let b = AgentBounds::new(CollisionShapeKind::RotatingBox, [0.5, 0.5, 1.0]);

        let k_a = RowKey::new(ws, TilePosition::new(0, 0), &a);
        let k_b = RowKey::new(ws, TilePosition::new(0, 0), &b);
        store.insert(k_a, tile_at(0, 0), 1, TilePosition::new(0, 0));
        store.insert(k_b, tile_at(0, 0), 1, TilePosition::new(0, 0));

        // Each bucket has its own budget of 1, so both tiles survive even
        // though the store holds two entries total.
        assert!(store.contains(&k_a));
        assert!(store.contains(&k_b));
    }

    #[test]
    fn equidistant_tiles_evict_least_recently_used_first() {
        let store = TileStateStore::new(2);
        let ws = WorldspaceId(1);
        let b = bounds();
        let player = TilePosition::new(0, 0);

        let left = RowKey::new(ws, TilePosition::new(-5, 0), &b);
        let right = RowKey::new(ws, TilePosition::new(5, 0), &b);
        store.insert(left, tile_at(-5, 0), 1, player);
        store.insert(right, tile_at(5, 0), 1, player);

        // Touch `left` so it becomes more recently used than `right`.
        store.get(&left);

        let third = RowKey::new(ws, TilePosition::new(0, 5), &b);
        store.insert(third, tile_at(0, 5), 1, player);

        assert!(store.contains(&left), "more recently used tile should survive the tie");
        assert!(!store.contains(&right), "least recently used tile should be evicted on a distance tie");
    }

    #[test]
    fn resident_tiles_for_filters_by_worldspace_and_bucket() {
        let store = TileStateStore::new(10);
        let ws = WorldspaceId(1);
        let b = bounds();
        let k1 = RowKey::new(ws, TilePosition::new(0, 0), &b);
        let k2 = RowKey::new(ws, TilePosition::new(1, 0), &b);
        store.insert(k1, tile_at(0, 0), 1, TilePosition::new(0, 0));
        store.insert(k2, tile_at(1, 0), 1, TilePosition::new(0, 0));

        let resident = store.resident_tiles_for(ws, b.bucket_key());
        assert_eq!(resident.len(), 2);
        assert!(resident.contains(&TilePosition::new(0, 0)));
        assert!(resident.contains(&TilePosition::new(1, 0)));
    }

    #[test]
    fn remove_worldspace_drops_only_its_tiles() {
        let store = TileStateStore::new(10);
        let ws1 = WorldspaceId(1);
        let ws2 = WorldspaceId(2);
        let b = bounds();

        let k1 = RowKey::new(ws1, TilePosition::new(0, 0), &b);
        let k2 = RowKey::new(ws2, TilePosition::new(0, 0), &b);
        store.insert(k1, tile_at(0, 0), 1, TilePosition::new(0, 0));
        store.insert(k2, tile_at(0, 0), 1, TilePosition::new(0, 0));

        store.remove_worldspace(ws1);
        assert!(!store.contains(&k1));
        assert!(store.contains(&k2));
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let store = TileStateStore::new(10);
        let ws = WorldspaceId(1);
        let key = RowKey::new(ws, TilePosition::new(0, 0), &bounds());

        assert!(store.get(&key).is_none());
        store.insert(key, tile_at(0, 0), 1, TilePosition::new(0, 0));
        assert!(store.get(&key).is_some());

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
