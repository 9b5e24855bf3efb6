//! Per-tile geometry aggregation cache.
//!
//! Collects the objects (static geometry, water planes, heightfields) that
//! overlap each tile and exposes versioned, immutable snapshots of that
//! aggregation for the builder to rasterize. Mutations are batched behind
//! an [`UpdateGuard`]: nothing observable changes until the guard commits
//! (on drop), and a commit that didn't actually change any tile's content
//! does not bump that tile's revision (spec property P6, "bit-identical
//! changes are not rebuilt").
//!
//! Grounded on the teacher's `scheduler.rs` for the generation counter used
//! to invalidate in-flight work (`AtomicU64`, `Ordering::SeqCst` loads
//! compared across a critical section) and on
//! `original_source/components/detournavigator/commulativeaabb.{hpp,cpp}`
//! for per-object cumulative-AABB bookkeeping (cheaper than recomputing a
//! tile's bounds from scratch on every add/remove).

use crate::shape::{CollisionShape, Heightfield, ObjectId};
use crate::tiles::{tile_range_for_aabb, AreaType, TilePosition, WorldAabb, WorldspaceId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic version: `generation` bumps on any cache-wide invalidation
/// (e.g. a worldspace is torn down), `revision` bumps per-tile on every
/// content-changing commit. Builders and readers compare the pair to decide
/// whether a previously-built tile is still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub generation: u64,
    pub revision: u64,
}

impl Version {
    pub const ZERO: Version = Version {
        generation: 0,
        revision: 0,
    };
}

#[derive(Debug, Clone)]
struct ObjectRecord {
    shape: Arc<dyn CollisionShape>,
    area: AreaType,
    /// Cached so membership changes don't require re-walking `shape`'s
    /// triangles, mirroring `commulativeaabb.cpp`'s running-union approach.
    cumulative_aabb: WorldAabb,
}

#[derive(Debug, Clone, Default)]
struct TileAggregate {
    objects: HashMap<ObjectId, ObjectRecord>,
    water: Option<(WorldAabb, f32)>,
    /// Spec I2: at most one heightfield per tile per worldspace; a second
    /// `addHeightfield` on an already-set tile is silently ignored.
    heightfield: Option<Heightfield>,
    revision: u64,
    /// Fingerprint of the content that produced `revision`, used to detect
    /// bit-identical re-commits (P6) without keeping every past snapshot.
    content_fingerprint: u64,
}

impl TileAggregate {
    fn fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = twox_hash::XxHash64::with_seed(0);
        let mut ids: Vec<_> = self.objects.keys().copied().collect();
        ids.sort();
        for id in ids {
            id.0.hash(&mut hasher);
            let rec = &self.objects[&id];
            rec.area.hash_into(&mut hasher);
            for tri in rec.shape.triangles() {
                for v in &tri.vertices {
                    v[0].to_bits().hash(&mut hasher);
                    v[1].to_bits().hash(&mut hasher);
                    v[2].to_bits().hash(&mut hasher);
                }
            }
        }
        if let Some((aabb, depth)) = self.water {
            aabb.min[0].to_bits().hash(&mut hasher);
            aabb.max[0].to_bits().hash(&mut hasher);
            depth.to_bits().hash(&mut hasher);
        } else {
            0xFFFF_u64.hash(&mut hasher);
        }
        if let Some(hf) = &self.heightfield {
            hf.tile.x.hash(&mut hasher);
            hf.tile.y.hash(&mut hasher);
            hf.cell_size.to_bits().hash(&mut hasher);
            hf.width.hash(&mut hasher);
            hf.min_z.to_bits().hash(&mut hasher);
            hf.max_z.to_bits().hash(&mut hasher);
            for h in hf.heights.iter() {
                h.to_bits().hash(&mut hasher);
            }
        } else {
            0xFFFE_u64.hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl AreaType {
    fn hash_into<H: std::hash::Hasher>(&self, hasher: &mut H) {
        use std::hash::Hash;
        std::mem::discriminant(self).hash(hasher);
    }
}

/// Immutable, shareable snapshot of one tile's aggregated geometry at a
/// specific [`Version`]. Cheap to clone: it's a thin `Arc` wrapper.
#[derive(Debug, Clone)]
pub struct RecastMesh {
    pub worldspace: WorldspaceId,
    pub tile: TilePosition,
    pub version: Version,
    pub objects: Arc<Vec<(ObjectId, Arc<dyn CollisionShape>, AreaType)>>,
    pub water: Option<(WorldAabb, f32)>,
    pub heightfield: Option<Heightfield>,
}

struct WorldspaceState {
    tile_size: f64,
    generation: AtomicU64,
    tiles: HashMap<TilePosition, TileAggregate>,
}

/// Cache of per-tile geometry aggregates, one bucket per worldspace.
///
/// All mutation happens through [`RecastMeshCache::begin_update`], which
/// returns an [`UpdateGuard`]. The guard buffers operations and applies them
/// atomically (with respect to readers) when it is committed or dropped, so
/// a reader taking a `snapshot()` mid-batch never sees a half-applied update.
pub struct RecastMeshCache {
    worldspaces: RwLock<HashMap<WorldspaceId, WorldspaceState>>,
}

impl Default for RecastMeshCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RecastMeshCache {
    pub fn new() -> Self {
        Self {
            worldspaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_worldspace(&self, id: WorldspaceId, tile_size: f64) {
        let mut worldspaces = self.worldspaces.write();
        worldspaces.entry(id).or_insert_with(|| WorldspaceState {
            tile_size,
            generation: AtomicU64::new(0),
            tiles: HashMap::new(),
        });
    }

    /// Tear down a worldspace: bumps its generation so any in-flight build
    /// for it is recognized as stale, and drops all cached aggregates.
    pub fn remove_worldspace(&self, id: WorldspaceId) {
        let mut worldspaces = self.worldspaces.write();
        if let Some(state) = worldspaces.get_mut(&id) {
            state.generation.fetch_add(1, Ordering::SeqCst);
            state.tiles.clear();
        }
    }

    pub fn generation(&self, id: WorldspaceId) -> u64 {
        self.worldspaces
            .read()
            .get(&id)
            .map(|s| s.generation.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Open a transactional batch of mutations against `worldspace`.
    /// Nothing is visible to readers until the guard is committed (or
    /// dropped, which commits implicitly — see [`UpdateGuard`]).
    pub fn begin_update(&self, worldspace: WorldspaceId) -> UpdateGuard<'_> {
        UpdateGuard {
            cache: self,
            worldspace,
            ops: Vec::new(),
            changed_tiles: Vec::new(),
            committed: false,
        }
    }

    /// Immutable snapshot of one tile's current aggregate, or `None` if the
    /// tile has no content (never built, nothing placed there).
    pub fn snapshot(&self, worldspace: WorldspaceId, tile: TilePosition) -> Option<RecastMesh> {
        let worldspaces = self.worldspaces.read();
        let state = worldspaces.get(&worldspace)?;
        let agg = state.tiles.get(&tile)?;
        if agg.objects.is_empty() && agg.water.is_none() && agg.heightfield.is_none() {
            return None;
        }
        let generation = state.generation.load(Ordering::SeqCst);
        let mut objects: Vec<_> = agg
            .objects
            .iter()
            .map(|(id, rec)| (*id, rec.shape.clone(), rec.area))
            .collect();
        objects.sort_by_key(|(id, _, _)| *id);
        Some(RecastMesh {
            worldspace,
            tile,
            version: Version {
                generation,
                revision: agg.revision,
            },
            objects: Arc::new(objects),
            water: agg.water,
            heightfield: agg.heightfield.clone(),
        })
    }

    /// True if `worldspace` has at least one tile with actual content
    /// (an object, water or a heightfield) anywhere. Used to tell "this
    /// world has no navmesh at all" apart from "this agent's area just
    /// happens to have nothing built" (spec §8 boundary behaviours).
    pub fn has_content(&self, worldspace: WorldspaceId) -> bool {
        let worldspaces = self.worldspaces.read();
        match worldspaces.get(&worldspace) {
            Some(state) => state
                .tiles
                .values()
                .any(|agg| !agg.objects.is_empty() || agg.water.is_some() || agg.heightfield.is_some()),
            None => false,
        }
    }

    fn tiles_touching(&self, worldspace: WorldspaceId, aabb: WorldAabb) -> Vec<TilePosition> {
        let worldspaces = self.worldspaces.read();
        match worldspaces.get(&worldspace) {
            Some(state) => tile_range_for_aabb(aabb, state.tile_size),
            None => Vec::new(),
        }
    }
}

enum Op {
    AddOrUpdateObject {
        id: ObjectId,
        shape: Arc<dyn CollisionShape>,
        area: AreaType,
    },
    RemoveObject {
        id: ObjectId,
    },
    SetWater {
        aabb: WorldAabb,
        depth: f32,
    },
    RemoveWater,
    SetHeightfield {
        heightfield: Heightfield,
    },
    RemoveHeightfield {
        tile: TilePosition,
    },
}

/// A batch of pending mutations to one worldspace's recast-mesh cache.
///
/// Move-only by convention (no `Clone`/`Copy`): building the guard, adding
/// operations to it, then letting it drop (or calling [`commit`](Self::commit)
/// explicitly) is the only supported flow, mirroring the teacher's
/// claim-then-release-on-drop discipline in `bulk_preload.rs`'s cancellation
/// guard.
pub struct UpdateGuard<'a> {
    cache: &'a RecastMeshCache,
    worldspace: WorldspaceId,
    ops: Vec<(ObjectId, Op)>,
    changed_tiles: Vec<TilePosition>,
    committed: bool,
}

impl<'a> UpdateGuard<'a> {
    pub fn add_or_update_object(
        &mut self,
        id: ObjectId,
        shape: Arc<dyn CollisionShape>,
        area: AreaType,
    ) {
        self.ops.push((
            id,
            Op::AddOrUpdateObject {
                id,
                shape,
                area,
            },
        ));
    }

    pub fn remove_object(&mut self, id: ObjectId) {
        self.ops.push((id, Op::RemoveObject { id }));
    }

    pub fn set_water(&mut self, id: ObjectId, aabb: WorldAabb, depth: f32) {
        self.ops.push((id, Op::SetWater { aabb, depth }));
    }

    pub fn remove_water(&mut self, id: ObjectId) {
        self.ops.push((id, Op::RemoveWater));
    }

    /// Add a heightfield for `heightfield.tile`. Per spec I2, a tile that
    /// already has a heightfield silently ignores this.
    pub fn set_heightfield(&mut self, heightfield: Heightfield) {
        self.ops.push((ObjectId(0), Op::SetHeightfield { heightfield }));
    }

    pub fn remove_heightfield(&mut self, tile: TilePosition) {
        self.ops.push((ObjectId(0), Op::RemoveHeightfield { tile }));
    }

    /// Tiles touched by at least one mutation that actually changed content
    /// (revision bumped). Populated only after [`commit`](Self::commit) runs.
    pub fn changed_tiles(&self) -> &[TilePosition] {
        &self.changed_tiles
    }

    /// Apply every buffered operation atomically with respect to readers.
    /// Safe to call at most once; a guard that is dropped without an
    /// explicit call commits automatically.
    pub fn commit(mut self) -> Vec<TilePosition> {
        self.apply();
        std::mem::take(&mut self.changed_tiles)
    }

    fn apply(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;

        let mut worldspaces = self.cache.worldspaces.write();
        let Some(state) = worldspaces.get_mut(&self.worldspace) else {
            return;
        };
        let tile_size = state.tile_size;

        let mut touched: HashMap<TilePosition, bool> = HashMap::new();

        for (_id, op) in self.ops.drain(..) {
            match op {
                Op::AddOrUpdateObject { id, shape, area } => {
                    let aabb = shape.world_aabb();
                    let tiles = tile_range_for_aabb(aabb, tile_size);
                    for tile in tiles {
                        let agg = state.tiles.entry(tile).or_default();
                        agg.objects.insert(
                            id,
                            ObjectRecord {
                                shape: shape.clone(),
                                area,
                                cumulative_aabb: aabb,
                            },
                        );
                        touched.entry(tile).or_insert(false);
                    }
                }
                Op::RemoveObject { id } => {
                    let mut removed_from = Vec::new();
                    for (tile, agg) in state.tiles.iter_mut() {
                        if agg.objects.remove(&id).is_some() {
                            removed_from.push(*tile);
                        }
                    }
                    for tile in removed_from {
                        touched.entry(tile).or_insert(false);
                    }
                }
                Op::SetWater { aabb, depth } => {
                    let tiles = tile_range_for_aabb(aabb, tile_size);
                    for tile in tiles {
                        let agg = state.tiles.entry(tile).or_default();
                        // I2: only the first water plane registered on a
                        // tile takes effect; later additions are ignored.
                        if agg.water.is_none() {
                            agg.water = Some((aabb, depth));
                            touched.entry(tile).or_insert(false);
                        }
                    }
                }
                Op::RemoveWater => {
                    for (tile, agg) in state.tiles.iter_mut() {
                        if agg.water.take().is_some() {
                            touched.entry(*tile).or_insert(false);
                        }
                    }
                }
                Op::SetHeightfield { heightfield } => {
                    let tile = heightfield.tile;
                    let agg = state.tiles.entry(tile).or_default();
                    // I2: only the first heightfield registered on a tile
                    // takes effect.
                    if agg.heightfield.is_none() {
                        agg.heightfield = Some(heightfield);
                        touched.entry(tile).or_insert(false);
                    }
                }
                Op::RemoveHeightfield { tile } => {
                    if let Some(agg) = state.tiles.get_mut(&tile) {
                        if agg.heightfield.take().is_some() {
                            touched.entry(tile).or_insert(false);
                        }
                    }
                }
            }
        }

        for tile in touched.keys().copied().collect::<Vec<_>>() {
            let agg = state.tiles.entry(tile).or_default();
            let new_fingerprint = agg.fingerprint();
            if new_fingerprint != agg.content_fingerprint || agg.revision == 0 {
                agg.revision += 1;
                agg.content_fingerprint = new_fingerprint;
                self.changed_tiles.push(tile);
            }
        }
    }
}

impl<'a> Drop for UpdateGuard<'a> {
    fn drop(&mut self) {
        self.apply();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{Triangle, TriangleSoup};

    fn tri(offset: f32) -> Arc<dyn CollisionShape> {
        Arc::new(TriangleSoup::new(vec![Triangle {
            vertices: [
                [offset, offset, 0.0],
                [offset + 1.0, offset, 0.0],
                [offset, offset + 1.0, 0.0],
            ],
            area: AreaType::Ground,
        }]))
    }

    #[test]
    fn add_object_bumps_revision_once() {
        let cache = RecastMeshCache::new();
        let ws = WorldspaceId(1);
        cache.register_worldspace(ws, 64.0);

        {
            let mut guard = cache.begin_update(ws);
            guard.add_or_update_object(ObjectId(1), tri(0.0), AreaType::Ground);
            let changed = guard.commit();
            assert_eq!(changed, vec![TilePosition::new(0, 0)]);
        }

        let mesh = cache.snapshot(ws, TilePosition::new(0, 0)).unwrap();
        assert_eq!(mesh.version.revision, 1);
    }

    #[test]
    fn bit_identical_recommit_does_not_bump_revision() {
        let cache = RecastMeshCache::new();
        let ws = WorldspaceId(1);
        cache.register_worldspace(ws, 64.0);

        let shape = tri(0.0);
        {
            let mut guard = cache.begin_update(ws);
            guard.add_or_update_object(ObjectId(1), shape.clone(), AreaType::Ground);
            guard.commit();
        }
        let v1 = cache.snapshot(ws, TilePosition::new(0, 0)).unwrap().version;

        {
            let mut guard = cache.begin_update(ws);
            guard.add_or_update_object(ObjectId(1), shape.clone(), AreaType::Ground);
            let changed = guard.commit();
            assert!(changed.is_empty(), "identical re-add must not be reported as changed");
        }
        let v2 = cache.snapshot(ws, TilePosition::new(0, 0)).unwrap().version;
        assert_eq!(v1, v2);
    }

    #[test]
    fn remove_worldspace_bumps_generation() {
        let cache = RecastMeshCache::new();
        let ws = WorldspaceId(1);
        cache.register_worldspace(ws, 64.0);
        assert_eq!(cache.generation(ws), 0);
        cache.remove_worldspace(ws);
        assert_eq!(cache.generation(ws), 1);
    }

    #[test]
    fn second_water_plane_on_same_tile_is_ignored() {
        let cache = RecastMeshCache::new();
        let ws = WorldspaceId(1);
        cache.register_worldspace(ws, 64.0);

        let tile = TilePosition::new(0, 0);
        let aabb = WorldAabb::new([0.0, 0.0, 0.0], [10.0, 10.0, 0.0]);
        {
            let mut guard = cache.begin_update(ws);
            guard.set_water(ObjectId(1), aabb, 5.0);
            let changed = guard.commit();
            assert_eq!(changed, vec![tile]);
        }
        let v1 = cache.snapshot(ws, tile).unwrap();
        assert_eq!(v1.water, Some((aabb, 5.0)));

        {
            let mut guard = cache.begin_update(ws);
            guard.set_water(ObjectId(2), aabb, 99.0);
            let changed = guard.commit();
            assert!(changed.is_empty(), "a second water plane must be silently ignored (I2)");
        }
        let v2 = cache.snapshot(ws, tile).unwrap();
        assert_eq!(v2.version, v1.version);
        assert_eq!(v2.water, Some((aabb, 5.0)));
    }

    #[test]
    fn heightfield_aggregates_and_respects_i2() {
        let cache = RecastMeshCache::new();
        let ws = WorldspaceId(1);
        cache.register_worldspace(ws, 64.0);

        let tile = TilePosition::new(0, 0);
        let hf = Heightfield::flat(tile, 1.0, -25.0);
        {
            let mut guard = cache.begin_update(ws);
            guard.set_heightfield(hf.clone());
            let changed = guard.commit();
            assert_eq!(changed, vec![tile]);
        }
        let snapshot = cache.snapshot(ws, tile).unwrap();
        assert_eq!(snapshot.heightfield, Some(hf));

        let other = Heightfield::flat(tile, 1.0, -50.0);
        {
            let mut guard = cache.begin_update(ws);
            guard.set_heightfield(other);
            let changed = guard.commit();
            assert!(changed.is_empty(), "a second heightfield must be silently ignored (I2)");
        }

        {
            let mut guard = cache.begin_update(ws);
            guard.remove_heightfield(tile);
            guard.commit();
        }
        assert!(cache.snapshot(ws, tile).is_none());
    }

    #[test]
    fn drop_without_explicit_commit_still_applies() {
        let cache = RecastMeshCache::new();
        let ws = WorldspaceId(1);
        cache.register_worldspace(ws, 64.0);
        {
            let mut guard = cache.begin_update(ws);
            guard.add_or_update_object(ObjectId(5), tri(10.0), AreaType::Water);
        }
        assert!(cache.snapshot(ws, TilePosition::new(0, 0)).is_some());
    }
}
