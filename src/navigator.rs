//! Public façade: the single entry point embedders use to register
//! worldspace geometry, register agents, and run navmesh queries.
//!
//! Grounded on the teacher's top-level `TileScheduler` (the type external
//! callers actually hold in `scheduler.rs`): one struct owning the cache,
//! the queue and the worker pool, exposing a small set of methods that
//! hide all three. The query surface here (`find_path`, `raycast`,
//! `find_nearest_position`, `find_random_point_around_circle`) is
//! deliberately infallible at the type level — failures are encoded in
//! [`PathStatus`] rather than `Result`, matching how Detour itself reports
//! query outcomes, and resolving the spec's apparent tension between
//! listing "plan paths across navmeshes" as a non-goal and separately
//! specifying `findPath`'s full behavior: this crate does not implement
//! pathfinding itself, it only orchestrates calls into an injected
//! [`NavMeshEngine`] and is responsible for nothing more than gathering a
//! consistent tile snapshot first.

use crate::config::NavigatorConfig;
use crate::error::NavResult;
use crate::job_queue::{JobQueue, Reason};
use crate::nav_mesh_store::TileStateStore;
use crate::recast_mesh::RecastMeshCache;
use crate::shape::{
    AgentBounds, AgentId, BuiltTile, CollisionShape, Heightfield, NavMeshEngine,
    NullProgressListener, ObjectId, PathResult, PathStatus, ProgressListener, TileBuilder,
};
use crate::tile_db::{FileTileDb, MemoryTileDb, PersistentDb, RowKey};
use crate::tiles::{tile_range_for_aabb, AreaType, NavFlags, TilePosition, WorldAabb, WorldspaceId};
use crate::updater::{AsyncUpdater, UpdaterContext};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

struct AgentRecord {
    worldspace: WorldspaceId,
    bounds: AgentBounds,
    flags: NavFlags,
    last_position: [f32; 3],
}

/// Owns every subsystem (geometry cache, tile store, persistent DB, job
/// queue, worker pool) and exposes the operations embedders call.
pub struct Navigator {
    config: NavigatorConfig,
    mesh_cache: Arc<RecastMeshCache>,
    tile_store: Arc<TileStateStore>,
    db: Arc<dyn PersistentDb>,
    queue: Arc<JobQueue>,
    engine: Arc<dyn NavMeshEngine>,
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    updater: Option<AsyncUpdater>,
}

impl Navigator {
    /// Build a navigator backed by an in-memory (non-persistent) tile DB.
    pub fn new(
        config: NavigatorConfig,
        builder: Arc<dyn TileBuilder>,
        engine: Arc<dyn NavMeshEngine>,
    ) -> Self {
        Self::with_db(config, builder, engine, Arc::new(MemoryTileDb::new()))
    }

    /// Build a navigator backed by an on-disk tile DB at `path`.
    pub fn open(
        config: NavigatorConfig,
        builder: Arc<dyn TileBuilder>,
        engine: Arc<dyn NavMeshEngine>,
        path: impl AsRef<Path>,
    ) -> NavResult<Self> {
        let db = Arc::new(FileTileDb::open(
            path,
            config.max_db_file_size,
            config.compress_db_rows,
        )?);
        Ok(Self::with_db(config, builder, engine, db))
    }

    fn with_db(
        config: NavigatorConfig,
        builder: Arc<dyn TileBuilder>,
        engine: Arc<dyn NavMeshEngine>,
        db: Arc<dyn PersistentDb>,
    ) -> Self {
        let mesh_cache = Arc::new(RecastMeshCache::new());
        let tile_store = Arc::new(TileStateStore::new(config.max_tiles_number));
        let queue = Arc::new(JobQueue::new(config.max_tiles_built_per_second));

        let ctx = Arc::new(UpdaterContext {
            queue: queue.clone(),
            mesh_cache: mesh_cache.clone(),
            tile_store: tile_store.clone(),
            db: db.clone(),
            builder,
            progress: Arc::new(NullProgressListener),
            tile_size: config.tile_size,
            write_to_db: config.write_to_db,
        });
        let updater = Some(AsyncUpdater::start(ctx, config.max_worker_threads));

        Self {
            config,
            mesh_cache,
            tile_store,
            db,
            queue,
            engine,
            agents: RwLock::new(HashMap::new()),
            updater,
        }
    }

    /// Replace the progress listener used to report build activity. Only
    /// meaningful before the first update; the worker pool captures the
    /// listener at construction the way the teacher's preloader captures
    /// its thread pool once, up front.
    pub fn with_progress_listener(
        config: NavigatorConfig,
        builder: Arc<dyn TileBuilder>,
        engine: Arc<dyn NavMeshEngine>,
        progress: Arc<dyn ProgressListener>,
    ) -> Self {
        let mesh_cache = Arc::new(RecastMeshCache::new());
        let tile_store = Arc::new(TileStateStore::new(config.max_tiles_number));
        let db: Arc<dyn PersistentDb> = Arc::new(MemoryTileDb::new());
        let queue = Arc::new(JobQueue::new(config.max_tiles_built_per_second));

        let ctx = Arc::new(UpdaterContext {
            queue: queue.clone(),
            mesh_cache: mesh_cache.clone(),
            tile_store: tile_store.clone(),
            db: db.clone(),
            builder,
            progress,
            tile_size: config.tile_size,
            write_to_db: config.write_to_db,
        });
        let updater = Some(AsyncUpdater::start(ctx, config.max_worker_threads));

        Self {
            config,
            mesh_cache,
            tile_store,
            db,
            queue,
            engine,
            agents: RwLock::new(HashMap::new()),
            updater,
        }
    }

    pub fn register_worldspace(&self, id: WorldspaceId) {
        self.mesh_cache.register_worldspace(id, self.config.tile_size);
    }

    pub fn remove_worldspace(&self, id: WorldspaceId) {
        self.mesh_cache.remove_worldspace(id);
        self.tile_store.remove_worldspace(id);
        let _ = self.db.remove_worldspace(id);
    }

    /// Begin a batch of geometry mutations against `worldspace`. Nothing
    /// is enqueued for rebuild until [`commit_update`](Self::commit_update)
    /// is called with the guard's changed tiles.
    pub fn begin_update(&self, worldspace: WorldspaceId) -> crate::recast_mesh::UpdateGuard<'_> {
        self.mesh_cache.begin_update(worldspace)
    }

    /// Commit a batch started with [`begin_update`](Self::begin_update):
    /// applies the buffered mutations and enqueues a rebuild for every
    /// tile whose content actually changed, for every agent-bounds bucket
    /// currently registered in `worldspace`.
    pub fn commit_update(&self, worldspace: WorldspaceId, guard: crate::recast_mesh::UpdateGuard<'_>) {
        let changed = guard.commit();
        if changed.is_empty() {
            return;
        }
        log::debug!("{} tile(s) changed in {:?}, scheduling rebuilds", changed.len(), worldspace);
        let buckets = self.active_buckets_for(worldspace);
        for tile in changed {
            for bounds in &buckets {
                let key = RowKey::new(worldspace, tile, bounds);
                self.queue.enqueue(key, Reason::Invalidated);
            }
        }
    }

    fn active_buckets_for(&self, worldspace: WorldspaceId) -> Vec<AgentBounds> {
        let agents = self.agents.read();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for record in agents.values() {
            if record.worldspace != worldspace {
                continue;
            }
            if seen.insert(record.bounds.bucket_key()) {
                out.push(record.bounds);
            }
        }
        out
    }

    /// Register an agent. Returns `None` if `bounds` fails the plausibility
    /// check (spec §4.7's "agent too large" scenarios: half-extents at or
    /// beyond [`AgentBounds::MAX_HALF_EXTENT`]).
    pub fn add_agent(
        &self,
        worldspace: WorldspaceId,
        bounds: AgentBounds,
        flags: NavFlags,
        initial_position: [f32; 3],
    ) -> Option<AgentId> {
        if !bounds.is_plausible() {
            log::warn!("rejecting agent with implausible bounds {:?}", bounds);
            return None;
        }
        let id = AgentId(next_agent_id());
        self.agents.write().insert(
            id,
            AgentRecord {
                worldspace,
                bounds,
                flags,
                last_position: initial_position,
            },
        );
        self.update_active_window(id);
        Some(id)
    }

    pub fn remove_agent(&self, id: AgentId) {
        self.agents.write().remove(&id);
    }

    /// Report an agent's new position, enqueuing prefetch for any tiles in
    /// its active window that aren't built yet.
    pub fn update_agent_position(&self, id: AgentId, position: [f32; 3]) {
        {
            let mut agents = self.agents.write();
            if let Some(record) = agents.get_mut(&id) {
                record.last_position = position;
            } else {
                return;
            }
        }
        self.update_active_window(id);
    }

    /// Report new positions for many agents at once (e.g. once per frame
    /// for a crowd), recomputing each agent's active window in parallel.
    /// Grounded on the teacher's `scheduler.rs::prefetch_for_viewport`,
    /// which fans a batch of tile requests out over `rayon::par_iter`
    /// rather than looping sequentially.
    pub fn update_agent_positions_bulk(&self, updates: &[(AgentId, [f32; 3])]) {
        {
            let mut agents = self.agents.write();
            for (id, position) in updates {
                if let Some(record) = agents.get_mut(id) {
                    record.last_position = *position;
                }
            }
        }
        updates
            .par_iter()
            .for_each(|(id, _)| self.update_active_window(*id));
    }

    fn update_active_window(&self, id: AgentId) {
        let (worldspace, bounds, position) = {
            let agents = self.agents.read();
            let Some(record) = agents.get(&id) else {
                return;
            };
            (record.worldspace, record.bounds, record.last_position)
        };

        let radius = self.config.tile_radius as f64 * self.config.tile_size;
        let window = WorldAabb::new(
            [
                position[0] as f64 - radius,
                position[1] as f64 - radius,
                f32::MIN as f64,
            ],
            [
                position[0] as f64 + radius,
                position[1] as f64 + radius,
                f32::MAX as f64,
            ],
        );
        let tiles = tile_range_for_aabb(window, self.config.tile_size);
        let in_window: HashSet<TilePosition> = tiles.iter().copied().collect();
        for tile in &tiles {
            let key = RowKey::new(worldspace, *tile, &bounds);
            if !self.tile_store.contains(&key) && !self.queue.is_in_flight(&key) {
                self.queue.enqueue(key, Reason::Prefetch);
            }
        }

        // Prune tiles that fell out of the window (spec §4.7 `update`: "prune
        // tiles falling out of the window"; property P1 requires the final
        // store to hold exactly the in-window tiles for each agent).
        let bucket = bounds.bucket_key();
        for resident in self.tile_store.resident_tiles_for(worldspace, bucket) {
            if !in_window.contains(&resident) {
                let key = RowKey::new(worldspace, resident, &bounds);
                self.tile_store.remove(&key);
            }
        }
    }

    /// Ensure every tile `points` would need is built, then run `engine`'s
    /// query against the gathered snapshot. Shared by every query method
    /// below: this crate's entire contribution to pathfinding is "collect
    /// the right tiles, then hand them to the real engine".
    fn gather_tiles(
        &self,
        worldspace: WorldspaceId,
        bounds: &AgentBounds,
        points: &[[f32; 3]],
        wait_for_builds: bool,
    ) -> Vec<BuiltTile> {
        let mut aabb: Option<WorldAabb> = None;
        for p in points {
            let p64 = [p[0] as f64, p[1] as f64, p[2] as f64];
            let point_box = WorldAabb::new(p64, p64);
            aabb = Some(match aabb {
                Some(a) => a.union(point_box),
                None => point_box,
            });
        }
        let Some(aabb) = aabb else { return Vec::new() };

        let tiles = tile_range_for_aabb(aabb, self.config.tile_size);
        let keys: Vec<RowKey> = tiles
            .iter()
            .map(|t| RowKey::new(worldspace, *t, bounds))
            .collect();

        for key in &keys {
            if !self.tile_store.contains(key) {
                self.queue.enqueue(*key, Reason::OnDemand);
            }
        }
        if wait_for_builds {
            self.queue.wait_tiles_settled(&keys);
        }

        keys.iter().filter_map(|k| self.tile_store.get(k)).collect()
    }

    /// Find a path for `agent` between `start` and `end`. Blocks until the
    /// tiles the route would need are built (or fail to build).
    ///
    /// No-coverage cases are resolved before ever calling the engine (spec
    /// §8 boundary behaviours): an empty world (nothing registered anywhere
    /// in the worldspace) reports `NavMeshNotFound`; an agent with no
    /// geometry under its own active window reports `StartPolygonNotFound`.
    pub fn find_path(&self, agent: AgentId, start: [f32; 3], end: [f32; 3]) -> PathResult {
        let Some((worldspace, bounds, flags)) = self.agent_view(agent) else {
            return PathResult {
                status: PathStatus::NavMeshNotFound,
                points: Vec::new(),
            };
        };
        let tiles = self.gather_tiles(worldspace, &bounds, &[start, end], true);
        if tiles.is_empty() {
            let status = if self.mesh_cache.has_content(worldspace) {
                PathStatus::StartPolygonNotFound
            } else {
                PathStatus::NavMeshNotFound
            };
            return PathResult {
                status,
                points: Vec::new(),
            };
        }
        self.engine.find_path(&tiles, &bounds, flags, start, end)
    }

    pub fn raycast(&self, agent: AgentId, start: [f32; 3], end: [f32; 3]) -> PathResult {
        let Some((worldspace, bounds, flags)) = self.agent_view(agent) else {
            return PathResult {
                status: PathStatus::NavMeshNotFound,
                points: Vec::new(),
            };
        };
        let tiles = self.gather_tiles(worldspace, &bounds, &[start, end], true);
        self.engine.raycast(&tiles, &bounds, flags, start, end)
    }

    pub fn find_nearest_position(
        &self,
        agent: AgentId,
        point: [f32; 3],
        search_extent: [f32; 3],
    ) -> Option<[f32; 3]> {
        let (worldspace, bounds, _flags) = self.agent_view(agent)?;
        let tiles = self.gather_tiles(worldspace, &bounds, &[point], true);
        self.engine
            .find_nearest_position(&tiles, &bounds, point, search_extent)
    }

    pub fn find_random_point_around_circle(
        &self,
        agent: AgentId,
        center: [f32; 3],
        radius: f32,
        seed: u64,
    ) -> Option<[f32; 3]> {
        let (worldspace, bounds, _flags) = self.agent_view(agent)?;
        let tiles = self.gather_tiles(worldspace, &bounds, &[center], true);
        self.engine
            .find_random_point_around_circle(&tiles, &bounds, center, radius, seed)
    }

    fn agent_view(&self, agent: AgentId) -> Option<(WorldspaceId, AgentBounds, NavFlags)> {
        let agents = self.agents.read();
        agents
            .get(&agent)
            .map(|r| (r.worldspace, r.bounds, r.flags))
    }

    /// Add an object's geometry directly, outside an explicit
    /// [`begin_update`](Self::begin_update) batch, for the common case of a
    /// single-object change.
    pub fn add_object(
        &self,
        worldspace: WorldspaceId,
        id: ObjectId,
        shape: Arc<dyn CollisionShape>,
        area: AreaType,
    ) {
        let mut guard = self.begin_update(worldspace);
        guard.add_or_update_object(id, shape, area);
        self.commit_update(worldspace, guard);
    }

    pub fn remove_object(&self, worldspace: WorldspaceId, id: ObjectId) {
        let mut guard = self.begin_update(worldspace);
        guard.remove_object(id);
        self.commit_update(worldspace, guard);
    }

    /// Add a water plane covering `aabb`. Per I2, a tile that already has
    /// water on it silently ignores this (the tile's revision is
    /// unaffected).
    pub fn add_water(&self, worldspace: WorldspaceId, id: ObjectId, aabb: WorldAabb, depth: f32) {
        let mut guard = self.begin_update(worldspace);
        guard.set_water(id, aabb, depth);
        self.commit_update(worldspace, guard);
    }

    pub fn remove_water(&self, worldspace: WorldspaceId, id: ObjectId) {
        let mut guard = self.begin_update(worldspace);
        guard.remove_water(id);
        self.commit_update(worldspace, guard);
    }

    /// Add a heightfield to its tile. Per I2, a tile that already has a
    /// heightfield silently ignores this.
    pub fn add_heightfield(&self, worldspace: WorldspaceId, heightfield: Heightfield) {
        let mut guard = self.begin_update(worldspace);
        guard.set_heightfield(heightfield);
        self.commit_update(worldspace, guard);
    }

    pub fn remove_heightfield(&self, worldspace: WorldspaceId, tile: TilePosition) {
        let mut guard = self.begin_update(worldspace);
        guard.remove_heightfield(tile);
        self.commit_update(worldspace, guard);
    }

    /// Block until every queued and in-flight build finishes. Used by
    /// callers that want a fully up-to-date navmesh before proceeding (e.g.
    /// a loading screen).
    pub fn wait_all_jobs_done(&self) {
        self.queue.wait_all_done();
    }

    pub fn pending_job_count(&self) -> usize {
        self.queue.pending_len()
    }

    pub fn tile_store_stats(&self) -> crate::nav_mesh_store::TileStoreStats {
        self.tile_store.stats()
    }
}

impl Drop for Navigator {
    fn drop(&mut self) {
        if let Some(updater) = self.updater.take() {
            updater.cancel();
        }
    }
}

static NEXT_AGENT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn next_agent_id() -> u64 {
    NEXT_AGENT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{BuildError, BuildTileInput, CollisionShapeKind, Triangle, TriangleSoup};

    struct FakeBuilder;
    impl TileBuilder for FakeBuilder {
        fn build_tile(&self, input: &BuildTileInput) -> Result<BuiltTile, BuildError> {
            Ok(BuiltTile {
                data: bytes::Bytes::from(vec![input.tile.x as u8, input.tile.y as u8]),
            })
        }
    }

    struct FakeEngine;
    impl NavMeshEngine for FakeEngine {
        fn find_path(
            &self,
            tiles: &[BuiltTile],
            _agent_bounds: &AgentBounds,
            _flags: NavFlags,
            start: [f32; 3],
            end: [f32; 3],
        ) -> PathResult {
            if tiles.is_empty() {
                PathResult {
                    status: PathStatus::NavMeshNotFound,
                    points: Vec::new(),
                }
            } else {
                PathResult {
                    status: PathStatus::Success,
                    points: vec![start, end],
                }
            }
        }

        fn find_nearest_position(
            &self,
            _tiles: &[BuiltTile],
            _agent_bounds: &AgentBounds,
            point: [f32; 3],
            _search_extent: [f32; 3],
        ) -> Option<[f32; 3]> {
            Some(point)
        }

        fn raycast(
            &self,
            _tiles: &[BuiltTile],
            _agent_bounds: &AgentBounds,
            _flags: NavFlags,
            start: [f32; 3],
            _end: [f32; 3],
        ) -> PathResult {
            PathResult {
                status: PathStatus::Success,
                points: vec![start],
            }
        }

        fn find_random_point_around_circle(
            &self,
            _tiles: &[BuiltTile],
            _agent_bounds: &AgentBounds,
            center: [f32; 3],
            _radius: f32,
            _seed: u64,
        ) -> Option<[f32; 3]> {
            Some(center)
        }
    }

    fn navigator() -> Navigator {
        Navigator::new(
            NavigatorConfig::default(),
            Arc::new(FakeBuilder),
            Arc::new(FakeEngine),
        )
    }

    #[test]
    fn oversized_agent_is_rejected() {
        let nav = navigator();
        let ws = WorldspaceId(1);
        nav.register_worldspace(ws);
        let huge = AgentBounds::new(CollisionShapeKind::Aabb, [1.0e6, 1.0e6, 1.0e6]);
        assert!(nav.add_agent(ws, huge, NavFlags::WALK, [0.0, 0.0, 0.0]).is_none());
    }

    #[test]
    fn find_path_builds_tiles_and_succeeds() {
        let nav = navigator();
        let ws = WorldspaceId(1);
        nav.register_worldspace(ws);

        nav.add_object(
            ws,
            ObjectId(1),
            Arc::new(TriangleSoup::new(vec![Triangle {
                vertices: [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                area: AreaType::Ground,
            }])),
            AreaType::Ground,
        );

        let bounds = AgentBounds::new(CollisionShapeKind::Cylinder, [0.3, 0.3, 0.9]);
        let agent = nav
            .add_agent(ws, bounds, NavFlags::WALK, [0.0, 0.0, 0.0])
            .unwrap();
        nav.wait_all_jobs_done();

        let result = nav.find_path(agent, [0.0, 0.0, 0.0], [10.0, 0.0, 0.0]);
        assert_eq!(result.status, PathStatus::Success);
    }

    #[test]
    fn bulk_position_update_refreshes_all_agents() {
        let nav = navigator();
        let ws = WorldspaceId(1);
        nav.register_worldspace(ws);
        let bounds = AgentBounds::new(CollisionShapeKind::Cylinder, [0.3, 0.3, 0.9]);

        for (id, x) in [(1, 100.0), (2, -100.0)] {
            nav.add_object(
                ws,
                ObjectId(id),
                Arc::new(TriangleSoup::new(vec![Triangle {
                    vertices: [[x, 0.0, 0.0], [x + 1.0, 0.0, 0.0], [x, 1.0, 0.0]],
                    area: AreaType::Ground,
                }])),
                AreaType::Ground,
            );
        }

        let a = nav.add_agent(ws, bounds, NavFlags::WALK, [0.0, 0.0, 0.0]).unwrap();
        let b = nav.add_agent(ws, bounds, NavFlags::WALK, [0.0, 0.0, 0.0]).unwrap();

        nav.update_agent_positions_bulk(&[(a, [100.0, 0.0, 0.0]), (b, [-100.0, 0.0, 0.0])]);
        nav.wait_all_jobs_done();

        assert!(nav.tile_store_stats().resident_tiles > 0);
    }

    #[test]
    fn find_path_for_unknown_agent_is_nav_mesh_not_found() {
        let nav = navigator();
        let result = nav.find_path(AgentId(9999), [0.0, 0.0, 0.0], [1.0, 0.0, 0.0]);
        assert_eq!(result.status, PathStatus::NavMeshNotFound);
    }

    #[test]
    fn find_path_in_empty_world_is_nav_mesh_not_found() {
        let nav = navigator();
        let ws = WorldspaceId(1);
        nav.register_worldspace(ws);
        let bounds = AgentBounds::new(CollisionShapeKind::Cylinder, [0.3, 0.3, 0.9]);
        let agent = nav
            .add_agent(ws, bounds, NavFlags::WALK, [0.0, 0.0, 0.0])
            .unwrap();
        nav.wait_all_jobs_done();

        let result = nav.find_path(agent, [0.0, 0.0, 0.0], [10.0, 0.0, 0.0]);
        assert_eq!(result.status, PathStatus::NavMeshNotFound);
    }

    #[test]
    fn water_and_heightfield_are_reachable_from_the_facade() {
        let nav = navigator();
        let ws = WorldspaceId(1);
        nav.register_worldspace(ws);

        let tile = TilePosition::new(0, 0);
        let aabb = WorldAabb::new([0.0, 0.0, 0.0], [10.0, 10.0, 0.0]);
        nav.add_water(ws, ObjectId(1), aabb, 50.0);
        nav.add_heightfield(ws, crate::shape::Heightfield::flat(tile, 1.0, -25.0));
        nav.wait_all_jobs_done();

        let bounds = AgentBounds::new(CollisionShapeKind::Cylinder, [0.3, 0.3, 0.9]);
        let agent = nav
            .add_agent(ws, bounds, NavFlags::WALK | NavFlags::SWIM, [0.0, 0.0, 0.0])
            .unwrap();
        nav.wait_all_jobs_done();

        let result = nav.find_path(agent, [0.0, 0.0, 0.0], [1.0, 0.0, 0.0]);
        assert_eq!(result.status, PathStatus::Success);

        nav.remove_water(ws, ObjectId(1));
        nav.remove_heightfield(ws, tile);
    }
}
