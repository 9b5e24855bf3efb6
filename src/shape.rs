//! Collision shapes, agent bounds, and the external collaborator traits
//! (`TileBuilder`, `NavMeshEngine`) that stand in for the real Recast/Detour
//! rasterizer and pathfinder. Rasterizing a heightfield into a navmesh tile
//! and searching a compiled navmesh are both out of scope; this crate only
//! ever calls through these trait objects and is responsible for what goes
//! in and what comes out.
//!
//! Grounded on the teacher's `decoder.rs` (a narrow trait-like boundary
//! around an external codec the crate does not implement itself) and on
//! `original_source/components/detournavigator/recastmeshobject.{hpp,cpp}`
//! for the agent-bounds quantisation grid (distinct agents whose bounds are
//! "close enough" share one cached recast-mesh/tile set rather than each
//! rebuilding their own).

use crate::tiles::{AreaType, TilePosition, WorldAabb, WorldspaceId};
use std::sync::Arc;

/// Stable identity for any object placed in a worldspace (world geometry,
/// doors, heightfields). Distinct from `AgentId` to make the type system
/// catch mixing the two up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

/// Stable identity for an agent registered with the navigator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub u64);

/// Shape used to approximate an agent's collision volume while building
/// navmesh tiles for it. Each variant carries its half-extents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CollisionShapeKind {
    /// `[half_x, half_y, half_z]` world-aligned box.
    Aabb,
    /// Radius + half-height cylinder, always upright.
    Cylinder,
    /// Radius + half-height box that rotates to face the agent's heading.
    RotatingBox,
}

/// An agent's collision volume, used both to decide which recast-mesh
/// "flavor" to build (ground clearance, step height) and to reject
/// obviously-broken configurations before they reach the builder.
///
/// Quantised on construction: two agents whose half-extents differ by less
/// than [`QUANTUM`](AgentBounds::QUANTUM) share one bucket, so the tile
/// cache and builder see one recast-mesh config rather than one per agent.
/// This mirrors `recastmeshobject.cpp`'s rationale for keying builds by a
/// rounded agent half-extent rather than the raw float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentBounds {
    pub kind: CollisionShapeKind,
    pub half_extents: [f32; 3],
}

impl AgentBounds {
    /// Quantisation step, in world units. Chosen well below any plausible
    /// gameplay-visible difference in agent radius.
    pub const QUANTUM: f32 = 1.0 / 64.0;

    /// Upper bound on any half-extent component. Anything at or beyond this
    /// is rejected outright (spec §4.7's "agent too large" scenarios use
    /// half-extents around 2043/2890, comfortably inside this limit; a
    /// worldspace-spanning agent is not).
    pub const MAX_HALF_EXTENT: f32 = 1.0e4;

    pub fn new(kind: CollisionShapeKind, half_extents: [f32; 3]) -> Self {
        let q = |v: f32| (v / Self::QUANTUM).round() * Self::QUANTUM;
        Self {
            kind,
            half_extents: [q(half_extents[0]), q(half_extents[1]), q(half_extents[2])],
        }
    }

    /// True if every component is finite, non-negative and below the
    /// absolute size limit. Agents failing this are rejected during
    /// registration (spec §4.7, agent-too-large scenarios).
    pub fn is_plausible(&self) -> bool {
        self.half_extents
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0 && *v < Self::MAX_HALF_EXTENT)
    }

    /// Key used to bucket agents with equivalent bounds into one cached
    /// build, bit-exact because both inputs were already snapped to the
    /// quantisation grid.
    pub fn bucket_key(&self) -> (u8, [i64; 3]) {
        let kind = match self.kind {
            CollisionShapeKind::Aabb => 0,
            CollisionShapeKind::Cylinder => 1,
            CollisionShapeKind::RotatingBox => 2,
        };
        let to_fixed = |v: f32| (v / Self::QUANTUM).round() as i64;
        (
            kind,
            [
                to_fixed(self.half_extents[0]),
                to_fixed(self.half_extents[1]),
                to_fixed(self.half_extents[2]),
            ],
        )
    }
}

/// A single collision triangle, already transformed into world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub vertices: [[f32; 3]; 3],
    pub area: AreaType,
}

/// An arbitrary collision mesh contributed by one object. Kept abstract
/// (just triangles plus a bounding AABB) since rasterizing the triangles is
/// entirely the builder's concern.
pub trait CollisionShape: Send + Sync {
    fn triangles(&self) -> &[Triangle];
    fn world_aabb(&self) -> WorldAabb;
}

/// Plain triangle-soup implementation of [`CollisionShape`], sufficient for
/// every object this crate tracks (static geometry, doors, heightfields
/// converted to triangles by the caller).
#[derive(Debug, Clone)]
pub struct TriangleSoup {
    triangles: Vec<Triangle>,
    aabb: WorldAabb,
}

impl TriangleSoup {
    pub fn new(triangles: Vec<Triangle>) -> Self {
        let aabb = triangles.iter().fold(None, |acc: Option<WorldAabb>, t| {
            let tri_aabb = WorldAabb::new(
                [
                    t.vertices[0][0].min(t.vertices[1][0]).min(t.vertices[2][0]) as f64,
                    t.vertices[0][1].min(t.vertices[1][1]).min(t.vertices[2][1]) as f64,
                    t.vertices[0][2].min(t.vertices[1][2]).min(t.vertices[2][2]) as f64,
                ],
                [
                    t.vertices[0][0].max(t.vertices[1][0]).max(t.vertices[2][0]) as f64,
                    t.vertices[0][1].max(t.vertices[1][1]).max(t.vertices[2][1]) as f64,
                    t.vertices[0][2].max(t.vertices[1][2]).max(t.vertices[2][2]) as f64,
                ],
            );
            Some(match acc {
                Some(a) => a.union(tri_aabb),
                None => tri_aabb,
            })
        });
        let aabb = aabb.unwrap_or(WorldAabb::new([0.0; 3], [0.0; 3]));
        Self { triangles, aabb }
    }
}

impl CollisionShape for TriangleSoup {
    fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    fn world_aabb(&self) -> WorldAabb {
        self.aabb
    }
}

/// Terrain heightfield covering one tile, sampled on a `width x width` grid
/// of `cell_size`-wide cells. `heights` is the "flat form" the spec allows:
/// a single uniform `z` stored as a `width == 1` grid rather than a second
/// representation.
///
/// Grounded on `original_source/components/detournavigator/
/// heightfieldmeshbuilder.{hpp,cpp}`: a fixed-size sample grid bounded by
/// `[min_z, max_z]`, converted to a triangle mesh before it ever reaches the
/// recast-mesh aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct Heightfield {
    pub tile: TilePosition,
    pub cell_size: f32,
    pub width: u32,
    pub min_z: f32,
    pub max_z: f32,
    /// Row-major, `width * width` entries.
    pub heights: Arc<Vec<f32>>,
}

impl Heightfield {
    pub fn new(
        tile: TilePosition,
        cell_size: f32,
        width: u32,
        min_z: f32,
        max_z: f32,
        heights: Vec<f32>,
    ) -> Self {
        Self {
            tile,
            cell_size,
            width,
            min_z,
            max_z,
            heights: Arc::new(heights),
        }
    }

    /// Degenerate flat form: `{tilePos, cellSize, z}`, a single uniform
    /// height across the tile.
    pub fn flat(tile: TilePosition, cell_size: f32, z: f32) -> Self {
        Self::new(tile, cell_size, 1, z, z, vec![z])
    }

    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.cell_size.is_finite()
            && self.cell_size > 0.0
            && self.heights.len() == (self.width as usize) * (self.width as usize)
            && self.min_z <= self.max_z
    }
}

/// Input handed to the external tile builder: everything it needs to
/// rasterize one tile for one agent-bounds bucket.
#[derive(Debug, Clone)]
pub struct BuildTileInput {
    pub worldspace: WorldspaceId,
    pub tile: TilePosition,
    pub agent_bounds: AgentBounds,
    pub objects: Vec<(ObjectId, Arc<dyn CollisionShape>)>,
    pub heightfield: Option<Heightfield>,
    pub generation: u64,
}

impl std::fmt::Debug for dyn CollisionShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollisionShape({} triangles)", self.triangles().len())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    #[error("tile build failed: {0}")]
    Failed(String),
    #[error("build was cancelled")]
    Cancelled,
}

/// Compiled navmesh data for one tile, opaque to this crate beyond its byte
/// length (used for DB size accounting). Backed by `bytes::Bytes` so
/// cloning a `BuiltTile` (every tile-store hit, every DB write) is a
/// refcount bump rather than a buffer copy.
#[derive(Debug, Clone)]
pub struct BuiltTile {
    pub data: bytes::Bytes,
}

impl BuiltTile {
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// External collaborator standing in for Recast: rasterizes a heightfield +
/// collision geometry snapshot into one compiled navmesh tile.
pub trait TileBuilder: Send + Sync {
    fn build_tile(&self, input: &BuildTileInput) -> Result<BuiltTile, BuildError>;
}

/// Outcome of a navmesh query, mirroring Detour's own status bits closely
/// enough for callers ported from a Detour-based engine to recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Success,
    /// Only a prefix of the route is reachable; the caller may still
    /// consume the partial polyline.
    PartialPath,
    /// The start point isn't inside any walkable tile.
    StartPolygonNotFound,
    /// The end point isn't inside any walkable tile.
    EndPolygonNotFound,
    /// The agent has no navmesh coverage at all yet (nothing built, or
    /// nothing in the world to build from).
    NavMeshNotFound,
    /// A point query (e.g. `findNearestPosition`) found no polygon within
    /// range.
    TargetPolygonNotFound,
    /// The underlying engine's surface-walk step failed; rare, typically
    /// worth a caller-side retry.
    MoveAlongSurfaceFailed,
}

/// Result of a path query: a polyline plus the status that produced it.
#[derive(Debug, Clone)]
pub struct PathResult {
    pub status: PathStatus,
    pub points: Vec<[f32; 3]>,
}

/// External collaborator standing in for Detour: runs queries against a set
/// of already-built tiles. This crate's job ends at gathering a consistent
/// tile snapshot and handing it here; it never walks polygons itself.
pub trait NavMeshEngine: Send + Sync {
    fn find_path(
        &self,
        tiles: &[BuiltTile],
        agent_bounds: &AgentBounds,
        flags: crate::tiles::NavFlags,
        start: [f32; 3],
        end: [f32; 3],
    ) -> PathResult;

    fn find_nearest_position(
        &self,
        tiles: &[BuiltTile],
        agent_bounds: &AgentBounds,
        point: [f32; 3],
        search_extent: [f32; 3],
    ) -> Option<[f32; 3]>;

    fn raycast(
        &self,
        tiles: &[BuiltTile],
        agent_bounds: &AgentBounds,
        flags: crate::tiles::NavFlags,
        start: [f32; 3],
        end: [f32; 3],
    ) -> PathResult;

    fn find_random_point_around_circle(
        &self,
        tiles: &[BuiltTile],
        agent_bounds: &AgentBounds,
        center: [f32; 3],
        radius: f32,
        seed: u64,
    ) -> Option<[f32; 3]>;
}

/// Progress reporting hook for long-running rebuilds, used by callers that
/// surface a loading screen. All methods have a default no-op body so
/// implementors only need to override the callbacks they care about.
pub trait ProgressListener: Send + Sync {
    fn on_tile_started(&self, _worldspace: WorldspaceId, _tile: TilePosition) {}
    fn on_tile_finished(&self, _worldspace: WorldspaceId, _tile: TilePosition) {}
    fn on_all_jobs_done(&self) {}
}

/// A listener that does nothing, used as the default when the caller
/// doesn't need progress feedback.
pub struct NullProgressListener;

impl ProgressListener for NullProgressListener {}
