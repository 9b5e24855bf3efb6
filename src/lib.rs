//! Tile-based navigation-mesh manager for an open-world game.
//!
//! Tracks per-tile collision geometry across one or more worldspaces,
//! schedules navmesh tile (re)builds through an injected builder, persists
//! compiled tiles to survive restarts, and answers pathfinding-style
//! queries by delegating to an injected navmesh engine. This crate owns
//! none of the rasterization or graph search itself - see
//! [`shape::TileBuilder`] and [`shape::NavMeshEngine`].
//!
//! The [`navigator::Navigator`] type is the intended entry point for
//! embedders; the other modules are exposed for callers that want to
//! compose the pieces differently (e.g. a headless navmeshtool that only
//! needs the geometry cache and the builder, with no query engine at all).

pub mod config;
pub mod error;
pub mod job_queue;
pub mod nav_mesh_store;
pub mod navigator;
pub mod recast_mesh;
pub mod shape;
pub mod tile_db;
pub mod tiles;
pub mod updater;

pub use config::{NavigatorConfig, RecastConfig};
pub use error::{NavResult, NavigatorError};
pub use navigator::Navigator;
pub use shape::{
    AgentBounds, AgentId, BuildError, BuildTileInput, BuiltTile, CollisionShape,
    CollisionShapeKind, Heightfield, NavMeshEngine, ObjectId, PathResult, PathStatus,
    ProgressListener, TileBuilder, Triangle, TriangleSoup,
};
pub use tiles::{AreaType, NavFlags, TilePosition, WorldAabb, WorldspaceId};
