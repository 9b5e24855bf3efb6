//! Navigator configuration.
//!
//! Bundles every tunable the rest of the crate reads, deserializable the
//! way the teacher's `format.rs::SlideMetadata` is: a plain `serde`
//! `Deserialize` struct with a `Default` impl providing sane out-of-the-box
//! values, loaded with `serde_json::from_str` by embedders that keep their
//! settings in a JSON file or an in-process map.

use serde::Deserialize;

/// Tunables that feed the external tile builder (Recast parameters this
/// crate passes through verbatim without interpreting).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecastConfig {
    pub cell_size: f32,
    pub cell_height: f32,
    pub max_slope: f32,
    pub max_climb: f32,
    pub max_simplification_error: f32,
    pub max_edge_len: i32,
    pub region_min_size: i32,
    pub region_merge_size: i32,
}

impl Default for RecastConfig {
    fn default() -> Self {
        Self {
            cell_size: 0.2,
            cell_height: 0.2,
            max_slope: 49.0,
            max_climb: 0.9,
            max_simplification_error: 1.3,
            max_edge_len: 12,
            region_min_size: 8,
            region_merge_size: 20,
        }
    }
}

/// Top-level navigator configuration, covering scheduling, caching and
/// persistence knobs.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NavigatorConfig {
    pub recast: RecastConfig,

    /// World units per tile edge.
    pub tile_size: f64,

    /// Upper bound on tiles kept resident in the in-memory tile-state
    /// store before LRU eviction kicks in.
    pub max_tiles_number: usize,

    /// Upper bound on the number of worker threads used to build tiles.
    pub max_worker_threads: usize,

    /// Maximum number of tiles built per second across all workers, used
    /// to avoid saturating the CPU during a large initial load.
    pub max_tiles_built_per_second: Option<u32>,

    /// Maximum bytes the persistent tile DB may occupy before it starts
    /// evicting the oldest rows to make room.
    pub max_db_file_size: u64,

    /// Whether to write built tiles through to the persistent DB.
    pub write_to_db: bool,

    /// Whether to enable deflate compression of DB row values.
    pub compress_db_rows: bool,

    /// Radius, in tiles, of the "active window" kept built around each
    /// agent's last reported position.
    pub tile_radius: i32,

    /// When true, the builder is asked to also produce an off-mesh
    /// connection pass for doors in addition to ground triangles.
    pub enable_door_connections: bool,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            recast: RecastConfig::default(),
            tile_size: 64.0,
            max_tiles_number: 512,
            max_worker_threads: 4,
            max_tiles_built_per_second: None,
            max_db_file_size: 0, // 0 == unbounded
            write_to_db: true,
            compress_db_rows: true,
            tile_radius: 4,
            enable_door_connections: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let cfg = NavigatorConfig::default();
        assert!(cfg.tile_size > 0.0);
        assert!(cfg.max_tiles_number > 0);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let json = r#"{ "tile_size": 128.0, "recast": { "cell_size": 0.5 } }"#;
        let cfg: NavigatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.tile_size, 128.0);
        assert_eq!(cfg.recast.cell_size, 0.5);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.max_tiles_number, NavigatorConfig::default().max_tiles_number);
        assert_eq!(cfg.recast.cell_height, RecastConfig::default().cell_height);
    }
}
