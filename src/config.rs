//! Streaming configuration
//!
//! Both structs deserialize from JSON with every field optional; missing
//! fields take the defaults below.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::streaming::decode::DecodeFormat;

/// Size of the decode worker pool for one format
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub format: DecodeFormat,
    /// Maximum live decoder instances
    pub workers: usize,
}

/// Global engine configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Maximum points resident across all point clouds
    pub memory_budget_points: u64,
    /// Decodes started per frame
    pub max_nodes_loading: usize,
    /// Loaded nodes promoted to renderable form per frame
    pub max_nodes_promoted_per_frame: usize,
    /// Deepest level folded into surface models
    pub max_surface_level: u32,
    /// Threads of the decode runtime
    pub runtime_threads: usize,
    /// Worker pools created at startup
    pub pools: Vec<PoolConfig>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            memory_budget_points: 10_000_000,
            max_nodes_loading: 4,
            max_nodes_promoted_per_frame: 20,
            max_surface_level: 0,
            runtime_threads: 2,
            pools: vec![
                PoolConfig { format: DecodeFormat::Binary, workers: 2 },
                PoolConfig { format: DecodeFormat::BinaryLz4, workers: 2 },
            ],
        }
    }
}

impl StreamingConfig {
    /// Load configuration from a JSON file
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty JSON
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.memory_budget_points == 0 {
            return Err(Error::Config("memory_budget_points must be positive".into()));
        }
        if self.runtime_threads == 0 {
            return Err(Error::Config("runtime_threads must be positive".into()));
        }
        for pool in &self.pools {
            if pool.workers == 0 {
                return Err(Error::Config(format!("pool {:?} has no workers", pool.format)));
            }
        }
        for (i, pool) in self.pools.iter().enumerate() {
            if self.pools[..i].iter().any(|p| p.format == pool.format) {
                return Err(Error::Config(format!("pool {:?} configured twice", pool.format)));
            }
        }
        Ok(())
    }
}

/// Per point cloud traversal limits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointCloudSettings {
    /// Maximum visible points per frame
    pub point_budget: u64,
    /// Children projecting smaller than this (pixels) are not expanded
    pub minimum_node_pixel_size: f32,
    /// Nodes at this level or deeper are never shown
    pub max_level: u32,
    /// Maintain a surface (elevation) model from shallow visible nodes
    pub generate_surface_model: bool,
    /// Cells per side of the surface model grid, at most 2048
    pub surface_resolution: u32,
}

impl Default for PointCloudSettings {
    fn default() -> Self {
        Self {
            point_budget: 1_000_000,
            minimum_node_pixel_size: 150.0,
            max_level: u32::MAX,
            generate_surface_model: false,
            surface_resolution: 128,
        }
    }
}
