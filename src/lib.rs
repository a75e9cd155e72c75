//! pointstream - visibility and level-of-detail streaming for out-of-core
//! point clouds

pub mod core;
pub mod math;
pub mod config;
pub mod octree;
pub mod streaming;
pub mod visibility;

pub use crate::config::{PointCloudSettings, PoolConfig, StreamingConfig};
pub use crate::core::error::Error;
pub use crate::core::types::Result;
