//! Error types for pointstream

use thiserror::Error;

use crate::octree::PointCloudId;
use crate::streaming::decode::DecodeFormat;

/// Main error type for the streaming engine
///
/// Recoverable per-node conditions (decode failures, stale decode responses,
/// budget pruning) never surface here; they are absorbed by the component that
/// detects them. Only configuration-level problems propagate to callers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Hierarchy error: {0}")]
    Hierarchy(String),

    #[error("No decoder pool registered for format {0:?}")]
    UnsupportedFormat(DecodeFormat),

    #[error("Unknown point cloud {0:?}")]
    UnknownPointCloud(PointCloudId),
}
