//! Point cloud hierarchies and their two-state node representation

pub mod node;
pub mod tree;
pub mod pointcloud;
pub mod manifest;
pub mod surface;

pub use node::{GeometryNode, LoadState, NodeId, Resident, SpatialNode, TreeNode};
pub use tree::{HierarchyKind, Octree};
pub use pointcloud::{MaterialId, NodeKey, PointCloud, PointCloudId, TransformTracker};
pub use manifest::{Manifest, ManifestBounds, ManifestNode};
pub use surface::SurfaceModel;
