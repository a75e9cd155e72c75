//! Point cloud entity: hierarchy, transform and per-frame visibility state

use crate::config::PointCloudSettings;
use crate::core::types::Mat4;
use super::node::{LoadState, NodeId};
use super::surface::{SurfaceModel, MAX_SURFACE_RESOLUTION};
use super::tree::Octree;

/// Identifier handed out when a point cloud is attached
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointCloudId(pub u32);

/// Globally unique node address (point cloud + node)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub cloud: PointCloudId,
    pub node: NodeId,
}

impl NodeKey {
    pub fn new(cloud: PointCloudId, node: NodeId) -> Self {
        Self { cloud, node }
    }
}

/// Opaque material reference owned by the host renderer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MaterialId(pub u64);

/// Detects changes of a world transform between frames
///
/// The version starts at 0 on first observation and increments whenever the
/// observed matrix differs from the stored snapshot.
#[derive(Clone, Debug, Default)]
pub struct TransformTracker {
    version: u64,
    snapshot: Option<Mat4>,
}

impl TransformTracker {
    /// Record the current transform; returns true if it changed
    pub fn observe(&mut self, world: &Mat4) -> bool {
        match &self.snapshot {
            None => {
                self.snapshot = Some(*world);
                false
            }
            Some(previous) if previous == world => false,
            Some(_) => {
                self.version += 1;
                self.snapshot = Some(*world);
                true
            }
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// A dataset attached to the engine
#[derive(Debug)]
pub struct PointCloud {
    pub name: String,
    pub octree: Octree,
    /// Object space to world
    pub world: Mat4,
    pub settings: PointCloudSettings,
    /// Hidden clouds are not traversed
    pub visible: bool,
    pub material: MaterialId,
    pub(crate) transform: TransformTracker,
    pub(crate) visible_nodes: Vec<NodeId>,
    pub(crate) num_visible_nodes: usize,
    pub(crate) num_visible_points: u64,
    pub(crate) surface: Option<SurfaceModel>,
}

impl PointCloud {
    pub fn new(name: impl Into<String>, octree: Octree, settings: PointCloudSettings) -> Self {
        let mut cloud = Self {
            name: name.into(),
            octree,
            world: Mat4::IDENTITY,
            settings,
            visible: true,
            material: MaterialId::default(),
            transform: TransformTracker::default(),
            visible_nodes: Vec::new(),
            num_visible_nodes: 0,
            num_visible_points: 0,
            surface: None,
        };
        cloud.sync_surface_model();
        cloud
    }

    pub fn with_world(mut self, world: Mat4) -> Self {
        self.world = world;
        self
    }

    /// Promoted nodes shown in the last frame, in traversal order
    pub fn visible_nodes(&self) -> &[NodeId] {
        &self.visible_nodes
    }

    /// Nodes selected in the last frame, promoted or not
    pub fn num_visible_nodes(&self) -> usize {
        self.num_visible_nodes
    }

    /// Points selected in the last frame, promoted or not
    pub fn num_visible_points(&self) -> u64 {
        self.num_visible_points
    }

    pub fn transform_version(&self) -> u64 {
        self.transform.version()
    }

    pub fn surface(&self) -> Option<&SurfaceModel> {
        self.surface.as_ref()
    }

    /// Points currently held in decoded buffers
    pub fn resident_points(&self) -> u64 {
        self.octree
            .nodes()
            .filter(|n| n.is_loaded())
            .map(|n| n.point_count as u64)
            .sum()
    }

    /// Whether the cloud can take part in traversal this frame
    pub(crate) fn is_well_formed(&self) -> bool {
        self.octree.is_valid() && self.world.is_finite() && self.world.determinant().abs() > f32::EPSILON
    }

    /// Create or drop the surface model to match the current settings.
    /// A new model starts empty, so every resident node gets folded again.
    pub(crate) fn sync_surface_model(&mut self) {
        let wanted = self.settings.generate_surface_model;
        let resolution = self.settings.surface_resolution.clamp(1, MAX_SURFACE_RESOLUTION);
        let stale = self.surface.as_ref().is_some_and(|s| s.resolution() != resolution);

        if wanted && (self.surface.is_none() || stale) {
            self.surface = Some(SurfaceModel::new(self.octree.root().bounding_box, resolution));
            for node in self.octree.nodes_mut() {
                if let LoadState::Loaded(resident) = &mut node.state {
                    resident.in_surface = false;
                }
            }
        } else if !wanted {
            self.surface = None;
        }
    }

    pub(crate) fn reset_frame_state(&mut self) {
        for id in std::mem::take(&mut self.visible_nodes) {
            if let Some(tree) = self.octree.node_mut(id).and_then(|n| n.tree_node_mut()) {
                tree.visible = false;
            }
        }
        self.num_visible_nodes = 0;
        self.num_visible_points = 0;
    }
}
