//! Geometry nodes and their promoted (renderable) form
//!
//! A [`GeometryNode`] always exists for every node of the hierarchy. Its
//! [`LoadState`] owns the decoded buffers while loaded, and the [`TreeNode`]
//! lives inside that loaded state. Dropping back to `Unloaded` therefore
//! destroys the renderable form together with the data, and a node can never
//! carry more than one renderable form.

use std::sync::Arc;

use crate::core::types::{FrameNumber, Mat4};
use crate::math::{Aabb, Sphere};
use crate::streaming::decode::{DecodedBuffers, Locator};
use crate::visibility::host::GpuHandle;

/// Index of a node inside its octree arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Capabilities the traversal needs from a hierarchy node.
///
/// The scheduler and budget logic only go through this trait, so octree and
/// kd-tree nodes are handled the same way.
pub trait SpatialNode {
    fn bounding_box(&self) -> Aabb;
    fn bounding_sphere(&self) -> Sphere;
    fn children(&self) -> &[NodeId];
    fn point_count(&self) -> u32;
    fn level(&self) -> u32;
    fn spacing(&self) -> f32;

    fn is_leaf(&self) -> bool {
        self.children().is_empty()
    }
}

/// Renderable form of a loaded geometry node
#[derive(Debug)]
pub struct TreeNode {
    /// Host resource backing this node
    pub gpu: GpuHandle,
    /// Scene transform (object space to world)
    pub world: Mat4,
    /// Point cloud transform version `world` was computed for
    pub transform_version: Option<u64>,
    /// Shown in the current frame
    pub visible: bool,
}

impl TreeNode {
    pub fn new(gpu: GpuHandle) -> Self {
        Self {
            gpu,
            world: Mat4::IDENTITY,
            transform_version: None,
            visible: false,
        }
    }
}

/// Decoded data of a loaded node plus its optional renderable form
#[derive(Debug)]
pub struct Resident {
    pub buffers: Arc<DecodedBuffers>,
    pub tree: Option<TreeNode>,
    /// Whether the buffers were already folded into the surface model
    pub(crate) in_surface: bool,
}

/// Residency state of a geometry node
#[derive(Debug, Default)]
pub enum LoadState {
    #[default]
    Unloaded,
    /// Decode dispatched under the given ticket
    Loading { ticket: u64 },
    Loaded(Resident),
}

/// Host-side descriptor of one node of the hierarchy
#[derive(Debug)]
pub struct GeometryNode {
    pub id: NodeId,
    /// Octant path name ("r", "r0", "r07", ...)
    pub name: String,
    pub level: u32,
    pub bounding_box: Aabb,
    pub bounding_sphere: Sphere,
    pub point_count: u32,
    pub spacing: f32,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub locator: Locator,
    pub state: LoadState,
    /// Frame the node was last touched in (LRU stamp)
    pub last_touched: FrameNumber,
}

impl GeometryNode {
    pub fn is_loaded(&self) -> bool {
        matches!(self.state, LoadState::Loaded(_))
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, LoadState::Loading { .. })
    }

    pub fn is_unloaded(&self) -> bool {
        matches!(self.state, LoadState::Unloaded)
    }

    /// Whether the node has been promoted to a [`TreeNode`]
    pub fn is_promoted(&self) -> bool {
        self.tree_node().is_some()
    }

    pub fn buffers(&self) -> Option<&Arc<DecodedBuffers>> {
        match &self.state {
            LoadState::Loaded(resident) => Some(&resident.buffers),
            _ => None,
        }
    }

    pub fn tree_node(&self) -> Option<&TreeNode> {
        match &self.state {
            LoadState::Loaded(resident) => resident.tree.as_ref(),
            _ => None,
        }
    }

    pub fn tree_node_mut(&mut self) -> Option<&mut TreeNode> {
        match &mut self.state {
            LoadState::Loaded(resident) => resident.tree.as_mut(),
            _ => None,
        }
    }

    /// Current load ticket, if a decode is in flight
    pub fn loading_ticket(&self) -> Option<u64> {
        match self.state {
            LoadState::Loading { ticket } => Some(ticket),
            _ => None,
        }
    }

    /// Unloaded -> Loading
    pub(crate) fn begin_loading(&mut self, ticket: u64) {
        self.state = LoadState::Loading { ticket };
    }

    /// Loading -> Loaded
    pub(crate) fn finish_loading(&mut self, buffers: DecodedBuffers) {
        self.state = LoadState::Loaded(Resident {
            buffers: Arc::new(buffers),
            tree: None,
            in_surface: false,
        });
    }

    /// Attach the renderable form. Returns false if the node is not loaded
    /// or already promoted.
    pub(crate) fn promote(&mut self, tree: TreeNode) -> bool {
        match &mut self.state {
            LoadState::Loaded(resident) if resident.tree.is_none() => {
                resident.tree = Some(tree);
                true
            }
            _ => false,
        }
    }

    /// Drop buffers and renderable form, back to Unloaded.
    ///
    /// Returns the host resource of the dropped tree node so the caller can
    /// dispose it.
    pub(crate) fn release(&mut self) -> Option<GpuHandle> {
        match std::mem::take(&mut self.state) {
            LoadState::Loaded(resident) => resident.tree.map(|tree| tree.gpu),
            _ => None,
        }
    }
}

impl SpatialNode for GeometryNode {
    fn bounding_box(&self) -> Aabb {
        self.bounding_box
    }

    fn bounding_sphere(&self) -> Sphere {
        self.bounding_sphere
    }

    fn children(&self) -> &[NodeId] {
        &self.children
    }

    fn point_count(&self) -> u32 {
        self.point_count
    }

    fn level(&self) -> u32 {
        self.level
    }

    fn spacing(&self) -> f32 {
        self.spacing
    }
}
