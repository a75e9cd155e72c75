//! Arena-backed node hierarchy of one point cloud

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::math::Aabb;
use crate::streaming::decode::{DecodeFormat, Locator};
use super::node::{GeometryNode, LoadState, NodeId};

/// Shape of the hierarchy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyKind {
    /// Eight children per node, split at the box center
    #[default]
    Octree,
    /// Two children per node, split along x, y, z by level
    KdTree,
}

impl HierarchyKind {
    pub fn max_children(self) -> usize {
        match self {
            HierarchyKind::Octree => 8,
            HierarchyKind::KdTree => 2,
        }
    }

    /// Bounding box of child slot `index` of a node at `level`
    pub fn child_bounds(self, parent: &Aabb, level: u32, index: u8) -> Aabb {
        match self {
            HierarchyKind::Octree => parent.child_octant(index),
            HierarchyKind::KdTree => parent.child_half(level as usize % 3, index != 0),
        }
    }
}

/// Node hierarchy of a point cloud. Node 0 is the root.
#[derive(Debug)]
pub struct Octree {
    kind: HierarchyKind,
    format: DecodeFormat,
    nodes: Vec<GeometryNode>,
}

impl Octree {
    /// Create a hierarchy with just its root
    pub fn new(
        kind: HierarchyKind,
        format: DecodeFormat,
        bounding_box: Aabb,
        spacing: f32,
        point_count: u32,
        locator: Locator,
    ) -> Self {
        let root = GeometryNode {
            id: NodeId::ROOT,
            name: "r".to_string(),
            level: 0,
            bounding_box,
            bounding_sphere: bounding_box.bounding_sphere(),
            point_count,
            spacing,
            parent: None,
            children: Vec::new(),
            locator,
            state: LoadState::Unloaded,
            last_touched: 0,
        };

        Self {
            kind,
            format,
            nodes: vec![root],
        }
    }

    /// Add a child in slot `index` of `parent`.
    ///
    /// The child's box is derived from the parent's, its spacing is half the
    /// parent's, and its name extends the parent's octant path.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        index: u8,
        point_count: u32,
        locator: Locator,
    ) -> Result<NodeId> {
        if index as usize >= self.kind.max_children() {
            return Err(Error::Hierarchy(format!(
                "child slot {} out of range for {:?}", index, self.kind
            )));
        }

        let id = NodeId(self.nodes.len() as u32);
        let parent_node = self.nodes.get(parent.index()).ok_or_else(|| {
            Error::Hierarchy(format!("unknown parent node {:?}", parent))
        })?;

        let name = format!("{}{}", parent_node.name, index);
        if parent_node.children.iter().any(|c| self.nodes[c.index()].name == name) {
            return Err(Error::Hierarchy(format!("node {} already exists", name)));
        }

        let bounding_box = self.kind.child_bounds(&parent_node.bounding_box, parent_node.level, index);
        let child = GeometryNode {
            id,
            name,
            level: parent_node.level + 1,
            bounding_box,
            bounding_sphere: bounding_box.bounding_sphere(),
            point_count,
            spacing: parent_node.spacing * 0.5,
            parent: Some(parent),
            children: Vec::new(),
            locator,
            state: LoadState::Unloaded,
            last_touched: 0,
        };

        self.nodes.push(child);
        self.nodes[parent.index()].children.push(id);
        Ok(id)
    }

    /// Build a complete hierarchy of the given depth (root is depth 0)
    ///
    /// `locate` maps a node name to its payload locator.
    pub fn complete(
        kind: HierarchyKind,
        format: DecodeFormat,
        bounding_box: Aabb,
        spacing: f32,
        depth: u32,
        points_per_node: u32,
        mut locate: impl FnMut(&str) -> Locator,
    ) -> Self {
        let mut tree = Self::new(kind, format, bounding_box, spacing, points_per_node, locate("r"));
        let mut frontier = vec![NodeId::ROOT];

        for _ in 0..depth {
            let mut next = Vec::with_capacity(frontier.len() * kind.max_children());
            for parent in frontier {
                for index in 0..kind.max_children() as u8 {
                    let name = format!("{}{}", tree.nodes[parent.index()].name, index);
                    let locator = locate(&name);
                    // Slots are in range and names are fresh, so this cannot fail
                    if let Ok(child) = tree.add_child(parent, index, points_per_node, locator) {
                        next.push(child);
                    }
                }
            }
            frontier = next;
        }

        tree
    }

    pub fn kind(&self) -> HierarchyKind {
        self.kind
    }

    pub fn format(&self) -> DecodeFormat {
        self.format
    }

    pub fn root(&self) -> &GeometryNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> Option<&GeometryNode> {
        self.nodes.get(id.index())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut GeometryNode> {
        self.nodes.get_mut(id.index())
    }

    /// Find a node by octant path name
    pub fn find(&self, name: &str) -> Option<&GeometryNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GeometryNode> {
        self.nodes.iter()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut GeometryNode> {
        self.nodes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total points over all nodes
    pub fn total_points(&self) -> u64 {
        self.nodes.iter().map(|n| n.point_count as u64).sum()
    }

    /// Whether the root bounds are usable for culling
    pub fn is_valid(&self) -> bool {
        self.root().bounding_box.is_valid()
    }
}
