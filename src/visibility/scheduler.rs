//! Best-first traversal of every point cloud through one shared queue
//!
//! Roots are seeded at infinite weight. Each popped candidate is culled,
//! checked against its cloud's budget, and on admission its children are
//! weighed by projected size and pushed. Because the queue is shared, clouds
//! compete for expansion order by screen importance.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use crate::core::camera::{Camera, Projection};
use crate::core::types::Vec3;
use crate::octree::{NodeId, PointCloud, PointCloudId, SpatialNode};
use super::budget::{BudgetEnforcer, BudgetLimits, Rejection};
use super::culler::CullStructure;

/// Queue entry for one node of one cloud
#[derive(Clone, Copy, Debug)]
pub struct Candidate {
    pub cloud: PointCloudId,
    pub node: NodeId,
    pub parent: Option<NodeId>,
    /// Higher = expanded sooner
    pub weight: f32,
    /// Insertion order, breaks weight ties
    seq: u64,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // total_cmp keeps infinities ordered; earlier insertions win ties
        self.weight
            .total_cmp(&other.weight)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap of candidates
#[derive(Debug, Default)]
pub struct CandidateQueue {
    heap: BinaryHeap<Candidate>,
    next_seq: u64,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cloud: PointCloudId, node: NodeId, parent: Option<NodeId>, weight: f32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Candidate { cloud, node, parent, weight, seq });
    }

    /// Highest-weight candidate
    pub fn pop(&mut self) -> Option<Candidate> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.next_seq = 0;
    }
}

/// Projection data the weight function needs
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ViewParams {
    /// `0.5 * viewport_height / tan(fov_y / 2)`: pixels per unit at distance 1
    Perspective { projection_factor: f32 },
    Orthographic,
}

impl ViewParams {
    pub fn from_camera(camera: &Camera) -> Self {
        match camera.projection {
            Projection::Perspective { fov_y } => ViewParams::Perspective {
                projection_factor: 0.5 * camera.viewport_height / (fov_y * 0.5).tan(),
            },
            Projection::Orthographic { .. } => ViewParams::Orthographic,
        }
    }
}

/// Weight of a child node seen from `camera_position` (object space).
///
/// Returns `None` when a perspective child projects below
/// `minimum_pixel_size` and should not be expanded. Degenerate geometry
/// (camera exactly at a zero-sized node) weighs `f32::MAX`, never NaN.
pub fn child_weight(
    view: &ViewParams,
    node: &impl SpatialNode,
    camera_position: Vec3,
    minimum_pixel_size: f32,
) -> Option<f32> {
    let weight = match *view {
        ViewParams::Perspective { projection_factor } => {
            let sphere = node.bounding_sphere();
            let distance = sphere.distance_to_center(camera_position);
            let pixel_radius = sphere.radius * projection_factor / distance;

            if pixel_radius < minimum_pixel_size {
                return None;
            }
            if sphere.contains_point(camera_position) {
                return Some(f32::MAX);
            }
            Some(pixel_radius)
        }
        ViewParams::Orthographic => {
            let bounding_box = node.bounding_box();
            let distance = bounding_box.center().distance(camera_position);
            Some(bounding_box.diagonal() / distance)
        }
    };
    weight.map(|w| if w.is_finite() { w } else { f32::MAX })
}

/// A node admitted by the traversal
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Selection {
    pub cloud: PointCloudId,
    pub node: NodeId,
    pub parent: Option<NodeId>,
    pub weight: f32,
    pub level: u32,
    pub points: u32,
}

/// Outcome of one traversal
#[derive(Clone, Debug, Default)]
pub struct Traversal {
    /// Admitted nodes in pop order; a parent always precedes its children
    pub selected: Vec<Selection>,
    /// Smallest spacing among popped nodes
    pub lowest_spacing: f32,
    pub culled: usize,
    pub rejected_budget: usize,
    pub rejected_level: usize,
    /// Children never pushed because they project too small
    pub pruned: usize,
}

impl Traversal {
    /// Points admitted for one cloud
    pub fn points_for(&self, cloud: PointCloudId) -> u64 {
        self.selected
            .iter()
            .filter(|s| s.cloud == cloud)
            .map(|s| s.points as u64)
            .sum()
    }
}

/// Runs the shared-queue traversal; keeps its queue allocation across frames
#[derive(Debug, Default)]
pub struct PriorityScheduler {
    queue: CandidateQueue,
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Traverse every cloud that has a cull structure
    pub fn traverse(
        &mut self,
        clouds: &BTreeMap<PointCloudId, PointCloud>,
        culls: &HashMap<PointCloudId, CullStructure>,
        view: &ViewParams,
        budget: &mut BudgetEnforcer,
    ) -> Traversal {
        self.queue.clear();
        budget.reset();

        let mut traversal = Traversal {
            lowest_spacing: f32::INFINITY,
            ..Default::default()
        };

        for id in clouds.keys().filter(|id| culls.contains_key(*id)) {
            self.queue.push(*id, NodeId::ROOT, None, f32::INFINITY);
        }

        while let Some(candidate) = self.queue.pop() {
            let (Some(cloud), Some(cull)) = (clouds.get(&candidate.cloud), culls.get(&candidate.cloud)) else {
                continue;
            };
            let Some(node) = cloud.octree.node(candidate.node) else {
                continue;
            };

            traversal.lowest_spacing = traversal.lowest_spacing.min(node.spacing());

            if !cull.frustum.intersects_aabb(&node.bounding_box()) {
                traversal.culled += 1;
                continue;
            }

            let limits = BudgetLimits::from(&cloud.settings);
            match budget.admit(candidate.cloud, limits, node.level(), node.point_count()) {
                Ok(()) => {}
                Err(Rejection::PointBudget) => {
                    log::trace!("{:?}/{} over point budget", candidate.cloud, node.name);
                    traversal.rejected_budget += 1;
                    continue;
                }
                Err(Rejection::MaxLevel) => {
                    traversal.rejected_level += 1;
                    continue;
                }
            }

            traversal.selected.push(Selection {
                cloud: candidate.cloud,
                node: candidate.node,
                parent: candidate.parent,
                weight: candidate.weight,
                level: node.level(),
                points: node.point_count(),
            });

            for &child_id in node.children() {
                let Some(child) = cloud.octree.node(child_id) else {
                    continue;
                };
                match child_weight(view, child, cull.camera_position, cloud.settings.minimum_node_pixel_size) {
                    Some(weight) => self.queue.push(candidate.cloud, child_id, Some(candidate.node), weight),
                    None => traversal.pruned += 1,
                }
            }
        }

        traversal
    }
}
