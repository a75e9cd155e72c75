//! Per-frame visibility pass
//!
//! Each call to [`VisibilityPass::update`] walks the states
//! `Idle -> ComputingStructures -> Traversing -> Reconciling -> Done -> Idle`:
//!
//! 1. compute object-space cull structures, detect transform changes and
//!    clear last frame's visibility;
//! 2. traverse every cloud through the shared priority queue;
//! 3. apply finished decodes, then walk the selection in traversal order:
//!    touch resident nodes, promote loaded nodes whose parent is promoted
//!    (at most M per frame) and collect unloaded ones; evict over budget;
//!    dispatch at most K of the collected loads; refresh stale transforms
//!    and fold shallow nodes into surface models;
//! 4. report.
//!
//! Only the thread calling `update` touches octree and residency state.
//! Decoders see immutable requests and answer through the pipeline.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::runtime::Handle;

use crate::config::StreamingConfig;
use crate::core::camera::Camera;
use crate::core::error::Error;
use crate::core::types::{FrameNumber, Result};
use crate::octree::{LoadState, NodeId, NodeKey, PointCloud, PointCloudId, TreeNode};
use crate::streaming::cache::ResidencyCache;
use crate::streaming::decode::{DecodeRequest, DecodeResponse};
use crate::streaming::pipeline::LoadPipeline;
use super::budget::BudgetEnforcer;
use super::culler::{CullStructure, FrustumCuller};
use super::host::{GpuHandle, RenderHost};
use super::scheduler::{PriorityScheduler, Traversal, ViewParams};

/// Phase of the frame state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassState {
    Idle,
    ComputingStructures,
    Traversing,
    Reconciling,
    Done,
}

/// A promoted node shown this frame
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VisibleNode {
    pub cloud: PointCloudId,
    pub node: NodeId,
    pub level: u32,
    pub point_count: u32,
    pub gpu: GpuHandle,
}

/// Outcome of one frame
#[derive(Clone, Debug, Default)]
pub struct FrameReport {
    pub frame: FrameNumber,
    /// Promoted nodes to draw, in traversal order
    pub visible_nodes: Vec<VisibleNode>,
    /// Points of every selected node, promoted or not
    pub num_visible_points: u64,
    /// Selected nodes, promoted or not
    pub num_visible_nodes: usize,
    /// Smallest spacing among traversed nodes
    pub lowest_spacing: f32,
    /// Decodes applied this frame
    pub loaded: usize,
    /// Decodes that failed; their nodes went back to unloaded
    pub failed: usize,
    /// Responses discarded because their node moved on
    pub stale: usize,
    pub dispatched: usize,
    pub promoted: usize,
    pub evicted: usize,
    /// Tree nodes whose world transform was recomputed
    pub refreshed: usize,
    /// Nodes folded into surface models
    pub surface_folds: usize,
    pub culled: usize,
    pub rejected: usize,
    pub pruned: usize,
    /// Clouds whose transform changed since the previous frame
    pub transformed: Vec<PointCloudId>,
    /// Malformed clouds left out of this frame
    pub skipped: Vec<PointCloudId>,
}

/// Owns the attached point clouds and drives one frame at a time
pub struct VisibilityPass<H: RenderHost> {
    clouds: BTreeMap<PointCloudId, PointCloud>,
    next_id: u32,
    scheduler: PriorityScheduler,
    budget: BudgetEnforcer,
    cache: ResidencyCache,
    pipeline: LoadPipeline,
    /// Responses received by `wait_for_loads`, applied next frame
    pending: Vec<DecodeResponse>,
    host: H,
    config: StreamingConfig,
    frame: FrameNumber,
    state: PassState,
}

impl<H: RenderHost> VisibilityPass<H> {
    /// Create a pass with its own decode runtime
    pub fn new(config: StreamingConfig, host: H) -> Result<Self> {
        config.validate()?;
        let pipeline = LoadPipeline::new(&config)?;
        Ok(Self::with_pipeline(config, host, pipeline))
    }

    /// Create a pass that decodes on the host application's tokio runtime
    pub fn with_handle(config: StreamingConfig, host: H, handle: Handle) -> Result<Self> {
        config.validate()?;
        let pipeline = LoadPipeline::with_handle(&config, handle);
        Ok(Self::with_pipeline(config, host, pipeline))
    }

    fn with_pipeline(config: StreamingConfig, host: H, pipeline: LoadPipeline) -> Self {
        log::info!(
            "Visibility pass ready: memory budget {} points, {} loads/frame, {} promotions/frame",
            config.memory_budget_points,
            config.max_nodes_loading,
            config.max_nodes_promoted_per_frame
        );

        Self {
            clouds: BTreeMap::new(),
            next_id: 0,
            scheduler: PriorityScheduler::new(),
            budget: BudgetEnforcer::new(),
            cache: ResidencyCache::new(config.memory_budget_points),
            pipeline,
            pending: Vec::new(),
            host,
            config,
            frame: 0,
            state: PassState::Idle,
        }
    }

    // --- Cloud lifecycle ---

    pub fn add_point_cloud(&mut self, cloud: PointCloud) -> PointCloudId {
        let id = PointCloudId(self.next_id);
        self.next_id += 1;

        log::info!(
            "Attached point cloud {:?} '{}': {} nodes, {} points",
            id,
            cloud.name,
            cloud.octree.len(),
            cloud.octree.total_points()
        );
        self.clouds.insert(id, cloud);
        id
    }

    /// Detach a cloud, dropping its residency and host resources.
    /// Decodes still in flight for it are discarded when they finish.
    pub fn remove_point_cloud(&mut self, id: PointCloudId) -> Result<PointCloud> {
        let mut cloud = self.clouds.remove(&id).ok_or(Error::UnknownPointCloud(id))?;

        let dropped = self.cache.remove_cloud(id);
        for node in cloud.octree.nodes_mut() {
            if let Some(gpu) = node.release() {
                self.host.dispose(gpu);
            }
        }
        cloud.visible_nodes.clear();

        log::info!("Detached point cloud {:?} '{}' ({} resident nodes dropped)", id, cloud.name, dropped.len());
        Ok(cloud)
    }

    pub fn point_cloud(&self, id: PointCloudId) -> Option<&PointCloud> {
        self.clouds.get(&id)
    }

    pub fn point_cloud_mut(&mut self, id: PointCloudId) -> Option<&mut PointCloud> {
        self.clouds.get_mut(&id)
    }

    pub fn point_clouds(&self) -> impl Iterator<Item = (&PointCloudId, &PointCloud)> {
        self.clouds.iter()
    }

    /// Drop a node's data (and renderable form) right away.
    ///
    /// Returns whether anything was released. An in-flight decode for the
    /// node becomes stale.
    pub fn unload_node(&mut self, key: NodeKey) -> Result<bool> {
        let cloud = self.clouds.get_mut(&key.cloud).ok_or(Error::UnknownPointCloud(key.cloud))?;
        let Some(node) = cloud.octree.node_mut(key.node) else {
            return Ok(false);
        };
        if node.is_unloaded() {
            return Ok(false);
        }

        if let Some(gpu) = node.release() {
            self.host.dispose(gpu);
        }
        self.cache.remove(key);
        Ok(true)
    }

    // --- Frame ---

    /// Run one frame for the given camera
    pub fn update(&mut self, camera: &Camera) -> Result<FrameReport> {
        let result = self.run_frame(camera);
        self.enter(PassState::Idle);
        result
    }

    fn run_frame(&mut self, camera: &Camera) -> Result<FrameReport> {
        self.frame += 1;
        let frame = self.frame;
        let mut report = FrameReport { frame, ..Default::default() };

        self.enter(PassState::ComputingStructures);
        let culls = self.compute_structures(camera, &mut report);

        self.enter(PassState::Traversing);
        let view = ViewParams::from_camera(camera);
        let traversal = self.scheduler.traverse(&self.clouds, &culls, &view, &mut self.budget);
        report.lowest_spacing = traversal.lowest_spacing;
        report.culled = traversal.culled;
        report.rejected = traversal.rejected_budget + traversal.rejected_level;
        report.pruned = traversal.pruned;

        self.enter(PassState::Reconciling);
        self.apply_responses(frame, &mut report);
        let wanted = self.reconcile_selection(frame, &traversal, &mut report);
        self.evict(frame, &mut report);
        self.dispatch_loads(wanted, &mut report)?;
        self.refresh_tree_nodes(&mut report);

        self.enter(PassState::Done);
        log::debug!(
            "Frame {}: {} nodes ({} points) selected, {} shown, {} loaded, {} dispatched, {} evicted",
            frame,
            report.num_visible_nodes,
            report.num_visible_points,
            report.visible_nodes.len(),
            report.loaded,
            report.dispatched,
            report.evicted
        );
        Ok(report)
    }

    fn enter(&mut self, state: PassState) {
        log::trace!("Frame {}: {:?} -> {:?}", self.frame, self.state, state);
        self.state = state;
    }

    fn compute_structures(&mut self, camera: &Camera, report: &mut FrameReport) -> HashMap<PointCloudId, CullStructure> {
        let culler = FrustumCuller::new(camera);
        let mut culls = HashMap::with_capacity(self.clouds.len());

        for (id, cloud) in &mut self.clouds {
            cloud.reset_frame_state();
            cloud.sync_surface_model();
            if !cloud.visible {
                continue;
            }

            if cloud.transform.observe(&cloud.world) {
                log::debug!("Point cloud {:?} moved (transform version {})", id, cloud.transform.version());
                report.transformed.push(*id);
            }

            let cull = if cloud.is_well_formed() { culler.compute(&cloud.world) } else { None };
            match cull {
                Some(cull) => {
                    culls.insert(*id, cull);
                }
                None => {
                    log::warn!("Skipping malformed point cloud {:?} '{}'", id, cloud.name);
                    report.skipped.push(*id);
                }
            }
        }

        culls
    }

    /// Attach finished decodes to nodes still waiting for them
    fn apply_responses(&mut self, frame: FrameNumber, report: &mut FrameReport) {
        let mut responses = std::mem::take(&mut self.pending);
        responses.extend(self.pipeline.poll_responses());

        for response in responses {
            let key = response.key;
            let Some(node) = self.clouds.get_mut(&key.cloud).and_then(|c| c.octree.node_mut(key.node)) else {
                log::debug!("Discarding decode for detached node {:?}", key);
                report.stale += 1;
                continue;
            };

            if node.loading_ticket() != Some(response.ticket) {
                log::debug!("Discarding stale decode for {:?} (ticket {})", key, response.ticket);
                report.stale += 1;
                continue;
            }

            match response.result {
                Ok(buffers) => {
                    let points = node.point_count as u64;
                    node.finish_loading(buffers);
                    node.last_touched = frame;
                    self.cache.insert(key, points, frame);
                    report.loaded += 1;
                }
                Err(e) => {
                    log::warn!("Failed to decode {:?} '{}': {}", key, node.name, e);
                    node.release();
                    report.failed += 1;
                }
            }
        }
    }

    /// Touch, promote and collect loads for the selected nodes.
    ///
    /// Returns unloaded nodes worth loading, in selection order.
    fn reconcile_selection(&mut self, frame: FrameNumber, traversal: &Traversal, report: &mut FrameReport) -> Vec<NodeKey> {
        let max_promoted = self.config.max_nodes_promoted_per_frame;
        let mut wanted = Vec::new();

        for selection in &traversal.selected {
            let Some(cloud) = self.clouds.get_mut(&selection.cloud) else {
                continue;
            };
            cloud.num_visible_nodes += 1;
            cloud.num_visible_points += selection.points as u64;
            report.num_visible_nodes += 1;
            report.num_visible_points += selection.points as u64;

            let parent_promoted = match selection.parent {
                None => true,
                Some(parent) => cloud.octree.node(parent).is_some_and(|n| n.is_promoted()),
            };
            let key = NodeKey::new(selection.cloud, selection.node);
            let Some(node) = cloud.octree.node_mut(selection.node) else {
                continue;
            };

            if !node.is_promoted() && parent_promoted {
                if node.is_loaded() && report.promoted < max_promoted {
                    if let Some(buffers) = node.buffers().cloned() {
                        let gpu = self.host.allocate(key, &buffers);
                        node.promote(TreeNode::new(gpu));
                        report.promoted += 1;
                    }
                } else if node.is_unloaded() {
                    wanted.push(key);
                }
            }

            if node.is_loaded() {
                node.last_touched = frame;
                self.cache.touch(key, frame);
            }

            if let Some(tree) = node.tree_node_mut() {
                tree.visible = true;
                let gpu = tree.gpu;
                cloud.visible_nodes.push(selection.node);
                report.visible_nodes.push(VisibleNode {
                    cloud: selection.cloud,
                    node: selection.node,
                    level: selection.level,
                    point_count: selection.points,
                    gpu,
                });
            }
        }

        wanted
    }

    fn evict(&mut self, frame: FrameNumber, report: &mut FrameReport) {
        for key in self.cache.evict(frame) {
            if let Some(node) = self.clouds.get_mut(&key.cloud).and_then(|c| c.octree.node_mut(key.node)) {
                log::debug!("Evicting {:?} '{}' (last touched in frame {})", key, node.name, node.last_touched);
                if let Some(gpu) = node.release() {
                    self.host.dispose(gpu);
                }
            }
            report.evicted += 1;
        }
    }

    fn dispatch_loads(&mut self, wanted: Vec<NodeKey>, report: &mut FrameReport) -> Result<()> {
        for key in wanted.into_iter().take(self.config.max_nodes_loading) {
            let Some(cloud) = self.clouds.get_mut(&key.cloud) else {
                continue;
            };
            let format = cloud.octree.format();
            let Some(node) = cloud.octree.node_mut(key.node) else {
                continue;
            };
            if !node.is_unloaded() {
                continue;
            }

            let ticket = self.pipeline.next_ticket();
            self.pipeline.dispatch(DecodeRequest {
                key,
                ticket,
                locator: node.locator.clone(),
                format,
            })?;
            node.begin_loading(ticket);
            report.dispatched += 1;
        }
        Ok(())
    }

    /// Bring shown tree nodes up to date with their cloud's transform and
    /// feed shallow ones to the surface model
    fn refresh_tree_nodes(&mut self, report: &mut FrameReport) {
        let max_surface_level = self.config.max_surface_level;

        for cloud in self.clouds.values_mut() {
            let version = cloud.transform.version();
            let world = cloud.world;

            for &id in &cloud.visible_nodes {
                let Some(node) = cloud.octree.node_mut(id) else {
                    continue;
                };

                if let Some(tree) = node.tree_node_mut() {
                    if tree.transform_version != Some(version) {
                        tree.world = world;
                        tree.transform_version = Some(version);
                        report.refreshed += 1;
                    }
                }

                if node.level > max_surface_level {
                    continue;
                }
                if let (Some(surface), LoadState::Loaded(resident)) = (cloud.surface.as_mut(), &mut node.state) {
                    if !resident.in_surface {
                        surface.fold(&resident.buffers.positions);
                        resident.in_surface = true;
                        report.surface_folds += 1;
                    }
                }
            }
        }
    }

    // --- Loading helpers ---

    /// Block until a decode finishes or `timeout` passes. The responses are
    /// applied by the next [`VisibilityPass::update`].
    ///
    /// Returns how many responses are waiting. Inside an async context this
    /// does not block; use [`VisibilityPass::wait_for_loads_async`] there.
    pub fn wait_for_loads(&mut self, timeout: Duration) -> usize {
        let responses = self.pipeline.wait_for_responses(timeout);
        self.pending.extend(responses);
        self.pending.len()
    }

    /// Async form of [`VisibilityPass::wait_for_loads`]
    pub async fn wait_for_loads_async(&mut self, timeout: Duration) -> usize {
        let responses = self.pipeline.recv_responses(timeout).await;
        self.pending.extend(responses);
        self.pending.len()
    }

    /// Decodes dispatched and not yet applied
    pub fn loads_in_flight(&self) -> usize {
        self.pipeline.in_flight() + self.pending.len()
    }

    // --- Accessors ---

    pub fn state(&self) -> PassState {
        self.state
    }

    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResidencyCache {
        &self.cache
    }

    /// Change the global residency budget; applies from the next frame
    pub fn set_memory_budget(&mut self, points: u64) {
        self.config.memory_budget_points = points;
        self.cache.set_budget(points);
    }

    pub fn pipeline(&self) -> &LoadPipeline {
        &self.pipeline
    }

    /// For registering decoders of additional formats
    pub fn pipeline_mut(&mut self) -> &mut LoadPipeline {
        &mut self.pipeline
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}
