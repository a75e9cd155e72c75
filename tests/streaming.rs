//! End-to-end behaviour of the visibility pass with real decode workers

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pointstream::core::camera::Camera;
use pointstream::core::types::{Mat4, Vec3};
use pointstream::math::Aabb;
use pointstream::octree::{HierarchyKind, Manifest, NodeId, NodeKey, Octree, PointCloud, PointCloudId};
use pointstream::streaming::{
    encode_binary, BinaryDecoder, BinaryPoint, DecodeError, DecodeFormat, DecodedBuffers, Decoder, Locator,
};
use pointstream::visibility::{FrameReport, NullHost, VisibilityPass};
use pointstream::{Error, PointCloudSettings, StreamingConfig};
use tempfile::TempDir;

fn points(n: usize, z: f32) -> Vec<BinaryPoint> {
    (0..n)
        .map(|i| {
            let t = i as f32 / n.max(1) as f32;
            BinaryPoint { position: [t, 1.0 - t, z], color: [200, 100, 50, 255] }
        })
        .collect()
}

fn memory(n: usize) -> Locator {
    Locator::Memory(Arc::from(encode_binary(&points(n, 0.5))))
}

fn settings() -> PointCloudSettings {
    PointCloudSettings { minimum_node_pixel_size: 0.0, ..Default::default() }
}

/// Unit cube hierarchy where every node holds `per_node` points
fn cube_cloud(depth: u32, per_node: usize, settings: PointCloudSettings) -> PointCloud {
    let tree = Octree::complete(
        HierarchyKind::Octree,
        DecodeFormat::Binary,
        Aabb::new(Vec3::ZERO, Vec3::ONE),
        0.1,
        depth,
        per_node as u32,
        |_| memory(per_node),
    );
    PointCloud::new("cube", tree, settings)
}

fn camera() -> Camera {
    Camera::perspective(Vec3::new(0.5, 0.5, 5.0), 60.0, 800.0, 600.0).look_at(Vec3::splat(0.5), Vec3::Y)
}

fn new_pass(config: StreamingConfig) -> VisibilityPass<NullHost> {
    VisibilityPass::new(config, NullHost::default()).unwrap()
}

/// Run frames, waiting for decodes in between, until `done` holds
fn settle(
    pass: &mut VisibilityPass<NullHost>,
    camera: &Camera,
    done: impl Fn(&FrameReport) -> bool,
) -> FrameReport {
    for _ in 0..100 {
        let report = pass.update(camera).unwrap();
        if done(&report) {
            return report;
        }
        pass.wait_for_loads(Duration::from_millis(200));
    }
    panic!("pass did not settle within 100 frames");
}

fn root(cloud: PointCloudId) -> NodeKey {
    NodeKey::new(cloud, NodeId::ROOT)
}

#[test]
fn test_nodes_load_and_promote_top_down() {
    let mut pass = new_pass(StreamingConfig::default());
    let id = pass.add_point_cloud(cube_cloud(1, 16, settings()));

    let report = settle(&mut pass, &camera(), |r| r.visible_nodes.len() == 9);

    // Parents are always shown before their children
    assert_eq!(report.visible_nodes[0].node, NodeId::ROOT);
    assert_eq!(report.num_visible_points, 9 * 16);
    assert_eq!(pass.host().live(), 9);

    let cloud = pass.point_cloud(id).unwrap();
    assert_eq!(cloud.visible_nodes().len(), 9);
    assert_eq!(cloud.resident_points(), 9 * 16);
    for node in cloud.octree.nodes() {
        let tree = node.tree_node().unwrap();
        assert!(tree.visible);
        assert_eq!(node.buffers().unwrap().point_count(), 16);
    }
}

#[test]
fn test_caps_limit_work_per_frame() {
    let config = StreamingConfig {
        max_nodes_loading: 2,
        max_nodes_promoted_per_frame: 3,
        ..Default::default()
    };
    let mut pass = new_pass(config);
    pass.add_point_cloud(cube_cloud(2, 4, settings()));

    let mut shown = 0;
    for _ in 0..200 {
        let report = pass.update(&camera()).unwrap();
        assert!(report.dispatched <= 2, "dispatched {}", report.dispatched);
        assert!(report.promoted <= 3, "promoted {}", report.promoted);
        shown = report.visible_nodes.len();
        if shown == 73 {
            break;
        }
        pass.wait_for_loads(Duration::from_millis(200));
    }
    assert_eq!(shown, 73);
}

#[test]
fn test_point_budget_holds_while_orbiting() {
    let cloud_settings = PointCloudSettings {
        point_budget: 20_000,
        minimum_node_pixel_size: 10.0,
        ..Default::default()
    };
    let config = StreamingConfig { memory_budget_points: 30_000, ..Default::default() };
    let mut pass = new_pass(config);
    let id = pass.add_point_cloud(cube_cloud(3, 1_000, cloud_settings));

    for step in 0..40 {
        let angle = step as f32 * 0.3;
        let eye = Vec3::new(0.5 + 2.0 * angle.cos(), 0.8, 0.5 + 2.0 * angle.sin());
        let camera = Camera::perspective(eye, 60.0, 1280.0, 720.0).look_at(Vec3::splat(0.5), Vec3::Y);

        let report = pass.update(&camera).unwrap();
        assert!(pass.point_cloud(id).unwrap().num_visible_points() <= 20_000);
        assert!(report.num_visible_points <= 20_000);

        // Over the global budget only if everything left is in use this frame
        let cache = pass.cache();
        if cache.resident_points() > 30_000 {
            assert!(cache.keys().all(|k| cache.last_touched(*k) == Some(report.frame)));
        }

        pass.wait_for_loads(Duration::from_millis(20));
    }
}

#[test]
fn test_evicted_node_reloads_identically() {
    let config = StreamingConfig { memory_budget_points: 150, ..Default::default() };
    let mut pass = new_pass(config);
    let a = pass.add_point_cloud(cube_cloud(0, 100, settings()));
    let b = pass.add_point_cloud(cube_cloud(0, 100, settings()).with_world(Mat4::from_translation(Vec3::X * 0.2)));

    settle(&mut pass, &camera(), |r| r.visible_nodes.len() == 2);
    let first: DecodedBuffers = (**pass.point_cloud(a).unwrap().octree.root().buffers().unwrap()).clone();

    // Both were in use, so the pass stays over budget rather than evict
    assert_eq!(pass.cache().resident_points(), 200);

    pass.point_cloud_mut(a).unwrap().visible = false;
    let report = pass.update(&camera()).unwrap();
    assert_eq!(report.evicted, 1);
    assert!(pass.point_cloud(a).unwrap().octree.root().is_unloaded());
    assert_eq!(pass.host().live(), 1);

    pass.point_cloud_mut(a).unwrap().visible = true;
    pass.point_cloud_mut(b).unwrap().visible = false;
    let report = pass.update(&camera()).unwrap();
    assert_eq!(report.dispatched, 1);
    assert!(pass.point_cloud(a).unwrap().octree.root().is_loading());

    settle(&mut pass, &camera(), |r| r.visible_nodes.iter().any(|v| v.cloud == a));
    let reloaded = pass.point_cloud(a).unwrap().octree.root().buffers().unwrap();
    assert_eq!(**reloaded, first);
    assert!(pass.point_cloud(b).unwrap().octree.root().is_unloaded());
}

#[test]
fn test_stale_response_discarded() {
    let mut pass = new_pass(StreamingConfig::default());
    let id = pass.add_point_cloud(cube_cloud(0, 10, settings()));

    let report = pass.update(&camera()).unwrap();
    assert_eq!(report.dispatched, 1);

    // Drop the node while its decode is in flight
    assert!(pass.unload_node(root(id)).unwrap());
    pass.point_cloud_mut(id).unwrap().visible = false;

    assert_eq!(pass.wait_for_loads(Duration::from_secs(5)), 1);
    let report = pass.update(&camera()).unwrap();
    assert_eq!(report.stale, 1);
    assert_eq!(report.loaded, 0);

    let node = pass.point_cloud(id).unwrap().octree.root();
    assert!(node.is_unloaded());
    assert!(node.tree_node().is_none());
    assert_eq!(pass.cache().len(), 0);
    assert_eq!(pass.host().live(), 0);
}

/// Decoder that reports when it starts and then waits for a release before
/// decoding. The gate lock is held while waiting, so decodes finish in the
/// order they started.
struct GatedDecoder {
    gate: Arc<Mutex<Receiver<()>>>,
    started: Sender<()>,
}

impl Decoder for GatedDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<DecodedBuffers, DecodeError> {
        let gate = self.gate.lock().unwrap();
        self.started.send(()).unwrap();
        gate.recv().unwrap();
        drop(gate);
        BinaryDecoder.decode(bytes)
    }
}

#[test]
fn test_superseded_load_discarded() {
    let (release, gate) = mpsc::channel();
    let (started_tx, started) = mpsc::channel();
    let gate = Arc::new(Mutex::new(gate));

    let mut pass = new_pass(StreamingConfig::default());
    pass.pipeline_mut().register_pool(DecodeFormat::EptBinary, 2, move || {
        Box::new(GatedDecoder { gate: gate.clone(), started: started_tx.clone() })
    });
    let tree = Octree::new(
        HierarchyKind::Octree,
        DecodeFormat::EptBinary,
        Aabb::new(Vec3::ZERO, Vec3::ONE),
        0.1,
        10,
        memory(10),
    );
    let id = pass.add_point_cloud(PointCloud::new("gated", tree, settings()));

    assert_eq!(pass.update(&camera()).unwrap().dispatched, 1);
    let first = pass.point_cloud(id).unwrap().octree.root().loading_ticket().unwrap();
    started.recv_timeout(Duration::from_secs(5)).unwrap();

    // Release the node mid-decode and let the next frame request it again
    assert!(pass.unload_node(root(id)).unwrap());
    assert_eq!(pass.update(&camera()).unwrap().dispatched, 1);
    let second = pass.point_cloud(id).unwrap().octree.root().loading_ticket().unwrap();
    assert_ne!(first, second);

    // The first decode finishes while the second one is still pending
    release.send(()).unwrap();
    assert_eq!(pass.wait_for_loads(Duration::from_secs(5)), 1);
    let report = pass.update(&camera()).unwrap();
    assert_eq!(report.stale, 1);
    assert_eq!(report.loaded, 0);
    assert_eq!(report.dispatched, 0);

    let node = pass.point_cloud(id).unwrap().octree.root();
    assert_eq!(node.loading_ticket(), Some(second));
    assert!(pass.cache().is_empty());
    assert_eq!(pass.host().live(), 0);

    // The newer decode is applied normally
    release.send(()).unwrap();
    assert_eq!(pass.wait_for_loads(Duration::from_secs(5)), 1);
    let report = pass.update(&camera()).unwrap();
    assert_eq!(report.stale, 0);
    assert_eq!(report.loaded, 1);
    assert_eq!(report.visible_nodes.len(), 1);
    assert!(pass.point_cloud(id).unwrap().octree.root().is_promoted());
}

#[test]
fn test_response_for_removed_cloud_discarded() {
    let mut pass = new_pass(StreamingConfig::default());
    let id = pass.add_point_cloud(cube_cloud(0, 10, settings()));
    pass.update(&camera()).unwrap();

    let removed = pass.remove_point_cloud(id).unwrap();
    assert!(removed.octree.root().is_unloaded());

    pass.wait_for_loads(Duration::from_secs(5));
    let report = pass.update(&camera()).unwrap();
    assert_eq!(report.stale, 1);
    assert!(pass.point_cloud(id).is_none());
}

#[test]
fn test_remove_cloud_releases_everything() {
    let mut pass = new_pass(StreamingConfig::default());
    let id = pass.add_point_cloud(cube_cloud(1, 8, settings()));
    settle(&mut pass, &camera(), |r| r.visible_nodes.len() == 9);

    pass.remove_point_cloud(id).unwrap();
    assert_eq!(pass.host().live(), 0);
    assert!(pass.cache().is_empty());
}

#[test]
fn test_unsupported_format_propagates() {
    let tree = Octree::new(
        HierarchyKind::Octree,
        DecodeFormat::Laz,
        Aabb::new(Vec3::ZERO, Vec3::ONE),
        0.1,
        10,
        memory(10),
    );
    let mut pass = new_pass(StreamingConfig::default());
    let id = pass.add_point_cloud(PointCloud::new("laz", tree, settings()));

    let err = pass.update(&camera()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(DecodeFormat::Laz)));
    assert!(pass.point_cloud(id).unwrap().octree.root().is_unloaded());

    // A registered decoder makes the format usable
    pass.pipeline_mut().register_pool(DecodeFormat::Laz, 1, || Box::new(BinaryDecoder));
    let report = settle(&mut pass, &camera(), |r| r.visible_nodes.len() == 1);
    assert_eq!(report.num_visible_points, 10);
}

#[test]
fn test_decode_failure_is_retried() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let path = temp_dir.path().join("r.bin");

    let tree = Octree::new(
        HierarchyKind::Octree,
        DecodeFormat::Binary,
        Aabb::new(Vec3::ZERO, Vec3::ONE),
        0.1,
        5,
        Locator::File(path.clone()),
    );
    let mut pass = new_pass(StreamingConfig::default());
    let id = pass.add_point_cloud(PointCloud::new("late", tree, settings()));

    pass.update(&camera()).unwrap();
    pass.wait_for_loads(Duration::from_secs(5));
    let report = pass.update(&camera()).unwrap();
    assert_eq!(report.failed, 1);
    // The failed node went back to unloaded and was requested again
    assert_eq!(report.dispatched, 1);

    std::fs::write(&path, encode_binary(&points(5, 0.5))).unwrap();
    settle(&mut pass, &camera(), |r| r.visible_nodes.len() == 1);
    assert!(pass.point_cloud(id).unwrap().octree.root().is_promoted());
}

#[test]
fn test_manifest_cloud_streams_from_disk() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let dir = temp_dir.path();

    std::fs::write(dir.join("r.bin"), encode_binary(&points(30, 0.5))).unwrap();
    std::fs::write(dir.join("r0.bin"), encode_binary(&points(20, 0.25))).unwrap();
    std::fs::write(dir.join("payload_r7.bin"), encode_binary(&points(10, 0.75))).unwrap();

    let manifest = r#"{
        "name": "disk",
        "bounding_box": { "min": [0, 0, 0], "max": [1, 1, 1] },
        "spacing": 0.1,
        "format": "binary",
        "nodes": [
            { "name": "r", "points": 30 },
            { "name": "r0", "points": 20 },
            { "name": "r7", "points": 10, "file": "payload_r7.bin" }
        ]
    }"#;
    let manifest_path = dir.join("cloud.json");
    std::fs::write(&manifest_path, manifest).unwrap();

    let manifest = Manifest::load_sync(&manifest_path).unwrap();
    let cloud = PointCloud::new(manifest.name.clone(), manifest.build().unwrap(), settings());

    let mut pass = new_pass(StreamingConfig::default());
    let id = pass.add_point_cloud(cloud);
    let report = settle(&mut pass, &camera(), |r| r.visible_nodes.len() == 3);

    assert_eq!(report.num_visible_points, 60);
    let cloud = pass.point_cloud(id).unwrap();
    assert_eq!(cloud.octree.find("r7").unwrap().buffers().unwrap().positions[0][2], 0.75);
}

#[test]
fn test_transform_change_refreshes_tree_nodes() {
    let mut pass = new_pass(StreamingConfig::default());
    let id = pass.add_point_cloud(cube_cloud(1, 4, settings()));
    settle(&mut pass, &camera(), |r| r.visible_nodes.len() == 9);

    let moved = Mat4::from_translation(Vec3::new(0.05, 0.0, 0.0));
    pass.point_cloud_mut(id).unwrap().world = moved;
    let report = pass.update(&camera()).unwrap();

    assert_eq!(report.transformed, vec![id]);
    assert_eq!(report.refreshed, report.visible_nodes.len());
    let cloud = pass.point_cloud(id).unwrap();
    for node in cloud.visible_nodes() {
        let tree = cloud.octree.node(*node).unwrap().tree_node().unwrap();
        assert_eq!(tree.world, moved);
        assert_eq!(tree.transform_version, Some(1));
    }

    // Nothing to refresh once up to date
    assert_eq!(pass.update(&camera()).unwrap().refreshed, 0);
}

#[test]
fn test_surface_model_from_shallow_nodes() {
    let cloud_settings = PointCloudSettings { generate_surface_model: true, surface_resolution: 8, ..settings() };
    let mut pass = new_pass(StreamingConfig::default());
    let id = pass.add_point_cloud(cube_cloud(1, 32, cloud_settings));

    settle(&mut pass, &camera(), |r| r.visible_nodes.len() == 9);

    let surface = pass.point_cloud(id).unwrap().surface().unwrap();
    // Only the root (level 0) is folded with the default surface level
    assert_eq!(surface.nodes_folded(), 1);
    assert!(surface.covered_cells() > 0);
    assert_eq!(surface.height_at(0.0, 1.0), Some(0.5));
}

#[test]
fn test_surface_model_enabled_after_attach() {
    let mut pass = new_pass(StreamingConfig::default());
    let id = pass.add_point_cloud(cube_cloud(1, 32, settings()));
    settle(&mut pass, &camera(), |r| r.visible_nodes.len() == 9);
    assert!(pass.point_cloud(id).unwrap().surface().is_none());

    let cloud = pass.point_cloud_mut(id).unwrap();
    cloud.settings.generate_surface_model = true;
    cloud.settings.surface_resolution = 8;

    // The root is already resident; it is folded into the new grid
    let report = pass.update(&camera()).unwrap();
    assert_eq!(report.surface_folds, 1);
    let surface = pass.point_cloud(id).unwrap().surface().unwrap();
    assert_eq!(surface.resolution(), 8);
    assert_eq!(surface.height_at(0.0, 1.0), Some(0.5));

    pass.point_cloud_mut(id).unwrap().settings.generate_surface_model = false;
    assert_eq!(pass.update(&camera()).unwrap().surface_folds, 0);
    assert!(pass.point_cloud(id).unwrap().surface().is_none());
}

#[tokio::test]
async fn test_owning_pass_drops_in_async_context() {
    let mut pass = new_pass(StreamingConfig::default());
    pass.add_point_cloud(cube_cloud(1, 8, settings()));
    assert_eq!(pass.update(&camera()).unwrap().dispatched, 1);
    drop(pass);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pass_on_host_runtime() {
    let handle = tokio::runtime::Handle::current();
    let mut pass = VisibilityPass::with_handle(StreamingConfig::default(), NullHost::default(), handle).unwrap();
    assert!(!pass.pipeline().owns_runtime());
    let id = pass.add_point_cloud(cube_cloud(1, 8, settings()));

    let mut shown = 0;
    for _ in 0..100 {
        shown = pass.update(&camera()).unwrap().visible_nodes.len();
        if shown == 9 {
            break;
        }
        pass.wait_for_loads_async(Duration::from_millis(200)).await;
    }
    assert_eq!(shown, 9);
    assert_eq!(pass.host().live(), 9);

    pass.remove_point_cloud(id).unwrap();
    assert_eq!(pass.host().live(), 0);
}
