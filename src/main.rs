//! Headless streaming driver
//!
//! Orbits a camera around the attached point clouds and logs what the
//! visibility pass does each frame.
//!
//! Usage: cargo run --release -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>     Streaming config JSON (default: built-in defaults)
//!   --manifest <PATH>   Point cloud manifest; repeat for several clouds.
//!                       Without one, a synthetic in-memory cloud is used.
//!   --frames <N>        Frames to run (default: 120)
//!   --budget <POINTS>   Per-cloud point budget (default: 1000000)
//!   --pixels <PX>       Minimum node pixel size (default: 150)
//!   --radius <M>        Orbit radius as a multiple of the scene size (default: 1.5)
//!   --wait-ms <MS>      Time to wait for decodes between frames (default: 5)

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pointstream::core::camera::Camera;
use pointstream::core::logging;
use pointstream::core::types::Vec3;
use pointstream::math::Aabb;
use pointstream::octree::{HierarchyKind, Manifest, Octree, PointCloud};
use pointstream::streaming::{encode_binary_lz4, BinaryPoint, DecodeFormat, Locator};
use pointstream::visibility::{NullHost, VisibilityPass};
use pointstream::{PointCloudSettings, Result, StreamingConfig};

fn main() -> ExitCode {
    logging::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let frames: u64 = parse_arg(&args, "--frames").unwrap_or(120);
    let wait = Duration::from_millis(parse_arg(&args, "--wait-ms").unwrap_or(5));
    let orbit_scale: f32 = parse_arg(&args, "--radius").unwrap_or(1.5);

    let settings = PointCloudSettings {
        point_budget: parse_arg(&args, "--budget").unwrap_or(1_000_000),
        minimum_node_pixel_size: parse_arg(&args, "--pixels").unwrap_or(150.0),
        ..Default::default()
    };

    let config = match parse_arg::<PathBuf>(&args, "--config") {
        Some(path) => StreamingConfig::load_sync(&path)?,
        None => StreamingConfig::default(),
    };

    let mut pass = VisibilityPass::new(config, NullHost::default())?;

    let manifests: Vec<PathBuf> = args
        .windows(2)
        .filter(|pair| pair[0] == "--manifest")
        .map(|pair| PathBuf::from(&pair[1]))
        .collect();

    let mut scene = Aabb::new(Vec3::splat(f32::MAX), Vec3::splat(f32::MIN));
    if manifests.is_empty() {
        let cloud = synthetic_cloud(settings.clone());
        grow(&mut scene, &cloud);
        pass.add_point_cloud(cloud);
    }
    for path in &manifests {
        let manifest = Manifest::load_sync(path)?;
        let cloud = PointCloud::new(manifest.name.clone(), manifest.build()?, settings.clone());
        grow(&mut scene, &cloud);
        pass.add_point_cloud(cloud);
    }

    let center = scene.center();
    let radius = scene.diagonal() * 0.5 * orbit_scale;
    let start = Instant::now();

    for frame in 0..frames {
        let angle = frame as f32 / frames.max(1) as f32 * std::f32::consts::TAU;
        let eye = center + Vec3::new(radius * angle.cos(), radius * 0.4, radius * angle.sin());
        let camera = Camera::perspective(eye, 60.0, 1920.0, 1080.0).look_at(center, Vec3::Y);

        let report = pass.update(&camera)?;
        log::info!(
            "frame {:>4}: {:>5} selected, {:>5} shown, {:>9} points, spacing {:.3}, +{} loads, {} promoted, {} evicted",
            report.frame,
            report.num_visible_nodes,
            report.visible_nodes.len(),
            report.num_visible_points,
            report.lowest_spacing,
            report.dispatched,
            report.promoted,
            report.evicted
        );

        if pass.loads_in_flight() > 0 {
            pass.wait_for_loads(wait);
        }
    }

    log::info!(
        "{} frames in {:.2?}, {} points resident ({} host resources live)",
        frames,
        start.elapsed(),
        pass.cache().resident_points(),
        pass.host().live()
    );
    Ok(())
}

/// Octree of depth 4 over a 100 m cube with a wavy surface of points in
/// every node
fn synthetic_cloud(settings: PointCloudSettings) -> PointCloud {
    let bounds = Aabb::new(Vec3::ZERO, Vec3::splat(100.0));
    let tree = Octree::complete(
        HierarchyKind::Octree,
        DecodeFormat::BinaryLz4,
        bounds,
        4.0,
        4,
        2_000,
        |name| {
            let seed = name.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
            Locator::Memory(Arc::from(encode_binary_lz4(&wave_points(seed, 2_000))))
        },
    );
    PointCloud::new("synthetic", tree, settings)
}

fn wave_points(seed: u32, count: usize) -> Vec<BinaryPoint> {
    (0..count)
        .map(|i| {
            let u = ((i as u32).wrapping_mul(2_654_435_761) ^ seed) as f32 / u32::MAX as f32;
            let v = ((i as u32).wrapping_mul(40_503) ^ seed.rotate_left(7)) as f32 / u32::MAX as f32;
            let (x, y) = (u * 100.0, v * 100.0);
            let z = 50.0 + 10.0 * (x * 0.1).sin() * (y * 0.1).cos();
            BinaryPoint { position: [x, y, z], color: [(u * 255.0) as u8, (v * 255.0) as u8, 128, 255] }
        })
        .collect()
}

fn grow(scene: &mut Aabb, cloud: &PointCloud) {
    let bounds = cloud.octree.root().bounding_box;
    let corners = [bounds.min, bounds.max].map(|p| cloud.world.transform_point3(p));
    for corner in corners {
        scene.min = scene.min.min(corner);
        scene.max = scene.max.max(corner);
    }
}

fn parse_arg<T: FromStr>(args: &[String], flag: &str) -> Option<T> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}
