//! Object-space culling structures per point cloud
//!
//! Instead of moving every node box into world space, the camera is moved
//! into each cloud's object space once per frame.

use crate::core::camera::Camera;
use crate::core::types::{Mat4, Vec3};
use crate::math::Frustum;

/// Per-cloud, per-frame culling data
#[derive(Clone, Copy, Debug)]
pub struct CullStructure {
    /// Frustum planes in the cloud's object space
    pub frustum: Frustum,
    /// Camera position in the cloud's object space
    pub camera_position: Vec3,
}

/// Computes [`CullStructure`]s from a camera snapshot
pub struct FrustumCuller {
    view_projection: Mat4,
    camera_world: Mat4,
}

impl FrustumCuller {
    pub fn new(camera: &Camera) -> Self {
        Self {
            view_projection: camera.view_projection(),
            camera_world: camera.world_matrix(),
        }
    }

    /// Culling data for a cloud with the given world transform.
    ///
    /// Returns `None` when the transform cannot be inverted.
    pub fn compute(&self, world: &Mat4) -> Option<CullStructure> {
        let det = world.determinant();
        if !det.is_finite() || det.abs() <= f32::EPSILON {
            return None;
        }

        let frustum = Frustum::from_matrix(&(self.view_projection * *world));
        let camera_in_object = world.inverse() * self.camera_world;
        let camera_position = camera_in_object.w_axis.truncate();

        Some(CullStructure {
            frustum,
            camera_position,
        })
    }
}
