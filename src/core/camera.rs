//! Camera description consumed by the visibility pass
//!
//! The host renderer owns the real camera; each frame it hands the engine a
//! snapshot of the world transform, projection and viewport size.

use crate::core::types::{Vec3, Mat4, Quat};

/// Projection model of the camera
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    /// Perspective projection with a vertical field of view in radians
    Perspective { fov_y: f32 },
    /// Orthographic projection with the half height of the view volume
    Orthographic { half_height: f32 },
}

/// Camera with position, rotation, projection and viewport parameters
#[derive(Clone, Debug)]
pub struct Camera {
    /// World position
    pub position: Vec3,
    /// Rotation as quaternion
    pub rotation: Quat,
    /// Projection model
    pub projection: Projection,
    /// Near clip plane
    pub near: f32,
    /// Far clip plane
    pub far: f32,
    /// Viewport width in pixels
    pub viewport_width: f32,
    /// Viewport height in pixels
    pub viewport_height: f32,
}

impl Camera {
    /// Create a perspective camera
    pub fn perspective(position: Vec3, fov_y_degrees: f32, viewport_width: f32, viewport_height: f32) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            projection: Projection::Perspective { fov_y: fov_y_degrees.to_radians() },
            near: 0.1,
            far: 10_000.0,
            viewport_width,
            viewport_height,
        }
    }

    /// Create an orthographic camera
    pub fn orthographic(position: Vec3, half_height: f32, viewport_width: f32, viewport_height: f32) -> Self {
        Self {
            projection: Projection::Orthographic { half_height },
            ..Self::perspective(position, 60.0, viewport_width, viewport_height)
        }
    }

    /// Rotate the camera so it looks at a target
    pub fn look_at(mut self, target: Vec3, up: Vec3) -> Self {
        let forward = (target - self.position).normalize();
        let right = forward.cross(up).normalize();
        let up = right.cross(forward);

        self.rotation = Quat::from_mat3(&glam::Mat3::from_cols(right, up, -forward));
        self
    }

    /// Whether the camera uses a perspective projection
    pub fn is_perspective(&self) -> bool {
        matches!(self.projection, Projection::Perspective { .. })
    }

    /// Viewport aspect ratio (width / height)
    pub fn aspect(&self) -> f32 {
        if self.viewport_height <= 0.0 {
            return 1.0;
        }
        self.viewport_width / self.viewport_height
    }

    /// Camera to world transform
    pub fn world_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position)
    }

    /// Get view matrix (world to camera space)
    pub fn view_matrix(&self) -> Mat4 {
        let rotation_matrix = Mat4::from_quat(self.rotation.conjugate());
        let translation_matrix = Mat4::from_translation(-self.position);
        rotation_matrix * translation_matrix
    }

    /// Get projection matrix (camera to clip space, depth in 0..1)
    pub fn projection_matrix(&self) -> Mat4 {
        match self.projection {
            Projection::Perspective { fov_y } => {
                Mat4::perspective_rh(fov_y, self.aspect(), self.near, self.far)
            }
            Projection::Orthographic { half_height } => {
                let half_width = half_height * self.aspect();
                Mat4::orthographic_rh(-half_width, half_width, -half_height, half_height, self.near, self.far)
            }
        }
    }

    /// Get combined view-projection matrix
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

}

impl Default for Camera {
    fn default() -> Self {
        Self::perspective(Vec3::new(0.0, 0.0, 5.0), 60.0, 1920.0, 1080.0)
    }
}
