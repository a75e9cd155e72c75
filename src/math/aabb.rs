//! Axis-aligned bounding box

use crate::core::types::Vec3;
use super::sphere::Sphere;

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create AABB from center and half-extents
    pub fn from_center_half_extent(center: Vec3, half_extent: Vec3) -> Self {
        Self {
            min: center - half_extent,
            max: center + half_extent,
        }
    }

    /// Get center point
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Get half-extents
    pub fn half_extent(&self) -> Vec3 {
        self.size() * 0.5
    }

    /// Length of the box diagonal
    pub fn diagonal(&self) -> f32 {
        self.size().length()
    }

    /// Finite corners with min <= max on every axis
    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min.cmple(self.max).all()
    }

    /// Smallest sphere enclosing the box
    pub fn bounding_sphere(&self) -> Sphere {
        Sphere::new(self.center(), self.half_extent().length())
    }

    /// Get child octant AABB for octree subdivision
    /// index: 0-7 representing xyz octant (bit 0=x, bit 1=y, bit 2=z)
    pub fn child_octant(&self, index: u8) -> Aabb {
        let center = self.center();
        let half = self.half_extent() * 0.5;

        let offset = Vec3::new(
            if index & 1 != 0 { half.x } else { -half.x },
            if index & 2 != 0 { half.y } else { -half.y },
            if index & 4 != 0 { half.z } else { -half.z },
        );

        Aabb::from_center_half_extent(center + offset, half)
    }

    /// Split the box in half along one axis (0=x, 1=y, 2=z), for binary hierarchies
    pub fn child_half(&self, axis: usize, upper: bool) -> Aabb {
        let mid = self.center()[axis];
        let mut child = *self;
        if upper {
            child.min[axis] = mid;
        } else {
            child.max[axis] = mid;
        }
        child
    }
}
