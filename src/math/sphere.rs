//! Bounding sphere

use crate::core::types::Vec3;

/// Sphere defined by center and radius
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Sphere {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// Distance from a point to the sphere center
    pub fn distance_to_center(&self, point: Vec3) -> f32 {
        self.center.distance(point)
    }

    /// Check if a point lies inside the sphere
    pub fn contains_point(&self, point: Vec3) -> bool {
        self.distance_to_center(point) < self.radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_point() {
        let sphere = Sphere::new(Vec3::ZERO, 2.0);
        assert!(sphere.contains_point(Vec3::new(1.0, 1.0, 0.0)));
        assert!(!sphere.contains_point(Vec3::new(3.0, 0.0, 0.0)));
        assert_eq!(sphere.distance_to_center(Vec3::new(0.0, 4.0, 0.0)), 4.0);
    }
}
