//! Bounding volumes and frustum math

pub mod aabb;
pub mod sphere;
pub mod frustum;

pub use aabb::Aabb;
pub use sphere::Sphere;
pub use frustum::{Plane, Frustum};
