//! Surface (elevation) model fed from shallow visible nodes
//!
//! A regular grid over the X/Y extent of the root box keeps the highest Z
//! seen per cell. Folding is a max, so re-adding a reloaded node is harmless.

use crate::core::types::Vec2;
use crate::math::Aabb;

/// Largest grid side; bigger requests are clamped
pub const MAX_SURFACE_RESOLUTION: u32 = 2048;

#[derive(Clone, Debug)]
pub struct SurfaceModel {
    origin: Vec2,
    cell_size: Vec2,
    resolution: u32,
    heights: Vec<f32>,
    nodes_folded: usize,
}

impl SurfaceModel {
    pub fn new(bounds: Aabb, resolution: u32) -> Self {
        if resolution > MAX_SURFACE_RESOLUTION {
            log::warn!("Surface resolution {} clamped to {}", resolution, MAX_SURFACE_RESOLUTION);
        }
        let resolution = resolution.clamp(1, MAX_SURFACE_RESOLUTION);
        let side = resolution as usize;
        let extent = bounds.size().truncate().max(Vec2::splat(f32::EPSILON));

        Self {
            origin: bounds.min.truncate(),
            cell_size: extent / resolution as f32,
            resolution,
            heights: vec![f32::NEG_INFINITY; side * side],
            nodes_folded: 0,
        }
    }

    fn cell_index(&self, x: f32, y: f32) -> Option<usize> {
        let cell = (Vec2::new(x, y) - self.origin) / self.cell_size;
        if !cell.is_finite() || cell.x < 0.0 || cell.y < 0.0 {
            return None;
        }
        if cell.x > self.resolution as f32 || cell.y > self.resolution as f32 {
            return None;
        }
        // Points on the max edge belong to the last cell
        let side = self.resolution as usize;
        let cx = (cell.x as usize).min(side - 1);
        let cy = (cell.y as usize).min(side - 1);
        Some(cy * side + cx)
    }

    /// Fold a node's positions into the grid
    pub fn fold(&mut self, positions: &[[f32; 3]]) {
        for p in positions {
            if let Some(h) = self.cell_index(p[0], p[1]).and_then(|i| self.heights.get_mut(i)) {
                *h = h.max(p[2]);
            }
        }
        self.nodes_folded += 1;
    }

    /// Highest recorded Z at (x, y), if any point landed in that cell
    pub fn height_at(&self, x: f32, y: f32) -> Option<f32> {
        let h = *self.heights.get(self.cell_index(x, y)?)?;
        h.is_finite().then_some(h)
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Cells that received at least one point
    pub fn covered_cells(&self) -> usize {
        self.heights.iter().filter(|h| h.is_finite()).count()
    }

    pub fn nodes_folded(&self) -> usize {
        self.nodes_folded
    }
}
