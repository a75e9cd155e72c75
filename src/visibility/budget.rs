//! Point budget and depth cap enforced during traversal
//!
//! Candidates are admitted in priority order, so the most important nodes
//! fill the budget first. A candidate that would overshoot is rejected
//! outright (no partial admission), which can leave the budget under-filled
//! by up to one node.

use std::collections::HashMap;

use crate::config::PointCloudSettings;
use crate::octree::PointCloudId;

/// Why a candidate was turned away
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// Admitting it would exceed the cloud's point budget
    PointBudget,
    /// Its level is at or below the cloud's max level
    MaxLevel,
}

/// Limits of one point cloud
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BudgetLimits {
    pub point_budget: u64,
    pub max_level: u32,
}

impl From<&PointCloudSettings> for BudgetLimits {
    fn from(settings: &PointCloudSettings) -> Self {
        Self {
            point_budget: settings.point_budget,
            max_level: settings.max_level,
        }
    }
}

/// Running per-cloud visible point counters for one traversal
#[derive(Debug, Default)]
pub struct BudgetEnforcer {
    running: HashMap<PointCloudId, u64>,
}

impl BudgetEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all counters (start of a traversal)
    pub fn reset(&mut self) {
        self.running.clear();
    }

    // --- Decision methods ---

    /// Admit or reject a node; admission adds its points to the cloud total
    pub fn admit(
        &mut self,
        cloud: PointCloudId,
        limits: BudgetLimits,
        level: u32,
        points: u32,
    ) -> Result<(), Rejection> {
        if points as u64 > self.remaining(cloud, limits) {
            return Err(Rejection::PointBudget);
        }
        if level >= limits.max_level {
            return Err(Rejection::MaxLevel);
        }

        *self.running.entry(cloud).or_insert(0) += points as u64;
        Ok(())
    }

    // --- Query methods ---

    /// Points admitted so far for a cloud
    pub fn running(&self, cloud: PointCloudId) -> u64 {
        self.running.get(&cloud).copied().unwrap_or(0)
    }

    /// Points still available for a cloud
    pub fn remaining(&self, cloud: PointCloudId, limits: BudgetLimits) -> u64 {
        limits.point_budget.saturating_sub(self.running(cloud))
    }
}
