//! LRU residency cache for decoded nodes
//!
//! Tracks every loaded node across all point clouds in touch order, together
//! with its point count. When the resident total exceeds the memory budget,
//! the least recently touched nodes are evicted first. Nodes touched in the
//! current frame are never evicted.
//!
//! The cache only tracks keys; the decoded buffers live in the octree and the
//! caller releases them for every key [`ResidencyCache::evict`] returns.

use std::collections::{BTreeMap, HashMap};

use crate::core::types::FrameNumber;
use crate::octree::{NodeKey, PointCloudId};

#[derive(Clone, Copy, Debug)]
struct Entry {
    points: u64,
    /// Position in `order`
    stamp: (FrameNumber, u64),
}

/// LRU set of resident nodes under a global point budget
pub struct ResidencyCache {
    /// Resident nodes and their point counts
    entries: HashMap<NodeKey, Entry>,
    /// Touch order: oldest first. Keyed by (frame, sequence) so touching is
    /// a remove plus an insert instead of a linear scan.
    order: BTreeMap<(FrameNumber, u64), NodeKey>,
    next_seq: u64,
    resident_points: u64,
    /// Maximum points to keep resident
    budget: u64,
}

impl ResidencyCache {
    /// Create an empty cache
    ///
    /// # Arguments
    /// * `budget` - Maximum number of resident points across all clouds
    pub fn new(budget: u64) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            resident_points: 0,
            budget,
        }
    }

    /// Register a newly loaded node as most recently used
    ///
    /// Re-inserting a key replaces its point count and refreshes its stamp.
    pub fn insert(&mut self, key: NodeKey, points: u64, frame: FrameNumber) {
        self.remove(key);

        let stamp = self.next_stamp(frame);
        self.order.insert(stamp, key);
        self.entries.insert(key, Entry { points, stamp });
        self.resident_points += points;
    }

    /// Mark a node as used in `frame`
    ///
    /// # Returns
    /// False if the node is not resident
    pub fn touch(&mut self, key: NodeKey, frame: FrameNumber) -> bool {
        let Some(old) = self.entries.get(&key).map(|e| e.stamp) else {
            return false;
        };

        let stamp = self.next_stamp(frame);
        self.order.remove(&old);
        self.order.insert(stamp, key);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.stamp = stamp;
        }
        true
    }

    /// Forget a node
    ///
    /// # Returns
    /// The node's point count if it was resident
    pub fn remove(&mut self, key: NodeKey) -> Option<u64> {
        let entry = self.entries.remove(&key)?;
        self.order.remove(&entry.stamp);
        self.resident_points -= entry.points;
        Some(entry.points)
    }

    /// Forget every node of a point cloud
    ///
    /// # Returns
    /// The removed keys, oldest first
    pub fn remove_cloud(&mut self, cloud: PointCloudId) -> Vec<NodeKey> {
        let keys: Vec<NodeKey> = self.order.values().copied().filter(|k| k.cloud == cloud).collect();
        for key in &keys {
            self.remove(*key);
        }
        keys
    }

    /// Evict least recently used nodes until the budget holds
    ///
    /// Stops early at the first node touched in `frame` or later, so the
    /// current frame's working set stays resident even over budget.
    ///
    /// # Returns
    /// Evicted keys, oldest first
    pub fn evict(&mut self, frame: FrameNumber) -> Vec<NodeKey> {
        let mut evicted = Vec::new();

        while self.resident_points > self.budget {
            let Some((&(stamp_frame, _), &key)) = self.order.iter().next() else {
                break;
            };
            if stamp_frame >= frame {
                log::debug!(
                    "Residency over budget ({} > {}) with only current-frame nodes left",
                    self.resident_points,
                    self.budget
                );
                break;
            }
            self.remove(key);
            evicted.push(key);
        }

        evicted
    }

    /// Check if a node is resident
    pub fn contains(&self, key: NodeKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Frame a node was last touched in
    pub fn last_touched(&self, key: NodeKey) -> Option<FrameNumber> {
        self.entries.get(&key).map(|e| e.stamp.0)
    }

    /// Total resident points
    pub fn resident_points(&self) -> u64 {
        self.resident_points
    }

    /// Get the number of resident nodes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Change the budget; takes effect on the next [`ResidencyCache::evict`]
    pub fn set_budget(&mut self, budget: u64) {
        self.budget = budget;
    }

    /// Resident keys, least recently used first
    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.order.values()
    }

    fn next_stamp(&mut self, frame: FrameNumber) -> (FrameNumber, u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        (frame, seq)
    }
}
