//! Dataset manifest: JSON description of a point cloud hierarchy
//!
//! ```json
//! {
//!   "name": "survey",
//!   "bounding_box": { "min": [0, 0, 0], "max": [64, 64, 64] },
//!   "spacing": 2.0,
//!   "format": "binary",
//!   "nodes": [
//!     { "name": "r", "points": 5000 },
//!     { "name": "r0", "points": 4000, "file": "r0.bin" }
//!   ]
//! }
//! ```
//!
//! Node names are octant paths: `r` is the root and every further digit
//! selects a child slot. Payload files are resolved against `base_dir`, or
//! the manifest's own directory when loaded from disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::math::Aabb;
use crate::streaming::decode::{DecodeFormat, Locator};
use super::node::NodeId;
use super::tree::{HierarchyKind, Octree};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestBounds {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl From<&ManifestBounds> for Aabb {
    fn from(bounds: &ManifestBounds) -> Self {
        Aabb::new(Vec3::from(bounds.min), Vec3::from(bounds.max))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestNode {
    pub name: String,
    pub points: u32,
    /// Payload file relative to the base directory; defaults to `<name>.<ext>`
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: String,
    pub bounding_box: ManifestBounds,
    /// Point spacing at the root
    pub spacing: f32,
    #[serde(default)]
    pub kind: HierarchyKind,
    pub format: DecodeFormat,
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    pub nodes: Vec<ManifestNode>,
}

impl Manifest {
    /// Load a manifest from a JSON file
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let mut manifest: Self = serde_json::from_str(&json)?;

        let manifest_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        manifest.base_dir = Some(match manifest.base_dir.take() {
            Some(dir) if dir.is_relative() => manifest_dir.join(dir),
            Some(dir) => dir,
            None => manifest_dir,
        });

        log::info!("Loaded manifest {} ({} nodes) from {}", manifest.name, manifest.nodes.len(), path.display());
        Ok(manifest)
    }

    fn locator_for(&self, node: &ManifestNode) -> Locator {
        let file = node
            .file
            .clone()
            .unwrap_or_else(|| format!("{}.{}", node.name, self.format.extension()));
        let base = self.base_dir.clone().unwrap_or_default();
        Locator::File(base.join(file))
    }

    /// Build the hierarchy. Parents must be listed (in any order) for every
    /// node, and the root must be named `r`.
    pub fn build(&self) -> Result<Octree> {
        let bounds = Aabb::from(&self.bounding_box);
        if !bounds.is_valid() {
            return Err(Error::Manifest(format!("invalid bounding box {:?}", self.bounding_box)));
        }

        let mut ordered: Vec<&ManifestNode> = self.nodes.iter().collect();
        ordered.sort_by(|a, b| a.name.len().cmp(&b.name.len()).then_with(|| a.name.cmp(&b.name)));

        let root = match ordered.first() {
            Some(node) if node.name == "r" => *node,
            _ => return Err(Error::Manifest("manifest has no root node \"r\"".into())),
        };

        let mut tree = Octree::new(
            self.kind,
            self.format,
            bounds,
            self.spacing,
            root.points,
            self.locator_for(root),
        );

        let mut ids: HashMap<&str, NodeId> = HashMap::new();
        ids.insert("r", NodeId::ROOT);

        for node in ordered.iter().skip(1) {
            let (parent_name, slot) = split_name(&node.name)?;
            let parent = *ids.get(parent_name).ok_or_else(|| {
                Error::Manifest(format!("node {} has no parent {}", node.name, parent_name))
            })?;

            let id = tree
                .add_child(parent, slot, node.points, self.locator_for(node))
                .map_err(|e| Error::Manifest(format!("node {}: {}", node.name, e)))?;
            ids.insert(node.name.as_str(), id);
        }

        Ok(tree)
    }
}

/// "r0427" -> ("r042", 7)
fn split_name(name: &str) -> Result<(&str, u8)> {
    let bad_name = || Error::Manifest(format!("bad node name {:?}", name));
    if !name.starts_with('r') {
        return Err(bad_name());
    }
    let (at, last) = name.char_indices().next_back().ok_or_else(bad_name)?;
    if at == 0 {
        return Err(bad_name());
    }
    let slot = last.to_digit(10).ok_or_else(bad_name)?;
    Ok((&name[..at], slot as u8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
        "name": "survey",
        "bounding_box": { "min": [0, 0, 0], "max": [64, 64, 64] },
        "spacing": 2.0,
        "format": "binary",
        "nodes": [
            { "name": "r07", "points": 10 },
            { "name": "r", "points": 500 },
            { "name": "r0", "points": 300, "file": "custom.bin" },
            { "name": "r1", "points": 200 }
        ]
    }"#;

    #[test]
    fn test_build_hierarchy() {
        let manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        let tree = manifest.build().unwrap();

        assert_eq!(tree.len(), 4);
        assert_eq!(tree.root().point_count, 500);

        let deep = tree.find("r07").unwrap();
        assert_eq!(deep.level, 2);
        assert_eq!(deep.spacing, 0.5);
        assert_eq!(deep.bounding_box, Aabb::new(Vec3::new(16.0, 16.0, 16.0), Vec3::splat(32.0)));
        assert_eq!(tree.node(deep.parent.unwrap()).unwrap().name, "r0");
    }

    #[test]
    fn test_missing_parent() {
        let mut manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        manifest.nodes.retain(|n| n.name != "r0");
        assert!(matches!(manifest.build(), Err(Error::Manifest(_))));
    }

    #[test]
    fn test_missing_root() {
        let mut manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        manifest.nodes.retain(|n| n.name != "r");
        assert!(matches!(manifest.build(), Err(Error::Manifest(_))));
    }

    #[test]
    fn test_bad_names() {
        assert!(split_name("r").is_err());
        assert!(split_name("x01").is_err());
        assert!(split_name("r0a").is_err());
        assert_eq!(split_name("r0427").unwrap(), ("r042", 7));
    }

    #[test]
    fn test_non_ascii_name_is_rejected() {
        assert!(split_name("ré").is_err());
        assert!(split_name("r٣").is_err());

        let mut manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        manifest.nodes.push(ManifestNode { name: "ré".into(), points: 1, file: None });
        assert!(matches!(manifest.build(), Err(Error::Manifest(_))));
    }

    #[test]
    fn test_kd_tree_slot_range() {
        let mut manifest: Manifest = serde_json::from_str(MANIFEST).unwrap();
        manifest.kind = HierarchyKind::KdTree;
        // r07 uses slot 7, invalid for a binary hierarchy
        assert!(manifest.build().is_err());
    }

    #[test]
    fn test_load_resolves_files() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("cloud.json");
        std::fs::write(&path, MANIFEST).unwrap();

        let manifest = Manifest::load_sync(&path).unwrap();
        let tree = manifest.build().unwrap();

        match &tree.find("r0").unwrap().locator {
            Locator::File(file) => assert_eq!(file, &temp_dir.path().join("custom.bin")),
            other => panic!("unexpected locator {:?}", other),
        }
        match &tree.find("r1").unwrap().locator {
            Locator::File(file) => assert_eq!(file, &temp_dir.path().join("r1.bin")),
            other => panic!("unexpected locator {:?}", other),
        }
    }
}
