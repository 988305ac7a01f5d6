// ── Canopy Tree: Forest ────────────────────────────────────────────────────
//
// Named collection of independent trees with a default, persistence, and
// the shared-resource policy: one writer + many readers per tree, enforced
// by a per-tree RwLock. Layer installation into `layer_to_nodes` is the
// publication point for readers — snapshot isolation is not promised.

use log::info;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::Tree;
use crate::engine::tree::persistence::{load_forest_blob, save_forest_blob};

/// A tree handle: readers take `.read()`, the single writer takes `.write()`.
pub type SharedTree = Arc<RwLock<Tree>>;

#[derive(Default)]
pub struct TreeForest {
    trees: RwLock<BTreeMap<String, SharedTree>>,
    default_tree_id: RwLock<Option<String>>,
}

impl TreeForest {
    pub fn new() -> Self {
        Self::default()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Tree management
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert or replace a tree. The first tree added becomes the default.
    pub fn add_tree(&self, tree_id: impl Into<String>, tree: Tree) -> SharedTree {
        let tree_id = tree_id.into();
        let shared: SharedTree = Arc::new(RwLock::new(tree));
        self.trees.write().insert(tree_id.clone(), shared.clone());

        let mut default = self.default_tree_id.write();
        if default.is_none() {
            *default = Some(tree_id.clone());
        }
        info!("[canopy:forest] ✓ tree '{}' installed", tree_id);
        shared
    }

    pub fn get_tree(&self, tree_id: &str) -> Option<SharedTree> {
        self.trees.read().get(tree_id).cloned()
    }

    pub fn remove_tree(&self, tree_id: &str) -> bool {
        let removed = self.trees.write().remove(tree_id).is_some();
        if removed {
            let mut default = self.default_tree_id.write();
            if default.as_deref() == Some(tree_id) {
                *default = self.trees.read().keys().next().cloned();
            }
        }
        removed
    }

    pub fn list_trees(&self) -> Vec<String> {
        self.trees.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.trees.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.read().is_empty()
    }

    pub fn set_default(&self, tree_id: &str) -> EngineResult<()> {
        if !self.trees.read().contains_key(tree_id) {
            return Err(EngineError::Config(format!("unknown tree '{}'", tree_id)));
        }
        *self.default_tree_id.write() = Some(tree_id.to_string());
        Ok(())
    }

    pub fn default_tree_id(&self) -> Option<String> {
        self.default_tree_id.read().clone()
    }

    pub fn default_tree(&self) -> Option<SharedTree> {
        let id = self.default_tree_id.read().clone()?;
        self.get_tree(&id)
    }

    /// Run a closure against read-locked snapshots of every tree, in id
    /// order. Retrieval uses this to scan the forest without exposing locks.
    pub fn for_each_tree<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Tree),
    {
        let handles: Vec<(String, SharedTree)> = self
            .trees
            .read()
            .iter()
            .map(|(id, t)| (id.clone(), t.clone()))
            .collect();
        for (id, handle) in handles {
            let guard = handle.read();
            f(&id, &guard);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Persistence
    // ═══════════════════════════════════════════════════════════════════════

    /// Serialize the whole forest to one versioned blob.
    pub fn save(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let mut plain: BTreeMap<String, Tree> = BTreeMap::new();
        self.for_each_tree(|id, tree| {
            plain.insert(id.to_string(), tree.clone());
        });
        save_forest_blob(&plain, self.default_tree_id(), &path)?;
        info!(
            "[canopy:forest] ✓ saved {} trees to {}",
            plain.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Load a forest from a blob. Every tree is validated; any violation is
    /// fatal to the load.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let (trees, default_tree_id) = load_forest_blob(&path)?;
        let forest = Self::new();
        {
            let mut map = forest.trees.write();
            for (id, tree) in trees {
                map.insert(id, Arc::new(RwLock::new(tree)));
            }
        }
        *forest.default_tree_id.write() = default_tree_id.or_else(|| {
            forest.trees.read().keys().next().cloned()
        });
        info!(
            "[canopy:forest] ✓ loaded {} trees from {}",
            forest.len(),
            path.as_ref().display()
        );
        Ok(forest)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::Node;

    fn leaf_tree(text: &str) -> Tree {
        Tree::from_leaves(vec![Node::leaf(0, text)])
    }

    #[test]
    fn first_tree_becomes_default() {
        let forest = TreeForest::new();
        forest.add_tree("k8s", leaf_tree("a"));
        forest.add_tree("runbooks", leaf_tree("b"));
        assert_eq!(forest.default_tree_id().as_deref(), Some("k8s"));
        assert_eq!(forest.list_trees(), vec!["k8s", "runbooks"]);
    }

    #[test]
    fn set_default_rejects_unknown() {
        let forest = TreeForest::new();
        forest.add_tree("k8s", leaf_tree("a"));
        assert!(forest.set_default("nope").is_err());
        assert!(forest.set_default("k8s").is_ok());
    }

    #[test]
    fn remove_tree_repoints_default() {
        let forest = TreeForest::new();
        forest.add_tree("a", leaf_tree("1"));
        forest.add_tree("b", leaf_tree("2"));
        assert!(forest.remove_tree("a"));
        assert_eq!(forest.default_tree_id().as_deref(), Some("b"));
        assert!(!forest.remove_tree("a"));
    }

    #[test]
    fn save_load_round_trip() {
        let path = std::env::temp_dir()
            .join(format!("canopy-forest-{}.bin", uuid::Uuid::new_v4()));
        let forest = TreeForest::new();
        forest.add_tree("k8s", leaf_tree("scheduling docs"));
        forest.save(&path).unwrap();

        let loaded = TreeForest::load(&path).unwrap();
        assert_eq!(loaded.list_trees(), vec!["k8s"]);
        assert_eq!(loaded.default_tree_id().as_deref(), Some("k8s"));
        let tree = loaded.get_tree("k8s").unwrap();
        assert_eq!(tree.read().all_nodes[&0].text, "scheduling docs");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn readers_and_writer_coexist() {
        let forest = Arc::new(TreeForest::new());
        forest.add_tree("t", leaf_tree("start"));
        let handle = forest.get_tree("t").unwrap();

        // Writer mutates while sequential readers observe a consistent tree.
        {
            let mut guard = handle.write();
            let idx = guard.next_index();
            guard.all_nodes.insert(idx, Node::leaf(idx, "added"));
            guard.layer_to_nodes.entry(0).or_default().push(idx);
        }
        let reader = handle.read();
        assert_eq!(reader.leaf_count(), 2);
    }
}
