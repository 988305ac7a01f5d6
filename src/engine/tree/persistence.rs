// ── Canopy Tree: Persistence ───────────────────────────────────────────────
//
// Versioned binary blobs (MessagePack) for trees and forests. Decoding goes
// into concrete types only — no arbitrary object graphs — and every loaded
// tree is validated against the structural invariants before it is handed
// to anyone. An invalid blob is a fatal load error, never a usable forest.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::Tree;

/// Bump on any incompatible layout change.
pub const BLOB_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct TreeBlob {
    version: u32,
    tree: Tree,
}

#[derive(Debug, Serialize, Deserialize)]
struct ForestBlob {
    version: u32,
    default_tree_id: Option<String>,
    trees: BTreeMap<String, Tree>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Trees
// ═══════════════════════════════════════════════════════════════════════════

pub fn save_tree(tree: &Tree, path: impl AsRef<Path>) -> EngineResult<()> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    let blob = TreeBlob { version: BLOB_VERSION, tree: tree.clone() };
    let bytes = rmp_serde::to_vec_named(&blob)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

pub fn load_tree(path: impl AsRef<Path>) -> EngineResult<Tree> {
    let bytes = std::fs::read(path)?;
    let blob: TreeBlob = rmp_serde::from_slice(&bytes)?;
    if blob.version != BLOB_VERSION {
        return Err(EngineError::invalid_tree(format!(
            "unsupported blob version {} (expected {})",
            blob.version, BLOB_VERSION
        )));
    }
    let mut tree = blob.tree;
    tree.validate()?;
    tree.rebuild_parent_ids();
    Ok(tree)
}

// ═══════════════════════════════════════════════════════════════════════════
// Forests
// ═══════════════════════════════════════════════════════════════════════════

pub(crate) fn save_forest_blob(
    trees: &BTreeMap<String, Tree>,
    default_tree_id: Option<String>,
    path: impl AsRef<Path>,
) -> EngineResult<()> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    let blob = ForestBlob { version: BLOB_VERSION, default_tree_id, trees: trees.clone() };
    let bytes = rmp_serde::to_vec_named(&blob)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

pub(crate) fn load_forest_blob(
    path: impl AsRef<Path>,
) -> EngineResult<(BTreeMap<String, Tree>, Option<String>)> {
    let bytes = std::fs::read(path)?;
    let blob: ForestBlob = rmp_serde::from_slice(&bytes)?;
    if blob.version != BLOB_VERSION {
        return Err(EngineError::invalid_tree(format!(
            "unsupported forest blob version {} (expected {})",
            blob.version, BLOB_VERSION
        )));
    }
    let mut trees = blob.trees;
    for (id, tree) in trees.iter_mut() {
        tree.validate().map_err(|e| {
            EngineError::invalid_tree(format!("tree '{}' failed validation: {}", id, e))
        })?;
        tree.rebuild_parent_ids();
    }
    if let Some(default) = &blob.default_tree_id {
        if !trees.contains_key(default) {
            return Err(EngineError::invalid_tree(format!(
                "default tree '{}' not present in blob",
                default
            )));
        }
    }
    Ok((trees, blob.default_tree_id))
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
