//! Analysed archive contents keyed by archive hash.
//!
//! Identical archives under different names or directories are enumerated
//! once; later analyses reuse the stored subtree.

use super::file::IndexedTree;
use crate::hash::Hash;
use crate::store::KvStore;

use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct IndexCache {
    store: Arc<dyn KvStore>,
}

impl IndexCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Children of the archive with this hash, if it was analysed before.
    pub fn get(&self, hash: Hash) -> Option<Vec<IndexedTree>> {
        let raw = match self.store.get(&hash.to_le_bytes()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Index cache read failed for {}: {}", hash, e);
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(children) => Some(children),
            Err(e) => {
                warn!("Corrupt index cache entry for {}, dropping: {}", hash, e);
                let _ = self.store.delete(&hash.to_le_bytes());
                None
            }
        }
    }

    /// Remember an archive's children. Subtrees with errors are never stored.
    pub fn put(&self, hash: Hash, children: &[IndexedTree]) {
        if hash.is_empty() || !children.iter().all(IndexedTree::is_clean) {
            return;
        }
        let raw = match serde_json::to_vec(children) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize index cache entry for {}: {}", hash, e);
                return;
            }
        };
        if let Err(e) = self.store.put(&hash.to_le_bytes(), &raw) {
            warn!("Index cache write failed for {}: {}", hash, e);
        }
    }
}
