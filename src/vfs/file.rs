//! The archive forest.
//!
//! Each physical root file owns one immutable arena ([`RootTree`]) holding its
//! node and every nested entry beneath it. Parent and child links are indices
//! into that arena, so there are no ownership cycles. A [`VirtualFile`] is a
//! cheap handle: the arena plus a node id.
//!
//! Trees are never mutated after publication. Re-indexing an unchanged root
//! reuses its `Arc<RootTree>` as-is; anything else builds a new tree.

use super::path::{FullPath, HashRelativePath};
use crate::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub(crate) type NodeId = usize;

const ROOT: NodeId = 0;

/// Path-free description of an analysed file and everything inside it.
///
/// This is what the index cache stores per archive hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedTree {
    pub name: String,
    pub hash: Hash,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<IndexedTree>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IndexedTree {
    pub fn leaf(name: impl Into<String>, hash: Hash, size: u64) -> Self {
        Self {
            name: name.into(),
            hash,
            size,
            children: Vec::new(),
            error: None,
        }
    }

    /// True when no node in this subtree failed enumeration.
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.children.iter().all(IndexedTree::is_clean)
    }

    /// Number of nodes, this one included.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(IndexedTree::count).sum::<usize>()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    /// Entry name inside the parent archive; the absolute path for the root.
    pub name: String,
    pub hash: Hash,
    pub size: u64,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub error: Option<String>,
    pub placeholder: bool,
}

/// One physical file and its nested contents.
#[derive(Debug, Clone)]
pub(crate) struct RootTree {
    pub path: PathBuf,
    /// Modification time of the physical file, nanoseconds since the epoch.
    pub last_modified: i64,
    pub last_analyzed: DateTime<Utc>,
    pub nodes: Vec<Node>,
}

impl RootTree {
    pub fn from_indexed(path: PathBuf, last_modified: i64, last_analyzed: DateTime<Utc>, tree: IndexedTree) -> Self {
        let mut out = Self {
            path: path.clone(),
            last_modified,
            last_analyzed,
            nodes: Vec::with_capacity(tree.count()),
        };
        let mut root = tree;
        root.name = path.to_string_lossy().into_owned();
        out.push_indexed(None, root);
        out
    }

    fn push_indexed(&mut self, parent: Option<NodeId>, tree: IndexedTree) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: tree.name,
            hash: tree.hash,
            size: tree.size,
            parent,
            children: Vec::with_capacity(tree.children.len()),
            error: tree.error,
            placeholder: false,
        });
        for child in tree.children {
            let child_id = self.push_indexed(Some(id), child);
            self.nodes[id].children.push(child_id);
        }
        id
    }

    /// Root known only from metadata.
    pub fn placeholder(path: PathBuf, hash: Hash, size: u64, last_modified: i64) -> Self {
        Self {
            nodes: vec![Node {
                name: path.to_string_lossy().into_owned(),
                hash,
                size,
                parent: None,
                children: Vec::new(),
                error: None,
                placeholder: true,
            }],
            path,
            last_modified,
            last_analyzed: Utc::now(),
        }
    }

    pub fn root_hash(&self) -> Hash {
        self.nodes[ROOT].hash
    }

    pub fn root_size(&self) -> u64 {
        self.nodes[ROOT].size
    }

    pub fn child_named(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c].name == name)
    }

    /// Walk entry names down from the root.
    pub fn find(&self, parts: &[String]) -> Option<NodeId> {
        parts
            .iter()
            .try_fold(ROOT, |node, name| self.child_named(node, name))
    }

    /// Create placeholder nodes for whatever part of `parts` is missing.
    /// Returns how many nodes were added.
    pub fn add_chain(&mut self, parts: &[String]) -> usize {
        let mut node = ROOT;
        let mut added = 0;
        for name in parts {
            node = match self.child_named(node, name) {
                Some(existing) => existing,
                None => {
                    let id = self.nodes.len();
                    self.nodes.push(Node {
                        name: name.clone(),
                        hash: Hash::default(),
                        size: 0,
                        parent: Some(node),
                        children: Vec::new(),
                        error: None,
                        placeholder: true,
                    });
                    self.nodes[node].children.push(id);
                    added += 1;
                    id
                }
            };
        }
        added
    }

    pub fn full_path(&self, id: NodeId) -> FullPath {
        let mut parts = Vec::new();
        let mut cur = id;
        while let Some(parent) = self.nodes[cur].parent {
            parts.push(self.nodes[cur].name.clone());
            cur = parent;
        }
        parts.reverse();
        FullPath::with_parts(self.path.clone(), parts)
    }

    /// Node ids in pre-order starting at `id`.
    pub fn preorder(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.nodes[n].children.iter().rev().copied());
        }
        out
    }
}

/// Handle to one node of the forest.
#[derive(Clone)]
pub struct VirtualFile {
    tree: Arc<RootTree>,
    id: NodeId,
}

impl VirtualFile {
    pub(crate) fn new(tree: Arc<RootTree>, id: NodeId) -> Self {
        Self { tree, id }
    }

    pub(crate) fn root_of(tree: &Arc<RootTree>) -> Self {
        Self::new(Arc::clone(tree), ROOT)
    }

    fn node(&self) -> &Node {
        &self.tree.nodes[self.id]
    }

    /// Entry name inside the parent archive, or the absolute path for a physical file.
    pub fn name(&self) -> &str {
        &self.node().name
    }

    pub fn hash(&self) -> Hash {
        self.node().hash
    }

    pub fn size(&self) -> u64 {
        self.node().size
    }

    /// Modification time of the physical root file (nanoseconds since the epoch).
    pub fn last_modified(&self) -> i64 {
        self.tree.last_modified
    }

    pub fn last_analyzed(&self) -> DateTime<Utc> {
        self.tree.last_analyzed
    }

    /// Why this archive could not be enumerated, if it failed.
    pub fn error(&self) -> Option<&str> {
        self.node().error.as_deref()
    }

    /// Created from metadata, not from analysing content.
    pub fn is_placeholder(&self) -> bool {
        self.node().placeholder
    }

    /// Path of the physical file this node lives in.
    pub fn root_path(&self) -> &Path {
        &self.tree.path
    }

    pub fn full_path(&self) -> FullPath {
        self.tree.full_path(self.id)
    }

    pub fn parent(&self) -> Option<VirtualFile> {
        self.node()
            .parent
            .map(|p| VirtualFile::new(Arc::clone(&self.tree), p))
    }

    pub fn children(&self) -> Vec<VirtualFile> {
        self.node()
            .children
            .iter()
            .map(|&c| VirtualFile::new(Arc::clone(&self.tree), c))
            .collect()
    }

    pub fn child(&self, name: &str) -> Option<VirtualFile> {
        self.tree
            .child_named(self.id, name)
            .map(|c| VirtualFile::new(Arc::clone(&self.tree), c))
    }

    /// The physical file at the top of this node's chain.
    pub fn top_parent(&self) -> VirtualFile {
        VirtualFile::root_of(&self.tree)
    }

    /// Every node from the physical root down to this one.
    pub fn files_in_full_path(&self) -> Vec<VirtualFile> {
        let mut chain = vec![self.clone()];
        let mut cur = self.clone();
        while let Some(parent) = cur.parent() {
            chain.push(parent.clone());
            cur = parent;
        }
        chain.reverse();
        chain
    }

    /// 1 for a physical file, plus one per archive level.
    pub fn nesting_factor(&self) -> usize {
        let mut depth = 1;
        let mut cur = self.node().parent;
        while let Some(p) = cur {
            depth += 1;
            cur = self.tree.nodes[p].parent;
        }
        depth
    }

    /// This node and all its descendants, pre-order.
    pub fn this_and_all_children(&self) -> Vec<VirtualFile> {
        self.tree
            .preorder(self.id)
            .into_iter()
            .map(|id| VirtualFile::new(Arc::clone(&self.tree), id))
            .collect()
    }

    pub fn is_archive(&self) -> bool {
        !self.node().children.is_empty()
    }

    /// A real file on disk rather than an archive entry.
    pub fn is_native(&self) -> bool {
        self.node().parent.is_none()
    }

    /// Location relative to the top-level archive, identified by its hash.
    pub fn make_relative_paths(&self) -> HashRelativePath {
        HashRelativePath::new(self.tree.root_hash(), self.full_path().parts().to_vec())
    }
}

impl PartialEq for VirtualFile {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) && self.id == other.id
    }
}

impl Eq for VirtualFile {}

impl fmt::Debug for VirtualFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualFile")
            .field("path", &self.full_path().to_string())
            .field("hash", &self.hash())
            .field("size", &self.size())
            .finish()
    }
}
