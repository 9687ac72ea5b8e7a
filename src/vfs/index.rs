//! Immutable lookup tables over the forest.
//!
//! An [`IndexRoot`] is built in full and then published in one step; readers
//! hold an `Arc<IndexRoot>` and see either the old or the new index, never a
//! mix of both.

use super::file::{RootTree, VirtualFile};
use super::path::{FullPath, HashRelativePath};
use crate::hash::Hash;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Default)]
pub struct IndexRoot {
    roots: BTreeMap<PathBuf, Arc<RootTree>>,
    by_hash: HashMap<Hash, Vec<VirtualFile>>,
    by_full_path: HashMap<FullPath, VirtualFile>,
}

impl IndexRoot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_roots(roots: BTreeMap<PathBuf, Arc<RootTree>>) -> Self {
        let mut by_hash: HashMap<Hash, Vec<VirtualFile>> = HashMap::new();
        let mut by_full_path = HashMap::new();

        for tree in roots.values() {
            for file in VirtualFile::root_of(tree).this_and_all_children() {
                // Placeholders without a recorded hash are reachable by path only
                if !file.hash().is_empty() {
                    by_hash.entry(file.hash()).or_default().push(file.clone());
                }
                by_full_path.insert(file.full_path(), file);
            }
        }

        Self {
            roots,
            by_hash,
            by_full_path,
        }
    }

    pub(crate) fn trees(&self) -> &BTreeMap<PathBuf, Arc<RootTree>> {
        &self.roots
    }

    /// The physical file indexed at `path`.
    pub fn by_root_path(&self, path: &Path) -> Option<VirtualFile> {
        let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        self.roots.get(&abs).map(VirtualFile::root_of)
    }

    /// Every node with this content, physical or nested.
    pub fn by_hash(&self, hash: Hash) -> &[VirtualFile] {
        self.by_hash.get(&hash).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn by_full_path(&self, path: &FullPath) -> Option<VirtualFile> {
        self.by_full_path.get(path).cloned()
    }

    /// Resolve a hash-relative location against any indexed root with that hash.
    pub fn resolve(&self, location: &HashRelativePath) -> Option<VirtualFile> {
        self.by_hash(location.hash)
            .iter()
            .filter(|f| f.is_native())
            .find_map(|root| {
                let tree = self.roots.get(root.root_path())?;
                let id = tree.find(&location.parts)?;
                Some(VirtualFile::new(Arc::clone(tree), id))
            })
    }

    /// The file named `name` next to `file` (same archive, same directory).
    pub fn in_same_folder(&self, file: &VirtualFile, name: &str) -> Option<VirtualFile> {
        self.by_full_path(&file.full_path().in_same_folder(name))
    }

    /// Physical root files, ordered by path.
    pub fn roots(&self) -> impl Iterator<Item = VirtualFile> + '_ {
        self.roots.values().map(VirtualFile::root_of)
    }

    pub fn all_files(&self) -> impl Iterator<Item = &VirtualFile> + '_ {
        self.by_full_path.values()
    }

    /// Number of nodes, nested entries included.
    pub fn len(&self) -> usize {
        self.by_full_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_full_path.is_empty()
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::file::IndexedTree;
    use chrono::Utc;

    fn tree(path: &str, hash: u64, children: Vec<IndexedTree>) -> (PathBuf, Arc<RootTree>) {
        let root = IndexedTree {
            children,
            ..IndexedTree::leaf("", Hash::new(hash), 10)
        };
        let path = PathBuf::from(path);
        (
            path.clone(),
            Arc::new(RootTree::from_indexed(path, 0, Utc::now(), root)),
        )
    }

    #[test]
    fn test_duplicate_content_is_listed_under_one_hash() {
        let roots = BTreeMap::from([
            tree("/a/one.zip", 1, vec![IndexedTree::leaf("x.txt", Hash::new(9), 1)]),
            tree("/a/two.zip", 2, vec![IndexedTree::leaf("y/x.txt", Hash::new(9), 1)]),
            tree("/a/loose.txt", 9, vec![]),
        ]);
        let index = IndexRoot::from_roots(roots);

        let dupes = index.by_hash(Hash::new(9));
        assert_eq!(dupes.len(), 3);
        let mut paths: Vec<String> = dupes.iter().map(|f| f.full_path().to_string()).collect();
        paths.sort();
        assert_eq!(paths, vec!["/a/loose.txt", "/a/one.zip|x.txt", "/a/two.zip|y/x.txt"]);
        assert_eq!(index.len(), 5);
        assert_eq!(index.root_count(), 3);
    }

    #[test]
    fn test_lookups() {
        let roots = BTreeMap::from([tree(
            "/a/one.zip",
            1,
            vec![
                IndexedTree::leaf("data/p.esp", Hash::new(3), 1),
                IndexedTree::leaf("data/p.bsa", Hash::new(4), 1),
            ],
        )]);
        let index = IndexRoot::from_roots(roots);

        let root = index.by_root_path(Path::new("/a/one.zip")).unwrap();
        assert_eq!(root.hash(), Hash::new(1));
        assert!(index.by_root_path(Path::new("/a/missing.zip")).is_none());

        let esp = index
            .by_full_path(&FullPath::new("/a/one.zip").join("data/p.esp"))
            .unwrap();
        let bsa = index.in_same_folder(&esp, "p.bsa").unwrap();
        assert_eq!(bsa.hash(), Hash::new(4));

        let rel = HashRelativePath::new(Hash::new(1), vec!["data/p.bsa".into()]);
        assert_eq!(index.resolve(&rel), Some(bsa));
        assert!(index.by_hash(Hash::new(42)).is_empty());
    }
}
