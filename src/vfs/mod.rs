//! Content-addressed virtual file system over nested archives.
//!
//! A [`Context`] owns everything a run needs: the worker pool, the caches, the
//! extractor registry and the current [`IndexRoot`]. It is built once per run
//! (or per test) and cloned cheaply into queue tasks.
//!
//! # Indexing
//!
//! [`Context::add_roots`] walks directories, hashes every file and expands
//! archives recursively. Unchanged files (same mtime and size as last time)
//! keep their previous subtree. The new index is published in one swap.
//!
//! # Staging
//!
//! [`Context::extract`] materializes any set of virtual files, at any depth,
//! into private temp directories; see the `staging` module.

mod analyze;
mod cache;
mod file;
mod index;
mod path;
mod staging;

pub use cache::IndexCache;
pub use file::{IndexedTree, VirtualFile};
pub use index::IndexRoot;
pub use path::{FullPath, HashRelativePath, SEPARATOR};
pub use staging::{cleanup_stale_temp_dirs, StagedFile};

use crate::archive::Extractors;
use crate::config::VfsConfig;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::hash_cache::{file_stamp, FileHashCache};
use crate::patch::PatchCache;
use crate::progress::ProgressSink;
use crate::queue::{CancellationToken, Resource, WorkQueue};
use crate::store::{KvStore, MemoryStore, SqliteStore};

use file::RootTree;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Backing stores for the three persistent caches.
#[derive(Clone)]
pub struct Stores {
    pub hashes: Arc<dyn KvStore>,
    pub patches: Arc<dyn KvStore>,
    pub index: Arc<dyn KvStore>,
}

impl Stores {
    /// One SQLite file, one table per cache.
    pub fn sqlite(db_path: &Path) -> Result<Self> {
        Ok(Self {
            hashes: Arc::new(SqliteStore::open(db_path, "hash_cache")?),
            patches: Arc::new(SqliteStore::open(db_path, "patch_cache")?),
            index: Arc::new(SqliteStore::open(db_path, "index_cache")?),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            hashes: Arc::new(MemoryStore::new()),
            patches: Arc::new(MemoryStore::new()),
            index: Arc::new(MemoryStore::new()),
        }
    }
}

/// Outcome of [`Context::add_roots`].
#[derive(Debug, Default)]
pub struct IndexReport {
    /// Root files hashed and expanded in this call.
    pub analyzed: usize,
    /// Root files whose previous subtree was reused.
    pub reused: usize,
    /// Root files dropped because they no longer exist.
    pub removed: usize,
    /// Per-file and per-archive failures. None of them stopped the run.
    pub errors: Vec<Error>,
}

/// Outcome of [`Context::backfill_missing`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    /// Placeholder nodes created.
    pub created: usize,
    /// Records whose top-level archive is still unknown.
    pub pending: usize,
}

#[derive(Default)]
struct KnownFiles {
    pending: Vec<HashRelativePath>,
    archives: HashMap<Hash, PathBuf>,
}

struct Inner {
    config: VfsConfig,
    queue: WorkQueue,
    hash_cache: Arc<FileHashCache>,
    patch_cache: Arc<PatchCache>,
    index_cache: IndexCache,
    extractors: Extractors,
    extract_limit: Arc<Resource>,
    index: RwLock<Arc<IndexRoot>>,
    /// Serializes index writers; readers never take it.
    writer: Mutex<()>,
    known: Mutex<KnownFiles>,
}

/// Shared handle to one VFS instance.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Open the SQLite caches under `config.cache_dir` and register the default extractors.
    pub fn new(config: VfsConfig) -> Result<Self> {
        config.validate()?;
        let stores = Stores::sqlite(&config.db_path())?;
        Self::with_parts(config, stores, Extractors::with_defaults(), None)
    }

    /// Context whose caches live only in memory.
    pub fn in_memory(config: VfsConfig) -> Result<Self> {
        Self::with_parts(config, Stores::in_memory(), Extractors::with_defaults(), None)
    }

    pub fn with_parts(
        config: VfsConfig,
        stores: Stores,
        extractors: Extractors,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.temp_dir).at_path(&config.temp_dir)?;

        let queue = match sink {
            Some(sink) => WorkQueue::with_sink(config.workers, sink),
            None => WorkQueue::new(config.workers),
        };
        let hash_limit = Arc::new(Resource::new("hashing", config.hash_limit));
        let hash_cache = FileHashCache::new(stores.hashes).with_limiter(hash_limit);

        info!(
            "VFS context ready: {} workers, {} concurrent extractions, {} extractor types",
            queue.worker_count(),
            config.extract_limit,
            extractors.len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                extract_limit: Arc::new(Resource::new("extraction", config.extract_limit)),
                config,
                queue,
                hash_cache: Arc::new(hash_cache),
                patch_cache: Arc::new(PatchCache::new(stores.patches)),
                index_cache: IndexCache::new(stores.index),
                extractors,
                index: RwLock::new(Arc::new(IndexRoot::empty())),
                writer: Mutex::new(()),
                known: Mutex::new(KnownFiles::default()),
            }),
        })
    }

    pub fn config(&self) -> &VfsConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.inner.queue
    }

    pub fn hash_cache(&self) -> &FileHashCache {
        &self.inner.hash_cache
    }

    pub fn patch_cache(&self) -> &PatchCache {
        &self.inner.patch_cache
    }

    pub fn index_cache(&self) -> &IndexCache {
        &self.inner.index_cache
    }

    pub fn extractors(&self) -> &Extractors {
        &self.inner.extractors
    }

    /// Limiter bounding concurrent extractor invocations.
    pub fn extract_limit(&self) -> &Resource {
        &self.inner.extract_limit
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.queue.cancellation_token()
    }

    /// Snapshot of the current index.
    pub fn index(&self) -> Arc<IndexRoot> {
        let guard = self.inner.index.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    fn publish(&self, index: IndexRoot) {
        let index = Arc::new(index);
        debug!(
            "Publishing index: {} roots, {} files",
            index.root_count(),
            index.len()
        );
        *self.inner.index.write().unwrap_or_else(|p| p.into_inner()) = index;
    }

    /// Index files and directories, replacing what changed since the last call.
    ///
    /// Roots indexed earlier that are outside `paths` stay as long as they
    /// still exist. Files under `paths` that have disappeared are dropped.
    ///
    /// Analysis runs without the writer lock; only the merge into the index
    /// current at that point and the publish hold it.
    pub fn add_roots(&self, paths: &[PathBuf]) -> Result<IndexReport> {
        let previous = self.index();
        let mut report = IndexReport::default();

        let given: Vec<PathBuf> = paths.iter().map(|p| absolute(p)).collect();
        let mut files = Vec::new();
        for root in &given {
            if root.is_file() {
                files.push(root.clone());
            } else if root.is_dir() {
                for entry in walkdir::WalkDir::new(root).follow_links(true) {
                    match entry {
                        Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
                        Ok(_) => {}
                        Err(e) => {
                            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                            warn!("Skipping unreadable path {}: {}", path.display(), e);
                            report.errors.push(Error::io(path, std::io::Error::other(e.to_string())));
                        }
                    }
                }
            } else {
                warn!("Root does not exist: {}", root.display());
            }
        }
        files.sort();
        files.dedup();

        let mut fresh: BTreeMap<PathBuf, Arc<RootTree>> = BTreeMap::new();
        let mut to_analyze = Vec::new();
        for path in &files {
            match previous.trees().get(path) {
                Some(tree) if is_unchanged(tree, path) => {
                    fresh.insert(path.clone(), Arc::clone(tree));
                    report.reused += 1;
                }
                _ => to_analyze.push(path.clone()),
            }
        }

        info!(
            "Indexing {} files ({} unchanged)",
            to_analyze.len(),
            report.reused
        );

        let ctx = self.clone();
        let outcomes = self
            .queue()
            .parallel_map_labeled("Indexing", to_analyze.clone(), move |path| Ok(ctx.analyze_root(path)))?;

        for (path, outcome) in to_analyze.into_iter().zip(outcomes) {
            match outcome {
                Ok((tree, errors)) => {
                    fresh.insert(path, tree);
                    report.analyzed += 1;
                    report.errors.extend(errors);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("Failed to index {}: {}", path.display(), e);
                    report.errors.push(e);
                }
            }
        }

        let _writer = self.inner.writer.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.index();
        let mut next: BTreeMap<PathBuf, Arc<RootTree>> = BTreeMap::new();
        for (path, tree) in current.trees() {
            let covered = given.iter().any(|g| path.starts_with(g));
            if !covered && path.is_file() {
                next.insert(path.clone(), Arc::clone(tree));
            } else if !covered || files.binary_search(path).is_err() {
                debug!("Dropping vanished root {}", path.display());
                report.removed += 1;
            }
        }
        next.extend(fresh);

        self.publish(IndexRoot::from_roots(next));
        info!(
            "Index updated: {} analyzed, {} reused, {} removed, {} errors",
            report.analyzed,
            report.reused,
            report.removed,
            report.errors.len()
        );
        Ok(report)
    }

    /// Register locations known from a previous run without touching disk.
    ///
    /// `archives` maps top-level archive hashes to where they are expected on disk.
    pub fn add_known(&self, entries: Vec<HashRelativePath>, archives: HashMap<Hash, PathBuf>) {
        let mut known = self.inner.known.lock().unwrap_or_else(|p| p.into_inner());
        known.pending.extend(entries);
        for (hash, path) in archives {
            known.archives.entry(hash).or_insert(path);
        }
    }

    /// Build placeholder nodes for every known location whose top-level archive
    /// is now available, then publish.
    ///
    /// A top-level hash resolves to an indexed root with that hash, or else to
    /// the recorded archive path if that file exists.
    pub fn backfill_missing(&self) -> Result<BackfillReport> {
        let _writer = self.inner.writer.lock().unwrap_or_else(|p| p.into_inner());
        let index = self.index();
        let mut known = self.inner.known.lock().unwrap_or_else(|p| p.into_inner());

        let mut trees = index.trees().clone();
        let mut edited: BTreeMap<PathBuf, RootTree> = BTreeMap::new();
        let mut still_pending = Vec::new();
        let mut created = 0;

        let records = std::mem::take(&mut known.pending);
        for record in records {
            let root_path = index
                .by_hash(record.hash)
                .iter()
                .find(|f| f.is_native())
                .map(|f| f.root_path().to_path_buf())
                .or_else(|| {
                    known
                        .archives
                        .get(&record.hash)
                        .filter(|p| p.is_file())
                        .map(|p| absolute(p))
                });
            let Some(root_path) = root_path else {
                still_pending.push(record);
                continue;
            };

            let tree = match edited.entry(root_path.clone()) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    let base = match trees.get(&root_path) {
                        Some(existing) => (**existing).clone(),
                        None => match file_stamp(&root_path) {
                            Ok((mtime, size)) => {
                                created += 1;
                                RootTree::placeholder(root_path.clone(), record.hash, size, mtime)
                            }
                            Err(e) => {
                                warn!("Known archive {} unreadable: {}", root_path.display(), e);
                                still_pending.push(record);
                                continue;
                            }
                        },
                    };
                    e.insert(base)
                }
            };
            if tree.root_hash() != record.hash {
                debug!(
                    "{} no longer has hash {}, leaving record pending",
                    root_path.display(),
                    record.hash
                );
                still_pending.push(record);
                continue;
            }
            created += tree.add_chain(&record.parts);
        }

        for (path, tree) in edited {
            trees.insert(path, Arc::new(tree));
        }
        let pending = still_pending.len();
        known.pending = still_pending;
        drop(known);

        self.publish(IndexRoot::from_roots(trees));
        info!("Backfilled {} placeholder files, {} still pending", created, pending);
        Ok(BackfillReport { created, pending })
    }

    /// A fresh private directory under the configured temp root.
    pub(crate) fn new_temp_dir(&self) -> Result<tempfile::TempDir> {
        let root = &self.inner.config.temp_dir;
        tempfile::Builder::new()
            .prefix(".tmp")
            .tempdir_in(root)
            .at_path(root)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn is_unchanged(tree: &RootTree, path: &Path) -> bool {
    match file_stamp(path) {
        Ok((mtime, size)) => tree.last_modified == mtime && tree.root_size() == size && !tree.nodes[0].placeholder,
        Err(_) => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::archive::tests::write_zip;
    use crate::hash::hash_bytes;
    use std::fs;
    use tempfile::tempdir;

    pub(crate) fn test_context(dir: &Path) -> Result<Context> {
        let config = VfsConfig {
            workers: 2,
            extract_limit: 2,
            hash_limit: 2,
            ..VfsConfig::in_dir(dir)
        };
        let mut extractors = Extractors::new();
        extractors.register(Arc::new(crate::archive::ZipExtractor));
        Context::with_parts(config, Stores::in_memory(), extractors, None)
    }

    /// `mods/outer.zip` holding `middle.zip` holding `inner.zip` holding `deep.txt`,
    /// plus a loose `mods/loose.txt` with the same bytes as `deep.txt`.
    pub(crate) fn nested_fixture(dir: &Path) -> anyhow::Result<PathBuf> {
        let mods = dir.join("mods");
        let build = dir.join("build");
        fs::create_dir_all(&mods)?;
        fs::create_dir_all(&build)?;

        write_zip(&build.join("inner.zip"), &[("deep.txt", b"This is a test")])?;
        let inner = fs::read(build.join("inner.zip"))?;
        write_zip(
            &build.join("middle.zip"),
            &[("inner.zip", &inner), ("side.txt", b"side")],
        )?;
        let middle = fs::read(build.join("middle.zip"))?;
        write_zip(
            &mods.join("outer.zip"),
            &[("nested/middle.zip", &middle), ("top.txt", b"top")],
        )?;
        fs::write(mods.join("loose.txt"), b"This is a test")?;
        Ok(mods)
    }

    #[test]
    fn test_index_nested_archives() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mods = nested_fixture(dir.path())?;
        let ctx = test_context(dir.path())?;

        let report = ctx.add_roots(&[mods.clone()])?;
        assert_eq!(report.analyzed, 2);
        assert!(report.errors.is_empty(), "{:?}", report.errors);

        let index = ctx.index();
        let deep_path = FullPath::new(mods.join("outer.zip"))
            .join("nested/middle.zip")
            .join("inner.zip")
            .join("deep.txt");
        let deep = index.by_full_path(&deep_path).expect("deep file indexed");
        assert_eq!(deep.hash(), hash_bytes(b"This is a test"));
        assert_eq!(deep.hash().to_string(), "qX0GZvIaTKM=");
        assert_eq!(deep.nesting_factor(), 4);
        assert_eq!(deep.size(), 14);

        // Same content at two places: both under one hash
        let copies = index.by_hash(deep.hash());
        assert_eq!(copies.len(), 2);
        assert!(copies.iter().any(|f| f.is_native()));

        let outer = index.by_root_path(&mods.join("outer.zip")).expect("root");
        // outer, middle, inner, deep, side, top
        assert_eq!(outer.this_and_all_children().len(), 6);
        Ok(())
    }

    #[test]
    fn test_reindex_reuses_unchanged_and_drops_deleted() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mods = nested_fixture(dir.path())?;
        let ctx = test_context(dir.path())?;

        ctx.add_roots(&[mods.clone()])?;
        let first = ctx.index();
        let outer_before = first.by_root_path(&mods.join("outer.zip")).expect("root");

        fs::remove_file(mods.join("loose.txt"))?;
        let report = ctx.add_roots(&[mods.clone()])?;
        assert_eq!(report.analyzed, 0);
        assert_eq!(report.reused, 1);
        assert_eq!(report.removed, 1);

        let second = ctx.index();
        let outer_after = second.by_root_path(&mods.join("outer.zip")).expect("root");
        assert_eq!(outer_after.last_analyzed(), outer_before.last_analyzed());
        assert_eq!(outer_after, outer_before);
        assert!(second.by_root_path(&mods.join("loose.txt")).is_none());
        assert_eq!(second.by_hash(hash_bytes(b"This is a test")).len(), 1);

        // The old snapshot is untouched
        assert!(first.by_root_path(&mods.join("loose.txt")).is_some());
        Ok(())
    }

    #[test]
    fn test_changed_root_is_replaced() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mods = dir.path().join("mods");
        fs::create_dir_all(&mods)?;
        let file = mods.join("a.txt");
        fs::write(&file, b"one")?;
        let ctx = test_context(dir.path())?;
        ctx.add_roots(&[mods.clone()])?;

        fs::write(&file, b"one two")?;
        let report = ctx.add_roots(&[mods.clone()])?;
        assert_eq!(report.analyzed, 1);
        let root = ctx.index().by_root_path(&file).expect("root");
        assert_eq!(root.hash(), hash_bytes(b"one two"));
        Ok(())
    }

    #[test]
    fn test_roots_outside_call_are_retained() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir_all(&a)?;
        fs::create_dir_all(&b)?;
        fs::write(a.join("x.txt"), b"x")?;
        fs::write(b.join("y.txt"), b"y")?;

        let ctx = test_context(dir.path())?;
        ctx.add_roots(&[a.clone()])?;
        ctx.add_roots(&[b.clone()])?;
        let index = ctx.index();
        assert!(index.by_root_path(&a.join("x.txt")).is_some());
        assert!(index.by_root_path(&b.join("y.txt")).is_some());
        Ok(())
    }

    #[test]
    fn test_corrupt_archive_fails_only_its_subtree() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mods = dir.path().join("mods");
        fs::create_dir_all(&mods)?;
        fs::write(mods.join("broken.zip"), b"PK\x03\x04 this is not a zip")?;
        write_zip(&mods.join("good.zip"), &[("a.txt", b"a")])?;

        let ctx = test_context(dir.path())?;
        let report = ctx.add_roots(&[mods.clone()])?;
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.errors.len(), 1);
        match &report.errors[0] {
            Error::ArchiveCorrupt { chain, .. } => assert!(chain.ends_with("broken.zip")),
            other => panic!("unexpected error {:?}", other),
        }

        let index = ctx.index();
        let broken = index.by_root_path(&mods.join("broken.zip")).expect("kept");
        assert!(broken.error().is_some());
        assert!(broken.children().is_empty());
        assert!(index
            .by_full_path(&FullPath::new(mods.join("good.zip")).join("a.txt"))
            .is_some());
        Ok(())
    }

    #[test]
    fn test_known_archive_contents_come_from_index_cache() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mods = dir.path().join("mods");
        fs::create_dir_all(&mods)?;
        write_zip(&mods.join("a.zip"), &[("a.txt", b"a")])?;
        fs::copy(mods.join("a.zip"), mods.join("renamed.zip"))?;

        let ctx = test_context(dir.path())?;
        ctx.add_roots(&[mods.clone()])?;
        let hash = ctx.index().by_root_path(&mods.join("a.zip")).expect("root").hash();
        assert!(ctx.index_cache().get(hash).is_some());

        let renamed = ctx.index().by_root_path(&mods.join("renamed.zip")).expect("root");
        assert_eq!(renamed.children().len(), 1);
        Ok(())
    }

    #[test]
    fn test_backfill_from_known_archive_path() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let downloads = dir.path().join("downloads");
        fs::create_dir_all(&downloads)?;
        let archive = downloads.join("mod.zip");
        write_zip(&archive, &[("data/a.txt", b"a")])?;
        let hash = crate::hash::hash_file(&archive)?;

        let ctx = test_context(dir.path())?;
        let missing = Hash::new(12345);
        ctx.add_known(
            vec![
                HashRelativePath::new(hash, vec!["inner.zip".into(), "x.dds".into()]),
                HashRelativePath::new(hash, vec!["inner.zip".into(), "y.dds".into()]),
                HashRelativePath::new(missing, vec!["z.txt".into()]),
            ],
            HashMap::from([(hash, archive.clone())]),
        );

        let report = ctx.backfill_missing()?;
        // root + inner.zip + x.dds + y.dds
        assert_eq!(report, BackfillReport { created: 4, pending: 1 });

        let index = ctx.index();
        let x = index
            .by_full_path(&FullPath::new(archive.clone()).join("inner.zip").join("x.dds"))
            .expect("placeholder");
        assert!(x.is_placeholder());
        assert!(x.hash().is_empty());
        assert_eq!(x.top_parent().hash(), hash);
        assert_eq!(index.by_hash(hash).len(), 1);
        Ok(())
    }

    #[test]
    fn test_backfill_onto_indexed_root() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mods = dir.path().join("mods");
        fs::create_dir_all(&mods)?;
        write_zip(&mods.join("a.zip"), &[("a.txt", b"a")])?;

        let ctx = test_context(dir.path())?;
        ctx.add_roots(&[mods.clone()])?;
        let hash = ctx.index().by_root_path(&mods.join("a.zip")).expect("root").hash();

        ctx.add_known(
            vec![
                HashRelativePath::new(hash, vec!["a.txt".into()]),
                HashRelativePath::new(hash, vec!["b.txt".into()]),
            ],
            HashMap::new(),
        );
        let report = ctx.backfill_missing()?;
        assert_eq!(report, BackfillReport { created: 1, pending: 0 });

        let index = ctx.index();
        let a = index
            .by_full_path(&FullPath::new(mods.join("a.zip")).join("a.txt"))
            .expect("existing");
        assert!(!a.is_placeholder());
        assert!(index
            .by_full_path(&FullPath::new(mods.join("a.zip")).join("b.txt"))
            .expect("backfilled")
            .is_placeholder());
        Ok(())
    }

    #[test]
    fn test_add_roots_from_queue_tasks() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mods = nested_fixture(dir.path())?;
        let mut roots = Vec::new();
        for i in 0..6 {
            let root = dir.path().join(format!("set{}", i));
            fs::create_dir_all(&root)?;
            fs::copy(mods.join("outer.zip"), root.join("outer.zip"))?;
            roots.push(root);
        }

        let ctx = test_context(dir.path())?;
        let task_ctx = ctx.clone();
        let reports = ctx
            .queue()
            .parallel_map(roots.clone(), move |root| task_ctx.add_roots(&[root]))?;
        assert!(reports.iter().all(|r| r.analyzed == 1 && r.errors.is_empty()));

        // Concurrent writers merge instead of overwriting each other
        let index = ctx.index();
        for root in &roots {
            let deep = FullPath::new(root.join("outer.zip"))
                .join("nested/middle.zip")
                .join("inner.zip")
                .join("deep.txt");
            assert!(index.by_full_path(&deep).is_some(), "{}", deep);
        }
        Ok(())
    }

    #[test]
    fn test_cancelled_indexing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mods = nested_fixture(dir.path())?;
        let ctx = test_context(dir.path())?;
        ctx.cancellation_token().cancel();
        assert!(matches!(ctx.add_roots(&[mods]), Err(Error::Cancelled)));
        assert!(ctx.index().is_empty());
        Ok(())
    }
}
