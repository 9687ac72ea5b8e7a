//! Hashing and recursive expansion of root files.
//!
//! Per archive, entries are hashed the cheapest way available:
//!
//! 1. a hash supplied by the extractor's listing,
//! 2. streaming entries through the hasher when the extractor can, in one
//!    pass over the archive,
//! 3. extracting into a private temp dir (a subset when supported and small
//!    enough, otherwise everything) and hashing the extracted files.
//!
//! Nested archives always take path 3 and are expanded on the work queue.
//! The extraction ticket is released before recursing so helpers draining the
//! queue can always get one.

use super::file::{IndexedTree, RootTree};
use super::path::FullPath;
use super::Context;
use crate::archive::{ArchiveExtractor, EntryInfo};
use crate::error::{Error, Result};
use crate::hash::{self, Hash};
use crate::hash_cache::file_stamp;
use crate::paths;

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

type Analysed = (Vec<IndexedTree>, Vec<Error>);

/// An entry waiting to be hashed from an extracted copy.
struct Extracted {
    entry: EntryInfo,
    path: PathBuf,
    nested: bool,
}

/// Re-anchor an extractor error on the virtual path of the failing archive.
///
/// Extractors only see temp paths for nested archives.
pub(crate) fn rechain(full: &FullPath, err: Error) -> Error {
    match err {
        Error::ArchiveCorrupt { reason, .. } => Error::corrupt(full, reason),
        Error::Io { source, .. } => Error::corrupt(full, source),
        other => other,
    }
}

impl Context {
    /// Hash one physical file and expand it if it is an archive.
    pub(crate) fn analyze_root(&self, path: PathBuf) -> Result<(Arc<RootTree>, Vec<Error>)> {
        self.cancellation_token().check()?;

        let (mtime, size) = file_stamp(&path)?;
        let hash = self.hash_cache().hash_cached(&path)?;
        let mut node = IndexedTree::leaf(path.to_string_lossy(), hash, size);
        let mut errors = Vec::new();

        if let Some(extractor) = self.extractors().for_file(&path) {
            let full = FullPath::new(path.clone());
            match self.analyze_archive(extractor, &path, &full, hash) {
                Ok((children, errs)) => {
                    node.children = children;
                    errors.extend(errs);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("{}", e);
                    node.error = Some(e.to_string());
                    errors.push(e);
                }
            }
        }

        let tree = RootTree::from_indexed(path, mtime, Utc::now(), node);
        Ok((Arc::new(tree), errors))
    }

    /// Children of the archive at `physical`, whose virtual path is `full`.
    ///
    /// `Err` means this archive itself could not be read. Failures further
    /// down are recorded on the failing node and returned alongside.
    pub(crate) fn analyze_archive(
        &self,
        extractor: Arc<dyn ArchiveExtractor>,
        physical: &Path,
        full: &FullPath,
        hash: Hash,
    ) -> Result<Analysed> {
        self.cancellation_token().check()?;

        if let Some(children) = self.index_cache().get(hash) {
            trace!("Index cache hit for {} ({})", full, hash);
            return Ok((children, Vec::new()));
        }

        let ticket = self.extract_limit().acquire();

        let mut seen = HashSet::new();
        let entries: Vec<EntryInfo> = extractor
            .list_entries(physical)
            .map_err(|e| rechain(full, e))?
            .into_iter()
            .filter(|e| {
                let fresh = seen.insert(e.name.clone());
                if !fresh {
                    warn!("Duplicate entry {} in {}, indexing it once", e.name, full);
                }
                fresh
            })
            .collect();
        debug!("{}: {} entries", full, entries.len());

        let mut children: Vec<Option<IndexedTree>> = vec![None; entries.len()];
        let mut pending = Vec::new();
        let mut streamable: HashMap<&str, usize> = HashMap::new();

        for (i, entry) in entries.iter().enumerate() {
            let nested = self.extractors().is_archive(&entry.name);
            if let (Some(known), false) = (entry.hash, nested) {
                children[i] = Some(IndexedTree::leaf(&entry.name, known, entry.size));
            } else if !nested && extractor.supports_streaming() {
                streamable.insert(&entry.name, i);
            } else {
                pending.push(i);
            }
        }

        if !streamable.is_empty() {
            let names: Vec<String> = streamable.keys().map(|n| n.to_string()).collect();
            extractor
                .stream_entries(physical, &names, &mut |name, reader| {
                    if let Some(&i) = streamable.get(name) {
                        let hash = hash::hash_reader(reader, None)?;
                        children[i] = Some(IndexedTree::leaf(name, hash, entries[i].size));
                    }
                    Ok(())
                })
                .map_err(|e| rechain(full, e))?;
            if let Some(&i) = streamable.values().find(|&&i| children[i].is_none()) {
                return Err(Error::corrupt(full, format!("entry {} was not streamed", entries[i].name)));
            }
        }

        // Keeps the extracted files alive until every nested analysis returned
        let mut _temp = None;
        let mut extracted = Vec::with_capacity(pending.len());
        if !pending.is_empty() {
            let temp = self.new_temp_dir()?;
            let names: Vec<String> = pending.iter().map(|&i| entries[i].name.clone()).collect();
            let subset = extractor.supports_subset()
                && names.len() < entries.len()
                && names.len() <= self.config().selective_extract_threshold;
            if subset {
                extractor.extract_subset(physical, &names, temp.path())
            } else {
                extractor.extract_all(physical, temp.path())
            }
            .map_err(|e| rechain(full, e))?;

            for &i in &pending {
                let entry = entries[i].clone();
                let Some(path) = paths::join_entry(temp.path(), &entry.name) else {
                    return Err(Error::corrupt(full, format!("unsafe entry name {}", entry.name)));
                };
                extracted.push((
                    i,
                    Extracted {
                        nested: self.extractors().is_archive(&entry.name),
                        entry,
                        path,
                    },
                ));
            }
            _temp = Some(temp);
        }
        drop(ticket);

        let mut errors = Vec::new();
        if !extracted.is_empty() {
            let (slots, items): (Vec<usize>, Vec<Extracted>) = extracted.into_iter().unzip();
            let ctx = self.clone();
            let parent = full.clone();
            let label = format!("Analyzing {}", full.file_name());
            let results = self.queue().parallel_map_labeled(&label, items, move |item| {
                ctx.analyze_extracted(&parent, item)
            })?;
            for (slot, (tree, errs)) in slots.into_iter().zip(results) {
                children[slot] = Some(tree);
                errors.extend(errs);
            }
        }

        let children: Vec<IndexedTree> = children.into_iter().flatten().collect();
        if errors.is_empty() {
            self.index_cache().put(hash, &children);
        }
        Ok((children, errors))
    }

    /// Hash one extracted entry and, for archives, expand it.
    fn analyze_extracted(&self, parent: &FullPath, item: Extracted) -> Result<(IndexedTree, Vec<Error>)> {
        let full = parent.join(item.entry.name.clone());
        let hash = hash::hash_file(&item.path).map_err(|e| rechain(parent, e))?;
        let mut node = IndexedTree::leaf(item.entry.name, hash, item.entry.size);
        let mut errors = Vec::new();

        if item.nested {
            let Some(extractor) = self.extractors().for_file(&item.path) else {
                return Ok((node, errors));
            };
            match self.analyze_archive(extractor, &item.path, &full, hash) {
                Ok((children, errs)) => {
                    node.children = children;
                    errors.extend(errs);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("{}", e);
                    node.error = Some(e.to_string());
                    errors.push(e);
                }
            }
        }
        Ok((node, errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::write_zip;
    use crate::archive::Extractors;
    use crate::vfs::tests::test_context;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_rechain_uses_virtual_path() {
        let full = FullPath::new("/m/a.zip").join("b.zip");
        let err = rechain(&full, Error::corrupt("/tmp/.tmpX/b.zip", "bad crc"));
        match err {
            Error::ArchiveCorrupt { chain, reason } => {
                assert_eq!(chain, "/m/a.zip|b.zip");
                assert_eq!(reason, "bad crc");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rechain(&full, Error::Cancelled), Error::Cancelled));
    }

    #[test]
    fn test_corrupt_nested_archive_keeps_siblings() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mods = dir.path().join("mods");
        fs::create_dir_all(&mods)?;
        write_zip(
            &mods.join("outer.zip"),
            &[("bad.zip", b"PK\x03\x04 garbage"), ("fine.txt", b"fine")],
        )?;

        let ctx = test_context(dir.path())?;
        let report = ctx.add_roots(&[mods.clone()])?;
        assert_eq!(report.errors.len(), 1);
        let msg = report.errors[0].to_string();
        assert!(msg.contains("outer.zip|bad.zip"), "{}", msg);

        let index = ctx.index();
        let outer = FullPath::new(mods.join("outer.zip"));
        let bad = index.by_full_path(&outer.join("bad.zip")).expect("kept");
        assert!(bad.error().is_some());
        assert!(index.by_full_path(&outer.join("fine.txt")).is_some());

        // A subtree with errors is not cached
        let outer_hash = index.by_full_path(&outer).expect("root").hash();
        assert!(ctx.index_cache().get(outer_hash).is_none());
        Ok(())
    }

    /// Zip extractor that pretends it cannot stream, counting extractions.
    struct NoStream {
        subsets: AtomicUsize,
        fulls: AtomicUsize,
    }

    impl ArchiveExtractor for NoStream {
        fn name(&self) -> &'static str {
            "zip"
        }
        fn extensions(&self) -> &'static [&'static str] {
            &["zip"]
        }
        fn list_entries(&self, archive: &Path) -> Result<Vec<EntryInfo>> {
            crate::archive::ZipExtractor.list_entries(archive)
        }
        fn extract_all(&self, archive: &Path, dest: &Path) -> Result<()> {
            self.fulls.fetch_add(1, Ordering::SeqCst);
            crate::archive::ZipExtractor.extract_all(archive, dest)
        }
        fn supports_subset(&self) -> bool {
            true
        }
        fn extract_subset(&self, archive: &Path, names: &[String], dest: &Path) -> Result<()> {
            self.subsets.fetch_add(1, Ordering::SeqCst);
            crate::archive::ZipExtractor.extract_subset(archive, names, dest)
        }
    }

    #[test]
    fn test_extraction_fallback_hashes_every_entry() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mods = dir.path().join("mods");
        fs::create_dir_all(&mods)?;
        write_zip(&mods.join("a.zip"), &[("one.txt", b"one"), ("two.txt", b"two")])?;

        let extractor = Arc::new(NoStream {
            subsets: AtomicUsize::new(0),
            fulls: AtomicUsize::new(0),
        });
        let mut extractors = Extractors::new();
        extractors.register(extractor.clone());
        let config = crate::config::VfsConfig {
            workers: 1,
            ..crate::config::VfsConfig::in_dir(dir.path())
        };
        let ctx = Context::with_parts(config, crate::vfs::Stores::in_memory(), extractors, None)?;

        ctx.add_roots(&[mods.clone()])?;
        let index = ctx.index();
        let one = index
            .by_full_path(&FullPath::new(mods.join("a.zip")).join("one.txt"))
            .expect("indexed");
        assert_eq!(one.hash(), hash::hash_bytes(b"one"));
        // Every entry needed extraction, so the whole archive was extracted once
        assert_eq!(extractor.fulls.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.subsets.load(Ordering::SeqCst), 0);

        // Temp dirs are gone afterwards
        let leftovers = fs::read_dir(&ctx.config().temp_dir)?.count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    /// Streaming zip extractor that counts how often entries are read.
    #[derive(Default)]
    struct CountingStream {
        passes: AtomicUsize,
        single_opens: AtomicUsize,
    }

    impl ArchiveExtractor for CountingStream {
        fn name(&self) -> &'static str {
            "zip"
        }
        fn extensions(&self) -> &'static [&'static str] {
            &["zip"]
        }
        fn list_entries(&self, archive: &Path) -> Result<Vec<EntryInfo>> {
            crate::archive::ZipExtractor.list_entries(archive)
        }
        fn extract_all(&self, archive: &Path, dest: &Path) -> Result<()> {
            crate::archive::ZipExtractor.extract_all(archive, dest)
        }
        fn supports_streaming(&self) -> bool {
            true
        }
        fn open_entry(
            &self,
            archive: &Path,
            name: &str,
            visit: &mut dyn FnMut(&mut dyn std::io::Read) -> std::io::Result<()>,
        ) -> Result<()> {
            self.single_opens.fetch_add(1, Ordering::SeqCst);
            crate::archive::ZipExtractor.open_entry(archive, name, visit)
        }
        fn stream_entries(
            &self,
            archive: &Path,
            names: &[String],
            visit: &mut dyn FnMut(&str, &mut dyn std::io::Read) -> std::io::Result<()>,
        ) -> Result<()> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            crate::archive::ZipExtractor.stream_entries(archive, names, visit)
        }
    }

    #[test]
    fn test_streamed_entries_share_one_pass() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mods = dir.path().join("mods");
        fs::create_dir_all(&mods)?;
        let names: Vec<String> = (0..200).map(|i| format!("textures/t{:03}.dds", i)).collect();
        let entries: Vec<(&str, &[u8])> = names.iter().map(|n| (n.as_str(), n.as_bytes())).collect();
        write_zip(&mods.join("big.zip"), &entries)?;

        let extractor = Arc::new(CountingStream::default());
        let mut extractors = Extractors::new();
        extractors.register(extractor.clone());
        let config = crate::config::VfsConfig::in_dir(dir.path());
        let ctx = Context::with_parts(config, crate::vfs::Stores::in_memory(), extractors, None)?;

        let report = ctx.add_roots(&[mods.clone()])?;
        assert!(report.errors.is_empty());
        assert_eq!(extractor.passes.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.single_opens.load(Ordering::SeqCst), 0);

        let last = ctx
            .index()
            .by_full_path(&FullPath::new(mods.join("big.zip")).join("textures/t199.dds"))
            .expect("indexed");
        assert_eq!(last.hash(), hash::hash_bytes(b"textures/t199.dds"));
        Ok(())
    }

    #[test]
    fn test_nested_archive_uses_subset_extraction() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mods = dir.path().join("mods");
        fs::create_dir_all(&mods)?;
        let build = dir.path().join("inner.zip");
        write_zip(&build, &[("x.txt", b"x")])?;
        let inner = fs::read(&build)?;
        write_zip(
            &mods.join("outer.zip"),
            &[("inner.zip", &inner), ("a.txt", b"a"), ("b.txt", b"b")],
        )?;

        let ctx = test_context(dir.path())?;
        let report = ctx.add_roots(&[mods.clone()])?;
        assert!(report.errors.is_empty());
        let x = ctx
            .index()
            .by_full_path(&FullPath::new(mods.join("outer.zip")).join("inner.zip").join("x.txt"))
            .expect("nested entry");
        assert_eq!(x.hash(), hash::hash_bytes(b"x"));
        Ok(())
    }
}
