//! Materializing virtual files.
//!
//! Targets are grouped by their physical root; each root is one partition and
//! runs as one queue task. Inside a partition the needed part of the tree is
//! walked top-down: every archive on the way is extracted once (only the
//! needed entries when the extractor supports it) into a temp dir below the
//! call's session dir, and everything beneath it is served from there.
//!
//! Temp dirs are `tempfile::TempDir`s owned by the recursion frame that made
//! them, so inner ones go before outer ones and all of them go on every exit
//! path, errors and panics included.

use super::analyze::rechain;
use super::path::FullPath;
use super::{Context, VirtualFile};
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{self, Hash};
use crate::paths;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A readable copy of a virtual file, valid only inside the `on_ready` callback.
#[derive(Debug, Clone)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> Result<BufReader<File>> {
        let file = File::open(&self.path).at_path(&self.path)?;
        Ok(BufReader::with_capacity(hash::CHUNK_SIZE, file))
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).at_path(&self.path)
    }

    pub fn hash(&self) -> Result<Hash> {
        hash::hash_file(&self.path)
    }

    /// Copy to `dest`, creating parent dirs. Uses a reflink where the filesystem allows.
    pub fn copy_to(&self, dest: &Path) -> Result<()> {
        paths::ensure_parent_dirs(dest).at_path(dest)?;
        reflink_copy::reflink_or_copy(&self.path, dest).at_path(dest)?;
        Ok(())
    }
}

/// The part of one tree a call needs, keyed by entry name.
struct Needed {
    file: VirtualFile,
    is_target: bool,
    children: BTreeMap<String, Needed>,
}

impl Needed {
    fn new(file: VirtualFile) -> Self {
        Self {
            file,
            is_target: false,
            children: BTreeMap::new(),
        }
    }

    /// Add the chain below this node down to `target`.
    fn insert(&mut self, chain: &[VirtualFile]) {
        match chain.split_first() {
            None => self.is_target = true,
            Some((next, rest)) => self
                .children
                .entry(next.name().to_string())
                .or_insert_with(|| Needed::new(next.clone()))
                .insert(rest),
        }
    }

    fn target_count(&self) -> usize {
        usize::from(self.is_target) + self.children.values().map(Needed::target_count).sum::<usize>()
    }
}

type OnReady = dyn Fn(&VirtualFile, &StagedFile) -> Result<()> + Send + Sync;

impl Context {
    /// Stage every target and call `on_ready` once per target with a readable copy.
    ///
    /// Partitions (one per physical root) run independently: all of them run
    /// to completion, then the first error is returned. All temp space is gone
    /// by the time this returns.
    pub fn extract<F>(&self, targets: Vec<VirtualFile>, on_ready: F) -> Result<()>
    where
        F: Fn(&VirtualFile, &StagedFile) -> Result<()> + Send + Sync + 'static,
    {
        let mut partitions: BTreeMap<PathBuf, Needed> = BTreeMap::new();
        for target in &targets {
            let chain = target.files_in_full_path();
            let Some((root, rest)) = chain.split_first() else {
                continue;
            };
            partitions
                .entry(root.root_path().to_path_buf())
                .or_insert_with(|| Needed::new(root.clone()))
                .insert(rest);
        }
        if partitions.is_empty() {
            return Ok(());
        }

        let session = tempfile::Builder::new()
            .prefix(&format!(".tmp-{}", Uuid::new_v4().simple()))
            .rand_bytes(0)
            .tempdir_in(&self.config().temp_dir)
            .at_path(&self.config().temp_dir)?;
        let session_dir = session.path().to_path_buf();

        let total: usize = partitions.values().map(Needed::target_count).sum();
        info!(
            "Staging {} files from {} root files",
            total,
            partitions.len()
        );

        let on_ready: Arc<OnReady> = Arc::new(on_ready);
        let ctx = self.clone();
        let outcomes = self.queue().parallel_map_labeled(
            "Extracting",
            partitions.into_values().collect(),
            move |needed: Needed| {
                let root = needed.file.root_path().to_path_buf();
                Ok(ctx.stage(needed, &root, &session_dir, &on_ready))
            },
        )?;

        let mut first_error = None;
        for outcome in outcomes {
            if let Err(e) = outcome {
                warn!("Staging failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        drop(session);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Serve `needed` whose bytes are at `physical`, then descend into it.
    fn stage(&self, needed: Needed, physical: &Path, session: &Path, on_ready: &Arc<OnReady>) -> Result<()> {
        self.cancellation_token().check()?;
        let full = needed.file.full_path();

        if needed.is_target {
            let staged = StagedFile {
                path: physical.to_path_buf(),
            };
            (on_ready.as_ref())(&needed.file, &staged)?;
        }
        if needed.children.is_empty() {
            return Ok(());
        }

        let extractor = self
            .extractors()
            .for_file(physical)
            .ok_or_else(|| Error::UnsupportedArchive(PathBuf::from(full.to_string())))?;
        let temp = tempfile::Builder::new()
            .prefix(".tmp")
            .tempdir_in(session)
            .at_path(session)?;

        let names: Vec<String> = needed.children.keys().cloned().collect();
        let subset = extractor.supports_subset() && names.len() <= self.config().selective_extract_threshold;
        {
            let _ticket = self.extract_limit().acquire();
            debug!(
                "Extracting {} of {} ({})",
                names.len(),
                full,
                if subset { "subset" } else { "all" }
            );
            let extracted = if subset {
                extractor.extract_subset(physical, &names, temp.path())
            } else {
                extractor.extract_all(physical, temp.path())
            };
            if let Err(e) = extracted {
                return Err(self.diagnose_failed_extraction(&needed.file, &full, physical, e));
            }
        }

        let mut archives = Vec::new();
        for (name, child) in needed.children {
            let Some(child_path) = paths::join_entry(temp.path(), &name) else {
                return Err(Error::corrupt(&full, format!("unsafe entry name {}", name)));
            };
            if !child_path.is_file() {
                return Err(Error::corrupt(&full, format!("{} missing after extraction", name)));
            }
            if child.children.is_empty() {
                self.stage(child, &child_path, session, on_ready)?;
            } else {
                archives.push((child, child_path));
            }
        }

        match archives.len() {
            0 => {}
            1 => {
                if let Some((child, child_path)) = archives.pop() {
                    self.stage(child, &child_path, session, on_ready)?;
                }
            }
            _ => {
                let ctx = self.clone();
                let session = session.to_path_buf();
                let on_ready = Arc::clone(on_ready);
                self.queue().parallel_for_each(archives, move |(child, child_path)| {
                    ctx.stage(child, &child_path, &session, &on_ready)
                })?;
            }
        }

        // Inner dirs are gone by now; this one goes last
        drop(temp);
        Ok(())
    }

    /// Turn an extractor failure into an error naming the full chain, checking
    /// whether the archive on disk still matches the index.
    fn diagnose_failed_extraction(&self, file: &VirtualFile, full: &FullPath, physical: &Path, err: Error) -> Error {
        if matches!(err, Error::Cancelled) {
            return err;
        }
        let expected = file.hash();
        if !expected.is_empty() {
            match hash::hash_file(physical) {
                Ok(actual) if actual != expected => {
                    if file.is_native() {
                        let _ = self.hash_cache().purge(physical);
                    }
                    return Error::corrupt(
                        full,
                        format!(
                            "file on disk is corrupt or changed (indexed hash {}, found {}); delete it and retry",
                            expected, actual
                        ),
                    );
                }
                Ok(_) => {}
                Err(e) => return rechain(full, e),
            }
        }
        rechain(full, err)
    }
}

/// Remove temp dirs left behind by interrupted runs under `root`.
///
/// Returns the number of directories removed.
pub fn cleanup_stale_temp_dirs(root: &Path) -> usize {
    let mut cleaned = 0;
    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            // tempfile creates dirs like .tmpXXXXXX
            if name.to_string_lossy().starts_with(".tmp")
                && entry.path().is_dir()
                && fs::remove_dir_all(entry.path()).is_ok()
            {
                cleaned += 1;
            }
        }
    }
    if cleaned > 0 {
        info!("Cleaned up {} leftover temp directories", cleaned);
    }
    cleaned
}
