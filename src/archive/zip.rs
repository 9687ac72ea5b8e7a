//! ZIP extractor backed by the `zip` crate.
//!
//! Random access makes both subset extraction and streaming cheap, so no
//! external process is involved.

use super::{ArchiveExtractor, EntryInfo};
use crate::error::{Error, IoResultExt, Result};
use crate::paths;

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;
use tracing::trace;

type Archive = ::zip::ZipArchive<BufReader<File>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct ZipExtractor;

fn open(archive: &Path) -> Result<Archive> {
    let file = File::open(archive).at_path(archive)?;
    ::zip::ZipArchive::new(BufReader::new(file)).map_err(|e| Error::corrupt(archive.display(), e))
}

impl ZipExtractor {
    /// Copy entries accepted by `wanted` under `dest`.
    fn extract_where(&self, archive: &Path, dest: &Path, wanted: impl Fn(&str) -> bool) -> Result<usize> {
        let mut zip = open(archive)?;
        fs::create_dir_all(dest).at_path(dest)?;
        let mut written = 0;

        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| Error::corrupt(archive.display(), e))?;
            if entry.is_dir() {
                continue;
            }
            let name = paths::to_linux_path(entry.name());
            if !wanted(&name) {
                continue;
            }
            let Some(out_path) = paths::join_entry(dest, &name) else {
                return Err(Error::corrupt(
                    archive.display(),
                    format!("entry escapes the output directory: {}", name),
                ));
            };
            paths::ensure_parent_dirs(&out_path).at_path(&out_path)?;
            let mut out = File::create(&out_path).at_path(&out_path)?;
            io::copy(&mut entry, &mut out).map_err(|e| Error::corrupt(archive.display(), e))?;
            written += 1;
        }

        trace!("Extracted {} entries from {}", written, archive.display());
        Ok(written)
    }
}

impl ArchiveExtractor for ZipExtractor {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["zip"]
    }

    fn list_entries(&self, archive: &Path) -> Result<Vec<EntryInfo>> {
        let mut zip = open(archive)?;
        let mut entries = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let entry = zip
                .by_index(i)
                .map_err(|e| Error::corrupt(archive.display(), e))?;
            if entry.is_dir() {
                continue;
            }
            entries.push(EntryInfo {
                name: paths::to_linux_path(entry.name()),
                size: entry.size(),
                hash: None,
            });
        }
        Ok(entries)
    }

    fn extract_all(&self, archive: &Path, dest: &Path) -> Result<()> {
        self.extract_where(archive, dest, |_| true).map(|_| ())
    }

    fn supports_subset(&self) -> bool {
        true
    }

    fn extract_subset(&self, archive: &Path, names: &[String], dest: &Path) -> Result<()> {
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        let written = self.extract_where(archive, dest, |name| wanted.contains(name))?;
        if written < wanted.len() {
            return Err(Error::corrupt(
                archive.display(),
                format!("{} of {} requested entries missing", wanted.len() - written, wanted.len()),
            ));
        }
        Ok(())
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn open_entry(
        &self,
        archive: &Path,
        name: &str,
        visit: &mut dyn FnMut(&mut dyn Read) -> io::Result<()>,
    ) -> Result<()> {
        let mut zip = open(archive)?;
        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| Error::corrupt(archive.display(), e))?;
            if entry.is_dir() || paths::to_linux_path(entry.name()) != name {
                continue;
            }
            return visit(&mut entry).map_err(|e| Error::corrupt(format!("{}|{}", archive.display(), name), e));
        }
        Err(Error::corrupt(archive.display(), format!("no entry named {}", name)))
    }

    fn stream_entries(
        &self,
        archive: &Path,
        names: &[String],
        visit: &mut dyn FnMut(&str, &mut dyn Read) -> io::Result<()>,
    ) -> Result<()> {
        let mut remaining: HashSet<&str> = names.iter().map(String::as_str).collect();
        if remaining.is_empty() {
            return Ok(());
        }
        let mut zip = open(archive)?;
        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| Error::corrupt(archive.display(), e))?;
            if entry.is_dir() {
                continue;
            }
            let name = paths::to_linux_path(entry.name());
            if !remaining.remove(name.as_str()) {
                continue;
            }
            visit(&name, &mut entry).map_err(|e| Error::corrupt(format!("{}|{}", archive.display(), name), e))?;
            if remaining.is_empty() {
                return Ok(());
            }
        }
        Err(Error::corrupt(
            archive.display(),
            format!("{} requested entries missing", remaining.len()),
        ))
    }
}
