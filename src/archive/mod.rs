//! Archive extractor contract and registry.
//!
//! The VFS never parses archive formats itself. Everything it needs from an
//! archive goes through [`ArchiveExtractor`]: list the entries, extract all or
//! some of them into a directory, and optionally stream one entry.
//!
//! Entry names always use forward slashes. Directory entries are not listed.

pub mod sevenzip;
pub mod zip;

pub use self::sevenzip::SevenZipExtractor;
pub use self::zip::ZipExtractor;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::paths;

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// One file inside an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Path inside the archive, forward slashes.
    pub name: String,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Content hash when the format (or a sidecar) already provides one.
    pub hash: Option<Hash>,
}

/// Format-specific archive access.
pub trait ArchiveExtractor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Lower-case extensions (without the dot) this extractor handles.
    fn extensions(&self) -> &'static [&'static str];

    fn list_entries(&self, archive: &Path) -> Result<Vec<EntryInfo>>;

    /// Extract every entry under `dest`, keeping the archive's relative paths.
    fn extract_all(&self, archive: &Path, dest: &Path) -> Result<()>;

    /// Whether [`extract_subset`](Self::extract_subset) is cheaper than a full extraction.
    fn supports_subset(&self) -> bool {
        false
    }

    /// Extract only `names` under `dest`. Falls back to a full extraction.
    fn extract_subset(&self, archive: &Path, names: &[String], dest: &Path) -> Result<()> {
        let _ = names;
        self.extract_all(archive, dest)
    }

    /// Whether [`open_entry`](Self::open_entry) can read entries without extracting.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Hand a reader over one entry's bytes to `visit`.
    fn open_entry(
        &self,
        archive: &Path,
        name: &str,
        visit: &mut dyn FnMut(&mut dyn Read) -> std::io::Result<()>,
    ) -> Result<()> {
        let _ = (name, visit);
        Err(Error::UnsupportedArchive(archive.to_path_buf()))
    }

    /// Hand a reader over each of `names` to `visit`, in archive order.
    ///
    /// Formats with a central directory override this to open the archive once.
    /// When a name occurs twice only the first entry is visited.
    fn stream_entries(
        &self,
        archive: &Path,
        names: &[String],
        visit: &mut dyn FnMut(&str, &mut dyn Read) -> std::io::Result<()>,
    ) -> Result<()> {
        for name in names {
            self.open_entry(archive, name, &mut |reader| visit(name, reader))?;
        }
        Ok(())
    }
}

/// Archive type detected by magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    Zip,
    SevenZ,
    Rar,
    Unknown,
}

impl ArchiveType {
    /// Extension of the extractor that handles this type.
    fn extension(self) -> Option<&'static str> {
        match self {
            ArchiveType::Zip => Some("zip"),
            ArchiveType::SevenZ => Some("7z"),
            ArchiveType::Rar => Some("rar"),
            ArchiveType::Unknown => None,
        }
    }
}

/// Detect archive type by reading magic bytes.
///
/// Catches mislabeled archives (a `.zip` that is really a RAR).
pub fn detect_archive_type(path: &Path) -> Result<ArchiveType> {
    let mut file = File::open(path).at_path(path)?;
    let mut magic = [0u8; 8];
    let bytes_read = file.read(&mut magic).unwrap_or(0);

    if bytes_read < 4 {
        return Ok(ArchiveType::Unknown);
    }
    // PK\x03\x04, PK\x05\x06 (empty), PK\x07\x08 (spanned)
    if magic[0..2] == [0x50, 0x4B] {
        return Ok(ArchiveType::Zip);
    }
    // Rar!
    if magic[0..4] == [0x52, 0x61, 0x72, 0x21] {
        return Ok(ArchiveType::Rar);
    }
    if bytes_read >= 6 && magic[0..6] == [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C] {
        return Ok(ArchiveType::SevenZ);
    }
    Ok(ArchiveType::Unknown)
}

/// Extension -> extractor map.
#[derive(Clone, Default)]
pub struct Extractors {
    by_ext: HashMap<String, Arc<dyn ArchiveExtractor>>,
}

impl Extractors {
    /// Empty registry: every file is a leaf.
    pub fn new() -> Self {
        Self::default()
    }

    /// ZIP always, 7z/RAR when a 7z binary is available.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ZipExtractor));
        match SevenZipExtractor::locate() {
            Ok(sz) => registry.register(Arc::new(sz)),
            Err(e) => warn!("7z/rar archives will be indexed as plain files: {}", e),
        }
        registry
    }

    pub fn register(&mut self, extractor: Arc<dyn ArchiveExtractor>) {
        for ext in extractor.extensions() {
            debug!("Registering {} extractor for .{}", extractor.name(), ext);
            self.by_ext.insert(ext.to_string(), Arc::clone(&extractor));
        }
    }

    /// Extractor for a file or entry name, by extension.
    pub fn for_name(&self, name: &str) -> Option<Arc<dyn ArchiveExtractor>> {
        let ext = paths::extension(name)?.to_lowercase();
        self.by_ext.get(&ext).cloned()
    }

    /// Whether `name` will be treated as an archive.
    pub fn is_archive(&self, name: &str) -> bool {
        self.for_name(name).is_some()
    }

    /// Extractor for a file on disk, sniffing its header when the extension lies.
    pub fn for_file(&self, path: &Path) -> Option<Arc<dyn ArchiveExtractor>> {
        let by_name = self.for_name(&path.to_string_lossy())?;
        let sniffed = detect_archive_type(path)
            .ok()
            .and_then(ArchiveType::extension)
            .and_then(|ext| self.by_ext.get(ext).cloned());
        match sniffed {
            Some(actual) if actual.name() != by_name.name() => {
                debug!(
                    "{} is really a {} archive",
                    path.display(),
                    actual.name()
                );
                Some(actual)
            }
            _ => Some(by_name),
        }
    }

    pub fn len(&self) -> usize {
        self.by_ext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ext.is_empty()
    }
}
