//! Binary patch cache and patch application.
//!
//! Deltas are keyed by `(src hash, dest hash)` and computed on a miss with
//! the OctoDiff builder. Application dispatches on the 8-byte magic at the
//! start of the patch so BSDIFF40 patches from older sources also apply.

pub mod bsdiff;
pub mod octodiff;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{hash_bytes, hashing_copy, Hash};
use crate::paths;
use crate::store::KvStore;

use memmap2::Mmap;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Patch formats recognised by [`apply_patch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchFormat {
    OctoDiff,
    BsDiff,
}

impl PatchFormat {
    /// Identify a patch by its first 8 bytes.
    pub fn detect(patch: &[u8]) -> Result<Self> {
        let magic = patch.get(..8).unwrap_or(patch);
        if magic == &octodiff::MAGIC[..8] {
            Ok(PatchFormat::OctoDiff)
        } else if magic == bsdiff::MAGIC {
            Ok(PatchFormat::BsDiff)
        } else {
            Err(Error::PatchFormatUnrecognized(magic.to_vec()))
        }
    }
}

/// Persistent `(src, dest) -> delta` cache.
pub struct PatchCache {
    store: Arc<dyn KvStore>,
    computed: AtomicU64,
}

impl PatchCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            computed: AtomicU64::new(0),
        }
    }

    fn key(src: Hash, dest: Hash) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&src.to_le_bytes());
        key[8..].copy_from_slice(&dest.to_le_bytes());
        key
    }

    /// Look up a stored delta. Store failures are logged and read as a miss.
    pub fn get_patch(&self, src: Hash, dest: Hash) -> Option<Vec<u8>> {
        match self.store.get(&Self::key(src, dest)) {
            Ok(found) => found,
            Err(e) => {
                warn!(%src, %dest, "Patch cache read failed: {}", e);
                None
            }
        }
    }

    /// Return the stored delta or build, persist and return a new one.
    pub fn get_or_create_patch(
        &self,
        src_hash: Hash,
        dest_hash: Hash,
        src: &[u8],
        dest: &[u8],
    ) -> Result<Vec<u8>> {
        if let Some(patch) = self.get_patch(src_hash, dest_hash) {
            debug!(src = %src_hash, dest = %dest_hash, "Patch cache hit");
            return Ok(patch);
        }

        let patch = octodiff::build_delta(src, dest)?;
        self.computed.fetch_add(1, Ordering::Relaxed);
        debug!(
            src = %src_hash,
            dest = %dest_hash,
            size = patch.len(),
            "Computed delta"
        );

        if let Err(e) = self.store.put_if_absent(&Self::key(src_hash, dest_hash), &patch) {
            warn!(src = %src_hash, dest = %dest_hash, "Patch cache write failed: {}", e);
        }
        Ok(patch)
    }

    /// [`get_or_create_patch`](Self::get_or_create_patch) over two files on disk.
    pub fn get_or_create_patch_files(
        &self,
        src_hash: Hash,
        dest_hash: Hash,
        src: &Path,
        dest: &Path,
    ) -> Result<Vec<u8>> {
        if let Some(patch) = self.get_patch(src_hash, dest_hash) {
            return Ok(patch);
        }
        with_mapped(src, |src_bytes| {
            with_mapped(dest, |dest_bytes| {
                self.get_or_create_patch(src_hash, dest_hash, src_bytes, dest_bytes)
            })
        })
    }

    pub fn apply_patch<R: Read + Seek, W: Write>(
        &self,
        input: R,
        patch: &[u8],
        output: W,
    ) -> Result<Hash> {
        apply_patch(input, patch, output)
    }

    pub fn apply_patch_verified<R: Read + Seek, W: Write>(
        &self,
        input: R,
        patch: &[u8],
        expected: Hash,
        output: W,
    ) -> Result<Hash> {
        apply_patch_verified(input, patch, expected, output)
    }

    /// Number of deltas built since this cache was created.
    pub fn computed_count(&self) -> u64 {
        self.computed.load(Ordering::Relaxed)
    }
}

/// Memory-map `path` for the duration of `f`. Empty files are passed as an
/// empty slice since they cannot be mapped.
fn with_mapped<T>(path: &Path, f: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
    let file = File::open(path).at_path(path)?;
    let len = file.metadata().at_path(path)?.len();
    if len == 0 {
        return f(&[]);
    }
    // SAFETY: the mapping is read-only and dropped before returning.
    let map = unsafe { Mmap::map(&file) }.at_path(path)?;
    f(&map[..])
}

/// Apply `patch` to `input`, writing the result to `output`.
///
/// Returns the xxHash64 of the bytes written.
pub fn apply_patch<R: Read + Seek, W: Write>(
    mut input: R,
    patch: &[u8],
    mut output: W,
) -> Result<Hash> {
    match PatchFormat::detect(patch)? {
        PatchFormat::OctoDiff => {
            let mut reader = octodiff::DeltaReader::new(input, Cursor::new(patch))?;
            let hash = hashing_copy(&mut reader, output, None)
                .map_err(|e| Error::PatchCorrupt(format!("applying OctoDiff delta: {}", e)))?;
            reader.verify()?;
            Ok(hash)
        }
        PatchFormat::BsDiff => {
            let mut old = Vec::new();
            input
                .seek(SeekFrom::Start(0))
                .and_then(|_| input.read_to_end(&mut old))
                .map_err(|e| Error::PatchCorrupt(format!("reading bsdiff basis: {}", e)))?;
            let new = bsdiff::apply(&old, patch)?;
            output
                .write_all(&new)
                .and_then(|_| output.flush())
                .map_err(|e| Error::PatchCorrupt(format!("writing bsdiff output: {}", e)))?;
            Ok(hash_bytes(&new))
        }
    }
}

/// [`apply_patch`], then check the output hash against `expected`.
pub fn apply_patch_verified<R: Read + Seek, W: Write>(
    input: R,
    patch: &[u8],
    expected: Hash,
    output: W,
) -> Result<Hash> {
    let actual = apply_patch(input, patch, output)?;
    if actual != expected {
        return Err(Error::HashMismatch {
            what: "patched output".to_string(),
            expected,
            actual,
        });
    }
    Ok(actual)
}

/// Patch the file at `src` into `out`. The source is memory-mapped and the
/// output streamed through a buffered writer. A partial output is removed on
/// failure.
pub fn apply_patch_file(src: &Path, patch: &[u8], out: &Path, expected: Option<Hash>) -> Result<Hash> {
    paths::ensure_parent_dirs(out).at_path(out)?;
    let result = with_mapped(src, |basis| {
        let file = File::create(out).at_path(out)?;
        let writer = BufWriter::new(file);
        match expected {
            Some(expected) => apply_patch_verified(Cursor::new(basis), patch, expected, writer),
            None => apply_patch(Cursor::new(basis), patch, writer),
        }
    });
    if result.is_err() {
        let _ = std::fs::remove_file(out);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqliteStore};
    use tempfile::tempdir;

    fn sample(len: usize, salt: u8) -> Vec<u8> {
        (0..len).map(|i| ((i * 31 + i / 7) as u8) ^ salt).collect()
    }

    fn cache() -> PatchCache {
        PatchCache::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_round_trip_through_cache() -> Result<()> {
        let cache = cache();
        let src = sample(20_000, 0);
        let mut dest = src.clone();
        dest[5_000..5_100].copy_from_slice(&[0xAB; 100]);
        dest.extend_from_slice(b"trailing bytes");

        let patch = cache.get_or_create_patch(hash_bytes(&src), hash_bytes(&dest), &src, &dest)?;
        let mut out: Vec<u8> = Vec::new();
        let hash = cache.apply_patch(Cursor::new(&src), &patch, &mut out)?;

        assert_eq!(out, dest);
        assert_eq!(hash, hash_bytes(&dest));
        Ok(())
    }

    #[test]
    fn test_second_request_is_a_hit() -> Result<()> {
        let cache = cache();
        let (src, dest) = (sample(5_000, 1), sample(5_000, 2));
        let (a, b) = (hash_bytes(&src), hash_bytes(&dest));

        assert!(cache.get_patch(a, b).is_none());
        let first = cache.get_or_create_patch(a, b, &src, &dest)?;
        let second = cache.get_or_create_patch(a, b, &src, &dest)?;

        assert_eq!(first, second);
        assert_eq!(cache.computed_count(), 1);
        assert_eq!(cache.get_patch(a, b), Some(first));
        // Direction matters
        assert!(cache.get_patch(b, a).is_none());
        Ok(())
    }

    #[test]
    fn test_unknown_header_is_rejected() {
        let result = apply_patch(Cursor::new(b"abc"), b"NOTAPATCH", Vec::<u8>::new());
        match result {
            Err(Error::PatchFormatUnrecognized(magic)) => assert_eq!(magic, b"NOTAPATC"),
            other => panic!("unexpected result: {:?}", other.map(|h| h.to_hex())),
        }
        assert!(matches!(
            PatchFormat::detect(b"BSD"),
            Err(Error::PatchFormatUnrecognized(_))
        ));
    }

    #[test]
    fn test_bsdiff_patches_dispatch() -> Result<()> {
        let patch = bsdiff::tests::make_patch(11, vec![(vec![0, 0, 0, 0, 1], b" there".to_vec(), 0)]);
        assert_eq!(PatchFormat::detect(&patch)?, PatchFormat::BsDiff);

        let mut out: Vec<u8> = Vec::new();
        let hash = apply_patch(Cursor::new(b"hello world"), &patch, &mut out)?;
        assert_eq!(out, b"hellp there");
        assert_eq!(hash, hash_bytes(b"hellp there"));
        Ok(())
    }

    #[test]
    fn test_verified_apply_detects_wrong_output() -> Result<()> {
        let cache = cache();
        let (src, dest) = (sample(3_000, 3), sample(3_100, 4));
        let patch = cache.get_or_create_patch(hash_bytes(&src), hash_bytes(&dest), &src, &dest)?;

        let ok = apply_patch_verified(Cursor::new(&src), &patch, hash_bytes(&dest), Vec::<u8>::new())?;
        assert_eq!(ok, hash_bytes(&dest));

        let err = apply_patch_verified(Cursor::new(&src), &patch, Hash::new(42), Vec::<u8>::new())
            .expect_err("wrong expected hash must fail");
        assert!(err.is_fatal());
        assert!(matches!(err, Error::HashMismatch { expected, .. } if expected == Hash::new(42)));
        Ok(())
    }

    #[test]
    fn test_wrong_basis_fails_sha1_check() -> Result<()> {
        let cache = cache();
        let src = sample(8_192, 5);
        let mut dest = src.clone();
        dest.truncate(6_000);
        let patch = cache.get_or_create_patch(hash_bytes(&src), hash_bytes(&dest), &src, &dest)?;

        let other_basis = sample(8_192, 6);
        let err = apply_patch(Cursor::new(&other_basis), &patch, Vec::<u8>::new())
            .expect_err("delta against the wrong basis must fail");
        assert!(matches!(err, Error::HashMismatch { .. }));
        Ok(())
    }

    #[test]
    fn test_patches_persist_in_sqlite() -> Result<()> {
        let dir = tempdir().unwrap();
        let db = dir.path().join("patches.sqlite");
        let (src, dest) = (sample(4_000, 7), sample(4_000, 8));
        let (a, b) = (hash_bytes(&src), hash_bytes(&dest));

        let first = {
            let cache = PatchCache::new(Arc::new(SqliteStore::open(&db, "patch_cache")?));
            cache.get_or_create_patch(a, b, &src, &dest)?
        };

        let reopened = PatchCache::new(Arc::new(SqliteStore::open(&db, "patch_cache")?));
        assert_eq!(reopened.get_patch(a, b), Some(first));
        assert_eq!(reopened.computed_count(), 0);
        Ok(())
    }

    #[test]
    fn test_file_helpers() -> Result<()> {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("src.bin");
        let dest_path = dir.path().join("dest.bin");
        let empty_path = dir.path().join("empty.bin");
        let src = sample(10_000, 9);
        let mut dest = src.clone();
        dest.reverse();
        std::fs::write(&src_path, &src).unwrap();
        std::fs::write(&dest_path, &dest).unwrap();
        std::fs::write(&empty_path, b"").unwrap();

        let cache = cache();
        let patch = cache.get_or_create_patch_files(
            hash_bytes(&src),
            hash_bytes(&dest),
            &src_path,
            &dest_path,
        )?;
        let out = dir.path().join("out/patched.bin");
        apply_patch_file(&src_path, &patch, &out, Some(hash_bytes(&dest)))?;
        assert_eq!(std::fs::read(&out).unwrap(), dest);

        // Empty basis: the delta is all literal data
        let from_empty = cache.get_or_create_patch_files(
            hash_bytes(b""),
            hash_bytes(&src),
            &empty_path,
            &src_path,
        )?;
        let rebuilt = dir.path().join("rebuilt.bin");
        apply_patch_file(&empty_path, &from_empty, &rebuilt, None)?;
        assert_eq!(std::fs::read(&rebuilt).unwrap(), src);

        // Failed verification leaves no partial output behind
        let bad = dir.path().join("bad.bin");
        assert!(apply_patch_file(&src_path, &patch, &bad, Some(Hash::new(1))).is_err());
        assert!(!bad.exists());
        Ok(())
    }
}
