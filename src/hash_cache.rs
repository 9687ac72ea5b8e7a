//! Persistent path -> hash cache.
//!
//! An entry is only trusted while the file's modification time and size both
//! match the stored values. Anything else is purged and recomputed.
//!
//! Store failures on the lookup path are logged and treated as misses.

use crate::error::{IoResultExt, Result};
use crate::hash::{self, Hash};
use crate::queue::Resource;
use crate::store::KvStore;

use binrw::{BinRead, BinWrite};
use std::fs::{self, File};
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Stored record, fixed little-endian layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"HC1")]
pub struct HashCacheEntry {
    /// Modification time in nanoseconds since the Unix epoch.
    pub last_modified: i64,
    pub size: u64,
    pub hash: u64,
}

impl HashCacheEntry {
    fn encode(&self) -> Vec<u8> {
        let mut out = Cursor::new(Vec::with_capacity(27));
        // Writing to a Vec cannot fail
        let _ = self.write(&mut out);
        out.into_inner()
    }

    fn decode(bytes: &[u8]) -> binrw::BinResult<Self> {
        Self::read(&mut Cursor::new(bytes))
    }
}

/// `(mtime, size)` of a file as used for staleness checks.
pub fn file_stamp(path: &Path) -> Result<(i64, u64)> {
    let meta = fs::metadata(path).at_path(path)?;
    let modified = meta.modified().at_path(path)?;
    let nanos = match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    };
    Ok((nanos, meta.len()))
}

/// Cache of file hashes keyed by absolute path.
pub struct FileHashCache {
    store: Arc<dyn KvStore>,
    limiter: Option<Arc<Resource>>,
    files_hashed: AtomicU64,
    bytes_hashed: AtomicU64,
}

impl FileHashCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            limiter: None,
            files_hashed: AtomicU64::new(0),
            bytes_hashed: AtomicU64::new(0),
        }
    }

    /// Bound the number of files hashed at the same time.
    pub fn with_limiter(mut self, limiter: Arc<Resource>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    fn key(path: &Path) -> Vec<u8> {
        let abs = absolute(path);
        abs.to_string_lossy().into_owned().into_bytes()
    }

    /// Return the cached hash when still valid, without reading the file.
    pub fn try_get(&self, path: &Path) -> Result<Option<Hash>> {
        let (mtime, size) = file_stamp(path)?;
        let key = Self::key(path);

        let raw = match self.store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Hash cache read failed for {}, recomputing: {}", path.display(), e);
                return Ok(None);
            }
        };

        match HashCacheEntry::decode(&raw) {
            Ok(entry) if entry.last_modified == mtime && entry.size == size && entry.hash != 0 => {
                Ok(Some(Hash::new(entry.hash)))
            }
            Ok(_) => {
                debug!("Stale hash cache entry for {}", path.display());
                self.forget(path);
                Ok(None)
            }
            Err(e) => {
                warn!("Corrupt hash cache entry for {}: {}", path.display(), e);
                self.forget(path);
                Ok(None)
            }
        }
    }

    /// Hash a file, consulting and updating the cache.
    pub fn hash_cached(&self, path: &Path) -> Result<Hash> {
        if let Some(hash) = self.try_get(path)? {
            return Ok(hash);
        }

        let _ticket = self.limiter.as_ref().map(|l| l.acquire());
        let (mtime, size) = file_stamp(path)?;

        let file = File::open(path).at_path(path)?;
        let reader = BufReader::with_capacity(hash::CHUNK_SIZE, file);
        let hash = hash::hash_reader(reader, None).at_path(path)?;

        self.files_hashed.fetch_add(1, Ordering::Relaxed);
        self.bytes_hashed.fetch_add(size, Ordering::Relaxed);

        if let Err(e) = self.write(path, mtime, size, hash) {
            warn!("Failed to cache hash of {}: {}", path.display(), e);
        }
        Ok(hash)
    }

    /// Record a hash that was computed elsewhere (e.g. while copying the file).
    pub fn write_cached(&self, path: &Path, hash: Hash) -> Result<()> {
        let (mtime, size) = file_stamp(path)?;
        self.write(path, mtime, size, hash)
    }

    fn write(&self, path: &Path, mtime: i64, size: u64, hash: Hash) -> Result<()> {
        if hash.is_empty() {
            return Ok(());
        }
        let entry = HashCacheEntry {
            last_modified: mtime,
            size,
            hash: hash.as_u64(),
        };
        self.store.put(&Self::key(path), &entry.encode())
    }

    /// Drop any cached value for `path`.
    pub fn purge(&self, path: &Path) -> Result<()> {
        self.store.delete(&Self::key(path))?;
        Ok(())
    }

    fn forget(&self, path: &Path) {
        if let Err(e) = self.purge(path) {
            warn!("Failed to drop cached hash of {}: {}", path.display(), e);
        }
    }

    /// Number of files actually read by [`hash_cached`](Self::hash_cached).
    pub fn files_hashed(&self) -> u64 {
        self.files_hashed.load(Ordering::Relaxed)
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed.load(Ordering::Relaxed)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqliteStore};
    use std::io::Write;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut f = File::create(path)?;
        f.write_all(data)?;
        f.sync_all()
    }

    fn set_mtime(path: &Path, time: SystemTime) -> std::io::Result<()> {
        File::options().write(true).open(path)?.set_modified(time)
    }

    #[test]
    fn test_second_call_is_cached() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        write_file(&path, b"hello")?;

        let cache = FileHashCache::new(Arc::new(MemoryStore::new()));
        let first = cache.hash_cached(&path)?;
        let second = cache.hash_cached(&path)?;

        assert_eq!(first, hash::hash_bytes(b"hello"));
        assert_eq!(first, second);
        assert_eq!(cache.files_hashed(), 1);
        Ok(())
    }

    #[test]
    fn test_modified_file_is_rehashed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        write_file(&path, b"hello")?;
        set_mtime(&path, SystemTime::now() - Duration::from_secs(60))?;

        let cache = FileHashCache::new(Arc::new(MemoryStore::new()));
        let stale = cache.hash_cached(&path)?;

        write_file(&path, b"hello, changed")?;
        set_mtime(&path, SystemTime::now())?;

        let fresh = cache.hash_cached(&path)?;
        assert_ne!(stale, fresh);
        assert_eq!(fresh, hash::hash_bytes(b"hello, changed"));
        assert_eq!(cache.files_hashed(), 2);
        Ok(())
    }

    #[test]
    fn test_same_mtime_different_size_is_stale() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        let when = SystemTime::now() - Duration::from_secs(3600);
        write_file(&path, b"one")?;
        set_mtime(&path, when)?;

        let cache = FileHashCache::new(Arc::new(MemoryStore::new()));
        cache.hash_cached(&path)?;

        write_file(&path, b"one two")?;
        set_mtime(&path, when)?;
        assert_eq!(cache.try_get(&path)?, None);
        assert_eq!(cache.hash_cached(&path)?, hash::hash_bytes(b"one two"));
        Ok(())
    }

    #[test]
    fn test_purge() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        write_file(&path, b"hello")?;

        let cache = FileHashCache::new(Arc::new(SqliteStore::in_memory("hash_cache")?));
        cache.hash_cached(&path)?;
        assert!(cache.try_get(&path)?.is_some());

        cache.purge(&path)?;
        assert!(cache.try_get(&path)?.is_none());
        cache.hash_cached(&path)?;
        assert_eq!(cache.files_hashed(), 2);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_io_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = Arc::new(MemoryStore::new());
        let cache = FileHashCache::new(store.clone());
        let err = cache.hash_cached(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, crate::Error::Io { .. }));
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        write_file(&path, b"hello")?;

        let store = Arc::new(MemoryStore::new());
        store.put(&FileHashCache::key(&path), b"garbage")?;
        let cache = FileHashCache::new(store);
        assert_eq!(cache.hash_cached(&path)?, hash::hash_bytes(b"hello"));
        Ok(())
    }

    /// Store where every operation fails, like a read-only or locked database.
    struct BrokenStore;

    impl KvStore for BrokenStore {
        fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
            Err(crate::Error::Store(rusqlite::Error::InvalidQuery))
        }
        fn put(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
            Err(crate::Error::Store(rusqlite::Error::InvalidQuery))
        }
        fn delete(&self, _key: &[u8]) -> Result<bool> {
            Err(crate::Error::Store(rusqlite::Error::InvalidQuery))
        }
    }

    /// Reads a fixed stale record; writes and deletes fail.
    struct StaleReadOnlyStore(Vec<u8>);

    impl KvStore for StaleReadOnlyStore {
        fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(Some(self.0.clone()))
        }
        fn put(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
            Err(crate::Error::Store(rusqlite::Error::InvalidQuery))
        }
        fn delete(&self, _key: &[u8]) -> Result<bool> {
            Err(crate::Error::Store(rusqlite::Error::InvalidQuery))
        }
    }

    #[test]
    fn test_failing_store_still_hashes() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        write_file(&path, b"hello")?;

        let cache = FileHashCache::new(Arc::new(BrokenStore));
        assert_eq!(cache.try_get(&path)?, None);
        assert_eq!(cache.hash_cached(&path)?, hash::hash_bytes(b"hello"));
        assert_eq!(cache.hash_cached(&path)?, hash::hash_bytes(b"hello"));
        assert_eq!(cache.files_hashed(), 2);
        // Explicit writes still report the failure
        assert!(cache.write_cached(&path, hash::hash_bytes(b"hello")).is_err());
        Ok(())
    }

    #[test]
    fn test_stale_entry_in_read_only_store_is_a_miss() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        write_file(&path, b"hello")?;

        let stale = HashCacheEntry {
            last_modified: 1,
            size: 5,
            hash: 7,
        };
        let cache = FileHashCache::new(Arc::new(StaleReadOnlyStore(stale.encode())));
        assert_eq!(cache.try_get(&path)?, None);
        assert_eq!(cache.hash_cached(&path)?, hash::hash_bytes(b"hello"));

        let garbage = FileHashCache::new(Arc::new(StaleReadOnlyStore(b"garbage".to_vec())));
        assert_eq!(garbage.hash_cached(&path)?, hash::hash_bytes(b"hello"));
        Ok(())
    }

    #[test]
    fn test_entry_roundtrip() -> anyhow::Result<()> {
        let entry = HashCacheEntry {
            last_modified: -5,
            size: 42,
            hash: 0xdead_beef,
        };
        assert_eq!(HashCacheEntry::decode(&entry.encode())?, entry);
        Ok(())
    }
}
