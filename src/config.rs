//! Runtime configuration for the VFS context.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Bytes of RAM budgeted per concurrent extractor process.
const RAM_PER_EXTRACTION: u64 = 2 * 1024 * 1024 * 1024;

/// Configuration for a [`Context`](crate::vfs::Context).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfsConfig {
    /// Directory holding the SQLite cache database.
    pub cache_dir: PathBuf,

    /// Directory under which staging sessions create their temp dirs.
    pub temp_dir: PathBuf,

    /// Number of work queue threads.
    pub workers: usize,

    /// Maximum concurrent archive extractions (external processes / open archives).
    pub extract_limit: usize,

    /// Maximum files hashed at the same time.
    pub hash_limit: usize,

    /// Above this many requested entries a whole-archive extraction is used
    /// even when the extractor supports subsets.
    pub selective_extract_threshold: usize,
}

impl Default for VfsConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("clf3-vfs");
        let workers = env_usize("CLF3_VFS_WORKERS").unwrap_or_else(default_workers);

        Self {
            cache_dir,
            temp_dir: std::env::temp_dir(),
            workers,
            extract_limit: env_usize("CLF3_VFS_EXTRACT_LIMIT").unwrap_or_else(default_extract_limit),
            hash_limit: workers,
            selective_extract_threshold: selective_extract_threshold(),
        }
    }
}

impl VfsConfig {
    /// Config rooted in `dir`: cache and temp space both live under it.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cache_dir: dir.join("cache"),
            temp_dir: dir.join("tmp"),
            ..Self::default()
        }
    }

    /// Path of the SQLite database shared by all caches.
    pub fn db_path(&self) -> PathBuf {
        self.cache_dir.join("clf3_vfs.sqlite")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroLimit("workers"));
        }
        if self.extract_limit == 0 {
            return Err(ConfigError::ZeroLimit("extract_limit"));
        }
        if self.hash_limit == 0 {
            return Err(ConfigError::ZeroLimit("hash_limit"));
        }
        if self.temp_dir.exists() && !self.temp_dir.is_dir() {
            return Err(ConfigError::NotADirectory(self.temp_dir.clone()));
        }
        if self.cache_dir.exists() && !self.cache_dir.is_dir() {
            return Err(ConfigError::NotADirectory(self.cache_dir.clone()));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e.to_string()))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| ConfigError::Read(path.to_path_buf(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Write(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, text).map_err(|e| ConfigError::Write(path.to_path_buf(), e.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Failed to read config {0}: {1}")]
    Read(PathBuf, String),

    #[error("Failed to write config {0}: {1}")]
    Write(PathBuf, String),
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// One extraction per 2GB of RAM, never more than the CPU count.
fn default_extract_limit() -> usize {
    static LIMIT: OnceLock<usize> = OnceLock::new();
    *LIMIT.get_or_init(|| {
        let sys = sysinfo::System::new_with_specifics(
            sysinfo::RefreshKind::nothing().with_memory(sysinfo::MemoryRefreshKind::everything()),
        );
        let by_ram = (sys.total_memory() / RAM_PER_EXTRACTION).max(1) as usize;
        by_ram.min(default_workers())
    })
}

/// Max number of files to request selectively before preferring full extraction.
pub fn selective_extract_threshold() -> usize {
    static THRESHOLD: OnceLock<usize> = OnceLock::new();
    *THRESHOLD.get_or_init(|| env_usize("CLF3_SELECTIVE_EXTRACT_THRESHOLD").unwrap_or(25))
}
