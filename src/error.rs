//! Error types for the VFS core.
//!
//! Errors local to one file, archive or partition are returned to the caller and
//! never abort unrelated work. Errors that mean the requested output cannot be
//! correct (hash mismatch, unreadable patch) are marked fatal via [`Error::is_fatal`].

use crate::config::ConfigError;
use crate::hash::Hash;
use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An archive (or one of its ancestors) could not be read.
    /// `chain` is the full virtual path of the failing archive.
    #[error("archive {chain} is corrupt or unreadable: {reason}")]
    ArchiveCorrupt { chain: String, reason: String },

    #[error("no extractor registered for {0}")]
    UnsupportedArchive(PathBuf),

    #[error("hash mismatch for {what}: expected {expected}, got {actual}")]
    HashMismatch {
        what: String,
        expected: Hash,
        actual: Hash,
    },

    #[error("unrecognized patch format (header {0:02x?})")]
    PatchFormatUnrecognized(Vec<u8>),

    #[error("patch is corrupt: {0}")]
    PatchCorrupt(String),

    #[error("queue task failed: {0}")]
    TaskFault(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("cache store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("not indexed: {0}")]
    NotIndexed(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Attach a path to a raw I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(chain: impl ToString, reason: impl ToString) -> Self {
        Error::ArchiveCorrupt {
            chain: chain.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True when the enclosing compile/install step must abort.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::HashMismatch { .. } | Error::PatchFormatUnrecognized(_) | Error::PatchCorrupt(_)
        )
    }
}

/// Extension for attaching a path to `std::io::Result`.
pub trait IoResultExt<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
