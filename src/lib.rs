//! CLF3 VFS - content-addressed view over archives nested inside archives
//!
//! Every file and every entry of every (nested) archive under a set of roots
//! is indexed by its xxHash64, can be staged to disk on demand, and can be
//! rebuilt from any other indexed file through the binary patch cache.

pub mod archive;
pub mod config;
pub mod error;
pub mod hash;
pub mod hash_cache;
pub mod patch;
pub mod paths;
pub mod progress;
pub mod queue;
pub mod store;
pub mod vfs;

pub use error::{Error, Result};
