//! Content hashing.
//!
//! Wabbajack identifies content by xxHash64 (seed 0), displayed as base64 of the
//! little-endian bytes. Everything in the VFS is keyed by this value.

use crate::error::{IoResultExt, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::str::FromStr;
use xxhash_rust::xxh64::Xxh64;

/// Seed used for every content hash.
pub const SEED: u64 = 0;

/// Chunk size used when streaming content through the hasher.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// 64-bit content hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(u64);

impl Hash {
    pub const fn new(code: u64) -> Self {
        Self(code)
    }

    pub fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Signed view, used for SQLite integer columns.
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn to_base64(self) -> String {
        STANDARD.encode(self.0.to_le_bytes())
    }

    pub fn from_base64(s: &str) -> Option<Self> {
        let bytes = STANDARD.decode(s).ok()?;
        let arr: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(Self(u64::from_le_bytes(arr)))
    }

    pub fn to_hex(self) -> String {
        self.0
            .to_le_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(s.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(Self(u64::from_le_bytes(bytes)))
    }

    /// Parse any of the textual forms found in modlists: 16 hex chars,
    /// 12 base64 chars ending in `=`, or a signed decimal.
    pub fn interpret(input: &str) -> Option<Self> {
        match input.len() {
            16 => Self::from_hex(input),
            12 if input.ends_with('=') => Self::from_base64(input),
            _ => input.parse::<i64>().ok().map(Self::from_i64),
        }
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl FromStr for Hash {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::interpret(s).ok_or_else(|| format!("not a hash: {}", s))
    }
}

/// Hash an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> Hash {
    Hash(xxhash_rust::xxh64::xxh64(data, SEED))
}

/// Stream a reader through the hasher in fixed-size chunks.
///
/// `progress` receives the running byte count after every chunk.
pub fn hash_reader<R: Read>(reader: R, progress: Option<&dyn Fn(u64)>) -> io::Result<Hash> {
    hashing_copy(reader, io::sink(), progress)
}

/// Copy `reader` into `writer`, hashing the bytes on the way through.
pub fn hashing_copy<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    progress: Option<&dyn Fn(u64)>,
) -> io::Result<Hash> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut hasher = Xxh64::new(SEED);
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
        if let Some(cb) = progress {
            cb(total);
        }
    }

    writer.flush()?;
    Ok(Hash(hasher.digest()))
}

/// Hash a file on disk, without consulting any cache.
pub fn hash_file(path: &Path) -> Result<Hash> {
    let file = File::open(path).at_path(path)?;
    let reader = BufReader::with_capacity(CHUNK_SIZE, file);
    hash_reader(reader, None).at_path(path)
}
