//! Virtual paths.
//!
//! A [`FullPath`] names a file anywhere in the forest: the absolute path of a
//! physical file followed by the entry name at each archive level. Displayed
//! with `|` between levels, e.g. `/mods/a.zip|textures.7z|armor.dds`.

use crate::hash::Hash;
use crate::paths;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Level separator in displayed paths.
pub const SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FullPath {
    root: PathBuf,
    parts: Vec<String>,
}

impl FullPath {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            parts: Vec::new(),
        }
    }

    pub fn with_parts(root: impl Into<PathBuf>, parts: Vec<String>) -> Self {
        Self {
            root: root.into(),
            parts,
        }
    }

    /// Path of the physical file at the top of the chain.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entry names below the root, outermost first.
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Number of archive levels below the root.
    pub fn depth(&self) -> usize {
        self.parts.len()
    }

    pub fn is_native(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn join(&self, name: impl Into<String>) -> Self {
        let mut parts = self.parts.clone();
        parts.push(name.into());
        Self {
            root: self.root.clone(),
            parts,
        }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.parts.is_empty() {
            return None;
        }
        Some(Self {
            root: self.root.clone(),
            parts: self.parts[..self.parts.len() - 1].to_vec(),
        })
    }

    /// Every prefix of this path, root first, ending with `self`.
    pub fn ancestors_and_self(&self) -> Vec<Self> {
        (0..=self.parts.len())
            .map(|n| Self {
                root: self.root.clone(),
                parts: self.parts[..n].to_vec(),
            })
            .collect()
    }

    /// Name of the last level.
    pub fn file_name(&self) -> String {
        match self.parts.last() {
            Some(name) => paths::file_name(name).to_string(),
            None => self
                .root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    /// Sibling path: same directory at the same level, different file name.
    pub fn in_same_folder(&self, name: &str) -> Self {
        match self.parts.split_last() {
            Some((last, outer)) => {
                let mut parts = outer.to_vec();
                parts.push(paths::with_file_name(last, name));
                Self {
                    root: self.root.clone(),
                    parts,
                }
            }
            None => Self::new(self.root.with_file_name(name)),
        }
    }
}

impl fmt::Display for FullPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.display())?;
        for part in &self.parts {
            write!(f, "{}{}", SEPARATOR, part)?;
        }
        Ok(())
    }
}

impl FromStr for FullPath {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut levels = s.split(SEPARATOR);
        let root = levels
            .next()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| format!("empty root in virtual path: {}", s))?;
        let parts: Vec<String> = levels.map(paths::to_linux_path).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(format!("empty level in virtual path: {}", s));
        }
        Ok(Self::with_parts(root, parts))
    }
}

/// A location relative to a top-level archive known only by its hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashRelativePath {
    pub hash: Hash,
    pub parts: Vec<String>,
}

impl HashRelativePath {
    pub fn new(hash: Hash, parts: Vec<String>) -> Self {
        Self { hash, parts }
    }

    /// Re-anchor on a physical file.
    pub fn to_full_path(&self, root: impl Into<PathBuf>) -> FullPath {
        FullPath::with_parts(root, self.parts.clone())
    }
}

impl fmt::Display for HashRelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash)?;
        for part in &self.parts {
            write!(f, "{}{}", SEPARATOR, part)?;
        }
        Ok(())
    }
}
