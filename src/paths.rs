//! Path helpers for archive entry names.
//!
//! Archives built on Windows use backslashes and arbitrary case. Entry names
//! are kept with forward slashes and their original case; lookups compare a
//! normalized form.

use std::path::{Component, Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

/// Convert Windows path separators to forward slashes
/// `Data\Textures\armor.dds` -> `Data/Textures/armor.dds`
pub fn to_linux_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Normalize for lookups and comparisons (NFC, lowercase, forward slashes, trimmed)
pub fn normalize_for_lookup(path: &str) -> String {
    path.nfc()
        .collect::<String>()
        .to_lowercase()
        .replace('\\', "/")
        .trim_matches('/')
        .to_string()
}

/// Check if two paths are equal (case-insensitive)
pub fn paths_equal(a: &str, b: &str) -> bool {
    normalize_for_lookup(a) == normalize_for_lookup(b)
}

/// Get the parent directory of a path (handles both / and \)
pub fn parent_path(path: &str) -> Option<&str> {
    path.rfind(['\\', '/']).map(|idx| &path[..idx])
}

/// Get the filename from a path (handles both / and \)
pub fn file_name(path: &str) -> &str {
    path.rfind(['\\', '/'])
        .map(|idx| &path[idx + 1..])
        .unwrap_or(path)
}

/// Get file extension
pub fn extension(path: &str) -> Option<&str> {
    let name = file_name(path);
    name.rfind('.').map(|idx| &name[idx + 1..])
}

/// Replace the file name of `path`, keeping its directory.
/// `a/b/c.esp` + `c.bsa` -> `a/b/c.bsa`
pub fn with_file_name(path: &str, name: &str) -> String {
    match parent_path(path) {
        Some(parent) => format!("{}/{}", to_linux_path(parent), name),
        None => name.to_string(),
    }
}

/// Join an archive entry name onto `base`, refusing names that would escape it.
pub fn join_entry(base: &Path, name: &str) -> Option<PathBuf> {
    let relative = PathBuf::from(to_linux_path(name));
    let mut out = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out == base {
        return None;
    }
    Some(out)
}

/// Create parent directories for a path if they don't exist
pub fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
