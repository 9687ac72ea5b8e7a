//! 7z binary integration.
//!
//! 7z and RAR archives are handled by the external `7zz`/`7z` executable:
//!
//! - List files: `7zz l -slt -ba -scsUTF-8 archive`
//!   - `-slt`: technical listing (key = value blocks)
//!   - `-ba`: bare output (no headers)
//! - Extract: `7zz x -y -aoa -spd -mmt=1 -o{dir} -- archive [names...]`
//!   - `-aoa`: overwrite all existing files
//!   - `-spd`: names are literal, not wildcards
//!   - `-mmt=1`: one thread per process, concurrency comes from the extraction limiter
//!   - `--`: ends switch parsing, entry names come from untrusted archives
//!
//! Subset extraction is supported; streaming is not (solid archives would
//! decompress everything before the requested entry anyway).

use super::{ArchiveExtractor, EntryInfo};
use crate::error::{Error, IoResultExt, Result};
use crate::paths;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SevenZipExtractor {
    binary: PathBuf,
}

impl SevenZipExtractor {
    /// Find the 7z binary.
    ///
    /// Looks in `bin/` next to the executable, then `bin/7zz` relative to the
    /// working directory, then `7zz` and `7z` on PATH.
    pub fn locate() -> Result<Self> {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                for candidate in ["bin/7zz", "bin/7z.exe", "7zz"] {
                    let path = exe_dir.join(candidate);
                    if path.exists() {
                        return Ok(Self::with_binary(path));
                    }
                }
            }
        }

        let cwd_path = PathBuf::from("bin/7zz");
        if cwd_path.exists() {
            return Ok(Self::with_binary(cwd_path));
        }

        which::which("7zz")
            .or_else(|_| which::which("7z"))
            .map(Self::with_binary)
            .map_err(|_| Error::UnsupportedArchive(PathBuf::from("7z binary not found (install p7zip or place 7zz in bin/)")))
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn run(&self, archive: &Path, mut cmd: Command, what: &str) -> Result<Vec<u8>> {
        let output = cmd.output().at_path(&self.binary)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::corrupt(
                archive.display(),
                format!("7z {} failed: {}", what, stderr.trim()),
            ));
        }
        Ok(output.stdout)
    }

    fn extract_command(&self, archive: &Path, dest: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("x")
            .arg("-y")
            .arg("-aoa")
            .arg("-spd")
            .arg("-scsUTF-8")
            .arg("-mmt=1")
            .arg(format!("-o{}", dest.display()))
            .arg("--")
            .arg(archive);
        cmd
    }

    fn subset_command(&self, archive: &Path, names: &[String], dest: &Path) -> Command {
        let mut cmd = self.extract_command(archive, dest);
        cmd.args(names);
        cmd
    }
}

impl ArchiveExtractor for SevenZipExtractor {
    fn name(&self) -> &'static str {
        "7z"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["7z", "rar"]
    }

    fn list_entries(&self, archive: &Path) -> Result<Vec<EntryInfo>> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("l").arg("-slt").arg("-ba").arg("-scsUTF-8").arg("--").arg(archive);
        let stdout = self.run(archive, cmd, "list")?;
        Ok(parse_7z_list(&stdout))
    }

    fn extract_all(&self, archive: &Path, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).at_path(dest)?;
        let cmd = self.extract_command(archive, dest);
        self.run(archive, cmd, "extract")?;
        fix_permissions_recursive(dest);
        Ok(())
    }

    fn supports_subset(&self) -> bool {
        true
    }

    fn extract_subset(&self, archive: &Path, names: &[String], dest: &Path) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(dest).at_path(dest)?;
        let cmd = self.subset_command(archive, names, dest);
        debug!("7z extracting {} entries from {}", names.len(), archive.display());
        self.run(archive, cmd, "extract")?;
        fix_permissions_recursive(dest);
        Ok(())
    }
}

/// Parse `7z l -slt` output. Directory entries are skipped.
fn parse_7z_list(output: &[u8]) -> Vec<EntryInfo> {
    let text = String::from_utf8_lossy(output);
    let mut entries = Vec::new();
    let mut current: HashMap<&str, &str> = HashMap::new();

    let mut flush = |current: &mut HashMap<&str, &str>| {
        if let Some(path) = current.get("Path").filter(|p| !p.is_empty()) {
            let is_dir = current.get("Folder").map(|v| *v == "+").unwrap_or(false);
            if !is_dir {
                let size = current
                    .get("Size")
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                entries.push(EntryInfo {
                    name: paths::to_linux_path(path),
                    size,
                    hash: None,
                });
            }
        }
        current.clear();
    };

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            flush(&mut current);
        } else if let Some((key, value)) = line.split_once(" = ") {
            current.insert(key, value);
        }
    }
    // Last block may have no trailing blank line
    flush(&mut current);

    entries
}

/// Windows archives sometimes extract with unreadable modes on Unix.
#[cfg(unix)]
fn fix_permissions_recursive(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mut perms = metadata.permissions();
        let mode = perms.mode();
        let wanted = if metadata.is_dir() { 0o700 } else { 0o600 };
        if mode & wanted != wanted {
            perms.set_mode(mode | wanted);
            let _ = fs::set_permissions(entry.path(), perms);
        }
    }
}

#[cfg(not(unix))]
fn fix_permissions_recursive(_dir: &Path) {}
