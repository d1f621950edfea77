//! On-disk layout of exported archives.
//!
//! Archives live in `<dest_dir>/<vm>/<vm>-<YYYYMMDDTHHMMSSZ>.tar.<ext>`. The
//! tool always writes to a `.partial` sibling first; [`finalize`] flushes it
//! and moves it into place, so a file carrying the final name is complete.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BackupError, Result};
use crate::model::{format_timestamp, parse_timestamp, StoredArtifact, VmIdentity};

/// Suffix carried by archives that are still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Archive compression understood by the export command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    None,
}

impl Compression {
    pub const ALL: [Compression; 5] = [
        Compression::Gzip,
        Compression::Bzip2,
        Compression::Xz,
        Compression::Zstd,
        Compression::None,
    ];

    /// Value passed to the tool's `--compression` flag.
    pub fn algorithm(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
            Compression::None => "none",
        }
    }

    /// File suffix including the leading `.tar`.
    pub fn suffix(&self) -> &'static str {
        match self {
            Compression::Gzip => ".tar.gz",
            Compression::Bzip2 => ".tar.bz2",
            Compression::Xz => ".tar.xz",
            Compression::Zstd => ".tar.zst",
            Compression::None => ".tar",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.algorithm().eq_ignore_ascii_case(raw.trim()))
    }
}

/// Directory holding every archive of one VM.
pub fn vm_dir(dest_dir: &Path, vm: &VmIdentity) -> PathBuf {
    dest_dir.join(vm.as_str())
}

pub fn archive_file_name(vm: &VmIdentity, taken_at: DateTime<Utc>, compression: Compression) -> String {
    format!("{}-{}{}", vm, format_timestamp(taken_at), compression.suffix())
}

/// Recover the timestamp from a completed archive name belonging to `vm`.
///
/// Names that do not match exactly, including staging files, yield `None`.
pub fn parse_archive_file_name(vm: &VmIdentity, file_name: &str) -> Option<DateTime<Utc>> {
    if file_name.ends_with(PARTIAL_SUFFIX) {
        return None;
    }
    let rest = file_name.strip_prefix(vm.as_str())?.strip_prefix('-')?;
    let stem = Compression::ALL
        .into_iter()
        .find_map(|c| rest.strip_suffix(c.suffix()))?;
    parse_timestamp(stem)
}

pub fn staging_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Flush a finished staging file and move it to its final name.
///
/// Returns the archive size in bytes. Refuses to replace an existing archive.
pub fn finalize(staging: &Path, final_path: &Path) -> Result<u64> {
    if final_path.exists() {
        return Err(BackupError::Filesystem(format!(
            "refusing to overwrite completed archive '{}'",
            final_path.display()
        )));
    }

    let file = File::open(staging)
        .map_err(|e| BackupError::filesystem(e, staging.to_string_lossy(), "open"))?;
    file.sync_all()
        .map_err(|e| BackupError::filesystem(e, staging.to_string_lossy(), "sync"))?;
    let size = file
        .metadata()
        .map_err(|e| BackupError::filesystem(e, staging.to_string_lossy(), "stat"))?
        .len();
    drop(file);

    fs::rename(staging, final_path)
        .map_err(|e| BackupError::filesystem(e, final_path.to_string_lossy(), "rename"))?;

    if let Some(parent) = final_path.parent() {
        // Persist the rename itself; not every platform lets a directory be opened.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    debug!(path = %final_path.display(), size, "archive finalized");
    Ok(size)
}

/// Remove staging files left behind by an interrupted run.
pub fn sweep_partials(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !dir.is_dir() {
        return Ok(removed);
    }

    let entries =
        fs::read_dir(dir).map_err(|e| BackupError::filesystem(e, dir.to_string_lossy(), "read_dir"))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_partial = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX));
        if !is_partial || !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale partial archive"),
        }
    }
    Ok(removed)
}

/// List the completed archives of `vm`, newest first.
pub fn scan_completed(dir: &Path, vm: &VmIdentity) -> Result<Vec<StoredArtifact>> {
    let mut artifacts = Vec::new();
    if !dir.is_dir() {
        return Ok(artifacts);
    }

    let entries =
        fs::read_dir(dir).map_err(|e| BackupError::filesystem(e, dir.to_string_lossy(), "read_dir"))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let Some(created_at) = parse_archive_file_name(vm, &file_name) else {
            continue;
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        artifacts.push(StoredArtifact {
            vm: vm.clone(),
            path,
            file_name,
            created_at,
            size_bytes: metadata.len(),
        });
    }

    artifacts.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.file_name.cmp(&a.file_name))
    });
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, day, 3, 0, 0).unwrap()
    }

    #[test]
    fn archive_names_embed_vm_and_timestamp() {
        let vm = VmIdentity::new("web-1");
        let name = archive_file_name(&vm, at(19), Compression::Gzip);
        assert_eq!(name, "web-1-20261019T030000Z.tar.gz");
        assert_eq!(parse_archive_file_name(&vm, &name), Some(at(19)));
    }

    #[test]
    fn parse_rejects_partials_and_foreign_files() {
        let vm = VmIdentity::new("web1");
        assert_eq!(
            parse_archive_file_name(&vm, "web1-20261019T030000Z.tar.gz.partial"),
            None
        );
        assert_eq!(parse_archive_file_name(&vm, "web10-20261019T030000Z.tar.gz"), None);
        assert_eq!(parse_archive_file_name(&vm, "web1-notatime.tar.gz"), None);
        assert_eq!(parse_archive_file_name(&vm, "notes.txt"), None);
        assert_eq!(
            parse_archive_file_name(&vm, "web1-20261019T030000Z.tar"),
            Some(at(19))
        );
    }

    #[test]
    fn compression_parses_case_insensitively() {
        assert_eq!(Compression::parse("ZSTD"), Some(Compression::Zstd));
        assert_eq!(Compression::parse("none"), Some(Compression::None));
        assert_eq!(Compression::parse("lzma"), None);
    }

    #[test]
    fn finalize_moves_staging_into_place() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("web1-20261019T030000Z.tar.gz");
        let staging = staging_path(&final_path);
        fs::write(&staging, b"archive-bytes").unwrap();

        let size = finalize(&staging, &final_path).unwrap();

        assert_eq!(size, 13);
        assert!(final_path.exists());
        assert!(!staging.exists());
    }

    #[test]
    fn finalize_never_overwrites_completed_archive() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("web1-20261019T030000Z.tar.gz");
        fs::write(&final_path, b"original").unwrap();
        let staging = staging_path(&final_path);
        fs::write(&staging, b"replacement").unwrap();

        assert!(finalize(&staging, &final_path).is_err());
        assert_eq!(fs::read(&final_path).unwrap(), b"original");
    }

    #[test]
    fn scan_only_sees_completed_archives() {
        let dir = TempDir::new().unwrap();
        let vm = VmIdentity::new("web1");
        for day in [10, 12, 11] {
            fs::write(dir.path().join(archive_file_name(&vm, at(day), Compression::Gzip)), b"x").unwrap();
        }
        fs::write(
            dir.path().join(format!("{}{}", archive_file_name(&vm, at(13), Compression::Gzip), PARTIAL_SUFFIX)),
            b"half",
        )
        .unwrap();
        fs::write(dir.path().join("README"), b"not an archive").unwrap();

        let found = scan_completed(dir.path(), &vm).unwrap();
        let days: Vec<_> = found.iter().map(|a| a.created_at).collect();
        assert_eq!(days, vec![at(12), at(11), at(10)]);
    }

    #[test]
    fn sweep_removes_only_partials() {
        let dir = TempDir::new().unwrap();
        let vm = VmIdentity::new("web1");
        let complete = dir.path().join(archive_file_name(&vm, at(10), Compression::Gzip));
        let partial = staging_path(&dir.path().join(archive_file_name(&vm, at(11), Compression::Gzip)));
        fs::write(&complete, b"x").unwrap();
        fs::write(&partial, b"y").unwrap();

        let removed = sweep_partials(dir.path()).unwrap();

        assert_eq!(removed, vec![partial.clone()]);
        assert!(complete.exists());
        assert!(!partial.exists());
    }

    #[test]
    fn missing_directory_scans_as_empty() {
        let dir = TempDir::new().unwrap();
        let vm = VmIdentity::new("web1");
        let missing = dir.path().join("nope");
        assert!(scan_completed(&missing, &vm).unwrap().is_empty());
        assert!(sweep_partials(&missing).unwrap().is_empty());
    }
}
