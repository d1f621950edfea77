use std::fs;
use std::path::Path;

use tracing::debug;

use crate::command_stream::is_tool_installed;
use crate::error::{BackupError, Result};

/// Make sure the backup destination exists and accepts new files.
///
/// The directory is created when missing. Writability is probed by creating
/// and dropping a temporary file, since permission bits alone do not account
/// for read-only mounts.
pub fn ensure_writable_dir(path: &Path) -> Result<()> {
    if !path.is_dir() {
        debug!(path = %path.display(), "backup directory missing, creating it");
        fs::create_dir_all(path).map_err(|e| {
            BackupError::config(format!(
                "failed to create backup directory '{}': {}",
                path.display(),
                e
            ))
        })?;
    }

    tempfile::Builder::new()
        .prefix(".vm-backup-probe")
        .tempfile_in(path)
        .map(drop)
        .map_err(|e| {
            BackupError::config(format!(
                "backup directory '{}' is not writable: {}",
                path.display(),
                e
            ))
        })
}

/// Fail with a configuration error when `tool` cannot be found in PATH.
pub fn ensure_tool_installed(tool: &str) -> Result<()> {
    if is_tool_installed(tool) {
        Ok(())
    } else {
        Err(BackupError::config(format!(
            "'{tool}' was not found in PATH; install it or set `tool` in the configuration"
        )))
    }
}
