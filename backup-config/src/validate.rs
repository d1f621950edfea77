use std::collections::HashSet;

use backup_core::error::{BackupError, Result};

use crate::config::{BackupConfig, VmEntry};

/// Longest instance name the virtualization tool accepts.
const MAX_VM_NAME_LEN: usize = 63;

/// Upper bound for any `max_age_days` setting (one hundred years).
pub const MAX_AGE_DAYS: u32 = 36_500;

fn check_age(field: &str, days: Option<u32>) -> Result<()> {
    match days {
        Some(days) if days > MAX_AGE_DAYS => Err(BackupError::config(format!(
            "{field} is {days}, the maximum is {MAX_AGE_DAYS}"
        ))),
        _ => Ok(()),
    }
}

/// Validate a VM name before it is ever passed to the tool.
pub fn validate_vm_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BackupError::config("VM name must not be empty"));
    }
    if name.len() > MAX_VM_NAME_LEN {
        return Err(BackupError::config(format!(
            "VM name '{name}' is longer than {MAX_VM_NAME_LEN} characters"
        )));
    }
    if name == "." || name == ".." {
        return Err(BackupError::config(format!(
            "VM name '{name}' is not a usable directory name"
        )));
    }
    if name.starts_with('-') {
        return Err(BackupError::config(format!(
            "VM name '{name}' must not start with '-'"
        )));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '/' || c == '\\')
    {
        return Err(BackupError::config(format!(
            "VM name '{name}' contains whitespace, control characters or path separators"
        )));
    }
    Ok(())
}

pub struct ConfigValidator<'a> {
    config: &'a BackupConfig,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(config: &'a BackupConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_destination()?;
        self.validate_retention()?;
        self.validate_runtime()?;
        self.validate_vms()?;
        Ok(())
    }

    fn validate_destination(&self) -> Result<()> {
        if self.config.dest_dir.as_os_str().is_empty() {
            return Err(BackupError::config(
                "Missing required field: dest_dir (or set VM_BACKUP_DEST_DIR)",
            ));
        }
        Ok(())
    }

    fn validate_retention(&self) -> Result<()> {
        if self.config.max_count < 1 {
            return Err(BackupError::config("max_count must be at least 1"));
        }
        check_age("max_age_days", self.config.max_age_days)?;
        if let Some(archives) = &self.config.archives {
            check_age("archives.max_age_days", archives.max_age_days)?;
            if archives.max_count.is_none() && archives.max_age_days.is_none() {
                return Err(BackupError::config(
                    "archives needs max_count, max_age_days or both",
                ));
            }
            if archives.max_count == Some(0) {
                return Err(BackupError::config("archives.max_count must be at least 1"));
            }
        }
        Ok(())
    }

    fn validate_runtime(&self) -> Result<()> {
        if self.config.concurrency < 1 {
            return Err(BackupError::config("concurrency must be at least 1"));
        }
        if self.config.tool.trim().is_empty() {
            return Err(BackupError::config("tool must not be empty"));
        }
        if self.config.command_timeout_secs == 0 || self.config.export_timeout_secs == 0 {
            return Err(BackupError::config("timeouts must be greater than zero"));
        }
        if self
            .config
            .snapshot_prefix
            .chars()
            .any(|c| c.is_whitespace() || c == '/')
        {
            return Err(BackupError::config(
                "snapshot_prefix must not contain whitespace or '/'",
            ));
        }
        Ok(())
    }

    fn validate_vms(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.config.vms {
            let name = entry.name();
            validate_vm_name(name)?;
            if !seen.insert(name) {
                return Err(BackupError::config(format!(
                    "VM '{name}' is listed more than once"
                )));
            }
            if let VmEntry::Detailed(detail) = entry {
                if detail.max_count == Some(0) {
                    return Err(BackupError::config(format!(
                        "max_count for VM '{name}' must be at least 1"
                    )));
                }
                check_age(&format!("max_age_days for VM '{name}'"), detail.max_age_days)?;
            }
        }
        Ok(())
    }
}
