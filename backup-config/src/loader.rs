// Standard library imports
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// External crate imports
use backup_core::artifact::Compression;
use backup_core::error::{BackupError, Result};
use tracing::debug;

// Internal imports
use crate::config::{BackupConfig, VmEntry};
use crate::validate::ConfigValidator;

pub const CONFIG_ENV: &str = "VM_BACKUP_CONFIG";
pub const CONFIG_FILE_NAME: &str = "vm-backup.yaml";

/// Finds, parses, overrides and validates the backup configuration.
///
/// Resolution order for the file:
/// 1. **Explicit path** given on the command line.
/// 2. **`VM_BACKUP_CONFIG`** environment variable.
/// 3. **Search paths:** `./vm-backup.yaml`, the user config directory, then
///    `/etc/vm-backup/config.yaml`.
///
/// When no file exists the defaults are used, so a run can be configured
/// purely through `VM_BACKUP_*` variables. Explicitly named files must exist.
pub struct ConfigLoader {
    explicit: Option<PathBuf>,
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self {
            explicit,
            search_paths: default_search_paths(),
        }
    }

    /// Replace the implicit search locations.
    pub fn with_search_paths(mut self, search_paths: Vec<PathBuf>) -> Self {
        self.search_paths = search_paths;
        self
    }

    /// Load using the process environment.
    pub fn load(&self) -> Result<BackupConfig> {
        self.load_with(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` as the environment.
    pub fn load_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<BackupConfig> {
        let mut config = match self.locate(&lookup)? {
            Some(path) => {
                debug!("Loading config from: {}", path.display());
                load_file(&path)?
            }
            None => {
                debug!("No configuration file found, using defaults and environment");
                BackupConfig::default()
            }
        };

        apply_env_overrides(&mut config, &lookup)?;
        ConfigValidator::new(&config).validate()?;
        Ok(config)
    }

    fn locate(&self, lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<PathBuf>> {
        let named = self
            .explicit
            .clone()
            .or_else(|| lookup(CONFIG_ENV).map(PathBuf::from));
        if let Some(path) = named {
            if !path.is_file() {
                return Err(BackupError::config(format!(
                    "configuration file '{}' does not exist",
                    path.display()
                )));
            }
            return Ok(Some(path));
        }

        Ok(self.search_paths.iter().find(|p| p.is_file()).cloned())
    }
}

fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("vm-backup").join("config.yaml"));
    }
    paths.push(PathBuf::from("/etc/vm-backup/config.yaml"));
    paths
}

/// Parse a configuration file.
pub fn load_file(path: &Path) -> Result<BackupConfig> {
    let contents = fs::read_to_string(path).map_err(|e| {
        BackupError::config(format!("failed to read '{}': {}", path.display(), e))
    })?;
    parse_config(&contents)
        .map_err(|e| BackupError::config(format!("invalid configuration in '{}': {}", path.display(), e)))
}

/// Parse configuration YAML. An empty document yields the defaults.
pub fn parse_config(contents: &str) -> std::result::Result<BackupConfig, serde_yaml_ng::Error> {
    if contents.trim().is_empty() {
        return Ok(BackupConfig::default());
    }
    serde_yaml_ng::from_str(contents)
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| BackupError::config(format!("{key} has an invalid value: '{raw}'")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(BackupError::config(format!(
            "{key} has an invalid value: '{raw}'"
        ))),
    }
}

/// Apply `VM_BACKUP_*` overrides on top of file values.
pub fn apply_env_overrides(
    config: &mut BackupConfig,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(dest) = lookup("VM_BACKUP_DEST_DIR") {
        config.dest_dir = PathBuf::from(dest);
    }
    if let Some(raw) = lookup("VM_BACKUP_VMS") {
        config.vms = raw
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(VmEntry::from)
            .collect();
    }
    if let Some(raw) = lookup("VM_BACKUP_MAX_COUNT") {
        config.max_count = parse_var("VM_BACKUP_MAX_COUNT", &raw)?;
    }
    if let Some(raw) = lookup("VM_BACKUP_MAX_AGE_DAYS") {
        config.max_age_days = if raw.trim().is_empty() {
            None
        } else {
            Some(parse_var("VM_BACKUP_MAX_AGE_DAYS", &raw)?)
        };
    }
    if let Some(raw) = lookup("VM_BACKUP_CONCURRENCY") {
        config.concurrency = parse_var("VM_BACKUP_CONCURRENCY", &raw)?;
    }
    if let Some(raw) = lookup("VM_BACKUP_DEBUG") {
        config.debug = parse_bool("VM_BACKUP_DEBUG", &raw)?;
    }
    if let Some(raw) = lookup("VM_BACKUP_COMPRESSION") {
        config.compression = Compression::parse(&raw).ok_or_else(|| {
            BackupError::config(format!("VM_BACKUP_COMPRESSION has an invalid value: '{raw}'"))
        })?;
    }
    Ok(())
}
