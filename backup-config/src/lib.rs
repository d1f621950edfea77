//! Configuration for vm-backup.
//!
//! A run is described by a single [`BackupConfig`]: where archives go, which
//! VMs to back up and how many snapshots and archives to keep. It is read from
//! a YAML file, adjusted by `VM_BACKUP_*` environment variables and validated
//! before any VM is touched.

pub mod config;
pub mod loader;
pub mod validate;


pub use config::{ArchiveRetention, BackupConfig, VmEntry, VmOverride, VmTarget};
pub use loader::{load_file, parse_config, ConfigLoader};
pub use validate::{validate_vm_name, ConfigValidator};
