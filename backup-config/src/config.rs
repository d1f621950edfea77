// Standard library imports
use std::path::PathBuf;
use std::time::Duration;

// External crate imports
use backup_core::artifact::Compression;
use backup_core::{RetentionPolicy, VmIdentity};
use serde::{Deserialize, Serialize};

fn default_max_count() -> usize {
    7
}

fn default_concurrency() -> usize {
    1
}

fn default_tool() -> String {
    "incus".to_string()
}

fn default_snapshot_prefix() -> String {
    "snapshot-".to_string()
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_export_timeout_secs() -> u64 {
    4 * 60 * 60
}

/// Complete configuration of one backup run.
///
/// Unknown keys are rejected so that a typo in the file surfaces as a
/// configuration error instead of a silently ignored option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    /// Root directory receiving one sub-directory of archives per VM.
    #[serde(default)]
    pub dest_dir: PathBuf,

    /// Snapshots kept per VM.
    #[serde(default = "default_max_count")]
    pub max_count: usize,

    /// Snapshots older than this are pruned (the newest one always survives).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,

    /// VMs processed in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub debug: bool,

    /// Try stateful snapshots first, falling back to stateless ones.
    #[serde(default)]
    pub stateful: bool,

    #[serde(default)]
    pub compression: Compression,

    /// Virtualization CLI binary.
    #[serde(default = "default_tool")]
    pub tool: String,

    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_export_timeout_secs")]
    pub export_timeout_secs: u64,

    /// Retention of exported archives; archives are never pruned when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archives: Option<ArchiveRetention>,

    /// VMs to back up, in processing order. Empty means every instance.
    #[serde(default)]
    pub vms: Vec<VmEntry>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dest_dir: PathBuf::new(),
            max_count: default_max_count(),
            max_age_days: None,
            concurrency: default_concurrency(),
            debug: false,
            stateful: false,
            compression: Compression::default(),
            tool: default_tool(),
            snapshot_prefix: default_snapshot_prefix(),
            command_timeout_secs: default_command_timeout_secs(),
            export_timeout_secs: default_export_timeout_secs(),
            archives: None,
            vms: Vec::new(),
        }
    }
}

impl BackupConfig {
    /// Snapshot retention applied to VMs without their own override.
    pub fn snapshot_policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.max_count, self.max_age_days)
    }

    pub fn archive_policy(&self) -> Option<RetentionPolicy> {
        self.archives.as_ref().map(ArchiveRetention::policy)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }

    /// Configured VMs with their effective snapshot policy, in file order.
    pub fn targets(&self) -> Vec<VmTarget> {
        let default_policy = self.snapshot_policy();
        self.vms
            .iter()
            .map(|entry| VmTarget {
                vm: VmIdentity::new(entry.name()),
                policy: entry.policy(default_policy),
            })
            .collect()
    }

    /// Target for a VM that was discovered rather than configured.
    pub fn discovered_target(&self, vm: VmIdentity) -> VmTarget {
        VmTarget {
            vm,
            policy: self.snapshot_policy(),
        }
    }
}

/// Archive retention settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveRetention {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,
}

impl ArchiveRetention {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.max_count.unwrap_or(usize::MAX), self.max_age_days)
    }
}

/// A VM entry: either a bare name or a name with policy overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VmEntry {
    Name(String),
    Detailed(VmOverride),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmOverride {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,
}

impl VmEntry {
    pub fn name(&self) -> &str {
        match self {
            VmEntry::Name(name) => name,
            VmEntry::Detailed(detail) => &detail.name,
        }
    }

    pub fn policy(&self, default: RetentionPolicy) -> RetentionPolicy {
        match self {
            VmEntry::Name(_) => default,
            VmEntry::Detailed(detail) => RetentionPolicy::new(
                detail.max_count.unwrap_or(default.max_count),
                detail.max_age_days.or(default.max_age_days),
            ),
        }
    }
}

impl From<&str> for VmEntry {
    fn from(name: &str) -> Self {
        VmEntry::Name(name.to_string())
    }
}

/// One VM scheduled for backup and the snapshot policy that applies to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmTarget {
    pub vm: VmIdentity,
    pub policy: RetentionPolicy,
}
