//! Gateway backed by the `incus` command-line client.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use backup_config::BackupConfig;
use backup_core::artifact::{self, Compression};
use backup_core::command_stream::run_command_with_timeout;
use backup_core::error::{GatewayError, GatewayErrorKind, GatewayResult};
use backup_core::system_check::ensure_tool_installed;
use backup_core::{ExportArtifact, Snapshot, VmIdentity};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::Gateway;

#[derive(Debug, Deserialize)]
struct RawInstance {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    name: Option<String>,
    created_at: Option<String>,
}

/// Parse `incus list --format json`.
pub fn parse_instance_list(stdout: &str) -> GatewayResult<Vec<VmIdentity>> {
    let raw: Vec<RawInstance> = serde_json::from_str(stdout)
        .map_err(|e| GatewayError::unknown(format!("unexpected instance list output: {e}")))?;
    Ok(raw
        .into_iter()
        .filter_map(|instance| instance.name)
        .filter(|name| !name.is_empty())
        .map(VmIdentity::new)
        .collect())
}

/// Parse `incus snapshot list <vm> --format json`.
///
/// Entries without a name or with an unreadable timestamp are skipped with a
/// warning rather than failing the whole listing.
pub fn parse_snapshot_list(vm: &VmIdentity, stdout: &str) -> GatewayResult<Vec<Snapshot>> {
    let raw: Vec<RawSnapshot> = serde_json::from_str(stdout)
        .map_err(|e| GatewayError::unknown(format!("unexpected snapshot list output: {e}")))?;

    let mut snapshots = Vec::with_capacity(raw.len());
    for entry in raw {
        let Some(name) = entry.name.filter(|n| !n.is_empty()) else {
            warn!(vm = %vm, "snapshot entry without a name, skipping");
            continue;
        };
        let Some(created_raw) = entry.created_at else {
            warn!(vm = %vm, snapshot = %name, "no creation date for snapshot, skipping");
            continue;
        };
        match DateTime::parse_from_rfc3339(&created_raw) {
            Ok(created_at) => {
                snapshots.push(Snapshot::new(vm.clone(), name, created_at.with_timezone(&Utc)))
            }
            Err(e) => warn!(
                vm = %vm,
                snapshot = %name,
                created_at = %created_raw,
                error = %e,
                "unreadable snapshot creation date, skipping"
            ),
        }
    }
    Ok(snapshots)
}

/// Talks to Incus through its CLI.
#[derive(Debug, Clone)]
pub struct IncusGateway {
    tool: String,
    snapshot_prefix: String,
    compression: Compression,
    command_timeout: Duration,
    export_timeout: Duration,
}

impl IncusGateway {
    pub fn new(tool: impl Into<String>) -> Self {
        let defaults = BackupConfig::default();
        Self {
            tool: tool.into(),
            snapshot_prefix: defaults.snapshot_prefix.clone(),
            compression: defaults.compression,
            command_timeout: defaults.command_timeout(),
            export_timeout: defaults.export_timeout(),
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            tool: config.tool.clone(),
            snapshot_prefix: config.snapshot_prefix.clone(),
            compression: config.compression,
            command_timeout: config.command_timeout(),
            export_timeout: config.export_timeout(),
        }
    }

    pub fn with_timeouts(mut self, command: Duration, export: Duration) -> Self {
        self.command_timeout = command;
        self.export_timeout = export;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    fn run(&self, args: &[&str]) -> GatewayResult<String> {
        run_command_with_timeout(&self.tool, args, self.command_timeout).map(|out| out.stdout)
    }
}

impl Gateway for IncusGateway {
    fn name(&self) -> &'static str {
        "incus"
    }

    fn check_available(&self) -> backup_core::Result<()> {
        ensure_tool_installed(&self.tool)
    }

    fn list_instances(&self) -> GatewayResult<Vec<VmIdentity>> {
        let stdout = self.run(&["list", "--format", "json"])?;
        let instances = parse_instance_list(&stdout)?;
        debug!(count = instances.len(), "discovered instances");
        Ok(instances)
    }

    fn create_snapshot(
        &self,
        vm: &VmIdentity,
        taken_at: DateTime<Utc>,
        stateful: bool,
    ) -> GatewayResult<Snapshot> {
        let name = Snapshot::name_for(&self.snapshot_prefix, taken_at);
        let mut args = vec!["snapshot", "create"];
        if stateful {
            args.push("--stateful");
        }
        args.push(vm.as_str());
        args.push(name.as_str());

        self.run(&args)?;
        debug!(vm = %vm, snapshot = %name, stateful, "snapshot created");
        Ok(Snapshot::new(vm.clone(), name, taken_at))
    }

    fn list_snapshots(&self, vm: &VmIdentity) -> GatewayResult<Vec<Snapshot>> {
        let stdout = self.run(&["snapshot", "list", vm.as_str(), "--format", "json"])?;
        parse_snapshot_list(vm, &stdout)
    }

    fn delete_snapshot(&self, vm: &VmIdentity, snapshot: &Snapshot) -> GatewayResult<()> {
        self.run(&["snapshot", "delete", vm.as_str(), snapshot.name.as_str()])?;
        Ok(())
    }

    fn export_snapshot(
        &self,
        vm: &VmIdentity,
        snapshot: &Snapshot,
        dest_dir: &Path,
    ) -> GatewayResult<ExportArtifact> {
        let final_path = dest_dir.join(artifact::archive_file_name(
            vm,
            snapshot.created_at,
            self.compression,
        ));
        if final_path.exists() {
            return Err(GatewayError::new(
                GatewayErrorKind::Unknown,
                format!("archive '{}' already exists", final_path.display()),
            ));
        }
        let staging = artifact::staging_path(&final_path);
        let staging_arg = staging.to_string_lossy().into_owned();

        info!(vm = %vm, path = %final_path.display(), "exporting");
        let started = Instant::now();
        let exported = run_command_with_timeout(
            &self.tool,
            &[
                "export",
                vm.as_str(),
                staging_arg.as_str(),
                "--compression",
                self.compression.algorithm(),
            ],
            self.export_timeout,
        );
        if let Err(e) = exported {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }

        let size_bytes = artifact::finalize(&staging, &final_path).map_err(|e| {
            let _ = fs::remove_file(&staging);
            GatewayError::unknown(format!("export finished but archive is unusable: {e}"))
        })?;

        Ok(ExportArtifact {
            snapshot: snapshot.clone(),
            path: final_path,
            size_bytes,
            duration: started.elapsed(),
            complete: true,
        })
    }
}
