//! Per-VM backup state machine.
//!
//! One [`Orchestrator::run`] call takes a VM from `Idle` to `Done` or
//! `Failed`: snapshot, export, then prune snapshots and archives. Whatever
//! goes wrong is folded into the returned [`RunResult`]; nothing propagates.

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use backup_config::{BackupConfig, VmTarget};
use backup_core::artifact;
use backup_core::{BackupError, ExportArtifact, RetentionPolicy, Snapshot, VmIdentity};
use backup_gateway::{Gateway, GatewayResult};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, warn};

use crate::cancel::CancellationFlag;
use crate::metrics::{ExportReport, MetricsRecorder, VmMetrics};
use crate::retention;

/// Where a VM is in its backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Idle,
    Snapshotting,
    Exporting,
    Pruning,
    Done,
    Failed,
}

impl Display for VmState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let label = match self {
            VmState::Idle => "idle",
            VmState::Snapshotting => "snapshotting",
            VmState::Exporting => "exporting",
            VmState::Pruning => "pruning",
            VmState::Done => "done",
            VmState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
pub enum VmOutcome {
    Succeeded,
    /// Backup exists but some snapshots or archives could not be pruned.
    PartiallyFailed { problems: Vec<String> },
    Failed { state: VmState, error: BackupError },
    Cancelled,
}

impl VmOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, VmOutcome::Succeeded)
    }
}

impl Display for VmOutcome {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            VmOutcome::Succeeded => f.write_str("succeeded"),
            VmOutcome::PartiallyFailed { problems } => {
                write!(f, "partially failed ({} problems)", problems.len())
            }
            VmOutcome::Failed { state, error } => write!(f, "failed while {state}: {error}"),
            VmOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// What happened to one VM.
#[derive(Debug)]
pub struct RunResult {
    pub vm: VmIdentity,
    pub outcome: VmOutcome,
    pub metrics: VmMetrics,
    pub archive: Option<PathBuf>,
}

impl RunResult {
    pub fn cancelled(vm: VmIdentity) -> Self {
        Self {
            vm,
            outcome: VmOutcome::Cancelled,
            metrics: VmMetrics::default(),
            archive: None,
        }
    }
}

/// Run-wide knobs the orchestrator needs from the configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub dest_dir: PathBuf,
    pub stateful: bool,
    pub archive_policy: Option<RetentionPolicy>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            dest_dir: config.dest_dir.clone(),
            stateful: config.stateful,
            archive_policy: config.archive_policy(),
        }
    }
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Orchestrator<'a> {
    gateway: &'a dyn Gateway,
    settings: &'a OrchestratorSettings,
    metrics: &'a MetricsRecorder,
    cancel: &'a CancellationFlag,
    clock: Clock,
}

/// Mutable bookkeeping for one VM run.
struct Progress {
    vm: VmIdentity,
    state: VmState,
    metrics: VmMetrics,
    archive: Option<PathBuf>,
    problems: Vec<String>,
}

impl Progress {
    fn advance(&mut self, next: VmState) {
        info!(from = %self.state, to = %next, "state transition");
        self.state = next;
    }
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        gateway: &'a dyn Gateway,
        settings: &'a OrchestratorSettings,
        metrics: &'a MetricsRecorder,
        cancel: &'a CancellationFlag,
    ) -> Self {
        Self {
            gateway,
            settings,
            metrics,
            cancel,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Back up one VM. Never fails; the outcome is in the result.
    pub fn run(&self, target: &VmTarget) -> RunResult {
        let span = info_span!("vm", vm = %target.vm);
        let _entered = span.enter();

        let mut progress = Progress {
            vm: target.vm.clone(),
            state: VmState::Idle,
            metrics: VmMetrics::default(),
            archive: None,
            problems: Vec::new(),
        };
        info!(policy = %target.policy, "starting backup");

        let outcome = match self.drive(target, &mut progress) {
            Ok(Some(())) => {
                progress.advance(VmState::Done);
                if progress.problems.is_empty() {
                    VmOutcome::Succeeded
                } else {
                    VmOutcome::PartiallyFailed {
                        problems: std::mem::take(&mut progress.problems),
                    }
                }
            }
            Ok(None) => {
                warn!(state = %progress.state, "cancelled");
                VmOutcome::Cancelled
            }
            Err(error) => {
                let state = progress.state;
                error!(state = %state, error = %error, "backup failed");
                progress.advance(VmState::Failed);
                VmOutcome::Failed { state, error }
            }
        };

        self.metrics.record(&progress.vm, &progress.metrics);
        info!(outcome = %outcome, "finished");
        RunResult {
            vm: progress.vm,
            outcome,
            metrics: progress.metrics,
            archive: progress.archive,
        }
    }

    /// `Ok(None)` means the run was cancelled between two states.
    fn drive(&self, target: &VmTarget, progress: &mut Progress) -> Result<Option<()>, BackupError> {
        let vm = &target.vm;

        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        progress.advance(VmState::Snapshotting);
        let snapshot = self.take_snapshot(vm, (self.clock)())?;
        info!(snapshot = %snapshot.name, "snapshot created");

        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        progress.advance(VmState::Exporting);
        let exported = self.export(vm, &snapshot)?;
        progress.metrics.export_duration = exported.duration;
        progress.metrics.export_bytes = exported.size_bytes;
        info!(
            path = %exported.path.display(),
            "export complete: {}",
            ExportReport(&progress.metrics)
        );
        progress.archive = Some(exported.path);

        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        progress.advance(VmState::Pruning);
        let now = (self.clock)();
        self.prune_snapshots(vm, &target.policy, now, progress)?;
        if let Some(policy) = &self.settings.archive_policy {
            self.prune_archives(vm, policy, now, progress);
        }

        Ok(Some(()))
    }

    fn take_snapshot(&self, vm: &VmIdentity, taken_at: DateTime<Utc>) -> GatewayResult<Snapshot> {
        if !self.settings.stateful {
            return self.gateway.create_snapshot(vm, taken_at, false);
        }
        match self.gateway.create_snapshot(vm, taken_at, true) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                warn!(error = %e, "stateful snapshot failed, retrying stateless");
                self.gateway.create_snapshot(vm, taken_at, false)
            }
        }
    }

    fn export(&self, vm: &VmIdentity, snapshot: &Snapshot) -> Result<ExportArtifact, BackupError> {
        let dir = artifact::vm_dir(&self.settings.dest_dir, vm);
        ensure_dir(&dir)?;
        for stale in artifact::sweep_partials(&dir)? {
            warn!(path = %stale.display(), "removed partial archive from an interrupted run");
        }

        let exported = self.gateway.export_snapshot(vm, snapshot, &dir)?;
        if !exported.complete {
            return Err(BackupError::Internal(format!(
                "export of '{}' returned an incomplete archive",
                snapshot.name
            )));
        }
        Ok(exported)
    }

    fn prune_snapshots(
        &self,
        vm: &VmIdentity,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        progress: &mut Progress,
    ) -> Result<(), BackupError> {
        let snapshots = self.gateway.list_snapshots(vm)?;
        let selection = retention::select(&snapshots, policy, now);
        debug!(
            keep = selection.keep.len(),
            delete = selection.delete.len(),
            floor_applied = selection.floor_applied,
            "snapshot retention decided"
        );
        if selection.floor_applied {
            info!("all snapshots past the age bound, keeping the newest");
        }

        for snapshot in &selection.delete {
            match self.gateway.delete_snapshot(vm, snapshot) {
                Ok(()) => {
                    info!(snapshot = %snapshot.name, created_at = %snapshot.created_at, "deleted snapshot");
                    progress.metrics.snapshots_deleted += 1;
                }
                Err(e) => {
                    error!(snapshot = %snapshot.name, error = %e, "failed to delete snapshot");
                    progress
                        .problems
                        .push(format!("delete snapshot '{}': {e}", snapshot.name));
                }
            }
        }
        Ok(())
    }

    fn prune_archives(
        &self,
        vm: &VmIdentity,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        progress: &mut Progress,
    ) {
        let dir = artifact::vm_dir(&self.settings.dest_dir, vm);
        let archives = match artifact::scan_completed(&dir, vm) {
            Ok(archives) => archives,
            Err(e) => {
                error!(error = %e, "failed to scan archives");
                progress.problems.push(format!("scan archives: {e}"));
                return;
            }
        };

        let selection = retention::select(&archives, policy, now);
        for stored in &selection.delete {
            match fs::remove_file(&stored.path) {
                Ok(()) => {
                    info!(path = %stored.path.display(), size = stored.size_bytes, "removed archive");
                    progress.metrics.archives_pruned += 1;
                }
                Err(e) => {
                    error!(path = %stored.path.display(), error = %e, "failed to remove archive");
                    progress
                        .problems
                        .push(format!("remove archive '{}': {e}", stored.file_name));
                }
            }
        }
    }
}

fn ensure_dir(dir: &Path) -> Result<(), BackupError> {
    fs::create_dir_all(dir).map_err(|e| BackupError::filesystem(e, dir.to_string_lossy(), "create_dir_all"))
}
