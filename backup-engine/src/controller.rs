//! Run controller: preflight, target resolution, scheduling and the final tally.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use backup_config::{validate_vm_name, BackupConfig, VmTarget};
use backup_core::system_check::ensure_writable_dir;
use backup_core::{BackupError, Result};
use backup_gateway::Gateway;
use fs2::FileExt;
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationFlag;
use crate::metrics::{ExportReport, MetricsRecorder, MetricsSummary};
use crate::orchestrator::{Clock, Orchestrator, OrchestratorSettings, RunResult, VmOutcome};

pub const LOCK_FILE_NAME: &str = ".vm-backup.lock";

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_VM_FAILURE: i32 = 1;
pub const EXIT_CONFIG_ERROR: i32 = 2;

/// Exclusive hold on the destination for the lifetime of a run.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(dest_dir: &Path) -> Result<Self> {
        let path = dest_dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| BackupError::config(format!("cannot open lock file '{}': {e}", path.display())))?;

        file.try_lock_exclusive().map_err(|_| {
            BackupError::config(format!(
                "another backup run holds '{}'",
                path.display()
            ))
        })?;
        debug!(path = %path.display(), "run lock acquired");
        Ok(Self { file, path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// One entry per target, in target order.
    pub results: Vec<RunResult>,
    pub summary: MetricsSummary,
}

impl RunOutcome {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed() == 0 {
            EXIT_SUCCESS
        } else {
            EXIT_VM_FAILURE
        }
    }
}

pub struct RunController<'a> {
    config: &'a BackupConfig,
    gateway: &'a dyn Gateway,
    cancel: CancellationFlag,
    clock: Option<Clock>,
}

impl<'a> RunController<'a> {
    pub fn new(config: &'a BackupConfig, gateway: &'a dyn Gateway, cancel: CancellationFlag) -> Self {
        Self {
            config,
            gateway,
            cancel,
            clock: None,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Back up every target.
    ///
    /// An `Err` is always a configuration or environment problem found
    /// before any VM was touched. Per-VM failures live in the outcome.
    pub fn run(&self) -> Result<RunOutcome> {
        self.preflight()?;
        let _lock = RunLock::acquire(&self.config.dest_dir)?;
        let targets = self.resolve_targets()?;
        info!(
            vms = targets.len(),
            concurrency = self.config.concurrency,
            dest = %self.config.dest_dir.display(),
            "starting backup run"
        );

        let settings = OrchestratorSettings::from_config(self.config);
        let recorder = MetricsRecorder::new();
        let results = self.process(&targets, &settings, &recorder)?;

        let outcome = RunOutcome {
            results,
            summary: recorder.finalize(),
        };
        log_summary(&outcome);
        Ok(outcome)
    }

    fn preflight(&self) -> Result<()> {
        ensure_writable_dir(&self.config.dest_dir)?;
        self.gateway.check_available()?;
        Ok(())
    }

    fn resolve_targets(&self) -> Result<Vec<VmTarget>> {
        let configured = self.config.targets();
        if !configured.is_empty() {
            return Ok(configured);
        }

        info!("no VMs configured, discovering instances");
        let discovered = self
            .gateway
            .list_instances()
            .map_err(|e| BackupError::config(format!("VM discovery failed: {e}")))?;

        let targets: Vec<VmTarget> = discovered
            .into_iter()
            .filter(|vm| match validate_vm_name(vm.as_str()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(vm = %vm, error = %e, "skipping discovered instance");
                    false
                }
            })
            .map(|vm| self.config.discovered_target(vm))
            .collect();

        if targets.is_empty() {
            return Err(BackupError::config("no VMs configured and none discovered"));
        }
        Ok(targets)
    }

    fn process(
        &self,
        targets: &[VmTarget],
        settings: &OrchestratorSettings,
        recorder: &MetricsRecorder,
    ) -> Result<Vec<RunResult>> {
        let mut orchestrator = Orchestrator::new(self.gateway, settings, recorder, &self.cancel);
        if let Some(clock) = &self.clock {
            orchestrator = orchestrator.with_clock(clock.clone());
        }
        let run_one = |target: &VmTarget| {
            if self.cancel.is_cancelled() {
                info!(vm = %target.vm, "not started, run cancelled");
                RunResult::cancelled(target.vm.clone())
            } else {
                orchestrator.run(target)
            }
        };

        if self.config.concurrency <= 1 {
            return Ok(targets.iter().map(run_one).collect());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency)
            .thread_name(|i| format!("vm-backup-{i}"))
            .build()
            .map_err(|e| BackupError::Internal(format!("failed to start worker pool: {e}")))?;
        Ok(pool.install(|| targets.par_iter().map(run_one).collect()))
    }
}

fn log_summary(outcome: &RunOutcome) {
    for result in &outcome.results {
        match &result.outcome {
            VmOutcome::Succeeded => {
                info!(vm = %result.vm, "succeeded: {}", ExportReport(&result.metrics))
            }
            VmOutcome::PartiallyFailed { problems } => {
                warn!(vm = %result.vm, problems = problems.len(), "partially failed: {}", problems.join("; "))
            }
            VmOutcome::Failed { state, error } => {
                error!(vm = %result.vm, state = %state, error = %error, "failed")
            }
            VmOutcome::Cancelled => warn!(vm = %result.vm, "cancelled"),
        }
    }

    let summary = &outcome.summary;
    debug!("metrics breakdown:\n{summary}");
    info!(
        succeeded = outcome.succeeded(),
        failed = outcome.failed(),
        total_bytes = summary.total_bytes(),
        total_export_secs = summary.total_export_duration().as_secs_f64(),
        snapshots_deleted = summary.total_snapshots_deleted(),
        archives_pruned = summary.total_archives_pruned(),
        "backup run complete"
    );
}
