//! In-memory gateway for tests.
//!
//! Keeps a snapshot table per VM, records every call, and can be told to fail
//! specific operations. Exports write real files through the same
//! staging-then-finalize path as [`IncusGateway`](crate::IncusGateway).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backup_core::artifact::{self, Compression};
use backup_core::error::{BackupError, GatewayError, GatewayErrorKind, GatewayResult};
use backup_core::{ExportArtifact, Snapshot, VmIdentity};
use chrono::{DateTime, Utc};

use crate::Gateway;

/// Gateway operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListInstances,
    CreateSnapshot,
    ListSnapshots,
    DeleteSnapshot,
    ExportSnapshot,
}

/// One recorded tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    ListInstances,
    CreateSnapshot {
        vm: VmIdentity,
        name: String,
        stateful: bool,
    },
    ListSnapshots {
        vm: VmIdentity,
    },
    DeleteSnapshot {
        vm: VmIdentity,
        name: String,
    },
    ExportSnapshot {
        vm: VmIdentity,
        name: String,
    },
}

/// Callback run after an operation succeeded.
#[derive(Clone)]
struct Hook(Arc<dyn Fn() + Send + Sync>);

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hook")
    }
}

#[derive(Debug, Default)]
struct MockState {
    instances: Vec<VmIdentity>,
    snapshots: HashMap<VmIdentity, Vec<Snapshot>>,
    failures: HashMap<(Operation, VmIdentity), GatewayErrorKind>,
    failing_deletes: HashMap<(VmIdentity, String), GatewayErrorKind>,
    stateless_only: HashSet<VmIdentity>,
    hooks: HashMap<(Operation, VmIdentity), Hook>,
    calls: Vec<GatewayCall>,
}

#[derive(Debug)]
pub struct MockGateway {
    snapshot_prefix: String,
    compression: Compression,
    available: bool,
    archive_bytes: Vec<u8>,
    export_duration: Duration,
    state: Mutex<MockState>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            snapshot_prefix: "snapshot-".to_string(),
            compression: Compression::Gzip,
            available: true,
            archive_bytes: b"mock archive".to_vec(),
            export_duration: Duration::from_millis(500),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `check_available` fail as if the tool were missing.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_export_duration(mut self, duration: Duration) -> Self {
        self.export_duration = duration;
        self
    }

    pub fn with_instances(self, names: &[&str]) -> Self {
        self.state().instances = names.iter().map(|n| VmIdentity::new(*n)).collect();
        self
    }

    pub fn with_snapshots(self, vm: &str, snapshots: Vec<Snapshot>) -> Self {
        self.state()
            .snapshots
            .insert(VmIdentity::new(vm), snapshots);
        self
    }

    /// Fail every `operation` targeting `vm` with `kind`.
    pub fn fail(self, operation: Operation, vm: &str, kind: GatewayErrorKind) -> Self {
        self.state()
            .failures
            .insert((operation, VmIdentity::new(vm)), kind);
        self
    }

    /// Fail the deletion of one particular snapshot.
    pub fn fail_delete_of(self, vm: &str, snapshot: &str, kind: GatewayErrorKind) -> Self {
        self.state()
            .failing_deletes
            .insert((VmIdentity::new(vm), snapshot.to_string()), kind);
        self
    }

    /// Reject stateful snapshots of `vm` while still accepting stateless ones.
    pub fn stateless_only(self, vm: &str) -> Self {
        self.state().stateless_only.insert(VmIdentity::new(vm));
        self
    }

    /// Run `hook` each time `operation` on `vm` succeeds, before the result
    /// is returned to the caller.
    pub fn on_success(
        self,
        operation: Operation,
        vm: &str,
        hook: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.state()
            .hooks
            .insert((operation, VmIdentity::new(vm)), Hook(Arc::new(hook)));
        self
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Current snapshots of `vm`, in insertion order.
    pub fn snapshots(&self, vm: &str) -> Vec<Snapshot> {
        self.state()
            .snapshots
            .get(&VmIdentity::new(vm))
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, call: GatewayCall, operation: Operation, vm: Option<&VmIdentity>) -> GatewayResult<()> {
        let mut state = self.state();
        state.calls.push(call);
        if let Some(vm) = vm {
            if let Some(kind) = state.failures.get(&(operation, vm.clone())) {
                return Err(GatewayError::new(
                    *kind,
                    format!("mock {operation:?} failure for {vm}"),
                ));
            }
        }
        Ok(())
    }

    fn succeeded(&self, operation: Operation, vm: &VmIdentity) {
        // Cloned out so the hook runs without the state lock held.
        let hook = self.state().hooks.get(&(operation, vm.clone())).cloned();
        if let Some(Hook(hook)) = hook {
            hook();
        }
    }
}

impl Gateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn check_available(&self) -> backup_core::Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(BackupError::config("'mock' was not found in PATH"))
        }
    }

    fn list_instances(&self) -> GatewayResult<Vec<VmIdentity>> {
        let mut state = self.state();
        state.calls.push(GatewayCall::ListInstances);
        if let Some((_, kind)) = state
            .failures
            .iter()
            .find(|((op, _), _)| *op == Operation::ListInstances)
        {
            return Err(GatewayError::new(*kind, "mock ListInstances failure"));
        }
        Ok(state.instances.clone())
    }

    fn create_snapshot(
        &self,
        vm: &VmIdentity,
        taken_at: DateTime<Utc>,
        stateful: bool,
    ) -> GatewayResult<Snapshot> {
        let name = Snapshot::name_for(&self.snapshot_prefix, taken_at);
        self.record(
            GatewayCall::CreateSnapshot {
                vm: vm.clone(),
                name: name.clone(),
                stateful,
            },
            Operation::CreateSnapshot,
            Some(vm),
        )?;

        {
            let mut state = self.state();
            if stateful && state.stateless_only.contains(vm) {
                return Err(GatewayError::unknown(
                    "Error: Stateful snapshot requires migration.stateful to be set to true",
                ));
            }
            let existing = state.snapshots.entry(vm.clone()).or_default();
            if existing.iter().any(|s| s.name == name) {
                return Err(GatewayError::unknown(format!(
                    "Error: Snapshot '{name}' already exists"
                )));
            }
            existing.push(Snapshot::new(vm.clone(), name.clone(), taken_at));
        }
        self.succeeded(Operation::CreateSnapshot, vm);
        Ok(Snapshot::new(vm.clone(), name, taken_at))
    }

    fn list_snapshots(&self, vm: &VmIdentity) -> GatewayResult<Vec<Snapshot>> {
        self.record(
            GatewayCall::ListSnapshots { vm: vm.clone() },
            Operation::ListSnapshots,
            Some(vm),
        )?;
        Ok(self.state().snapshots.get(vm).cloned().unwrap_or_default())
    }

    fn delete_snapshot(&self, vm: &VmIdentity, snapshot: &Snapshot) -> GatewayResult<()> {
        self.record(
            GatewayCall::DeleteSnapshot {
                vm: vm.clone(),
                name: snapshot.name.clone(),
            },
            Operation::DeleteSnapshot,
            Some(vm),
        )?;

        let mut state = self.state();
        if let Some(kind) = state
            .failing_deletes
            .get(&(vm.clone(), snapshot.name.clone()))
        {
            return Err(GatewayError::new(
                *kind,
                format!("Error: cannot delete snapshot '{}'", snapshot.name),
            ));
        }
        let Some(existing) = state.snapshots.get_mut(vm) else {
            return Err(GatewayError::new(GatewayErrorKind::NotFound, "Error: Instance not found"));
        };
        let before = existing.len();
        existing.retain(|s| s.name != snapshot.name);
        if existing.len() == before {
            return Err(GatewayError::new(
                GatewayErrorKind::NotFound,
                format!("Error: Snapshot '{}' not found", snapshot.name),
            ));
        }
        Ok(())
    }

    fn export_snapshot(
        &self,
        vm: &VmIdentity,
        snapshot: &Snapshot,
        dest_dir: &Path,
    ) -> GatewayResult<ExportArtifact> {
        self.record(
            GatewayCall::ExportSnapshot {
                vm: vm.clone(),
                name: snapshot.name.clone(),
            },
            Operation::ExportSnapshot,
            Some(vm),
        )?;

        let final_path = dest_dir.join(artifact::archive_file_name(
            vm,
            snapshot.created_at,
            self.compression,
        ));
        if final_path.exists() {
            return Err(GatewayError::unknown(format!(
                "archive '{}' already exists",
                final_path.display()
            )));
        }
        let staging = artifact::staging_path(&final_path);
        fs::write(&staging, &self.archive_bytes)
            .map_err(|e| GatewayError::from_io(&e, "mock export"))?;
        let size_bytes = artifact::finalize(&staging, &final_path)
            .map_err(|e| GatewayError::unknown(e.to_string()))?;
        self.succeeded(Operation::ExportSnapshot, vm);

        Ok(ExportArtifact {
            snapshot: snapshot.clone(),
            path: final_path,
            size_bytes,
            duration: self.export_duration,
            complete: true,
        })
    }
}
