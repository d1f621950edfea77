//! Command gateway to the virtualization CLI.
//!
//! The [`Gateway`] trait is the only way the rest of the tool talks to the
//! virtualization system. Each operation is a single invocation of the
//! external tool whose output is parsed into typed values here, so no other
//! crate ever sees raw process output. Failures come back as
//! [`GatewayError`]s; retrying is the caller's business.

// Standard library
use std::path::Path;

// External crates
use chrono::{DateTime, Utc};

// Re-export common types for convenience
pub use backup_core::error::{GatewayError, GatewayErrorKind, GatewayResult};
pub use backup_core::{ExportArtifact, Snapshot, VmIdentity};
pub use incus::IncusGateway;

pub mod incus;

// When the `test-helpers` feature is enabled, include the mock gateway.
#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

/// Typed operations over the virtualization CLI.
pub trait Gateway: Send + Sync {
    /// Get the name of the gateway (e.g., "incus").
    fn name(&self) -> &'static str;

    /// Verify the tool can be invoked at all. Runs no tool command.
    fn check_available(&self) -> backup_core::Result<()>;

    /// List every instance known to the virtualization system.
    fn list_instances(&self) -> GatewayResult<Vec<VmIdentity>>;

    /// Take a snapshot named after `taken_at`.
    fn create_snapshot(
        &self,
        vm: &VmIdentity,
        taken_at: DateTime<Utc>,
        stateful: bool,
    ) -> GatewayResult<Snapshot>;

    /// List the VM's snapshots in the order the tool reports them.
    fn list_snapshots(&self, vm: &VmIdentity) -> GatewayResult<Vec<Snapshot>>;

    fn delete_snapshot(&self, vm: &VmIdentity, snapshot: &Snapshot) -> GatewayResult<()>;

    /// Export `snapshot` as an archive inside `dest_dir`.
    ///
    /// The returned artifact is always complete: the archive has been flushed
    /// and carries its final name.
    fn export_snapshot(
        &self,
        vm: &VmIdentity,
        snapshot: &Snapshot,
        dest_dir: &Path,
    ) -> GatewayResult<ExportArtifact>;
}
