//! Backup engine: retention decisions, per-VM orchestration and run control.
//!
//! Data flows one way: [`RunController`] resolves targets and hands each one
//! to an [`Orchestrator`], which drives the gateway, asks [`retention`] what
//! to delete and reports into a shared [`MetricsRecorder`].

pub mod cancel;
pub mod controller;
pub mod metrics;
pub mod orchestrator;
pub mod retention;

pub use cancel::CancellationFlag;
pub use controller::{
    RunController, RunLock, RunOutcome, EXIT_CONFIG_ERROR, EXIT_SUCCESS, EXIT_VM_FAILURE,
};
pub use metrics::{MetricsRecorder, MetricsSummary, VmMetrics};
pub use orchestrator::{Clock, Orchestrator, OrchestratorSettings, RunResult, VmOutcome, VmState};
pub use retention::{select, Retainable, Selection};
