//! Export and pruning metrics.

use std::fmt::{self, Display, Formatter};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use backup_core::VmIdentity;
use indexmap::IndexMap;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Metrics collected for one VM.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmMetrics {
    pub export_duration: Duration,
    pub export_bytes: u64,
    pub snapshots_deleted: usize,
    pub archives_pruned: usize,
}

impl VmMetrics {
    /// Bytes per second, or `None` when the export took no measurable time.
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.export_duration.as_secs_f64();
        if secs > 0.0 {
            Some(self.export_bytes as f64 / secs)
        } else {
            None
        }
    }
}

/// Collects metrics from concurrently running orchestrations.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    entries: Mutex<IndexMap<VmIdentity, VmMetrics>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `metrics` into whatever was already recorded for `vm`.
    pub fn record(&self, vm: &VmIdentity, metrics: &VmMetrics) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(vm.clone()).or_default();
        entry.export_duration += metrics.export_duration;
        entry.export_bytes += metrics.export_bytes;
        entry.snapshots_deleted += metrics.snapshots_deleted;
        entry.archives_pruned += metrics.archives_pruned;
    }

    /// Consume the recorder and freeze what it saw.
    pub fn finalize(self) -> MetricsSummary {
        let per_vm = self
            .entries
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        MetricsSummary { per_vm }
    }
}

/// Immutable metrics for a finished run, in recording order.
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    per_vm: IndexMap<VmIdentity, VmMetrics>,
}

impl MetricsSummary {
    pub fn get(&self, vm: &VmIdentity) -> Option<&VmMetrics> {
        self.per_vm.get(vm)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VmIdentity, &VmMetrics)> {
        self.per_vm.iter()
    }

    pub fn len(&self) -> usize {
        self.per_vm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_vm.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.per_vm.values().map(|m| m.export_bytes).sum()
    }

    pub fn total_export_duration(&self) -> Duration {
        self.per_vm.values().map(|m| m.export_duration).sum()
    }

    pub fn total_snapshots_deleted(&self) -> usize {
        self.per_vm.values().map(|m| m.snapshots_deleted).sum()
    }

    pub fn total_archives_pruned(&self) -> usize {
        self.per_vm.values().map(|m| m.archives_pruned).sum()
    }
}

/// Human-readable rendering of an export: size in MB, seconds and MB/s.
pub struct ExportReport<'a>(pub &'a VmMetrics);

impl Display for ExportReport<'_> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let metrics = self.0;
        write!(
            f,
            "{:.2} MB in {:.1}s",
            metrics.export_bytes as f64 / BYTES_PER_MB,
            metrics.export_duration.as_secs_f64()
        )?;
        match metrics.throughput() {
            Some(rate) => write!(f, " ({:.2} MB/s)", rate / BYTES_PER_MB),
            None => write!(f, " (N/A)"),
        }
    }
}

impl Display for MetricsSummary {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for (vm, metrics) in &self.per_vm {
            writeln!(
                f,
                "{vm}: {}, {} snapshots deleted, {} archives pruned",
                ExportReport(metrics),
                metrics.snapshots_deleted,
                metrics.archives_pruned
            )?;
        }
        write!(
            f,
            "total: {:.2} MB exported in {:.1}s",
            self.total_bytes() as f64 / BYTES_PER_MB,
            self.total_export_duration().as_secs_f64()
        )
    }
}
