//! Data model shared by the gateway, the retention engine and the orchestrator.

use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp layout embedded in snapshot and archive names (ISO 8601 basic, UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Render a timestamp the way it appears inside generated names.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp produced by [`format_timestamp`].
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Name of a virtual machine as known to the virtualization system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmIdentity(String);

impl VmIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for VmIdentity {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VmIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VmIdentity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A point-in-time snapshot owned by a VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snapshot {
    pub vm: VmIdentity,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(vm: VmIdentity, name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            vm,
            name: name.into(),
            created_at,
        }
    }

    /// Deterministic snapshot name for a snapshot taken at `taken_at`.
    pub fn name_for(prefix: &str, taken_at: DateTime<Utc>) -> String {
        format!("{}{}", prefix, format_timestamp(taken_at))
    }
}

/// How many snapshots (or archives) may survive, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,
}

impl RetentionPolicy {
    pub fn new(max_count: usize, max_age_days: Option<u32>) -> Self {
        Self {
            max_count,
            max_age_days,
        }
    }

    /// Oldest creation time that still satisfies the age bound.
    ///
    /// An age reaching past the earliest representable time bounds nothing,
    /// so it yields `None` like an absent bound.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let days = self.max_age_days?;
        TimeDelta::try_days(i64::from(days)).and_then(|age| now.checked_sub_signed(age))
    }
}

impl Display for RetentionPolicy {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.max_age_days {
            Some(days) => write!(f, "keep {} newest, max age {}d", self.max_count, days),
            None => write!(f, "keep {} newest", self.max_count),
        }
    }
}

/// An archive produced by exporting a snapshot.
///
/// `complete` is only set once the tool reported success and the file was
/// flushed and moved to its final name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub snapshot: Snapshot,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration: Duration,
    pub complete: bool,
}

/// A completed archive found on disk while pruning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub vm: VmIdentity,
    pub path: PathBuf,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn snapshot_names_sort_like_their_timestamps() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();

        let a = Snapshot::name_for("snapshot-", earlier);
        let b = Snapshot::name_for("snapshot-", later);

        assert_eq!(a, "snapshot-20260109T235959Z");
        assert!(a < b);
    }

    #[test]
    fn timestamp_round_trips_through_name_format() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 4, 5, 6).unwrap();
        assert_eq!(parse_timestamp(&format_timestamp(at)), Some(at));
        assert_eq!(parse_timestamp("2026-10-19"), None);
    }

    #[test]
    fn cutoff_is_relative_to_now() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap();
        let policy = RetentionPolicy::new(3, Some(7));
        assert_eq!(
            policy.cutoff(now),
            Some(Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap())
        );
        assert_eq!(RetentionPolicy::new(3, None).cutoff(now), None);
    }

    #[test]
    fn cutoff_beyond_the_calendar_means_no_age_bound() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap();
        assert_eq!(RetentionPolicy::new(3, Some(200_000_000)).cutoff(now), None);
        assert_eq!(RetentionPolicy::new(3, Some(u32::MAX)).cutoff(now), None);
    }

    #[test]
    fn vm_identity_serializes_as_plain_string() {
        let vm = VmIdentity::new("web1");
        assert_eq!(serde_json::to_string(&vm).unwrap(), "\"web1\"");
        assert_eq!(vm.to_string(), "web1");
    }
}
