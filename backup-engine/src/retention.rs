//! Retention policy engine.
//!
//! [`select`] decides which snapshots or archives survive. It is a pure
//! function of its inputs: the current time is a parameter, nothing is read
//! from the clock or the tool.

use std::cmp::Ordering;

use backup_core::{BackupError, RetentionPolicy, Snapshot, StoredArtifact};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Anything retention can rank: a creation time plus a name for tie-breaking.
pub trait Retainable: Clone {
    fn created_at(&self) -> DateTime<Utc>;
    fn name(&self) -> &str;
}

impl Retainable for Snapshot {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Retainable for StoredArtifact {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn name(&self) -> &str {
        &self.file_name
    }
}

/// Result of applying a policy. `keep` and `delete` are both newest first and
/// together hold every input item exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection<T> {
    pub keep: Vec<T>,
    pub delete: Vec<T>,
    /// Set when the minimum-retain floor overrode the policy.
    pub floor_applied: bool,
}

impl<T> Selection<T> {
    fn empty() -> Self {
        Self {
            keep: Vec::new(),
            delete: Vec::new(),
            floor_applied: false,
        }
    }
}

/// Newest first; equal timestamps fall back to name, descending.
pub fn newest_first<T: Retainable>(a: &T, b: &T) -> Ordering {
    b.created_at()
        .cmp(&a.created_at())
        .then_with(|| b.name().cmp(a.name()))
}

/// Split `items` into the ones `policy` keeps and the ones it deletes.
///
/// The age bound is applied first, then the count bound. At least one item
/// always survives when `items` is non-empty.
pub fn select<T: Retainable>(
    items: &[T],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Selection<T> {
    if items.is_empty() {
        return Selection::empty();
    }

    let mut sorted = items.to_vec();
    sorted.sort_by(newest_first);

    let mut floor_applied = false;
    let (mut keep, mut delete): (Vec<T>, Vec<T>) = match policy.cutoff(now) {
        Some(cutoff) => sorted.into_iter().partition(|item| item.created_at() >= cutoff),
        None => (sorted, Vec::new()),
    };

    if keep.is_empty() {
        // Everything is past the age bound; hold on to the newest one.
        keep.push(delete.remove(0));
        floor_applied = true;
    }

    if keep.len() > policy.max_count {
        let excess = keep.split_off(policy.max_count);
        delete.extend(excess);
    }

    if keep.is_empty() {
        let violation = BackupError::PolicyViolation(format!(
            "policy '{policy}' would delete all {} items",
            items.len()
        ));
        warn!(error = %violation, "keeping newest item");
        delete.sort_by(newest_first);
        keep.push(delete.remove(0));
        floor_applied = true;
    }

    delete.sort_by(newest_first);
    Selection {
        keep,
        delete,
        floor_applied,
    }
}
