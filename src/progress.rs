//! Per-execution progress accounting.
//!
//! A [`ProgressTracker`] is created once per job execution with the declared
//! number of lines and accumulates the per-line outcomes. It is never shared
//! between executions and requires no locking: exactly one worker drives it.
//!
//! Point-in-time [`ProgressSnapshot`]s are what get published for polling
//! collaborators and persisted as the job's final output.
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Counters for a single job execution.
///
/// For every call to [`ProgressTracker::attempt`] the caller is expected to
/// call exactly one of [`ProgressTracker::success`],
/// [`ProgressTracker::skip`], or [`ProgressTracker::fail`]. The pairing is
/// not enforced; violating it breaks the `attempted == succeeded + skipped +
/// failed` property of the produced snapshots.
#[derive(Debug)]
pub struct ProgressTracker {
    action: String,
    total: usize,
    attempted: usize,
    succeeded: usize,
    skipped: usize,
    failed: usize,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(action: impl Into<String>, total: usize) -> Self {
        Self {
            action: action.into(),
            total,
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            started: Instant::now(),
        }
    }

    pub fn attempt(&mut self) {
        self.attempted += 1;
    }

    pub fn success(&mut self) {
        self.succeeded += 1;
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn fail(&mut self) {
        self.failed += 1;
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_with(Default::default())
    }

    /// Produces a snapshot carrying additional operation-specific fields.
    ///
    /// The extra entries are flattened into the serialized snapshot next to
    /// the standard counters.
    pub fn snapshot_with(
        &self,
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> ProgressSnapshot {
        ProgressSnapshot {
            action: self.action.clone(),
            total: self.total,
            attempted: self.attempted,
            succeeded: self.succeeded,
            skipped: self.skipped,
            failed: self.failed,
            duration_ms: self.started.elapsed().as_millis() as u64,
            extra,
        }
    }
}

/// A point-in-time view of a job execution's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub action: String,
    pub total: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration_ms: u64,
    #[serde(flatten, default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
