use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::progress::ProgressSnapshot;

pub mod builder;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// A persisted record of one submitted bulk job.
///
/// Created by the submitting operation, exclusively mutated by the runner
/// while it executes, and read by polling collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    /// Job type tag; matches a registered worker's `KIND`.
    pub kind: String,
    /// Derived from the job kind and target key at submission; a second
    /// submission with the same key is rejected while this job is live.
    pub dedup_key: Option<i64>,
    /// Opaque declared input, decoded into the worker's typed input at
    /// execution time.
    pub input: serde_json::Value,
    pub state: JobState,
    /// Last published progress while running, final snapshot on success, or
    /// the failure descriptor. Same shape for polling and audit.
    pub output: Option<JobOutput>,
    pub inserted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobState {
    Queuing,
    InProgress,
    Success,
    Failure,
}

impl JobState {
    /// A live job occupies its dedup key; terminal jobs release it.
    pub fn is_live(&self) -> bool {
        matches!(self, JobState::Queuing | JobState::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Progress(ProgressSnapshot),
    Failure(FailureInfo),
}

impl JobOutput {
    pub fn progress(&self) -> Option<&ProgressSnapshot> {
        match self {
            JobOutput::Progress(snapshot) => Some(snapshot),
            JobOutput::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureInfo> {
        match self {
            JobOutput::Progress(_) => None,
            JobOutput::Failure(failure) => Some(failure),
        }
    }
}

/// The persisted descriptor of a failed job.
///
/// The combined size of the fields is bounded by [`FailureInfo::MAX_BYTES`]:
/// when over budget the detail is dropped entirely before the message is
/// truncated, so the headline error always survives.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub error_type: String,
    pub message: String,
    /// Error source chain or panic context, when available.
    pub detail: Option<String>,
}

impl FailureInfo {
    pub const MAX_BYTES: usize = 1024;

    pub fn new(
        error_type: impl Into<String>,
        message: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        let error_type = error_type.into();
        let mut message = message.into();
        let mut detail = detail;

        let budget = Self::MAX_BYTES.saturating_sub(error_type.len());
        if message.len() + detail.as_ref().map_or(0, String::len) > budget {
            detail = None;
        }
        if message.len() > budget {
            message = truncate_to_boundary(message, budget);
        }

        Self {
            error_type,
            message,
            detail,
        }
    }
}

fn truncate_to_boundary(mut value: String, max: usize) -> String {
    let mut end = max;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
    value
}
