use std::fmt::Display;

use chrono::{DateTime, Utc};

use crate::job::JobId;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct LineTargetId(i64);

impl From<i64> for LineTargetId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<LineTargetId> for i64 {
    fn from(value: LineTargetId) -> Self {
        value.0
    }
}

impl Display for LineTargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LineTargetId({})", self.0)
    }
}

/// One unit of per-record work within a job: a CSV row, or the textual key
/// of an existing domain record being acted on.
///
/// Created in bulk at submission time, mutated once per processing attempt,
/// and never deleted by the engine. `completed` records that a terminal
/// per-line decision (success, skip, or fail) was made; it stays false when
/// an unexpected error was caught at the line boundary, which lets an
/// operator audit and re-drive exactly those rows.
#[derive(Debug, Clone, PartialEq)]
pub struct LineTarget {
    pub id: LineTargetId,
    pub job_id: JobId,
    pub raw: String,
    pub message: Option<String>,
    pub completed: bool,
    pub inserted_at: DateTime<Utc>,
}
