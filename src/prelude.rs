//! The purpose of this module is to alleviate the need to import many of the
//! `[rosterbatch]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use rosterbatch::prelude::*;
//! ```
pub use crate::backend::Backend;
pub use crate::daily::{BatchCounts, BatchKey, DailyOutcome, DailyStatusGuard};
pub use crate::job::{JobId, JobOutput, JobRecord, JobState};
pub use crate::line::{LineTarget, LineTargetId};
pub use crate::progress::{ProgressSnapshot, ProgressTracker};
pub use crate::runner::{ExecutionContext, JobRunner};
pub use crate::worker::{
    fields, JobContext, JobWorker, LineDecision, LineHandler, LineProcessor, Locale, WorkerError,
};
pub use crate::Rosterbatch;
