use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::{
    job::{FailureInfo, JobId, JobRecord},
    line::{LineTarget, LineTargetId},
    progress::ProgressSnapshot,
    worker::WorkerIdentifier,
};

pub mod memory;

/// The persistence seam for job records and line targets.
///
/// [`memory::InMemoryBackend`] is the provided implementation; a database
/// backed implementation plugs in here without touching the engine.
#[async_trait]
pub trait Backend: Clone {
    /// Streams jobs of the given kind as they become ready to execute, in
    /// creation order. Each job is delivered to exactly one subscriber.
    async fn subscribe_queued_jobs(
        &self,
        kind: WorkerIdentifier,
    ) -> Pin<Box<dyn Stream<Item = Result<JobRecord, BackendError>> + Send>>;
    /// Persists the job record and its line targets together.
    ///
    /// Fails with [`BackendError::DuplicateJob`] if a live job with the same
    /// dedup key already exists.
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError>;
    async fn load_job(&self, id: JobId) -> Result<Option<JobRecord>, BackendError>;
    async fn mark_job_in_progress(&self, id: JobId) -> Result<(), BackendError>;
    async fn mark_job_succeeded(
        &self,
        id: JobId,
        snapshot: ProgressSnapshot,
    ) -> Result<(), BackendError>;
    async fn mark_job_failed(&self, id: JobId, failure: FailureInfo) -> Result<(), BackendError>;
    /// Stores an intermediate progress snapshot for polling readers.
    async fn publish_progress(
        &self,
        id: JobId,
        snapshot: ProgressSnapshot,
    ) -> Result<(), BackendError>;
    /// Returns the job's line targets in creation order.
    async fn line_targets(&self, job_id: JobId) -> Result<Vec<LineTarget>, BackendError>;
    async fn record_line_result(
        &self,
        id: LineTargetId,
        message: Option<String>,
        completed: bool,
    ) -> Result<(), BackendError>;
}

pub struct EnqueuableJob {
    pub kind: String,
    pub input: serde_json::Value,
    pub dedup_key: Option<i64>,
    pub lines: Vec<String>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("system in bad state")]
    BadState,
    #[error("no job found with id {0}")]
    JobNotFound(JobId),
    #[error("no line target found with id {0}")]
    LineTargetNotFound(LineTargetId),
    #[error("a live job with the same dedup key already exists: {existing}")]
    DuplicateJob { existing: JobId },
}
