use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{
    backend::{Backend, BackendError},
    daily::BatchKey,
    job::{builder::JobBuilder, JobId},
    line::{LineTarget, LineTargetId},
    progress::ProgressSnapshot,
};

pub mod lines;

pub use lines::{fields, LineDecision, LineHandler, LineProcessor, Locale};

/// A bulk operation: registers students, masks personal data, sends
/// reminder mail, aggregates nightly scores, and so on.
///
/// Workers are constructed with their collaborators (mail transport, status
/// guard, domain stores) and registered on the engine; the runner decodes the
/// job's declared input into [`JobWorker::Input`] and calls
/// [`JobWorker::run`]. Everything a worker needs from the engine comes
/// through the [`JobContext`].
///
/// A worker must catch its own per-line errors ([`LineProcessor`] does this
/// when used) so that a single bad line never aborts the batch. Errors
/// returned from `run` itself fail the whole job.
#[async_trait]
pub trait JobWorker: Send + Sync {
    /// The operation's typed input, decoded from the job's declared input at
    /// execution time.
    type Input: Send + Serialize + DeserializeOwned;
    /// The job type tag associating stored jobs with this worker.
    ///
    /// This should be unique across all workers registered on a backend.
    const KIND: &'static str;
    /// The label carried on progress snapshots.
    const ACTION: &'static str;

    async fn run<B>(
        &self,
        ctx: &JobContext<B>,
        input: Self::Input,
    ) -> Result<ProgressSnapshot, WorkerError>
    where
        B: Backend + Send + Sync + 'static;

    fn builder() -> JobBuilder<Self>
    where
        Self: Sized,
    {
        Default::default()
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub struct WorkerIdentifier(&'static str);

impl From<&'static str> for WorkerIdentifier {
    fn from(value: &'static str) -> Self {
        Self(value)
    }
}

impl WorkerIdentifier {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::ops::Deref for WorkerIdentifier {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

/// The engine facilities available to a running worker.
pub struct JobContext<B> {
    backend: B,
    job_id: JobId,
    action: &'static str,
    locale: Locale,
}

impl<B> JobContext<B>
where
    B: Backend + Send + Sync,
{
    pub(crate) fn new(backend: B, job_id: JobId, action: &'static str, locale: Locale) -> Self {
        Self {
            backend,
            job_id,
            action,
            locale,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn action(&self) -> &'static str {
        self.action
    }

    pub fn locale(&self) -> Locale {
        self.locale
    }

    /// The job's line targets, in creation order.
    pub async fn line_targets(&self) -> Result<Vec<LineTarget>, WorkerError> {
        Ok(self.backend.line_targets(self.job_id).await?)
    }

    pub async fn record_line_result(
        &self,
        id: LineTargetId,
        message: Option<String>,
        completed: bool,
    ) -> Result<(), WorkerError> {
        Ok(self
            .backend
            .record_line_result(id, message, completed)
            .await?)
    }

    /// Pushes a progress snapshot for polling readers.
    pub async fn publish_progress(&self, snapshot: ProgressSnapshot) -> Result<(), WorkerError> {
        Ok(self.backend.publish_progress(self.job_id, snapshot).await?)
    }
}

/// Errors a worker can fail a whole job with.
///
/// Per-line problems are never reported through this type; they are recorded
/// on the individual line target and counted, and the job keeps going.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The declared input is missing a field this operation requires.
    #[error("required input field `{0}` is missing")]
    MissingInput(&'static str),
    /// The declared input references a context that has changed since the
    /// form was rendered (stale submission).
    #[error("stale {field}: declared {declared} but resolved {resolved}")]
    ContextConflict {
        field: &'static str,
        declared: String,
        resolved: String,
    },
    /// A dependency's daily batch has not finished successfully today.
    #[error("upstream batch for {0} has not finished today")]
    UpstreamNotFinished(BatchKey),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl WorkerError {
    /// Stable classification string persisted in the failure descriptor.
    pub fn error_type(&self) -> &'static str {
        match self {
            WorkerError::MissingInput(_) => "missing_input",
            WorkerError::ContextConflict { .. } => "context_conflict",
            WorkerError::UpstreamNotFinished(_) => "upstream_not_finished",
            WorkerError::Backend(_) => "backend",
            WorkerError::Other(_) => "worker",
        }
    }

    pub fn other(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        WorkerError::Other(error.into())
    }
}
