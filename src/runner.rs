use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{
    backend::{Backend, BackendError},
    job::{FailureInfo, JobId, JobRecord},
    progress::ProgressSnapshot,
    worker::{JobContext, JobWorker, Locale, WorkerError},
};

/// The identity the execution runtime reports for the run it is currently
/// performing.
///
/// Compared against the id recorded in the loaded job record to guard
/// against a stale or duplicate execution picking up a record meant for a
/// different run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    pub job_id: JobId,
}

impl From<JobId> for ExecutionContext {
    fn from(job_id: JobId) -> Self {
        Self { job_id }
    }
}

/// Loads a job record, runs the registered worker for it, and persists the
/// final outcome.
pub struct JobRunner<B, W> {
    backend: B,
    worker: Arc<W>,
    locale: Locale,
}

impl<B, W> JobRunner<B, W>
where
    B: Backend + Send + Sync + Clone + 'static,
    W: JobWorker + 'static,
    W::Input: Send + 'static,
{
    pub fn new(backend: B, worker: Arc<W>, locale: Locale) -> Self {
        Self {
            backend,
            worker,
            locale,
        }
    }

    /// Executes the job and returns its final snapshot.
    ///
    /// The record is marked in progress before the worker starts so polling
    /// readers see the transition immediately. Any error escaping the
    /// worker, including a panic, is captured into a bounded [`FailureInfo`] and
    /// persisted; this is the single place uncaught errors are made
    /// observable. Only a missing job record leaves nothing behind.
    #[instrument(skip(self, context), fields(job_id = %job_id))]
    pub async fn run_job(
        &self,
        job_id: JobId,
        context: ExecutionContext,
    ) -> Result<ProgressSnapshot, RunError> {
        let record = self
            .backend
            .load_job(job_id)
            .await?
            .ok_or(RunError::JobNotFound(job_id))?;

        self.backend.mark_job_in_progress(job_id).await?;

        match self.execute(record, context).await {
            Ok(snapshot) => {
                tracing::debug!(%job_id, "Job complete {job_id}");
                let _ = self
                    .backend
                    .mark_job_succeeded(job_id, snapshot.clone())
                    .await
                    .inspect_err(|err| {
                        tracing::error!(
                            ?err,
                            %job_id,
                            "Failed to mark job {job_id} as succeeded, error: {err:?}",
                        )
                    });
                Ok(snapshot)
            }
            Err(error) => {
                let failure = error.to_failure_info();
                tracing::error!(
                    %job_id,
                    ?error,
                    "Job {job_id} failed: error type: {}, message: {}",
                    failure.error_type,
                    failure.message
                );
                let _ = self
                    .backend
                    .mark_job_failed(job_id, failure)
                    .await
                    .inspect_err(|err| {
                        tracing::error!(
                            ?err,
                            %job_id,
                            "Failed to mark job {job_id} as failed, error: {err:?}",
                        )
                    });
                Err(error)
            }
        }
    }

    async fn execute(
        &self,
        record: JobRecord,
        context: ExecutionContext,
    ) -> Result<ProgressSnapshot, RunError> {
        let input: W::Input =
            serde_json::from_value(record.input).map_err(RunError::InvalidInput)?;
        if record.id != context.job_id {
            return Err(RunError::IdentityMismatch {
                recorded: record.id,
                current: context.job_id,
            });
        }

        let ctx = JobContext::new(self.backend.clone(), record.id, W::ACTION, self.locale);
        let worker = Arc::clone(&self.worker);
        let handle =
            tokio::spawn(async move { worker.run(&ctx, input).await }.in_current_span());
        match handle.await {
            Ok(result) => Ok(result?),
            Err(join_error) => Err(RunError::Panicked(panic_message(join_error))),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no job record found for {0}")]
    JobNotFound(JobId),
    #[error("job record {recorded} does not match execution context {current}")]
    IdentityMismatch { recorded: JobId, current: JobId },
    #[error("failed to decode job input")]
    InvalidInput(#[source] serde_json::Error),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RunError {
    fn error_type(&self) -> &'static str {
        match self {
            RunError::JobNotFound(_) => "job_not_found",
            RunError::IdentityMismatch { .. } => "identity_mismatch",
            RunError::InvalidInput(_) => "invalid_input",
            RunError::Worker(error) => error.error_type(),
            RunError::Panicked(_) => "panic",
            RunError::Backend(_) => "backend",
        }
    }

    fn to_failure_info(&self) -> FailureInfo {
        FailureInfo::new(self.error_type(), self.to_string(), source_chain(self))
    }
}

fn source_chain(error: &dyn std::error::Error) -> Option<String> {
    let mut parts = Vec::new();
    let mut source = error.source();
    while let Some(error) = source {
        parts.push(error.to_string());
        source = error.source();
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(": "))
    }
}

fn panic_message(value: JoinError) -> String {
    let msg = value.to_string();
    match value.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(msg),
        Err(_) => msg,
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        backend::memory::InMemoryBackend,
        job::{JobOutput, JobState},
        worker::test::{
            PanickingWorker, RegistrationInput, RegistrationWorker, RejectingWorker,
        },
        worker::JobWorker,
    };

    fn registration_input(history_id: Option<i64>) -> RegistrationInput {
        RegistrationInput {
            contract_id: 7,
            contract_code: "ACME".to_owned(),
            history_id,
        }
    }

    fn runner<W: JobWorker + 'static>(
        backend: &InMemoryBackend,
        worker: W,
    ) -> JobRunner<InMemoryBackend, W>
    where
        W::Input: Send + 'static,
    {
        JobRunner::new(backend.clone(), Arc::new(worker), Locale::En)
    }

    #[tokio::test]
    async fn mixed_upload_succeeds_with_per_line_outcomes() {
        let backend = InMemoryBackend::new().paused();
        let worker = RegistrationWorker::with_contract(7, "ACME");
        let registered = Arc::clone(&worker.registered);

        let job_id = RegistrationWorker::builder()
            .with_input(registration_input(Some(11)))
            .with_lines(vec!["", "Alice,alice01,alice@example.com", "bad,row"])
            .submit_to_backend(&backend)
            .await
            .unwrap();

        let snapshot = runner(&backend, worker)
            .run_job(job_id, job_id.into())
            .await
            .unwrap();

        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.attempted, 3);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.skipped, 1);
        assert_eq!(snapshot.failed, 1);

        let job = backend.load_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Success);
        assert_matches!(job.output, Some(JobOutput::Progress(_)));

        let lines = backend.line_targets(job_id).await.unwrap();
        assert!(lines.iter().all(|line| line.completed));
        assert_eq!(lines[0].message, None);
        assert_eq!(lines[1].message, None);
        assert_eq!(
            lines[2].message.as_deref(),
            Some("Line 3: expected 3 columns, got 2")
        );

        assert_eq!(*registered.lock().unwrap(), ["alice01"]);
    }

    #[tokio::test]
    async fn missing_required_input_fails_job_without_touching_lines() {
        let backend = InMemoryBackend::new().paused();
        let worker = RejectingWorker;

        let job_id = RejectingWorker::builder()
            .with_input(registration_input(None))
            .with_lines(vec!["Alice,alice01,alice@example.com"])
            .submit_to_backend(&backend)
            .await
            .unwrap();

        let error = runner(&backend, worker)
            .run_job(job_id, job_id.into())
            .await
            .unwrap_err();
        assert_matches!(error, RunError::Worker(WorkerError::MissingInput("history_id")));

        let job = backend.load_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failure);
        let failure = job.output.unwrap().failure().unwrap().clone();
        assert_eq!(failure.error_type, "missing_input");
        assert!(failure.message.contains("history_id"));

        let lines = backend.line_targets(job_id).await.unwrap();
        assert!(lines.iter().all(|line| !line.completed && line.message.is_none()));
    }

    #[tokio::test]
    async fn stale_context_fails_job() {
        let backend = InMemoryBackend::new().paused();
        let worker = RegistrationWorker::with_contract(7, "RENAMED");

        let job_id = RegistrationWorker::builder()
            .with_input(registration_input(Some(11)))
            .with_lines(vec!["Alice,alice01,alice@example.com"])
            .submit_to_backend(&backend)
            .await
            .unwrap();

        let error = runner(&backend, worker)
            .run_job(job_id, job_id.into())
            .await
            .unwrap_err();
        assert_matches!(error, RunError::Worker(WorkerError::ContextConflict { .. }));

        let job = backend.load_job(job_id).await.unwrap().unwrap();
        let failure = job.output.unwrap().failure().unwrap().clone();
        assert_eq!(failure.error_type, "context_conflict");
    }

    #[tokio::test]
    async fn identity_mismatch_is_fatal_and_captured() {
        let backend = InMemoryBackend::new().paused();
        let worker = RegistrationWorker::with_contract(7, "ACME");

        let job_id = RegistrationWorker::builder()
            .with_input(registration_input(Some(11)))
            .submit_to_backend(&backend)
            .await
            .unwrap();
        let other_id = RegistrationWorker::builder()
            .with_input(registration_input(Some(11)))
            .submit_to_backend(&backend)
            .await
            .unwrap();

        let error = runner(&backend, worker)
            .run_job(job_id, other_id.into())
            .await
            .unwrap_err();
        assert_matches!(error, RunError::IdentityMismatch { .. });

        let job = backend.load_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failure);
        let failure = job.output.unwrap().failure().unwrap().clone();
        assert_eq!(failure.error_type, "identity_mismatch");
    }

    #[tokio::test]
    async fn worker_panic_is_captured() {
        let backend = InMemoryBackend::new().paused();

        let job_id = PanickingWorker::builder()
            .with_input(())
            .submit_to_backend(&backend)
            .await
            .unwrap();

        let error = runner(&backend, PanickingWorker)
            .run_job(job_id, job_id.into())
            .await
            .unwrap_err();
        assert_matches!(error, RunError::Panicked(ref message) if message == "boom");

        let job = backend.load_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failure);
        let failure = job.output.unwrap().failure().unwrap().clone();
        assert_eq!(failure.error_type, "panic");
        assert!(failure.message.contains("boom"));
    }

    #[tokio::test]
    async fn undecodable_input_is_fatal() {
        let backend = InMemoryBackend::new().paused();
        // Submit with no input at all: decodes to `null`, which the typed
        // input rejects.
        let job_id = RegistrationWorker::builder()
            .submit_to_backend(&backend)
            .await
            .unwrap();

        let error = runner(&backend, RegistrationWorker::with_contract(7, "ACME"))
            .run_job(job_id, job_id.into())
            .await
            .unwrap_err();
        assert_matches!(error, RunError::InvalidInput(_));

        let job = backend.load_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failure);
        assert_eq!(
            job.output.unwrap().failure().unwrap().error_type,
            "invalid_input"
        );
    }

    #[tokio::test]
    async fn missing_job_record_propagates() {
        let backend = InMemoryBackend::new();
        let worker = RegistrationWorker::with_contract(7, "ACME");

        let missing = JobId::from(999);
        let error = runner(&backend, worker)
            .run_job(missing, missing.into())
            .await
            .unwrap_err();
        assert_matches!(error, RunError::JobNotFound(id) if id == missing);
    }
}
