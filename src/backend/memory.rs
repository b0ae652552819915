//! Provides an in memory implementation of [`Backend`] and
//! [`BatchStatusStore`].
//!
//! Currently this is provided for testing purposes and not designed for use
//! in a production system.
//!
//! It is not optimized, instead it is designed to be a correct
//! implementation for use in a test setup.
use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, RwLock,
    },
};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::mpsc;

use super::{Backend, BackendError, EnqueuableJob};
use crate::{
    daily::{BatchKey, BatchRun, BatchStatusStore},
    job::{FailureInfo, JobId, JobOutput, JobRecord, JobState},
    line::{LineTarget, LineTargetId},
    progress::ProgressSnapshot,
    worker::WorkerIdentifier,
};

struct QueuedJobStream {
    backend: InMemoryBackend,
    kind: WorkerIdentifier,
    receiver: mpsc::UnboundedReceiver<()>,
}

impl QueuedJobStream {
    const IDLE_DELAY: std::time::Duration = std::time::Duration::from_secs(30);

    pub async fn next(&mut self) -> Result<JobRecord, BackendError> {
        loop {
            if let Some(job) = self.backend.claim_next_queued(self.kind.as_str())? {
                return Ok(job);
            }
            tokio::select! {
                _ = self.receiver.recv() => { },
                _ = tokio::time::sleep(Self::IDLE_DELAY) => { },
            }
        }
    }
}

type Subscriber = mpsc::UnboundedSender<()>;

/// An in memory implementation of [`Backend`] and [`BatchStatusStore`].
///
/// It is provided as a correct (but not optimized) implementation primarily
/// for use in testing circumstances.
///
/// **This is not designed for use in a production system.**
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<Vec<StoredJob>>>,
    lines: Arc<RwLock<Vec<LineTarget>>>,
    batch_runs: Arc<RwLock<Vec<BatchRun>>>,
    job_ids: Arc<AtomicI64>,
    line_ids: Arc<AtomicI64>,
    subscribers: Arc<RwLock<HashMap<&'static str, Vec<Subscriber>>>>,
    paused: Arc<AtomicBool>,
}

#[derive(Clone)]
struct StoredJob {
    record: JobRecord,
    claimed: bool,
}

impl std::ops::Deref for StoredJob {
    type Target = JobRecord;

    fn deref(&self) -> &Self::Target {
        &self.record
    }
}

impl std::ops::DerefMut for StoredJob {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.record
    }
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the backend in paused mode where streams will not be woken up
    /// when jobs are enqueued.
    ///
    /// If you would like to then run jobs later in the test you can call
    /// [`InMemoryBackend::notify_all`].
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wake up all the stream subscribers to continue execution.
    ///
    /// Particularly helpful when running the backend in paused mode.
    pub fn notify_all(&self) -> Result<(), BackendError> {
        self.subscribers
            .read()
            .map_err(|_| BackendError::BadState)?
            .values()
            .for_each(|subscriber| {
                subscriber.iter().for_each(|sender| {
                    let _ = sender.send(());
                })
            });
        Ok(())
    }

    fn claim_next_queued(&self, kind: &str) -> Result<Option<JobRecord>, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        Ok(jobs
            .iter_mut()
            .find(|job| job.kind == kind && job.state == JobState::Queuing && !job.claimed)
            .map(|job| {
                job.claimed = true;
                job.record.clone()
            }))
    }

    fn notify_subscribers(&self, kind: &str) -> Result<(), BackendError> {
        if !self.paused.load(Ordering::Relaxed) {
            if let Some(subscriber) = self
                .subscribers
                .read()
                .map_err(|_| BackendError::BadState)?
                .get(kind)
            {
                subscriber.iter().for_each(|sender| {
                    let _ = sender.send(());
                });
            }
        }
        Ok(())
    }

    fn with_job<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut JobRecord) -> T,
    ) -> Result<T, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(BackendError::JobNotFound(id)),
            Some(job) => Ok(f(&mut job.record)),
        }
    }
}

impl JobRecord {
    fn mark_in_progress(&mut self) {
        self.started_at = Some(Utc::now());
        self.state = JobState::InProgress;
    }

    fn mark_succeeded(&mut self, snapshot: ProgressSnapshot) {
        self.finished_at = Some(Utc::now());
        self.output = Some(JobOutput::Progress(snapshot));
        self.state = JobState::Success;
    }

    fn mark_failed(&mut self, failure: FailureInfo) {
        self.finished_at = Some(Utc::now());
        self.output = Some(JobOutput::Failure(failure));
        self.state = JobState::Failure;
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn subscribe_queued_jobs(
        &self,
        kind: WorkerIdentifier,
    ) -> Pin<Box<dyn Stream<Item = Result<JobRecord, BackendError>> + Send>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.subscribers.write() {
            Ok(mut subscribers) => subscribers.entry(kind.as_str()).or_default().push(sender),
            Err(_) => return Box::pin(stream! { yield Err(BackendError::BadState); }),
        }

        let mut stream = QueuedJobStream {
            backend: self.clone(),
            kind,
            receiver,
        };
        Box::pin(stream! {
            loop {
                yield stream.next().await;
            }
        })
    }

    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let now = Utc::now();
        let id: JobId = self.job_ids.fetch_add(1, Ordering::SeqCst).into();
        {
            let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
            if let Some(key) = job.dedup_key {
                if let Some(existing) = jobs
                    .iter()
                    .find(|j| j.dedup_key == Some(key) && j.state.is_live())
                {
                    return Err(BackendError::DuplicateJob { existing: existing.id });
                }
            }
            jobs.push(StoredJob {
                record: JobRecord {
                    id,
                    kind: job.kind.clone(),
                    dedup_key: job.dedup_key,
                    input: job.input,
                    state: JobState::Queuing,
                    output: None,
                    inserted_at: now,
                    started_at: None,
                    finished_at: None,
                },
                claimed: false,
            });

            let mut lines = self.lines.write().map_err(|_| BackendError::BadState)?;
            for raw in job.lines {
                lines.push(LineTarget {
                    id: self.line_ids.fetch_add(1, Ordering::SeqCst).into(),
                    job_id: id,
                    raw,
                    message: None,
                    completed: false,
                    inserted_at: now,
                });
            }
        }

        self.notify_subscribers(job.kind.as_str())?;

        Ok(id)
    }

    async fn load_job(&self, id: JobId) -> Result<Option<JobRecord>, BackendError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .find(|job| job.id == id)
            .map(|job| job.record.clone()))
    }

    async fn mark_job_in_progress(&self, id: JobId) -> Result<(), BackendError> {
        self.with_job(id, JobRecord::mark_in_progress)
    }

    async fn mark_job_succeeded(
        &self,
        id: JobId,
        snapshot: ProgressSnapshot,
    ) -> Result<(), BackendError> {
        self.with_job(id, |job| job.mark_succeeded(snapshot))
    }

    async fn mark_job_failed(&self, id: JobId, failure: FailureInfo) -> Result<(), BackendError> {
        self.with_job(id, |job| job.mark_failed(failure))
    }

    async fn publish_progress(
        &self,
        id: JobId,
        snapshot: ProgressSnapshot,
    ) -> Result<(), BackendError> {
        self.with_job(id, |job| {
            job.output = Some(JobOutput::Progress(snapshot));
        })
    }

    async fn line_targets(&self, job_id: JobId) -> Result<Vec<LineTarget>, BackendError> {
        Ok(self
            .lines
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|line| line.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn record_line_result(
        &self,
        id: LineTargetId,
        message: Option<String>,
        completed: bool,
    ) -> Result<(), BackendError> {
        let mut lines = self.lines.write().map_err(|_| BackendError::BadState)?;
        match lines.iter_mut().find(|line| line.id == id) {
            None => Err(BackendError::LineTargetNotFound(id)),
            Some(line) => {
                line.message = message;
                line.completed = completed;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl BatchStatusStore for InMemoryBackend {
    async fn append_batch_run(&self, run: BatchRun) -> Result<(), BackendError> {
        self.batch_runs
            .write()
            .map_err(|_| BackendError::BadState)?
            .push(run);
        Ok(())
    }

    async fn batch_runs_between(
        &self,
        key: &BatchKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BatchRun>, BackendError> {
        Ok(self
            .batch_runs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|run| &run.key == key && run.created >= from && run.created < to)
            .cloned()
            .collect())
    }
}
