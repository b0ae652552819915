use std::{collections::HashMap, sync::Arc};

pub mod backend;
pub mod daily;
pub mod job;
pub mod line;
pub mod mail;
pub mod prelude;
pub mod progress;
pub mod runner;
pub mod worker;

use backend::{Backend, BackendError};
use futures::StreamExt;
use runner::JobRunner;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use worker::{JobWorker, Locale};

/// The engine front door: registers workers and drives their job loops.
///
/// One loop is spawned per registered worker kind; each loop consumes its
/// kind's queued jobs from the backend one at a time, in creation order, and
/// hands them to the [`JobRunner`].
#[derive(Debug)]
pub struct Rosterbatch<B: Backend> {
    workers: HashMap<&'static str, WorkerHandle>,
    backend: B,
    locale: Locale,
}

impl<B> Default for Rosterbatch<B>
where
    B: Backend + Default,
{
    fn default() -> Self {
        Self::new(Default::default())
    }
}

#[derive(Debug)]
struct WorkerHandle {
    sender: mpsc::UnboundedSender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    async fn graceful_shutdown(&mut self) -> Result<(), RosterbatchError> {
        self.sender
            .send(Message::Terminate)
            .map_err(|_| RosterbatchError::GracefulShutdownFailed)?;
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| RosterbatchError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}

enum Message {
    Terminate,
}

impl<B> Rosterbatch<B>
where
    B: Backend,
{
    pub fn new(backend: B) -> Self {
        Self {
            workers: Default::default(),
            backend,
            locale: Default::default(),
        }
    }

    /// Sets the locale line messages are formatted in.
    pub fn with_locale(mut self, locale: Locale) -> Self {
        self.locale = locale;
        self
    }
}

impl<B> Rosterbatch<B>
where
    B: Backend + Send + 'static + Sync + Clone,
{
    pub fn with_worker<W>(mut self, worker: W) -> Self
    where
        W: JobWorker + 'static,
        W::Input: Send + 'static,
    {
        let (sender, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn({
            let backend = self.backend.clone();
            let runner = JobRunner::new(backend.clone(), Arc::new(worker), self.locale);
            async move {
                let stream = backend.subscribe_queued_jobs(W::KIND.into()).await;
                tokio::pin!(stream);
                loop {
                    tokio::select! {
                        message = stream.next() => {
                            match message {
                                Some(Ok(job)) => {
                                    let _ = runner
                                        .run_job(job.id, job.id.into())
                                        .await
                                        .inspect_err(|error| {
                                            tracing::error!(?error, "Job execution failed: {error}")
                                        });
                                }
                                _ => tracing::warn!("Failed to get from stream"),
                            }
                        },
                        _ = rx.recv() => {
                            break;
                        }
                    }
                }
                tracing::debug!("Shutting down rosterbatch worker loop for {}", W::KIND);
            }
        });

        self.workers.insert(
            W::KIND,
            WorkerHandle {
                sender,
                handle: Some(handle),
            },
        );
        self
    }

    pub async fn graceful_shutdown(mut self) -> Result<Vec<()>, RosterbatchError> {
        tracing::debug!("Shutting down rosterbatch worker loops");
        futures::future::join_all(
            self.workers
                .values_mut()
                .map(WorkerHandle::graceful_shutdown),
        )
        .await
        .into_iter()
        .collect()
    }
}

#[derive(Debug, Error)]
pub enum RosterbatchError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the backend")]
    Backend(#[from] BackendError),
    #[error("Error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
}
