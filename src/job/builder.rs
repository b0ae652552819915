use std::hash::Hash;

use crate::{
    backend::{Backend, EnqueuableJob},
    job::JobId,
    worker::JobWorker,
    RosterbatchError,
};

/// Builds and submits one bulk job: the declared input plus one line target
/// per input line.
///
/// ```
/// # use rosterbatch::prelude::*;
/// # use rosterbatch::backend::memory::InMemoryBackend;
/// # use serde::{Deserialize, Serialize};
/// # pub(crate) struct RegistrationWorker;
/// # #[derive(Serialize, Deserialize)]
/// # pub(crate) struct RegistrationInput { contract_id: i64 }
/// #
/// # #[async_trait::async_trait]
/// # impl JobWorker for RegistrationWorker {
/// #     type Input = RegistrationInput;
/// #     const KIND: &'static str = "student_registration";
/// #     const ACTION: &'static str = "register_students";
/// #     async fn run<B>(
/// #         &self,
/// #         _ctx: &JobContext<B>,
/// #         _input: Self::Input,
/// #     ) -> Result<ProgressSnapshot, WorkerError>
/// #     where
/// #         B: Backend + Send + Sync + 'static,
/// #     {
/// #         unimplemented!()
/// #     }
/// # }
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let backend = InMemoryBackend::new().paused();
///
/// let job_id = RegistrationWorker::builder()
///     .with_input(RegistrationInput { contract_id: 7 })
///     .with_lines(vec!["Alice,alice01,alice@example.com"])
///     .deduped_on(&7)
///     .submit_to_backend(&backend)
///     .await
///     .unwrap();
/// # let _ = job_id;
/// # });
/// ```
pub struct JobBuilder<W>
where
    W: JobWorker,
{
    input: Option<W::Input>,
    lines: Vec<String>,
    dedup_key: Option<i64>,
}

impl<W> Default for JobBuilder<W>
where
    W: JobWorker,
{
    fn default() -> Self {
        Self {
            input: None,
            lines: Default::default(),
            dedup_key: None,
        }
    }
}

impl<W> JobBuilder<W>
where
    W: JobWorker,
{
    pub fn with_input(self, input: W::Input) -> Self {
        Self {
            input: Some(input),
            ..self
        }
    }

    pub fn with_lines(self, lines: Vec<impl Into<String>>) -> Self {
        let lines = lines.into_iter().map(Into::into).collect();
        Self { lines, ..self }
    }

    pub fn add_line(self, line: impl Into<String>) -> Self {
        let mut lines = self.lines;
        lines.push(line.into());
        Self { lines, ..self }
    }

    /// Derives the dedup key from the worker kind and the given target key.
    ///
    /// While a job with this key is live (queuing or in progress), a second
    /// submission fails with
    /// [`crate::backend::BackendError::DuplicateJob`].
    pub fn deduped_on<H: Hash>(self, key: &H) -> Self {
        let dedup_key = fxhash::hash64(&(W::KIND, key)) as i64;
        Self {
            dedup_key: Some(dedup_key),
            ..self
        }
    }

    pub async fn submit_to_backend<B>(self, backend: &B) -> Result<JobId, RosterbatchError>
    where
        B: Backend + Sync,
    {
        let job_id = backend
            .enqueue(EnqueuableJob {
                kind: W::KIND.to_owned(),
                input: serde_json::to_value(self.input)?,
                dedup_key: self.dedup_key,
                lines: self.lines,
            })
            .await?;

        Ok(job_id)
    }
}
