//! The shared per-line processing loop.
//!
//! Every bulk operation has the same shape: fetch the job's line targets in
//! creation order, walk them one by one, decide success/skip/fail per line,
//! record the decision on the target, and keep going no matter what a single
//! line does. [`LineProcessor`] owns that loop; operations plug in a
//! [`LineHandler`] with the domain-specific parsing, validation, and side
//! effects.
//!
//! A handler's writes for one line are expected to be atomic together: the
//! handler opens whatever transaction its domain store provides and commits
//! or rolls back before returning. The processor guarantees the rest: a
//! handler error is caught at the line boundary, logged with full detail,
//! counted as failed, and surfaced to the operator as a generic retry-later
//! message with no internal detail leaked.
use async_trait::async_trait;

use crate::{
    backend::Backend,
    line::LineTarget,
    progress::{ProgressSnapshot, ProgressTracker},
    worker::{JobContext, WorkerError},
};

/// The terminal decision for one non-blank line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineDecision {
    /// The line was applied; optionally carries an operator-visible note.
    Success(Option<String>),
    /// Benign non-error condition, e.g. the record is already in the desired
    /// end state.
    Skip,
    /// A validation failure with the reason shown to the operator.
    Fail(String),
}

#[async_trait]
pub trait LineHandler: Send {
    /// Parses, validates, and applies one line, atomically.
    ///
    /// Validation runs in a fixed order (row shape, then per-field format,
    /// then uniqueness against lines already applied in this job, then
    /// domain authorization) and the first failing check wins.
    async fn handle_line(
        &mut self,
        number: usize,
        target: &LineTarget,
    ) -> Result<LineDecision, WorkerError>;
}

pub struct LineProcessor<'a, B> {
    ctx: &'a JobContext<B>,
}

impl<'a, B> LineProcessor<'a, B>
where
    B: Backend + Send + Sync + 'static,
{
    /// Progress is republished after this many lines, and always once after
    /// the loop.
    const PUBLISH_EVERY: usize = 50;

    pub fn new(ctx: &'a JobContext<B>) -> Self {
        Self { ctx }
    }

    pub async fn process<H: LineHandler>(
        &self,
        handler: &mut H,
    ) -> Result<ProgressSnapshot, WorkerError> {
        let targets = self.ctx.line_targets().await?;
        let mut tracker = ProgressTracker::new(self.ctx.action(), targets.len());
        self.ctx.publish_progress(tracker.snapshot()).await?;

        let locale = self.ctx.locale();
        for (index, target) in targets.iter().enumerate() {
            let number = index + 1;
            tracker.attempt();

            if target.raw.trim().is_empty() {
                tracker.skip();
                self.ctx.record_line_result(target.id, None, true).await?;
            } else {
                match handler.handle_line(number, target).await {
                    Ok(LineDecision::Success(message)) => {
                        tracker.success();
                        let message = message.map(|m| locale.line_message(number, &m));
                        self.ctx.record_line_result(target.id, message, true).await?;
                    }
                    Ok(LineDecision::Skip) => {
                        tracker.skip();
                        self.ctx.record_line_result(target.id, None, true).await?;
                    }
                    Ok(LineDecision::Fail(message)) => {
                        tracker.fail();
                        let message = locale.line_message(number, &message);
                        self.ctx
                            .record_line_result(target.id, Some(message), true)
                            .await?;
                    }
                    Err(error) => {
                        tracing::error!(
                            ?error,
                            line = number,
                            job_id = %self.ctx.job_id(),
                            "Unexpected error processing line {number}: {error}"
                        );
                        tracker.fail();
                        let message = locale.line_message(number, locale.retry_later());
                        self.ctx
                            .record_line_result(target.id, Some(message), false)
                            .await?;
                    }
                }
            }

            if number % Self::PUBLISH_EVERY == 0 {
                self.ctx.publish_progress(tracker.snapshot()).await?;
            }
        }

        let snapshot = tracker.snapshot();
        self.ctx.publish_progress(snapshot.clone()).await?;
        Ok(snapshot)
    }
}

/// Splits a comma-delimited line into trimmed columns.
pub fn fields(raw: &str) -> Vec<&str> {
    raw.trim().split(',').map(str::trim).collect()
}

/// The language operator-visible line messages are formatted in.
///
/// Passed explicitly to the engine rather than read from any ambient
/// request context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Locale {
    #[default]
    En,
    Ja,
}

impl Locale {
    pub fn line_message(&self, number: usize, message: &str) -> String {
        match self {
            Locale::En => format!("Line {number}: {message}"),
            Locale::Ja => format!("{number}行目: {message}"),
        }
    }

    /// Shown for a line that hit an unexpected internal error.
    pub fn retry_later(&self) -> &'static str {
        match self {
            Locale::En => "processing failed, please retry later",
            Locale::Ja => "処理に失敗しました。時間をおいて再度お試しください",
        }
    }
}
