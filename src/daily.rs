//! The daily batch status guard.
//!
//! Nightly aggregation jobs append one [`BatchRun`] row per execution
//! attempt, keyed by contract (and optionally course): a `Started` row
//! synchronously before the work and exactly one of `Finished`/`Error`
//! synchronously after. Rows are never updated or deleted: "today's status"
//! is always derived by querying the rows within today's window, so a
//! concurrent second run appends its own rows rather than corrupting the
//! first.
//!
//! The guard answers two questions:
//!
//! - [`DailyStatusGuard::exists_today`]: did any run start today? Used to
//!   skip a nightly job that already ran, unless the operator forces a rerun.
//! - [`DailyStatusGuard::finished_today`]: did the most recent run today
//!   finish successfully? Used by a downstream job to confirm its upstream
//!   before proceeding; when false the downstream fails with
//!   [`WorkerError::UpstreamNotFinished`] rather than aggregating stale or
//!   partial data.
//!
//! "Today" is evaluated in the guard's reference timezone, configured with
//! [`DailyStatusGuard::with_timezone`].
//!
//! # Example
//!
//! ```
//! # use rosterbatch::backend::memory::InMemoryBackend;
//! # use rosterbatch::daily::{BatchCounts, BatchKey, DailyStatusGuard};
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let guard = DailyStatusGuard::new(InMemoryBackend::new());
//! let key = BatchKey::course(7, 42);
//!
//! guard.save_for_started(&key).await.unwrap();
//! assert!(guard.exists_today(&key).await.unwrap());
//! assert!(!guard.finished_today(&key).await.unwrap());
//!
//! guard.save_for_finished(&key, BatchCounts::processed(120)).await.unwrap();
//! assert!(guard.finished_today(&key).await.unwrap());
//! # });
//! ```
use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveTime, Offset, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{backend::BackendError, worker::WorkerError};

/// The domain key a nightly batch runs under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub contract_id: i64,
    pub course_id: Option<i64>,
}

impl BatchKey {
    pub fn contract(contract_id: i64) -> Self {
        Self {
            contract_id,
            course_id: None,
        }
    }

    pub fn course(contract_id: i64, course_id: i64) -> Self {
        Self {
            contract_id,
            course_id: Some(course_id),
        }
    }
}

impl Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.course_id {
            Some(course_id) => write!(f, "contract {} course {}", self.contract_id, course_id),
            None => write!(f, "contract {}", self.contract_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRunStatus {
    Started,
    Finished,
    Error,
}

/// Record counts reported by a finished (or failed) run.
///
/// Aggregation-style jobs report `processed`; reminder-style jobs report
/// `succeeded`/`failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub processed: Option<u64>,
    pub succeeded: Option<u64>,
    pub failed: Option<u64>,
}

impl BatchCounts {
    pub fn processed(count: u64) -> Self {
        Self {
            processed: Some(count),
            ..Default::default()
        }
    }

    pub fn outcomes(succeeded: u64, failed: u64) -> Self {
        Self {
            succeeded: Some(succeeded),
            failed: Some(failed),
            ..Default::default()
        }
    }
}

impl From<&crate::progress::ProgressSnapshot> for BatchCounts {
    fn from(snapshot: &crate::progress::ProgressSnapshot) -> Self {
        Self {
            processed: Some(snapshot.attempted as u64),
            succeeded: Some(snapshot.succeeded as u64),
            failed: Some(snapshot.failed as u64),
        }
    }
}

/// One appended status row. `counts` is `None` while `Started`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRun {
    pub key: BatchKey,
    pub status: BatchRunStatus,
    pub counts: Option<BatchCounts>,
    pub created: DateTime<Utc>,
}

/// Storage seam for the append-only status log.
#[async_trait]
pub trait BatchStatusStore: Clone {
    async fn append_batch_run(&self, run: BatchRun) -> Result<(), BackendError>;
    /// Rows for `key` with `created` in `[from, to)`, oldest first.
    async fn batch_runs_between(
        &self,
        key: &BatchKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BatchRun>, BackendError>;
}

/// A source of the current time, explicit so tests can roll the calendar.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct DailyStatusGuard<S, C = SystemClock> {
    store: S,
    clock: C,
    offset: FixedOffset,
}

impl<S> DailyStatusGuard<S, SystemClock>
where
    S: BatchStatusStore,
{
    /// Creates a guard with the system clock and a UTC reference timezone.
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: SystemClock,
            offset: Utc.fix(),
        }
    }
}

impl<S, C> DailyStatusGuard<S, C>
where
    S: BatchStatusStore + Sync,
    C: Clock,
{
    /// Sets the reference timezone used for the "today" window.
    pub fn with_timezone(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> DailyStatusGuard<S, C2> {
        DailyStatusGuard {
            store: self.store,
            clock,
            offset: self.offset,
        }
    }

    pub async fn exists_today(&self, key: &BatchKey) -> Result<bool, BackendError> {
        let (from, to) = self.today_window();
        Ok(!self.store.batch_runs_between(key, from, to).await?.is_empty())
    }

    /// True when the most recent run today finished successfully.
    ///
    /// A newer `Started` or `Error` row flips this back off; earlier rows are
    /// not consulted retroactively.
    pub async fn finished_today(&self, key: &BatchKey) -> Result<bool, BackendError> {
        let (from, to) = self.today_window();
        let mut runs = self.store.batch_runs_between(key, from, to).await?;
        runs.sort_by_key(|run| run.created);
        Ok(runs
            .last()
            .is_some_and(|run| run.status == BatchRunStatus::Finished))
    }

    async fn append(
        &self,
        key: &BatchKey,
        status: BatchRunStatus,
        counts: Option<BatchCounts>,
    ) -> Result<(), BackendError> {
        self.store
            .append_batch_run(BatchRun {
                key: key.clone(),
                status,
                counts,
                created: self.clock.now(),
            })
            .await
    }

    pub async fn save_for_started(&self, key: &BatchKey) -> Result<(), BackendError> {
        self.append(key, BatchRunStatus::Started, None).await
    }

    pub async fn save_for_finished(
        &self,
        key: &BatchKey,
        counts: BatchCounts,
    ) -> Result<(), BackendError> {
        self.append(key, BatchRunStatus::Finished, Some(counts)).await
    }

    pub async fn save_for_error(
        &self,
        key: &BatchKey,
        counts: Option<BatchCounts>,
    ) -> Result<(), BackendError> {
        self.append(key, BatchRunStatus::Error, counts).await
    }

    /// Runs one nightly batch under the guard.
    ///
    /// Skips when a run already exists today (unless `force`), appends the
    /// `Started` row, runs `work`, and appends `Finished` with the returned
    /// counts, or `Error` carrying whatever counts the failed work had
    /// accumulated.
    pub async fn run_daily<F, Fut>(
        &self,
        key: &BatchKey,
        force: bool,
        work: F,
    ) -> Result<DailyOutcome, WorkerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BatchCounts, DailyFailure>>,
    {
        if !force && self.exists_today(key).await? {
            tracing::debug!(%key, "Daily batch already ran today, skipping");
            return Ok(DailyOutcome::AlreadyRan);
        }
        self.save_for_started(key).await?;
        match work().await {
            Ok(counts) => {
                self.save_for_finished(key, counts.clone()).await?;
                Ok(DailyOutcome::Finished(counts))
            }
            Err(DailyFailure { counts, source }) => {
                tracing::warn!(%key, error = %source, "Daily batch failed");
                self.save_for_error(key, counts).await?;
                Err(source)
            }
        }
    }

    fn today_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let local_now = self.clock.now().with_timezone(&self.offset);
        let start = local_now - (local_now.time() - NaiveTime::MIN);
        let end = start + TimeDelta::days(1);
        (start.with_timezone(&Utc), end.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DailyOutcome {
    /// A run already existed today and `force` was not set.
    AlreadyRan,
    Finished(BatchCounts),
}

/// A failed nightly batch, carrying the counts accumulated before failing.
#[derive(Debug)]
pub struct DailyFailure {
    pub counts: Option<BatchCounts>,
    pub source: WorkerError,
}

impl DailyFailure {
    pub fn with_counts(source: WorkerError, counts: BatchCounts) -> Self {
        Self {
            counts: Some(counts),
            source,
        }
    }
}

impl From<WorkerError> for DailyFailure {
    fn from(source: WorkerError) -> Self {
        Self {
            counts: None,
            source,
        }
    }
}

impl From<BackendError> for DailyFailure {
    fn from(source: BackendError) -> Self {
        WorkerError::from(source).into()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;
    use crate::backend::memory::InMemoryBackend;

    #[derive(Clone)]
    pub(crate) struct ManualClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        fn at(now: DateTime<Utc>) -> Self {
            Self {
                now: Arc::new(Mutex::new(now)),
            }
        }

        fn set(&self, now: DateTime<Utc>) {
            *self.now.lock().unwrap() = now;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    fn guard_at(
        now: DateTime<Utc>,
    ) -> (DailyStatusGuard<InMemoryBackend, ManualClock>, ManualClock) {
        let clock = ManualClock::at(now);
        let guard = DailyStatusGuard::new(InMemoryBackend::new()).with_clock(clock.clone());
        (guard, clock)
    }

    #[tokio::test]
    async fn exists_today_after_started() {
        let (guard, clock) = guard_at(Utc.with_ymd_and_hms(2024, 4, 2, 3, 0, 0).unwrap());
        let key = BatchKey::contract(7);

        assert!(!guard.exists_today(&key).await.unwrap());
        guard.save_for_started(&key).await.unwrap();
        assert!(guard.exists_today(&key).await.unwrap());

        // Next calendar day: yesterday's run no longer counts.
        clock.set(Utc.with_ymd_and_hms(2024, 4, 3, 3, 0, 0).unwrap());
        assert!(!guard.exists_today(&key).await.unwrap());
    }

    #[tokio::test]
    async fn exists_today_is_per_key() {
        let (guard, _clock) = guard_at(Utc.with_ymd_and_hms(2024, 4, 2, 3, 0, 0).unwrap());
        guard.save_for_started(&BatchKey::contract(7)).await.unwrap();

        assert!(!guard.exists_today(&BatchKey::contract(8)).await.unwrap());
        assert!(!guard.exists_today(&BatchKey::course(7, 1)).await.unwrap());
    }

    #[tokio::test]
    async fn finished_today_follows_most_recent_run() {
        let (guard, clock) = guard_at(Utc.with_ymd_and_hms(2024, 4, 2, 1, 0, 0).unwrap());
        let key = BatchKey::course(7, 42);

        guard.save_for_started(&key).await.unwrap();
        assert!(!guard.finished_today(&key).await.unwrap());

        clock.set(Utc.with_ymd_and_hms(2024, 4, 2, 1, 5, 0).unwrap());
        guard
            .save_for_finished(&key, BatchCounts::processed(10))
            .await
            .unwrap();
        assert!(guard.finished_today(&key).await.unwrap());

        // A forced second run that errors flips the answer back off.
        clock.set(Utc.with_ymd_and_hms(2024, 4, 2, 2, 0, 0).unwrap());
        guard.save_for_started(&key).await.unwrap();
        clock.set(Utc.with_ymd_and_hms(2024, 4, 2, 2, 1, 0).unwrap());
        guard.save_for_error(&key, None).await.unwrap();
        assert!(!guard.finished_today(&key).await.unwrap());
    }

    #[tokio::test]
    async fn today_window_uses_reference_timezone() {
        // 23:00 UTC on April 1st is already April 2nd in JST.
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 4, 1, 23, 0, 0).unwrap());
        let jst = FixedOffset::east_opt(9 * 3600).unwrap();
        let guard = DailyStatusGuard::new(InMemoryBackend::new())
            .with_timezone(jst)
            .with_clock(clock.clone());
        let key = BatchKey::contract(7);

        guard.save_for_started(&key).await.unwrap();

        // Still April 2nd in JST a few hours later.
        clock.set(Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 0).unwrap());
        assert!(guard.exists_today(&key).await.unwrap());

        // 15:00 UTC on April 2nd is April 3rd in JST.
        clock.set(Utc.with_ymd_and_hms(2024, 4, 2, 15, 30, 0).unwrap());
        assert!(!guard.exists_today(&key).await.unwrap());
    }

    #[tokio::test]
    async fn run_daily_skips_second_run_unless_forced() {
        let (guard, _clock) = guard_at(Utc.with_ymd_and_hms(2024, 4, 2, 3, 0, 0).unwrap());
        let key = BatchKey::contract(7);

        let outcome = guard
            .run_daily(&key, false, || async { Ok(BatchCounts::processed(5)) })
            .await
            .unwrap();
        assert_eq!(outcome, DailyOutcome::Finished(BatchCounts::processed(5)));

        let outcome = guard
            .run_daily(&key, false, || async { Ok(BatchCounts::processed(9)) })
            .await
            .unwrap();
        assert_eq!(outcome, DailyOutcome::AlreadyRan);

        let outcome = guard
            .run_daily(&key, true, || async { Ok(BatchCounts::processed(9)) })
            .await
            .unwrap();
        assert_eq!(outcome, DailyOutcome::Finished(BatchCounts::processed(9)));
    }

    #[tokio::test]
    async fn downstream_blocked_by_unfinished_upstream() {
        let (guard, _clock) = guard_at(Utc.with_ymd_and_hms(2024, 4, 2, 3, 0, 0).unwrap());
        let upstream = BatchKey::contract(7);
        let downstream = BatchKey::course(7, 42);

        // Upstream started but never finished.
        guard.save_for_started(&upstream).await.unwrap();

        let result = guard
            .run_daily(&downstream, false, || async {
                if !guard.finished_today(&upstream).await? {
                    return Err(WorkerError::UpstreamNotFinished(upstream.clone()).into());
                }
                Ok(BatchCounts::processed(1))
            })
            .await;
        assert_matches!(result, Err(WorkerError::UpstreamNotFinished(_)));

        // The downstream recorded its own Error row with null counts.
        let (from, to) = guard.today_window();
        let runs = guard
            .store
            .batch_runs_between(&downstream, from, to)
            .await
            .unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, BatchRunStatus::Started);
        assert_eq!(runs[1].status, BatchRunStatus::Error);
        assert_eq!(runs[1].counts, None);
    }

    #[tokio::test]
    async fn failed_run_preserves_partial_counts() {
        let (guard, _clock) = guard_at(Utc.with_ymd_and_hms(2024, 4, 2, 3, 0, 0).unwrap());
        let key = BatchKey::contract(7);

        let result = guard
            .run_daily(&key, false, || async {
                Err(DailyFailure::with_counts(
                    WorkerError::other("store went away"),
                    BatchCounts::processed(37),
                ))
            })
            .await;
        assert_matches!(result, Err(WorkerError::Other(_)));

        let (from, to) = guard.today_window();
        let runs = guard.store.batch_runs_between(&key, from, to).await.unwrap();
        assert_eq!(runs[1].status, BatchRunStatus::Error);
        assert_eq!(runs[1].counts, Some(BatchCounts::processed(37)));
    }
}
