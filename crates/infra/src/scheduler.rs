//! Cron scheduler for periodic maintenance tasks.
//!
//! Each registered job gets its own timer task that computes the next fire
//! time in the job's time zone. A job never overlaps with itself: scheduled
//! firings and manual triggers share one per-job run lock, and a firing that
//! finds the lock taken is skipped. Different jobs run concurrently.
//!
//! Handler errors and panics are logged; the timer keeps going.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::clock::SharedClock;
use crate::config::CronSettings;
use crate::jobs::{FileCleanupJob, Producers, QueueName};
use crate::store::ConnectionManager;

pub type CronHandler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`CronHandler`].
pub fn handler<F, Fut>(f: F) -> CronHandler
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("cron job `{name}`: invalid expression `{expression}`: {reason}")]
    InvalidExpression {
        name: String,
        expression: String,
        reason: String,
    },

    #[error("cron job `{name}`: unknown time zone `{timezone}`")]
    UnknownTimezone { name: String, timezone: String },

    #[error("cron job `{0}` is already registered")]
    Duplicate(String),

    #[error("jobs cannot be registered after the scheduler has started")]
    AlreadyStarted,

    #[error("no cron job named `{0}`")]
    UnknownJob(String),
}

/// Result of a manual trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Completed,
    Failed(String),
    /// The job was already executing; nothing was started.
    AlreadyRunning,
}

/// Snapshot for the ops surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CronJobStatus {
    pub name: String,
    pub expression: String,
    pub timezone: String,
    pub active: bool,
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
}

struct CronJob {
    name: String,
    expression: String,
    schedule: Schedule,
    timezone: Tz,
    handler: CronHandler,
    /// Held for the duration of one run.
    run_lock: tokio::sync::Mutex<()>,
    active: AtomicBool,
}

impl CronJob {
    fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&now.with_timezone(&self.timezone))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }

    fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Run once unless a run is already in progress.
    async fn run_exclusive(&self) -> TriggerOutcome {
        let Ok(_guard) = self.run_lock.try_lock() else {
            return TriggerOutcome::AlreadyRunning;
        };

        let started = Instant::now();
        let handler = self.handler.clone();
        let result = AssertUnwindSafe(async move { handler().await })
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {
                info!(
                    job = %self.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "cron job completed"
                );
                TriggerOutcome::Completed
            }
            Ok(Err(e)) => {
                error!(job = %self.name, error = %format!("{e:#}"), "cron job failed");
                TriggerOutcome::Failed(format!("{e:#}"))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(job = %self.name, panic = %message, "cron job panicked");
                TriggerOutcome::Failed(format!("handler panicked: {message}"))
            }
        }
    }
}

/// Accept 5-field (minute precision) expressions by pinning seconds to 0.
fn normalize(expression: &str) -> Option<String> {
    match expression.split_whitespace().count() {
        5 => Some(format!("0 {}", expression.trim())),
        6 | 7 => Some(expression.trim().to_string()),
        _ => None,
    }
}

pub struct Scheduler {
    jobs: RwLock<BTreeMap<String, Arc<CronJob>>>,
    clock: SharedClock,
    started: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            clock,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    fn job(&self, name: &str) -> Option<Arc<CronJob>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn all_jobs(&self) -> Vec<Arc<CronJob>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn register(
        &self,
        name: &str,
        expression: &str,
        timezone: &str,
        handler: CronHandler,
    ) -> Result<(), SchedulerError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }

        let invalid = |reason: String| SchedulerError::InvalidExpression {
            name: name.to_string(),
            expression: expression.to_string(),
            reason,
        };
        let normalized =
            normalize(expression).ok_or_else(|| invalid("expected 5, 6 or 7 fields".to_string()))?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| SchedulerError::UnknownTimezone {
                name: name.to_string(),
                timezone: timezone.to_string(),
            })?;

        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(name) {
            return Err(SchedulerError::Duplicate(name.to_string()));
        }
        jobs.insert(
            name.to_string(),
            Arc::new(CronJob {
                name: name.to_string(),
                expression: expression.trim().to_string(),
                schedule,
                timezone,
                handler,
                run_lock: tokio::sync::Mutex::new(()),
                active: AtomicBool::new(false),
            }),
        );
        debug!(job = name, expression, timezone = timezone.name(), "cron job registered");
        Ok(())
    }

    /// Start one timer per registered job. Later calls do nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for job in self.all_jobs() {
            job.active.store(true, Ordering::SeqCst);
            let span = info_span!("cron", job = %job.name);
            self.tracker.spawn(
                timer_loop(job, self.clock.clone(), self.cancel.clone()).instrument(span),
            );
        }
        info!(jobs = self.tracker.len(), "scheduler started");
    }

    /// Cancel every timer and wait for runs already in progress.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        for job in self.all_jobs() {
            job.active.store(false, Ordering::SeqCst);
        }
        info!("scheduler stopped");
    }

    /// Run a job now, bypassing its schedule. Waits for the run to finish.
    pub async fn trigger(&self, name: &str) -> Result<TriggerOutcome, SchedulerError> {
        let job = self
            .job(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        let outcome = job.run_exclusive().await;
        if outcome == TriggerOutcome::AlreadyRunning {
            warn!(job = name, "manual trigger ignored, job is already running");
        }
        Ok(outcome)
    }

    /// Whether each job's timer is active.
    pub fn status(&self) -> BTreeMap<String, bool> {
        self.all_jobs()
            .into_iter()
            .map(|job| (job.name.clone(), job.active.load(Ordering::SeqCst)))
            .collect()
    }

    /// Whether the named job is executing right now.
    pub fn running(&self, name: &str) -> Option<bool> {
        self.job(name).map(|job| job.is_running())
    }

    pub fn describe(&self) -> Vec<CronJobStatus> {
        let now = self.clock.now();
        self.all_jobs()
            .into_iter()
            .map(|job| CronJobStatus {
                name: job.name.clone(),
                expression: job.expression.clone(),
                timezone: job.timezone.name().to_string(),
                active: job.active.load(Ordering::SeqCst),
                running: job.is_running(),
                next_run: job.next_after(now),
            })
            .collect()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.status())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

async fn timer_loop(job: Arc<CronJob>, clock: SharedClock, cancel: CancellationToken) {
    loop {
        let now = clock.now();
        let Some(next) = job.next_after(now) else {
            warn!("cron schedule has no further fire times");
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if job.run_exclusive().await == TriggerOutcome::AlreadyRunning {
            warn!("previous run still in progress, skipping scheduled firing");
        }
    }
    job.active.store(false, Ordering::SeqCst);
}

pub const FILE_CLEANUP_JOB: &str = "file-cleanup";
pub const HEALTH_CHECK_JOB: &str = "health-check";

/// Register the fixed maintenance jobs. A job whose configuration is invalid
/// is logged and left out; the rest still run.
pub fn register_defaults(
    scheduler: &Scheduler,
    settings: &CronSettings,
    producers: Producers,
    connections: Arc<ConnectionManager>,
) -> usize {
    let queue_producers = producers.clone();
    let folder = settings.cleanup_folder.clone();
    let older_than_days = settings.cleanup_older_than_days;
    let cleanup = handler(move || {
        let producers = producers.clone();
        let job = FileCleanupJob {
            folder: folder.clone(),
            older_than_days,
            paths: Vec::new(),
        };
        async move {
            let handle = producers.add_file_cleanup_job(job).await?;
            info!(job_id = %handle.id, "file cleanup enqueued");
            anyhow::Ok(())
        }
    });

    let health = handler(move || {
        let connections = connections.clone();
        let producers = queue_producers.clone();
        async move {
            if !connections.health_check().await {
                anyhow::bail!("store health check failed");
            }
            log_queue_counts(&producers).await;
            anyhow::Ok(())
        }
    });

    let mut registered = 0;
    for (name, expression, handler) in [
        (FILE_CLEANUP_JOB, settings.file_cleanup.as_str(), cleanup),
        (HEALTH_CHECK_JOB, settings.health_check.as_str(), health),
    ] {
        match scheduler.register(name, expression, &settings.timezone, handler) {
            Ok(()) => registered += 1,
            Err(e) => warn!(error = %e, "cron job disabled"),
        }
    }
    registered
}

async fn log_queue_counts(producers: &Producers) {
    for name in QueueName::ALL {
        let Some(queue) = producers.queue(name) else {
            continue;
        };
        match queue.counts().await {
            Ok(counts) => info!(
                queue = %name,
                waiting = counts.waiting,
                active = counts.active,
                delayed = counts.delayed,
                completed = counts.completed,
                failed = counts.failed,
                "queue counts"
            ),
            Err(e) => warn!(queue = %name, error = %e, "queue counts unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use crate::clock::SystemClock;

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(SystemClock))
    }

    fn noop() -> CronHandler {
        handler(|| async { anyhow::Ok(()) })
    }

    #[test]
    fn registration_validates_input() {
        let s = scheduler();
        s.register("five-field", "*/5 * * * *", "UTC", noop()).unwrap();
        s.register("six-field", "0 0 3 * * *", "Asia/Jakarta", noop()).unwrap();

        assert!(matches!(
            s.register("bad", "every tuesday", "UTC", noop()),
            Err(SchedulerError::InvalidExpression { .. })
        ));
        assert!(matches!(
            s.register("bad", "61 * * * *", "UTC", noop()),
            Err(SchedulerError::InvalidExpression { .. })
        ));
        assert!(matches!(
            s.register("tz", "0 * * * *", "Mars/Olympus", noop()),
            Err(SchedulerError::UnknownTimezone { .. })
        ));
        assert_eq!(
            s.register("six-field", "0 * * * * *", "UTC", noop()),
            Err(SchedulerError::Duplicate("six-field".into()))
        );
        assert_eq!(
            s.status(),
            BTreeMap::from([("five-field".to_string(), false), ("six-field".to_string(), false)])
        );
    }

    #[test]
    fn next_run_honours_time_zone() {
        let s = scheduler();
        s.register("daily", "0 0 3 * * *", "Asia/Jakarta", noop()).unwrap();
        let job = s.job("daily").unwrap();
        let now = DateTime::parse_from_rfc3339("2026-10-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        // 03:00 in Jakarta (UTC+7) is 20:00 UTC the day before.
        assert_eq!(
            job.next_after(now).unwrap().to_rfc3339(),
            "2026-10-15T20:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn manual_trigger_never_overlaps() {
        let s = Arc::new(scheduler());
        let runs = Arc::new(AtomicU32::new(0));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let started_tx = Arc::new(std::sync::Mutex::new(Some(started_tx)));
        let release = Arc::new(tokio::sync::Notify::new());

        let (r, tx, rel) = (runs.clone(), started_tx.clone(), release.clone());
        s.register(
            "slow",
            "0 0 3 * * *",
            "UTC",
            handler(move || {
                let (r, tx, rel) = (r.clone(), tx.clone(), rel.clone());
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    rel.notified().await;
                    anyhow::Ok(())
                }
            }),
        )
        .unwrap();

        let first = tokio::spawn({
            let s = s.clone();
            async move { s.trigger("slow").await }
        });
        started_rx.await.unwrap();
        assert_eq!(s.running("slow"), Some(true));

        assert_eq!(s.trigger("slow").await, Ok(TriggerOutcome::AlreadyRunning));
        release.notify_one();
        assert_eq!(first.await.unwrap(), Ok(TriggerOutcome::Completed));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(s.running("slow"), Some(false));
    }

    #[tokio::test]
    async fn failures_and_panics_are_contained() {
        let s = scheduler();
        s.register(
            "broken",
            "0 0 3 * * *",
            "UTC",
            handler(|| async { Err::<(), _>(anyhow::anyhow!("disk full")) }),
        )
        .unwrap();
        s.register(
            "panicky",
            "0 0 3 * * *",
            "UTC",
            handler(|| async {
                let config: Option<u32> = None;
                config.expect("boom");
                anyhow::Ok(())
            }),
        )
        .unwrap();

        assert_eq!(
            s.trigger("broken").await,
            Ok(TriggerOutcome::Failed("disk full".into()))
        );
        match s.trigger("panicky").await.unwrap() {
            TriggerOutcome::Failed(reason) => assert!(reason.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
        // Still usable afterwards.
        assert!(matches!(
            s.trigger("panicky").await,
            Ok(TriggerOutcome::Failed(_))
        ));
        assert_eq!(
            s.trigger("missing").await,
            Err(SchedulerError::UnknownJob("missing".into()))
        );
    }

    #[tokio::test]
    async fn timers_fire_until_stopped() {
        let s = scheduler();
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        s.register(
            "every-second",
            "* * * * * *",
            "UTC",
            handler(move || {
                let r = r.clone();
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }),
        )
        .unwrap();

        s.start();
        assert!(s.status()["every-second"]);
        assert_eq!(
            s.register("late", "* * * * * *", "UTC", noop()),
            Err(SchedulerError::AlreadyStarted)
        );

        tokio::time::sleep(Duration::from_millis(2500)).await;
        s.stop().await;
        let fired = runs.load(Ordering::SeqCst);
        assert!(fired >= 1, "fired {fired} times");
        assert!(!s.status()["every-second"]);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), fired);
    }
}
