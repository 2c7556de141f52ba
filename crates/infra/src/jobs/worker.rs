//! Queue worker: claims jobs and runs them with bounded concurrency.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::handlers::{JobContext, JobError, JobHandler};
use super::queue::{JobQueue, QueueError};
use super::types::{FailureOutcome, QueueName};

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
}

type SharedStats = Arc<Mutex<WorkerStats>>;

fn update(stats: &SharedStats, f: impl FnOnce(&mut WorkerStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    queue: QueueName,
    cancel: CancellationToken,
    join: JoinHandle<()>,
    stats: SharedStats,
}

impl WorkerHandle {
    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Stop claiming new jobs. In-flight jobs keep running.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait until the loop exited and every in-flight job finished.
    /// Returns the final statistics.
    pub async fn join(self) -> WorkerStats {
        if let Err(e) = self.join.await {
            error!(queue = %self.queue, error = %e, "worker task failed");
        }
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct Worker;

impl Worker {
    /// Spawn the worker loop for `queue` on the current runtime.
    ///
    /// At most `policy.concurrency` jobs run at once. The loop exits when
    /// `cancel` fires, after the jobs it already claimed have finished.
    pub fn spawn(
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> WorkerHandle {
        let stats = SharedStats::default();
        let name = queue.name();
        let join = tokio::spawn(
            worker_loop(queue, handler, cancel.clone(), stats.clone())
                .instrument(info_span!("worker", queue = %name)),
        );

        WorkerHandle {
            queue: name,
            cancel,
            join,
            stats,
        }
    }
}

async fn worker_loop(
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
    stats: SharedStats,
) {
    let policy = queue.policy().clone();
    let semaphore = Arc::new(Semaphore::new(policy.concurrency.max(1)));
    let tracker = TaskTracker::new();
    let mut last_recovery: Option<Instant> = None;

    info!(queue = %queue.name(), concurrency = policy.concurrency, "worker started");

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        if last_recovery.is_none_or(|at| at.elapsed() >= policy.lock_duration) {
            last_recovery = Some(Instant::now());
            if let Err(e) = queue.recover_stalled().await {
                warn!(queue = %queue.name(), error = %e, "stalled job recovery failed");
            }
        }

        let idle = match queue.claim().await {
            Ok(Some(job)) => {
                debug!(queue = %queue.name(), job_id = %job.id, attempt = job.attempts_made, "claimed job");
                let span = info_span!("job", queue = %queue.name(), job_id = %job.id);
                tracker.spawn(
                    run_job(queue.clone(), handler.clone(), JobContext::new(queue.clone(), job), stats.clone())
                        .instrument(span)
                        .map(move |()| drop(permit)),
                );
                false
            }
            Ok(None) => true,
            Err(e) => {
                error!(queue = %queue.name(), error = %e, "failed to claim job");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(policy.poll_interval) => {}
            }
        }
    }

    tracker.close();
    let in_flight = tracker.len();
    if in_flight > 0 {
        info!(queue = %queue.name(), in_flight, "worker stopping, waiting for in-flight jobs");
    }
    tracker.wait().await;
    info!(queue = %queue.name(), "worker stopped");
}

/// Run one claimed job to completion, renewing its lock meanwhile.
async fn run_job(
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    ctx: JobContext,
    stats: SharedStats,
) {
    update(&stats, |s| s.current_running += 1);
    let held = ctx.record();
    let id = held.id;
    let renew_every = (queue.policy().lock_duration / 2).max(Duration::from_millis(10));

    let outcome = {
        let work = AssertUnwindSafe(handler.process(&ctx)).catch_unwind();
        tokio::pin!(work);
        let mut renew = tokio::time::interval_at(
            tokio::time::Instant::now() + renew_every,
            renew_every,
        );
        loop {
            tokio::select! {
                result = &mut work => break result,
                _ = renew.tick() => match queue.extend_lock(&held).await {
                    Ok(true) => {}
                    Ok(false) => warn!(job_id = %id, "job lock lost while running"),
                    Err(e) => warn!(job_id = %id, error = %e, "failed to extend job lock"),
                },
            }
        }
    };

    let mut job = ctx.into_record();
    let failure = match outcome {
        Ok(Ok(result)) => match queue.complete(&mut job, result).await {
            Ok(()) => {
                debug!(job_id = %id, "job completed");
                update(&stats, |s| s.jobs_succeeded += 1);
                None
            }
            Err(QueueError::LockLost { .. }) => {
                warn!(job_id = %id, "job was claimed again before it finished, result discarded");
                None
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to record job completion");
                None
            }
        },
        Ok(Err(err)) => Some(err),
        Err(panic) => Some(JobError::Retryable(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };

    if let Some(err) = failure {
        match queue.fail(&mut job, err.to_string(), err.is_retryable()).await {
            Ok(FailureOutcome::Retrying { .. }) => update(&stats, |s| s.jobs_retried += 1),
            Ok(FailureOutcome::Failed) => update(&stats, |s| s.jobs_failed += 1),
            Err(QueueError::LockLost { .. }) => {
                warn!(job_id = %id, "job was claimed again before its failure was recorded")
            }
            Err(e) => error!(job_id = %id, error = %e, "failed to record job failure"),
        }
    }

    update(&stats, |s| {
        s.jobs_processed += 1;
        s.current_running = s.current_running.saturating_sub(1);
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
