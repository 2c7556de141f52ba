//! Store-backed job queue.
//!
//! ## Layout (per queue)
//!
//! - `queue:{name}:id` - id counter (`INCR`)
//! - `queue:{name}:job:{id}` - JSON [`JobRecord`]
//! - `queue:{name}:wait` - claimable jobs, scored `priority * 1e12 + id`
//! - `queue:{name}:delayed` - scored by run-at (epoch ms)
//! - `queue:{name}:active` - scored by lock expiry (epoch ms)
//! - `queue:{name}:lock:{id}` - token of the current claim on an active job
//! - `queue:{name}:completed` / `failed` - scored by finish time (epoch ms)
//!
//! A job id lives in exactly one of the sets. Moves between sets are single
//! atomic store primitives, and only the caller that wins a move rewrites
//! the job body. Moves out of `active` by the worker that claimed the job
//! are additionally gated on its claim token, so a worker whose lock expired
//! and whose job was claimed again cannot settle it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::types::{
    EnqueueOptions, FailureOutcome, JobHandle, JobId, JobRecord, JobState, JobStatusView,
    KeepPolicy, QueueCounts, QueueName, QueuePolicy,
};
use crate::clock::SharedClock;
use uuid::Uuid;

use crate::store::{Connection, KeyWrite, OwnedMove, ScoreBound, Store, StoreError};

/// Priorities above this are clamped so wait scores stay exact in an f64.
pub const MAX_PRIORITY: u32 = 1_000;

/// Width of one priority band in the wait score. Ids stay FIFO within a
/// band up to this many jobs per queue.
const ID_BAND: f64 = 1e12;

/// Delayed jobs promoted (and stalled jobs recovered) per pass.
const BATCH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("job {id} in queue {queue} has an unreadable body: {message}")]
    Corrupt {
        queue: QueueName,
        id: JobId,
        message: String,
    },

    #[error("invalid payload: {0}")]
    Payload(String),

    #[error("job {id} in queue {queue} is no longer held by this worker")]
    LockLost { queue: QueueName, id: JobId },
}

#[derive(Debug, Clone)]
struct QueueKeys {
    id: String,
    job_prefix: String,
    lock_prefix: String,
    wait: String,
    active: String,
    delayed: String,
    completed: String,
    failed: String,
}

impl QueueKeys {
    fn new(queue: QueueName) -> Self {
        let base = format!("queue:{}", queue.as_str());
        Self {
            id: format!("{base}:id"),
            job_prefix: format!("{base}:job:"),
            lock_prefix: format!("{base}:lock:"),
            wait: format!("{base}:wait"),
            active: format!("{base}:active"),
            delayed: format!("{base}:delayed"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
        }
    }

    fn job(&self, id: JobId) -> String {
        format!("{}{}", self.job_prefix, id)
    }

    fn lock(&self, id: JobId) -> String {
        format!("{}{}", self.lock_prefix, id)
    }
}

fn wait_score(priority: u32, id: JobId) -> f64 {
    priority.min(MAX_PRIORITY) as f64 * ID_BAND + id.0 as f64
}

fn millis(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One named queue.
pub struct JobQueue {
    name: QueueName,
    policy: QueuePolicy,
    conn: Connection,
    clock: SharedClock,
    keys: QueueKeys,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish()
    }
}

impl JobQueue {
    pub fn new(name: QueueName, policy: QueuePolicy, conn: Connection, clock: SharedClock) -> Self {
        Self {
            name,
            policy,
            conn,
            clock,
            keys: QueueKeys::new(name),
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    fn store(&self) -> &dyn Store {
        self.conn.store().as_ref()
    }

    /// Add a job. Failures are returned, never swallowed: a producer must
    /// know its job was not recorded.
    #[instrument(skip(self, payload), fields(queue = %self.name), err)]
    pub async fn enqueue(
        &self,
        job_name: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<JobHandle, QueueError> {
        let id = JobId(self.store().incr(&self.keys.id).await?);
        let now = self.clock.now();
        let priority = opts.priority.min(MAX_PRIORITY);

        let mut record = JobRecord::new(
            id,
            self.name,
            job_name,
            payload,
            priority,
            self.policy.retry.max_attempts.max(1),
            now,
        );
        let run_at = opts.delay.filter(|d| !d.is_zero()).map(|d| after(now, d));
        if let Some(run_at) = run_at {
            record.state = JobState::Delayed;
            record.next_attempt_at = Some(run_at);
        }

        self.write(&record, None).await?;
        let member = id.to_string();
        match run_at {
            Some(run_at) => {
                self.store()
                    .zadd(&self.keys.delayed, &member, millis(run_at))
                    .await?
            }
            None => {
                self.store()
                    .zadd(&self.keys.wait, &member, wait_score(priority, id))
                    .await?
            }
        }

        debug!(queue = %self.name, job_id = %id, job = job_name, "job enqueued");
        Ok(JobHandle {
            queue: self.name,
            id,
        })
    }

    /// Claim the best waiting job, promoting due delayed jobs first.
    ///
    /// The claimed job sits in `active` with a lock that expires after the
    /// policy's `lock_duration` unless renewed with [`JobQueue::extend_lock`].
    pub async fn claim(&self) -> Result<Option<JobRecord>, QueueError> {
        self.promote_due().await?;

        let now = self.clock.now();
        let lock_until = after(now, self.policy.lock_duration);
        let Some(member) = self
            .store()
            .zpop_min_into(&self.keys.wait, &self.keys.active, millis(lock_until))
            .await?
        else {
            return Ok(None);
        };

        let id = self.parse_member(&member)?;
        let Some(mut record) = self.load(id).await? else {
            // Body removed underneath us; drop the orphaned id.
            warn!(queue = %self.name, job_id = %id, "claimed job has no body, discarding");
            self.store().zrem(&self.keys.active, &member).await?;
            return Ok(None);
        };

        let token = Uuid::now_v7().to_string();
        self.store().set(&self.keys.lock(id), &token, None).await?;
        record.mark_active(now);
        record.claim_token = Some(token);
        self.write(&record, None).await?;
        Ok(Some(record))
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let due = self
            .store()
            .zrange_by_score(
                &self.keys.delayed,
                ScoreBound::NegInf,
                ScoreBound::Inclusive(millis(now)),
                Some(BATCH),
            )
            .await?;

        let mut promoted = 0;
        for (member, _) in due {
            let id = self.parse_member(&member)?;
            let priority = match self.load(id).await? {
                Some(record) => record.priority,
                None => {
                    self.store().zrem(&self.keys.delayed, &member).await?;
                    continue;
                }
            };
            if self
                .store()
                .zmove(&self.keys.delayed, &self.keys.wait, &member, wait_score(priority, id))
                .await?
            {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Record a successful attempt.
    pub async fn complete(
        &self,
        job: &mut JobRecord,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        job.mark_completed(result, now);
        let keep = self.policy.retention.completed;

        self.settle(job, &self.keys.completed, millis(now), Some(keep.age))
            .await?;
        job.claim_token = None;
        self.trim(&self.keys.completed, keep).await?;
        Ok(())
    }

    /// Record a failed attempt: back to `delayed` while attempts remain and
    /// the error is retryable, otherwise `failed` (retained, with a reason).
    pub async fn fail(
        &self,
        job: &mut JobRecord,
        reason: impl Into<String>,
        retryable: bool,
    ) -> Result<FailureOutcome, QueueError> {
        let reason = reason.into();
        let now = self.clock.now();

        if retryable && job.attempts_made < job.max_attempts {
            let delay = self.policy.retry.delay_for_attempt(job.attempts_made);
            let run_at = after(now, delay);
            job.mark_retrying(reason, run_at, now);
            self.settle(job, &self.keys.delayed, millis(run_at), None)
                .await?;
            job.claim_token = None;
            debug!(
                queue = %self.name,
                job_id = %job.id,
                attempt = job.attempts_made,
                delay_ms = delay.as_millis() as u64,
                "job failed, retry scheduled"
            );
            return Ok(FailureOutcome::Retrying { delay });
        }

        job.mark_failed(reason, now);
        let keep = self.policy.retention.failed;
        self.settle(job, &self.keys.failed, millis(now), Some(keep.age))
            .await?;
        job.claim_token = None;
        self.trim(&self.keys.failed, keep).await?;
        warn!(
            queue = %self.name,
            job_id = %job.id,
            attempts = job.attempts_made,
            reason = job.failure_reason.as_deref().unwrap_or_default(),
            "job failed permanently"
        );
        Ok(FailureOutcome::Failed)
    }

    /// Move a claimed job from `active` to `dst` and write its body, as one
    /// step and only while `job` still holds the claim. Moving to `active`
    /// itself keeps the claim and only renews the lock.
    async fn settle(
        &self,
        job: &JobRecord,
        dst: &str,
        score: f64,
        ttl: Option<Duration>,
    ) -> Result<(), QueueError> {
        let lost = || QueueError::LockLost {
            queue: self.name,
            id: job.id,
        };
        let token = job.claim_token.as_deref().ok_or_else(lost)?;
        let body = serde_json::to_string(job).map_err(StoreError::from)?;
        let member = job.id.to_string();
        let key = self.keys.job(job.id);
        let lock_key = self.keys.lock(job.id);

        let moved = self
            .store()
            .zmove_owned(OwnedMove {
                src: &self.keys.active,
                dst,
                member: &member,
                score,
                lock_key: &lock_key,
                token,
                release: dst != self.keys.active,
                write: Some(KeyWrite {
                    key: &key,
                    value: &body,
                    ttl,
                }),
            })
            .await?;
        if moved { Ok(()) } else { Err(lost()) }
    }

    /// Keep the newest `keep.count` members; drop older ones with their bodies.
    async fn trim(&self, set: &str, keep: KeepPolicy) -> Result<u64, QueueError> {
        let len = self.store().zcard(set).await?;
        let excess = len.saturating_sub(keep.count);
        if excess == 0 {
            return Ok(0);
        }
        let stop = excess as isize - 1;
        let ids = self.store().zrange(set, 0, stop).await?;
        let bodies: Vec<String> = ids
            .iter()
            .filter_map(|m| m.parse::<u64>().ok().map(|id| self.keys.job(JobId(id))))
            .collect();
        self.store().del(&bodies).await?;
        let removed = self.store().zrem_range_by_rank(set, 0, stop).await?;
        Ok(removed)
    }

    /// Persist advisory progress (clamped to 100). Also renews the lock.
    pub async fn update_progress(&self, job: &mut JobRecord, progress: u8) -> Result<(), QueueError> {
        job.progress = progress.min(100);
        let until = after(self.clock.now(), self.policy.lock_duration);
        self.settle(job, &self.keys.active, millis(until), None).await
    }

    /// Renew the claim `job` holds. `false` means the lock was lost.
    pub async fn extend_lock(&self, job: &JobRecord) -> Result<bool, QueueError> {
        let Some(token) = job.claim_token.as_deref() else {
            return Ok(false);
        };
        let until = after(self.clock.now(), self.policy.lock_duration);
        let member = job.id.to_string();
        let lock_key = self.keys.lock(job.id);
        Ok(self
            .store()
            .zmove_owned(OwnedMove {
                src: &self.keys.active,
                dst: &self.keys.active,
                member: &member,
                score: millis(until),
                lock_key: &lock_key,
                token,
                release: false,
                write: None,
            })
            .await?)
    }

    /// Return active jobs whose lock expired to `wait`, or to `failed` when
    /// they have no attempts left. Covers workers that died mid-job.
    pub async fn recover_stalled(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let stalled = self
            .store()
            .zrange_by_score(
                &self.keys.active,
                ScoreBound::NegInf,
                ScoreBound::Exclusive(millis(now)),
                Some(BATCH),
            )
            .await?;

        let mut recovered = 0;
        for (member, _) in stalled {
            let id = self.parse_member(&member)?;
            // Revoke the expired claim before moving the job.
            self.store().del(&[self.keys.lock(id)]).await?;
            let Some(mut record) = self.load(id).await? else {
                self.store().zrem(&self.keys.active, &member).await?;
                continue;
            };

            if record.attempts_made >= record.max_attempts {
                if self
                    .store()
                    .zmove(&self.keys.active, &self.keys.failed, &member, millis(now))
                    .await?
                {
                    record.mark_failed("job stalled: lock expired".into(), now);
                    let keep = self.policy.retention.failed;
                    self.write(&record, Some(keep.age)).await?;
                    self.trim(&self.keys.failed, keep).await?;
                    recovered += 1;
                }
            } else if self
                .store()
                .zmove(
                    &self.keys.active,
                    &self.keys.wait,
                    &member,
                    wait_score(record.priority, id),
                )
                .await?
            {
                record.state = JobState::Waiting;
                self.write(&record, None).await?;
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(queue = %self.name, recovered, "stalled jobs recovered");
        }
        Ok(recovered)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        self.load(id).await
    }

    pub async fn job_status(&self, id: JobId) -> Result<Option<JobStatusView>, QueueError> {
        Ok(self.load(id).await?.map(|record| record.status_view()))
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let store = self.store();
        Ok(QueueCounts {
            waiting: store.zcard(&self.keys.wait).await?,
            active: store.zcard(&self.keys.active).await?,
            completed: store.zcard(&self.keys.completed).await?,
            failed: store.zcard(&self.keys.failed).await?,
            delayed: store.zcard(&self.keys.delayed).await?,
        })
    }

    /// Put a failed job back in line with a fresh attempt budget.
    pub async fn retry_failed(&self, id: JobId) -> Result<bool, QueueError> {
        let Some(mut record) = self.load(id).await? else {
            return Ok(false);
        };
        let member = id.to_string();
        if !self
            .store()
            .zmove(
                &self.keys.failed,
                &self.keys.wait,
                &member,
                wait_score(record.priority, id),
            )
            .await?
        {
            return Ok(false);
        }

        record.state = JobState::Waiting;
        record.attempts_made = 0;
        record.failure_reason = None;
        record.finished_at = None;
        record.progress = 0;
        self.write(&record, None).await?;
        info!(queue = %self.name, job_id = %id, "failed job re-queued");
        Ok(true)
    }

    /// Delete a job wherever it is.
    pub async fn remove(&self, id: JobId) -> Result<bool, QueueError> {
        let member = id.to_string();
        let mut found = false;
        for set in [
            &self.keys.wait,
            &self.keys.delayed,
            &self.keys.active,
            &self.keys.completed,
            &self.keys.failed,
        ] {
            found |= self.store().zrem(set, &member).await?;
        }
        found |= self
            .store()
            .del(&[self.keys.job(id), self.keys.lock(id)])
            .await?
            > 0;
        Ok(found)
    }

    async fn load(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let Some(raw) = self.store().get(&self.keys.job(id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| QueueError::Corrupt {
                queue: self.name,
                id,
                message: e.to_string(),
            })
    }

    async fn write(&self, record: &JobRecord, ttl: Option<Duration>) -> Result<(), QueueError> {
        let body = serde_json::to_string(record).map_err(StoreError::from)?;
        self.store().set(&self.keys.job(record.id), &body, ttl).await?;
        Ok(())
    }

    fn parse_member(&self, member: &str) -> Result<JobId, QueueError> {
        member.parse().map_err(|_| QueueError::Corrupt {
            queue: self.name,
            id: JobId(0),
            message: format!("non-numeric job id `{member}`"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::jobs::types::RetryPolicy;
    use crate::store::{MemoryStore, Purpose};

    struct Fixture {
        queue: JobQueue,
        clock: MockClock,
        store: Arc<MemoryStore>,
    }

    fn fixture(policy: QueuePolicy) -> Fixture {
        let clock = MockClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let conn = Connection::new(Purpose::Queue, store.clone());
        let queue = JobQueue::new(
            QueueName::EmailNotification,
            policy,
            conn,
            Arc::new(clock.clone()),
        );
        Fixture {
            queue,
            clock,
            store,
        }
    }

    fn default_fixture() -> Fixture {
        fixture(QueuePolicy::for_queue(QueueName::EmailNotification))
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let f = default_fixture();
        let handle = f
            .queue
            .enqueue("send-email", serde_json::json!({"n": 1}), EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.id, JobId(1));

        let status = f.queue.job_status(handle.id).await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Waiting);

        let job = f.queue.claim().await.unwrap().unwrap();
        assert_eq!(job.id, handle.id);
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts_made, 1);
        assert!(f.queue.claim().await.unwrap().is_none());

        let counts = f.queue.counts().await.unwrap();
        assert_eq!(counts.active, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn lower_priority_value_is_served_first_then_fifo() {
        let f = default_fixture();
        let low = f
            .queue
            .enqueue("a", serde_json::json!({}), EnqueueOptions::priority(5))
            .await
            .unwrap();
        let urgent_1 = f
            .queue
            .enqueue("b", serde_json::json!({}), EnqueueOptions::priority(1))
            .await
            .unwrap();
        let urgent_2 = f
            .queue
            .enqueue("c", serde_json::json!({}), EnqueueOptions::priority(1))
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(job) = f.queue.claim().await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec![urgent_1.id, urgent_2.id, low.id]);
    }

    #[tokio::test]
    async fn delayed_job_is_not_claimable_until_due() {
        let f = default_fixture();
        f.queue
            .enqueue(
                "later",
                serde_json::json!({}),
                EnqueueOptions::delayed(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        assert_eq!(f.queue.counts().await.unwrap().delayed, 1);
        assert!(f.queue.claim().await.unwrap().is_none());

        f.clock.advance(Duration::from_secs(10));
        assert!(f.queue.claim().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn enqueue_surfaces_store_outage() {
        let f = default_fixture();
        f.store.set_available(false);
        let err = f
            .queue
            .enqueue("x", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Store(e) if e.is_unavailable()));
    }

    #[tokio::test]
    async fn retries_with_exponential_backoff_then_completes() {
        let f = default_fixture();
        let handle = f
            .queue
            .enqueue("flaky", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let mut delays = Vec::new();
        loop {
            let Some(mut job) = f.queue.claim().await.unwrap() else {
                panic!("job should be claimable after its backoff");
            };
            if job.attempts_made < job.max_attempts {
                match f.queue.fail(&mut job, "transient", true).await.unwrap() {
                    FailureOutcome::Retrying { delay } => {
                        assert!(f.queue.claim().await.unwrap().is_none(), "not due yet");
                        delays.push(delay);
                        f.clock.advance(delay);
                    }
                    FailureOutcome::Failed => panic!("attempts remain"),
                }
            } else {
                f.queue
                    .complete(&mut job, serde_json::json!({"delivered": true}))
                    .await
                    .unwrap();
                break;
            }
        }

        assert_eq!(delays, vec![Duration::from_secs(2), Duration::from_secs(4)]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));

        let job = f.queue.get_job(handle.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, job.max_attempts);
        assert_eq!(job.result, Some(serde_json::json!({"delivered": true})));
        assert_eq!(job.history.len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_a_queryable_failed_job() {
        let f = default_fixture();
        let handle = f
            .queue
            .enqueue("doomed", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let mut attempts = 0;
        while let Some(mut job) = f.queue.claim().await.unwrap() {
            attempts += 1;
            if let FailureOutcome::Retrying { delay } =
                f.queue.fail(&mut job, "smtp 550", true).await.unwrap()
            {
                f.clock.advance(delay);
            }
        }

        assert_eq!(attempts, 3);
        let status = f.queue.job_status(handle.id).await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Failed);
        assert_eq!(status.attempts_made, 3);
        assert_eq!(status.failure_reason.as_deref(), Some("smtp 550"));
        assert_eq!(f.queue.counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn fatal_errors_skip_remaining_attempts() {
        let f = default_fixture();
        f.queue
            .enqueue("bad", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let mut job = f.queue.claim().await.unwrap().unwrap();
        let outcome = f.queue.fail(&mut job, "undecodable payload", false).await.unwrap();
        assert_eq!(outcome, FailureOutcome::Failed);
        assert_eq!(job.attempts_made, 1);
    }

    #[tokio::test]
    async fn finished_jobs_are_trimmed_and_expire() {
        let mut policy = QueuePolicy::for_queue(QueueName::EmailNotification);
        policy.retention.completed = KeepPolicy {
            count: 2,
            age: Duration::from_secs(60),
        };
        let f = fixture(policy);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let handle = f
                .queue
                .enqueue("ok", serde_json::json!({}), EnqueueOptions::default())
                .await
                .unwrap();
            ids.push(handle.id);
            let mut job = f.queue.claim().await.unwrap().unwrap();
            f.queue.complete(&mut job, serde_json::json!(null)).await.unwrap();
            f.clock.advance(Duration::from_millis(5));
        }

        assert_eq!(f.queue.counts().await.unwrap().completed, 2);
        assert!(f.queue.get_job(ids[0]).await.unwrap().is_none(), "oldest trimmed");
        assert!(f.queue.get_job(ids[2]).await.unwrap().is_some());

        f.clock.advance(Duration::from_secs(61));
        assert!(f.queue.get_job(ids[2]).await.unwrap().is_none(), "body expired");
    }

    #[tokio::test]
    async fn stalled_jobs_return_to_wait() {
        let f = default_fixture();
        let handle = f
            .queue
            .enqueue("crashy", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = f.queue.claim().await.unwrap().unwrap();

        assert_eq!(f.queue.recover_stalled().await.unwrap(), 0, "lock still valid");
        assert!(f.queue.extend_lock(&job).await.unwrap());

        f.clock.advance(f.queue.policy().lock_duration + Duration::from_secs(1));
        assert_eq!(f.queue.recover_stalled().await.unwrap(), 1);
        assert!(!f.queue.extend_lock(&job).await.unwrap(), "lock lost");

        let again = f.queue.claim().await.unwrap().unwrap();
        assert_eq!(again.id, handle.id);
        assert_eq!(again.attempts_made, 2);
    }

    #[tokio::test]
    async fn expired_claim_cannot_settle_a_reclaimed_job() {
        let f = default_fixture();
        let handle = f
            .queue
            .enqueue("slow", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let mut stale = f.queue.claim().await.unwrap().unwrap();

        f.clock.advance(f.queue.policy().lock_duration + Duration::from_secs(1));
        assert_eq!(f.queue.recover_stalled().await.unwrap(), 1);
        let mut fresh = f.queue.claim().await.unwrap().unwrap();
        assert_eq!(fresh.id, stale.id);

        let err = f
            .queue
            .complete(&mut stale, serde_json::json!({"late": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LockLost { id, .. } if id == handle.id));
        assert!(matches!(
            f.queue.fail(&mut stale, "late failure", true).await,
            Err(QueueError::LockLost { .. })
        ));
        assert!(matches!(
            f.queue.update_progress(&mut stale, 50).await,
            Err(QueueError::LockLost { .. })
        ));

        let counts = f.queue.counts().await.unwrap();
        assert_eq!(counts.active, 1);
        assert_eq!(counts.completed, 0);
        assert_eq!(counts.delayed, 0);
        let body = f.queue.get_job(handle.id).await.unwrap().unwrap();
        assert_eq!(body.state, JobState::Active);
        assert_eq!(body.progress, 0);

        assert!(f.queue.extend_lock(&fresh).await.unwrap());
        f.queue
            .complete(&mut fresh, serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let counts = f.queue.counts().await.unwrap();
        assert_eq!((counts.active, counts.completed), (0, 1));
        assert!(!f.queue.extend_lock(&fresh).await.unwrap(), "claim released");
    }

    #[tokio::test]
    async fn job_never_claimed_cannot_be_settled() {
        let f = default_fixture();
        let handle = f
            .queue
            .enqueue("x", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let mut record = f.queue.get_job(handle.id).await.unwrap().unwrap();
        assert!(matches!(
            f.queue.complete(&mut record, serde_json::json!(null)).await,
            Err(QueueError::LockLost { .. })
        ));
        assert_eq!(f.queue.counts().await.unwrap().waiting, 1);
    }

    #[test]
    fn priority_bands_hold_past_a_billion_ids() {
        let late_urgent = wait_score(0, JobId(2_000_000_000));
        let early_normal = wait_score(1, JobId(1));
        assert!(late_urgent < early_normal);
        assert_eq!(wait_score(MAX_PRIORITY + 7, JobId(1)), wait_score(MAX_PRIORITY, JobId(1)));
    }

    #[tokio::test]
    async fn stalled_job_without_attempts_left_fails() {
        let policy = QueuePolicy::for_queue(QueueName::EmailNotification)
            .with_retry(RetryPolicy::no_retry());
        let f = fixture(policy);
        let handle = f
            .queue
            .enqueue("once", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        f.queue.claim().await.unwrap().unwrap();

        f.clock.advance(Duration::from_secs(31));
        assert_eq!(f.queue.recover_stalled().await.unwrap(), 1);
        let status = f.queue.job_status(handle.id).await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Failed);
        assert!(status.failure_reason.unwrap().contains("lock expired"));
    }

    #[tokio::test]
    async fn failed_job_can_be_retried_by_an_operator() {
        let policy = QueuePolicy::for_queue(QueueName::EmailNotification)
            .with_retry(RetryPolicy::no_retry());
        let f = fixture(policy);
        let handle = f
            .queue
            .enqueue("once", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let mut job = f.queue.claim().await.unwrap().unwrap();
        f.queue.fail(&mut job, "boom", true).await.unwrap();

        assert!(f.queue.retry_failed(handle.id).await.unwrap());
        assert!(!f.queue.retry_failed(handle.id).await.unwrap(), "already re-queued");

        let job = f.queue.claim().await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        assert!(job.failure_reason.is_none());
    }

    #[tokio::test]
    async fn progress_is_clamped_and_remove_deletes_everything() {
        let f = default_fixture();
        let handle = f
            .queue
            .enqueue("p", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let mut job = f.queue.claim().await.unwrap().unwrap();
        f.queue.update_progress(&mut job, 250).await.unwrap();
        assert_eq!(f.queue.job_status(handle.id).await.unwrap().unwrap().progress, 100);

        assert!(f.queue.remove(handle.id).await.unwrap());
        assert!(f.queue.get_job(handle.id).await.unwrap().is_none());
        assert_eq!(f.queue.counts().await.unwrap(), QueueCounts::default());
    }
}
