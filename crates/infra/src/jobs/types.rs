//! Core job types and policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fixed set of queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    ImageUpload,
    EmailNotification,
    WhatsappNotification,
    ReportGeneration,
    FileCleanup,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::ImageUpload,
        QueueName::EmailNotification,
        QueueName::WhatsappNotification,
        QueueName::ReportGeneration,
        QueueName::FileCleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::ImageUpload => "image-upload",
            QueueName::EmailNotification => "email-notification",
            QueueName::WhatsappNotification => "whatsapp-notification",
            QueueName::ReportGeneration => "report-generation",
            QueueName::FileCleanup => "file-cleanup",
        }
    }

    /// Suffix used by `QUEUE_CONCURRENCY_<QUEUE>` variables.
    pub fn env_suffix(&self) -> String {
        self.as_str().replace('-', "_").to_ascii_uppercase()
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue: {s}"))
    }
}

/// Store-assigned job identifier, unique within its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobId)
    }
}

/// Job execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting to be claimed
    Waiting,
    /// Claimed by a worker
    Active,
    Completed,
    /// Attempts exhausted (or a fatal error); retained for inspection
    Failed,
    /// Waiting for its run-at time (initial delay or retry backoff)
    Delayed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10 * 60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// How many finished jobs of one kind to keep, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepPolicy {
    pub count: u64,
    pub age: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub completed: KeepPolicy,
    pub failed: KeepPolicy,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: KeepPolicy {
                count: 100,
                age: Duration::from_secs(24 * 3600),
            },
            failed: KeepPolicy {
                count: 500,
                age: Duration::from_secs(7 * 24 * 3600),
            },
        }
    }
}

/// Everything a queue and its worker need to know, supplied at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// Max jobs of this queue active at once in this process
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
    /// How long a claim is valid without renewal before the job counts as stalled
    pub lock_duration: Duration,
    /// Sleep between claims when the queue is empty
    pub poll_interval: Duration,
}

impl QueuePolicy {
    pub fn for_queue(queue: QueueName) -> Self {
        let concurrency = match queue {
            QueueName::ImageUpload => 5,
            QueueName::EmailNotification => 3,
            QueueName::WhatsappNotification => 5,
            QueueName::ReportGeneration => 2,
            QueueName::FileCleanup => 1,
        };
        Self {
            concurrency,
            retry: RetryPolicy::default(),
            retention: RetentionPolicy::default(),
            lock_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Producer-side knobs for one enqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Lower is served first
    pub priority: u32,
    /// Hold the job back for this long before it becomes claimable
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn priority(priority: u32) -> Self {
        Self {
            priority,
            delay: None,
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            priority: 0,
            delay: Some(delay),
        }
    }
}

/// What a producer gets back from a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub queue: QueueName,
    pub id: JobId,
}

/// Persisted job body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: QueueName,
    /// Job type, e.g. `send-order-confirmation`
    pub name: String,
    pub payload: serde_json::Value,
    pub priority: u32,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub state: JobState,
    /// 0-100, advisory only
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the latest attempt started
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Run-at time while delayed
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Execution history (one entry per finished attempt)
    pub history: Vec<AttemptRecord>,
    /// Set on the copy a worker holds while its claim lasts; never persisted.
    #[serde(skip)]
    pub(crate) claim_token: Option<String>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl JobRecord {
    pub fn new(
        id: JobId,
        queue: QueueName,
        name: impl Into<String>,
        payload: serde_json::Value,
        priority: u32,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue,
            name: name.into(),
            payload,
            priority,
            attempts_made: 0,
            max_attempts,
            state: JobState::Waiting,
            progress: 0,
            result: None,
            failure_reason: None,
            created_at: now,
            processed_at: None,
            finished_at: None,
            next_attempt_at: None,
            history: Vec::new(),
            claim_token: None,
        }
    }

    /// Mark job as claimed by a worker.
    pub fn mark_active(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.processed_at = Some(now);
        self.next_attempt_at = None;
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.record_attempt(None, now);
        self.state = JobState::Completed;
        self.result = Some(result);
        self.failure_reason = None;
        self.finished_at = Some(now);
    }

    /// Mark job as waiting for a retry at `run_at`.
    pub fn mark_retrying(&mut self, error: String, run_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.record_attempt(Some(error), now);
        self.state = JobState::Delayed;
        self.next_attempt_at = Some(run_at);
    }

    /// Mark job as failed for good.
    pub fn mark_failed(&mut self, reason: String, now: DateTime<Utc>) {
        self.record_attempt(Some(reason.clone()), now);
        self.state = JobState::Failed;
        self.failure_reason = Some(reason);
        self.finished_at = Some(now);
        self.next_attempt_at = None;
    }

    fn record_attempt(&mut self, error: Option<String>, now: DateTime<Utc>) {
        let started_at = self.processed_at.unwrap_or(now);
        self.history.push(AttemptRecord {
            attempt: self.attempts_made,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            queue: self.queue,
            status: self.state,
            progress: self.progress,
            attempts_made: self.attempts_made,
            result: self.result.clone(),
            failure_reason: self.failure_reason.clone(),
        }
    }
}

/// What `get_job_status` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub queue: QueueName,
    pub status: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Per-state job counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Re-scheduled; claimable again after `delay`
    Retrying { delay: Duration },
    /// Attempts exhausted (or the error was fatal)
    Failed,
}
