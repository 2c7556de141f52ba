//! Background job system with retry, backoff and retention.
//!
//! ## Design
//!
//! - One durable queue per [`QueueName`], living entirely in the store
//! - Retry/backoff and retention are an explicit [`QueuePolicy`] per queue
//! - Failed jobs are retained (count- and age-capped) for inspection or retry
//! - Delivery is at-least-once: handlers must tolerate running twice
//!
//! ## Components
//!
//! - [`JobQueue`]: enqueue, claim, complete/fail, status and counts
//! - [`Worker`]: semaphore-bounded loop running one queue's [`JobHandler`]
//! - [`Producers`]: typed `add_*_job` entry points
//! - handler adapters driving the external collaborators

pub mod handlers;
pub mod local;
pub mod payloads;
pub mod producers;
pub mod queue;
pub mod types;
pub mod worker;

pub use handlers::{
    ChatSender, EmailHandler, FileCleanupHandler, FileRemover, ImageStore, ImageUploadHandler,
    JobContext, JobError, JobHandler, Mailer, ReportGenerator, ReportHandler, WhatsappHandler,
};
pub use local::{LocalFileRemover, LocalImageStore};
pub use payloads::{
    Attachment, EmailJob, FileCleanupJob, ImageUploadJob, JobPayload, ReportJob, WhatsappJob,
};
pub use producers::Producers;
pub use queue::{JobQueue, QueueError};
pub use types::{
    BackoffStrategy, EnqueueOptions, FailureOutcome, JobHandle, JobId, JobRecord, JobState,
    JobStatusView, KeepPolicy, QueueCounts, QueueName, QueuePolicy, RetentionPolicy, RetryPolicy,
};
pub use worker::{Worker, WorkerHandle, WorkerStats};
