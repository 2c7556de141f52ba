//! Job handlers and the external collaborators they drive.
//!
//! Each queue has one adapter handler. It decodes the typed payload, reports
//! a couple of progress milestones and performs exactly one side effect
//! through its collaborator. Collaborators are expected to be safe to call
//! again for the same payload, since a job can run more than once.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use orderflow_core::{EmailAddress, OrderId, PhoneNumber};

use super::payloads::{
    Attachment, EmailJob, FileCleanupJob, ImageUploadJob, JobPayload, ReportJob, WhatsappJob,
};
use super::queue::JobQueue;
use super::types::JobRecord;

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Worth another attempt (network hiccup, rate limited upstream, ...)
    #[error("{0}")]
    Retryable(String),

    /// Retrying cannot help (undecodable payload, rejected recipient, ...)
    #[error("{0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(e: impl std::fmt::Display) -> Self {
        Self::Retryable(e.to_string())
    }

    pub fn fatal(e: impl std::fmt::Display) -> Self {
        Self::Fatal(e.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}

/// Everything a handler sees about the job it runs.
pub struct JobContext {
    queue: Arc<JobQueue>,
    record: Mutex<JobRecord>,
}

impl JobContext {
    pub fn new(queue: Arc<JobQueue>, record: JobRecord) -> Self {
        Self {
            queue,
            record: Mutex::new(record),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self) -> JobRecord {
        self.lock().clone()
    }

    pub fn attempt(&self) -> u32 {
        self.lock().attempts_made
    }

    /// Decode the payload; a payload that does not decode is fatal.
    pub fn payload<T: JobPayload>(&self) -> Result<T, JobError> {
        let payload = self.lock().payload.clone();
        serde_json::from_value(payload)
            .map_err(|e| JobError::fatal(format!("invalid {} payload: {e}", T::QUEUE)))
    }

    /// Advisory progress. A failed write is logged and otherwise ignored.
    pub async fn report_progress(&self, progress: u8) {
        let mut snapshot = self.record();
        if let Err(e) = self.queue.update_progress(&mut snapshot, progress).await {
            warn!(job_id = %snapshot.id, error = %e, "failed to record job progress");
        }
        self.lock().progress = snapshot.progress;
    }

    pub(crate) fn into_record(self) -> JobRecord {
        self.record.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, ctx: &JobContext) -> Result<Value, JobError>;
}

/// Stores an uploaded image and returns its storage key.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn store(&self, bytes: &[u8], file_name: &str, folder: &str) -> anyhow::Result<String>;
}

/// Sends one e-mail and returns the provider's delivery id.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        to: &EmailAddress,
        subject: &str,
        html_body: &str,
        attachments: &[Attachment],
    ) -> anyhow::Result<String>;
}

/// Delivers one chat message about an order.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, phone: &PhoneNumber, message: &str, order_id: OrderId)
    -> anyhow::Result<()>;
}

/// Produces a report and returns where it was written.
#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(&self, report_type: &str, params: &Value) -> anyhow::Result<String>;
}

/// Removes files and returns how many were removed.
#[async_trait]
pub trait FileRemover: Send + Sync {
    async fn remove(&self, folder: &str, older_than_days: u32, paths: &[String])
    -> anyhow::Result<u64>;
}

pub struct ImageUploadHandler {
    pub store: Arc<dyn ImageStore>,
}

#[async_trait]
impl JobHandler for ImageUploadHandler {
    async fn process(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let job: ImageUploadJob = ctx.payload()?;
        ctx.report_progress(10).await;
        let key = self
            .store
            .store(&job.bytes, &job.file_name, &job.destination_folder)
            .await
            .map_err(JobError::retryable)?;
        ctx.report_progress(100).await;
        Ok(json!({ "storage_key": key, "size": job.bytes.len() }))
    }
}

pub struct EmailHandler {
    pub mailer: Arc<dyn Mailer>,
}

#[async_trait]
impl JobHandler for EmailHandler {
    async fn process(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let job: EmailJob = ctx.payload()?;
        ctx.report_progress(10).await;
        let delivery_id = self
            .mailer
            .send(&job.to, &job.subject, &job.html_body, &job.attachments)
            .await
            .map_err(JobError::retryable)?;
        ctx.report_progress(100).await;
        Ok(json!({ "delivery_id": delivery_id, "to": job.to }))
    }
}

pub struct WhatsappHandler {
    pub sender: Arc<dyn ChatSender>,
}

#[async_trait]
impl JobHandler for WhatsappHandler {
    async fn process(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let job: WhatsappJob = ctx.payload()?;
        ctx.report_progress(10).await;
        self.sender
            .send(&job.phone, &job.message, job.order_id)
            .await
            .map_err(JobError::retryable)?;
        ctx.report_progress(100).await;
        Ok(json!({ "order_id": job.order_id, "phone": job.phone }))
    }
}

pub struct ReportHandler {
    pub generator: Arc<dyn ReportGenerator>,
}

#[async_trait]
impl JobHandler for ReportHandler {
    async fn process(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let job: ReportJob = ctx.payload()?;
        ctx.report_progress(5).await;
        let location = self
            .generator
            .generate(&job.report_type, &job.params)
            .await
            .map_err(JobError::retryable)?;
        ctx.report_progress(100).await;
        Ok(json!({ "report_type": job.report_type, "location": location }))
    }
}

pub struct FileCleanupHandler {
    pub remover: Arc<dyn FileRemover>,
}

#[async_trait]
impl JobHandler for FileCleanupHandler {
    async fn process(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let job: FileCleanupJob = ctx.payload()?;
        let removed = self
            .remover
            .remove(&job.folder, job.older_than_days, &job.paths)
            .await
            .map_err(JobError::retryable)?;
        ctx.report_progress(100).await;
        Ok(json!({ "folder": job.folder, "removed": removed }))
    }
}
