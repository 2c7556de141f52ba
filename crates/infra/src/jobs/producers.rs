//! Producer API used by the rest of the platform.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::payloads::{
    EmailJob, FileCleanupJob, ImageUploadJob, JobPayload, ReportJob, WhatsappJob,
};
use super::queue::{JobQueue, QueueError};
use super::types::{EnqueueOptions, JobHandle, JobId, JobStatusView, QueueName};

/// Cheap to clone; every clone enqueues into the same queues.
#[derive(Debug, Clone)]
pub struct Producers {
    queues: Arc<BTreeMap<QueueName, Arc<JobQueue>>>,
}

impl Producers {
    pub fn new(queues: impl IntoIterator<Item = Arc<JobQueue>>) -> Self {
        Self {
            queues: Arc::new(queues.into_iter().map(|q| (q.name(), q)).collect()),
        }
    }

    pub fn queue(&self, name: QueueName) -> Option<&Arc<JobQueue>> {
        self.queues.get(&name)
    }

    /// Enqueue any typed payload on its own queue.
    pub async fn add<P: JobPayload>(
        &self,
        payload: &P,
        opts: EnqueueOptions,
    ) -> Result<JobHandle, QueueError> {
        let queue = self.queues.get(&P::QUEUE).ok_or_else(|| {
            QueueError::Payload(format!("queue {} is not configured", P::QUEUE))
        })?;
        let value =
            serde_json::to_value(payload).map_err(|e| QueueError::Payload(e.to_string()))?;
        queue.enqueue(payload.job_name(), value, opts).await
    }

    pub async fn add_image_upload_job(&self, job: ImageUploadJob) -> Result<JobHandle, QueueError> {
        self.add(&job, EnqueueOptions::default()).await
    }

    /// Transactional mail goes ahead of bulk mail.
    pub async fn add_email_job(&self, job: EmailJob) -> Result<JobHandle, QueueError> {
        self.add(&job, EnqueueOptions::priority(1)).await
    }

    pub async fn add_whatsapp_job(&self, job: WhatsappJob) -> Result<JobHandle, QueueError> {
        self.add(&job, EnqueueOptions::priority(1)).await
    }

    pub async fn add_report_job(&self, job: ReportJob) -> Result<JobHandle, QueueError> {
        self.add(&job, EnqueueOptions::default()).await
    }

    pub async fn add_file_cleanup_job(&self, job: FileCleanupJob) -> Result<JobHandle, QueueError> {
        self.add(&job, EnqueueOptions::priority(10)).await
    }

    /// `None` when the job never existed or its retention expired.
    pub async fn get_job_status(
        &self,
        queue: QueueName,
        id: JobId,
    ) -> Result<Option<JobStatusView>, QueueError> {
        match self.queues.get(&queue) {
            Some(q) => q.job_status(id).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::jobs::types::{JobState, QueuePolicy};
    use crate::store::{Connection, MemoryStore, Purpose};
    use orderflow_core::{OrderId, PhoneNumber};

    fn producers() -> Producers {
        let conn = Connection::new(Purpose::Queue, MemoryStore::arc());
        Producers::new(QueueName::ALL.into_iter().map(|name| {
            JobQueue::new(
                name,
                QueuePolicy::for_queue(name),
                conn.clone(),
                Arc::new(SystemClock),
            )
            .arc()
        }))
    }

    #[tokio::test]
    async fn typed_jobs_land_on_their_queue() {
        let p = producers();
        let order_id = OrderId::new();
        let handle = p
            .add_whatsapp_job(WhatsappJob {
                phone: PhoneNumber::parse("+6281234567890").unwrap(),
                message: "Your order is ready".into(),
                order_id,
            })
            .await
            .unwrap();
        assert_eq!(handle.queue, QueueName::WhatsappNotification);

        let status = p
            .get_job_status(QueueName::WhatsappNotification, handle.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.status, JobState::Waiting);
        assert_eq!(status.progress, 0);

        let record = p
            .queue(QueueName::WhatsappNotification)
            .unwrap()
            .get_job(handle.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.name, "send-whatsapp");
        assert_eq!(record.payload["order_id"], order_id.to_string());
    }

    #[tokio::test]
    async fn ids_are_per_queue_and_unknown_jobs_are_none() {
        let p = producers();
        let a = p
            .add_report_job(ReportJob {
                report_type: "daily-sales".into(),
                params: serde_json::json!({"date": "2026-10-15"}),
                requested_by: None,
            })
            .await
            .unwrap();
        let b = p
            .add_file_cleanup_job(FileCleanupJob {
                folder: "tmp".into(),
                older_than_days: 7,
                paths: vec![],
            })
            .await
            .unwrap();
        assert_eq!(a.id, JobId(1));
        assert_eq!(b.id, JobId(1));
        assert!(p
            .get_job_status(QueueName::ReportGeneration, JobId(99))
            .await
            .unwrap()
            .is_none());
    }
}
