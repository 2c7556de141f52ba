//! Typed payloads, one per queue.

use serde::{Deserialize, Serialize};

use orderflow_core::{EmailAddress, OrderId, PhoneNumber, UserId};

use super::types::QueueName;

/// Ties a payload type to the queue that carries it.
pub trait JobPayload: Serialize + serde::de::DeserializeOwned + Send + Sync {
    const QUEUE: QueueName;

    /// Job type recorded with the job.
    fn job_name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUploadJob {
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub destination_folder: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailJob {
    pub to: EmailAddress,
    pub subject: String,
    pub html_body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhatsappJob {
    pub phone: PhoneNumber,
    pub message: String,
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportJob {
    pub report_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub requested_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCleanupJob {
    pub folder: String,
    pub older_than_days: u32,
    /// Explicit files to remove regardless of age.
    #[serde(default)]
    pub paths: Vec<String>,
}

impl JobPayload for ImageUploadJob {
    const QUEUE: QueueName = QueueName::ImageUpload;

    fn job_name(&self) -> &'static str {
        "upload-image"
    }
}

impl JobPayload for EmailJob {
    const QUEUE: QueueName = QueueName::EmailNotification;

    fn job_name(&self) -> &'static str {
        "send-email"
    }
}

impl JobPayload for WhatsappJob {
    const QUEUE: QueueName = QueueName::WhatsappNotification;

    fn job_name(&self) -> &'static str {
        "send-whatsapp"
    }
}

impl JobPayload for ReportJob {
    const QUEUE: QueueName = QueueName::ReportGeneration;

    fn job_name(&self) -> &'static str {
        "generate-report"
    }
}

impl JobPayload for FileCleanupJob {
    const QUEUE: QueueName = QueueName::FileCleanup;

    fn job_name(&self) -> &'static str {
        "cleanup-files"
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_bytes_travel_as_base64() {
        let job = ImageUploadJob {
            bytes: vec![0x89, b'P', b'N', b'G'],
            file_name: "order-17.png".into(),
            destination_folder: "orders/17".into(),
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["bytes"], "iVBORw==");
        let back: ImageUploadJob = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn email_payload_rejects_bad_recipient() {
        let raw = serde_json::json!({
            "to": "not-an-address",
            "subject": "Order confirmed",
            "html_body": "<p>Thanks</p>"
        });
        assert!(serde_json::from_value::<EmailJob>(raw).is_err());
    }

    #[test]
    fn queues_match_payload_types() {
        assert_eq!(ImageUploadJob::QUEUE, QueueName::ImageUpload);
        assert_eq!(FileCleanupJob::QUEUE, QueueName::FileCleanup);
    }
}
