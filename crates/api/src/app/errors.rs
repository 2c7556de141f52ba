use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use orderflow_infra::jobs::QueueError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Store(e) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string())
        }
        QueueError::Corrupt { .. } => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "corrupt_job", err.to_string())
        }
        QueueError::Payload(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_payload", msg),
        QueueError::LockLost { .. } => {
            json_error(StatusCode::CONFLICT, "lock_lost", err.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
