use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use orderflow_infra::{Infrastructure, Mode};

/// 200 while the infrastructure is ready, 503 when it runs degraded.
pub async fn health(Extension(infra): Extension<Arc<Infrastructure>>) -> impl IntoResponse {
    let status = match infra.mode() {
        Mode::Ready => StatusCode::OK,
        Mode::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(json!({
            "mode": infra.mode(),
            "store": infra.store_status(),
        })),
    )
}
