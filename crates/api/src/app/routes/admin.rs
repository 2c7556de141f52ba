//! Read-mostly operational endpoints for the ops dashboard.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use orderflow_infra::jobs::{JobId, JobQueue, QueueName};
use orderflow_infra::{Infrastructure, SchedulerError, TriggerOutcome};

use crate::app::errors;

fn resolve_job(
    infra: &Infrastructure,
    queue: &str,
    id: &str,
) -> Result<(Arc<JobQueue>, JobId), axum::response::Response> {
    let name: QueueName = queue
        .parse()
        .map_err(|e: String| errors::json_error(StatusCode::NOT_FOUND, "unknown_queue", e))?;
    let id: JobId = id.parse().map_err(|_| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_job_id", "job id must be a number")
    })?;
    let queue = infra.producers().queue(name).cloned().ok_or_else(|| {
        errors::json_error(
            StatusCode::NOT_FOUND,
            "unknown_queue",
            format!("queue {name} is not configured"),
        )
    })?;
    Ok((queue, id))
}

pub async fn queues(Extension(infra): Extension<Arc<Infrastructure>>) -> axum::response::Response {
    match infra.queue_stats().await {
        Ok(counts) => Json(json!({
            "queues": counts,
            "workers": infra.worker_stats(),
        }))
        .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn job(
    Extension(infra): Extension<Arc<Infrastructure>>,
    Path((queue, id)): Path<(String, String)>,
) -> axum::response::Response {
    let (queue, id) = match resolve_job(&infra, &queue, &id) {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    match queue.get_job(id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// Put a failed job back in the waiting set with a fresh attempt budget.
pub async fn retry_job(
    Extension(infra): Extension<Arc<Infrastructure>>,
    Path((queue, id)): Path<(String, String)>,
) -> axum::response::Response {
    let (queue, id) = match resolve_job(&infra, &queue, &id) {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    match queue.retry_failed(id).await {
        Ok(true) => {
            Json(json!({ "queue": queue.name(), "id": id, "retried": true })).into_response()
        }
        Ok(false) => errors::json_error(
            StatusCode::CONFLICT,
            "not_failed",
            "only failed jobs can be retried",
        ),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn cache(Extension(infra): Extension<Arc<Infrastructure>>) -> impl IntoResponse {
    Json(infra.cache_stats().await)
}

pub async fn cron(Extension(infra): Extension<Arc<Infrastructure>>) -> impl IntoResponse {
    Json(json!({ "jobs": infra.scheduler().describe() }))
}

pub async fn trigger_cron(
    Extension(infra): Extension<Arc<Infrastructure>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    match infra.scheduler().trigger(&name).await {
        Ok(outcome @ TriggerOutcome::AlreadyRunning) => {
            (StatusCode::CONFLICT, Json(outcome)).into_response()
        }
        Ok(outcome) => Json(outcome).into_response(),
        Err(e @ SchedulerError::UnknownJob(_)) => {
            errors::json_error(StatusCode::NOT_FOUND, "unknown_job", e.to_string())
        }
        Err(e) => errors::json_error(StatusCode::BAD_REQUEST, "scheduler_error", e.to_string()),
    }
}
