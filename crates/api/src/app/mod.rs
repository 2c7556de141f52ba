//! HTTP application wiring (Axum router).
//!
//! - `routes/`: handlers, one file per area
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    Extension, Router,
    routing::{get, post},
};
use tower::ServiceBuilder;

use orderflow_infra::Infrastructure;
use orderflow_infra::config::RateLimitSettings;

use crate::middleware::{self, RateLimitState};

pub mod errors;
pub mod routes;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// rate limiter can fall back to the peer address.
pub fn build_app(infra: Arc<Infrastructure>, rate_limits: RateLimitSettings) -> Router {
    let public_limit = RateLimitState::new(infra.rate_limiter().clone(), rate_limits.public);
    let admin_limit = RateLimitState::new(infra.rate_limiter().clone(), rate_limits.admin);

    let public = Router::new()
        .route("/health", get(routes::system::health))
        .layer(axum::middleware::from_fn_with_state(
            public_limit,
            middleware::rate_limit_middleware,
        ));

    let admin = Router::new()
        .route("/admin/queues", get(routes::admin::queues))
        .route("/admin/queues/:queue/jobs/:id", get(routes::admin::job))
        .route(
            "/admin/queues/:queue/jobs/:id/retry",
            post(routes::admin::retry_job),
        )
        .route("/admin/cache", get(routes::admin::cache))
        .route("/admin/cron", get(routes::admin::cron))
        .route("/admin/cron/:name/trigger", post(routes::admin::trigger_cron))
        .layer(axum::middleware::from_fn_with_state(
            admin_limit,
            middleware::rate_limit_middleware,
        ));

    Router::new()
        .merge(public)
        .merge(admin)
        .layer(ServiceBuilder::new().layer(Extension(infra)))
}
