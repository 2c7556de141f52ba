use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use orderflow_infra::{RateLimitClass, RateLimitConfig, RateLimitDecision, RateLimiter};

#[derive(Clone)]
pub struct RateLimitState {
    limiter: RateLimiter,
    config: Arc<RateLimitConfig>,
}

impl RateLimitState {
    pub fn new(limiter: RateLimiter, class: RateLimitClass) -> Self {
        Self::with_config(limiter, class.config())
    }

    pub fn with_config(limiter: RateLimiter, config: RateLimitConfig) -> Self {
        Self {
            limiter,
            config: Arc::new(config),
        }
    }
}

/// Sliding-window limit keyed by client address. Rejections get a 429;
/// every response carries the rate-limit headers.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identifier = client_identifier(req.headers(), peer);
    let decision = state
        .limiter
        .check_and_consume(&identifier, &state.config)
        .await;

    let mut response = if decision.allowed {
        next.run(req).await
    } else {
        tracing::info!(
            identifier,
            limiter = %state.config.name,
            blocked = decision.blocked,
            "request rate limited"
        );
        (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(json!({
                "error": if decision.blocked { "blocked" } else { "rate_limited" },
                "message": "too many requests",
                "reset_time": decision.reset_time,
            })),
        )
            .into_response()
    };

    apply_headers(response.headers_mut(), &decision);
    response
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

/// First `X-Forwarded-For` hop, else the peer address, else `unknown`.
fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" 203.0.113.9, 10.0.0.1"));
        let peer = Some(SocketAddr::from(([127, 0, 0, 1], 4000)));
        assert_eq!(client_identifier(&headers, peer), "203.0.113.9");
    }

    #[test]
    fn identifier_falls_back_to_peer_then_unknown() {
        let peer = Some(SocketAddr::from(([192, 168, 1, 20], 4000)));
        assert_eq!(client_identifier(&HeaderMap::new(), peer), "192.168.1.20");
        assert_eq!(client_identifier(&HeaderMap::new(), None), "unknown");
    }
}
