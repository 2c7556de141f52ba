//! Tracing/logging initialization.
//!
//! Layers, outermost first: Sentry (only when a DSN is configured), the level
//! filter, then JSON formatting with timestamps.

use std::time::Duration;

use serde::Deserialize;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// What the process needs to know to set up telemetry.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySettings {
    /// Fallback filter directive when `RUST_LOG` is not set.
    pub log_level: String,
    /// Error-tracking DSN. `None` disables Sentry.
    pub sentry_dsn: Option<String>,
    pub sentry_environment: Option<String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            sentry_dsn: None,
            sentry_environment: None,
        }
    }
}

/// Keeps the error-tracking client alive; flushed as the last shutdown step.
#[must_use = "dropping the guard disables error tracking"]
pub struct TelemetryGuard {
    sentry: Option<sentry::ClientInitGuard>,
}

impl TelemetryGuard {
    /// A guard with nothing behind it (tests, or telemetry set up elsewhere).
    pub fn disabled() -> Self {
        Self { sentry: None }
    }

    pub fn error_tracking_enabled(&self) -> bool {
        self.sentry.as_ref().is_some_and(|g| g.is_enabled())
    }

    /// Drain queued error reports. Returns `true` when nothing was left behind.
    pub fn flush(self, timeout: Duration) -> bool {
        match self.sentry {
            Some(guard) if guard.is_enabled() => guard.flush(Some(timeout)),
            _ => true,
        }
    }
}

impl std::fmt::Debug for TelemetryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryGuard")
            .field("error_tracking", &self.error_tracking_enabled())
            .finish()
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls keep the first subscriber).
pub fn init(settings: &TelemetrySettings) -> TelemetryGuard {
    let dsn = settings.sentry_dsn.as_deref().filter(|dsn| !dsn.trim().is_empty());

    let sentry = dsn.map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                environment: settings.sentry_environment.clone().map(Into::into),
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let sentry_layer = sentry
        .as_ref()
        .is_some_and(|g| g.is_enabled())
        .then(sentry_tracing::layer);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // JSON logs + timestamps, configurable via RUST_LOG.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let installed = Registry::default()
        .with(sentry_layer)
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();

    if installed && dsn.is_none() {
        ::tracing::warn!("SENTRY_DSN not set, error tracking disabled");
    }

    TelemetryGuard { sentry }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_without_dsn_disables_error_tracking() {
        let guard = init(&TelemetrySettings::default());
        assert!(!guard.error_tracking_enabled());
        assert!(guard.flush(Duration::from_millis(10)));
    }

    #[test]
    fn init_twice_is_harmless() {
        let settings = TelemetrySettings {
            log_level: "debug".to_string(),
            sentry_dsn: Some("   ".to_string()),
            sentry_environment: None,
        };
        let first = init(&settings);
        let second = init(&settings);
        assert!(!first.error_tracking_enabled());
        assert!(!second.error_tracking_enabled());
    }
}
