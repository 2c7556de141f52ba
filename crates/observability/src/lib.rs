//! Tracing, logging and error tracking (shared setup).

use std::time::Duration;

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::{TelemetryGuard, TelemetrySettings};

/// Initialize process-wide observability (structured logs + error tracking).
///
/// This is safe to call multiple times; subsequent calls do not replace the
/// global subscriber.
pub fn init(settings: &TelemetrySettings) -> TelemetryGuard {
    self::tracing::init(settings)
}

/// Default time allowed for pending error reports to drain on shutdown.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
