//! Process configuration read from environment variables.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use orderflow_observability::TelemetrySettings;

use crate::jobs::{QueueName, QueuePolicy};
use crate::rate_limit::RateLimitClass;
use crate::store::StoreConfig;

pub const DEFAULT_HEALTH_CHECK_CRON: &str = "0 */5 * * * *";
pub const DEFAULT_FILE_CLEANUP_CRON: &str = "0 0 3 * * *";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

/// Periodic task settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSettings {
    pub health_check: String,
    pub file_cleanup: String,
    /// IANA zone name, validated when jobs are registered.
    pub timezone: String,
    pub cleanup_folder: String,
    pub cleanup_older_than_days: u32,
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            health_check: DEFAULT_HEALTH_CHECK_CRON.to_string(),
            file_cleanup: DEFAULT_FILE_CLEANUP_CRON.to_string(),
            timezone: "UTC".to_string(),
            cleanup_folder: "uploads/tmp".to_string(),
            cleanup_older_than_days: 7,
        }
    }
}

/// Rate-limit class per API route group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub admin: RateLimitClass,
    pub public: RateLimitClass,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            admin: RateLimitClass::Strict,
            public: RateLimitClass::Public,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub store: StoreConfig,
    pub telemetry: TelemetrySettings,
    pub queues: BTreeMap<QueueName, QueuePolicy>,
    pub rate_limits: RateLimitSettings,
    pub cron: CronSettings,
    /// Root directory for the filesystem-backed collaborators.
    pub storage_root: PathBuf,
    pub shutdown_grace: Duration,
    pub http_bind: SocketAddr,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            telemetry: TelemetrySettings::default(),
            queues: QueueName::ALL
                .into_iter()
                .map(|q| (q, QueuePolicy::for_queue(q)))
                .collect(),
            rate_limits: RateLimitSettings::default(),
            cron: CronSettings::default(),
            storage_root: PathBuf::from("storage"),
            shutdown_grace: Duration::from_secs(30),
            http_bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Present and non-blank.
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::Invalid {
                    var: var.to_string(),
                    reason: e.to_string(),
                    value,
                }),
        }
    }

    fn flag(&self, var: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(var) {
            None => Ok(None),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::Invalid {
                    var: var.to_string(),
                    value,
                    reason: "expected true or false".to_string(),
                }),
            },
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build settings from any variable source. Unset variables keep their
    /// defaults; malformed ones are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut settings = Settings::default();

        let store = &mut settings.store;
        store.url = env.get("REDIS_URL");
        if let Some(host) = env.get("REDIS_HOST") {
            store.host = host;
        }
        if let Some(port) = env.parse("REDIS_PORT")? {
            store.port = port;
        }
        store.username = env.get("REDIS_USERNAME");
        store.password = env.get("REDIS_PASSWORD");
        if let Some(db) = env.parse("REDIS_DB")? {
            store.db = db;
        }
        if let Some(tls) = env.flag("REDIS_TLS")? {
            store.tls = tls;
        }
        if let Some(ms) = env.parse::<u64>("REDIS_COMMAND_TIMEOUT_MS")? {
            store.command_timeout = Duration::from_millis(ms);
        }

        let telemetry = &mut settings.telemetry;
        if let Some(level) = env.get("LOG_LEVEL") {
            telemetry.log_level = level;
        }
        telemetry.sentry_dsn = env.get("SENTRY_DSN");
        telemetry.sentry_environment = env.get("SENTRY_ENVIRONMENT");

        for (queue, policy) in settings.queues.iter_mut() {
            let var = format!("QUEUE_CONCURRENCY_{}", queue.env_suffix());
            if let Some(n) = env.parse::<usize>(&var)? {
                if n == 0 {
                    return Err(ConfigError::Invalid {
                        var,
                        value: n.to_string(),
                        reason: "concurrency must be at least 1".to_string(),
                    });
                }
                *policy = policy.clone().with_concurrency(n);
            }
        }

        if let Some(class) = env.parse("RATE_LIMIT_ADMIN")? {
            settings.rate_limits.admin = class;
        }
        if let Some(class) = env.parse("RATE_LIMIT_PUBLIC")? {
            settings.rate_limits.public = class;
        }

        let cron = &mut settings.cron;
        if let Some(expr) = env.get("HEALTH_CHECK_CRON") {
            cron.health_check = expr;
        }
        if let Some(expr) = env.get("FILE_CLEANUP_CRON") {
            cron.file_cleanup = expr;
        }
        if let Some(tz) = env.get("CRON_TIMEZONE") {
            cron.timezone = tz;
        }
        if let Some(folder) = env.get("FILE_CLEANUP_FOLDER") {
            cron.cleanup_folder = folder;
        }
        if let Some(days) = env.parse("FILE_CLEANUP_OLDER_THAN_DAYS")? {
            cron.cleanup_older_than_days = days;
        }

        if let Some(root) = env.get("STORAGE_ROOT") {
            settings.storage_root = PathBuf::from(root);
        }
        if let Some(secs) = env.parse::<u64>("SHUTDOWN_GRACE_SECS")? {
            settings.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(addr) = env.parse("HTTP_BIND")? {
            settings.http_bind = addr;
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.store.redis_url(), "redis://127.0.0.1:6379/0");
        assert_eq!(s.store.command_timeout, Duration::from_millis(5000));
        assert_eq!(s.telemetry.log_level, "info");
        assert_eq!(s.queues[&QueueName::ImageUpload].concurrency, 5);
        assert_eq!(s.queues[&QueueName::FileCleanup].concurrency, 1);
        assert_eq!(s.cron.timezone, "UTC");
        assert_eq!(s.shutdown_grace, Duration::from_secs(30));
        assert_eq!(s.http_bind.port(), 8080);
    }

    #[test]
    fn overrides_are_applied() {
        let s = settings(&[
            ("REDIS_HOST", "cache.internal"),
            ("REDIS_PORT", "6380"),
            ("REDIS_TLS", "true"),
            ("QUEUE_CONCURRENCY_IMAGE_UPLOAD", "8"),
            ("RATE_LIMIT_PUBLIC", "relaxed"),
            ("CRON_TIMEZONE", "Asia/Jakarta"),
            ("SHUTDOWN_GRACE_SECS", "5"),
            ("HTTP_BIND", "127.0.0.1:9000"),
            ("LOG_LEVEL", "debug"),
        ])
        .unwrap();
        assert!(s.store.uses_tls());
        assert!(s.store.redis_url().starts_with("rediss://cache.internal:6380"));
        assert_eq!(s.queues[&QueueName::ImageUpload].concurrency, 8);
        assert_eq!(s.rate_limits.public, RateLimitClass::Relaxed);
        assert_eq!(s.rate_limits.admin, RateLimitClass::Strict);
        assert_eq!(s.cron.timezone, "Asia/Jakarta");
        assert_eq!(s.shutdown_grace, Duration::from_secs(5));
        assert_eq!(s.http_bind.to_string(), "127.0.0.1:9000");
        assert_eq!(s.telemetry.log_level, "debug");
    }

    #[test]
    fn blank_values_count_as_unset() {
        let s = settings(&[("REDIS_PORT", "  "), ("SENTRY_DSN", "")]).unwrap();
        assert_eq!(s.store.port, 6379);
        assert!(s.telemetry.sentry_dsn.is_none());
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = settings(&[("REDIS_PORT", "sixty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "REDIS_PORT"));

        assert!(settings(&[("QUEUE_CONCURRENCY_REPORT_GENERATION", "0")]).is_err());
        assert!(settings(&[("RATE_LIMIT_ADMIN", "lenient")]).is_err());
        assert!(settings(&[("REDIS_TLS", "maybe")]).is_err());
    }
}
