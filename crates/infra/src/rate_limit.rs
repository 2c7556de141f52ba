//! Sliding-window rate limiter with exact counting.
//!
//! Each identifier owns a sorted set of request markers scored by epoch-ms.
//! A check trims markers that fell out of the window, counts the rest and
//! records a new marker only when the request is admitted; all three steps
//! are one atomic store primitive. Configurations with a block duration also
//! keep a `...:blocked` key holding the block expiry.
//!
//! The limiter fails open: when the store is unreachable (or already known
//! to be down) every request is admitted.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::store::{Connection, ScoreBound, StoreHealth, StoreResult, WindowRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Namespace of the keys this config writes.
    pub name: String,
    pub window: Duration,
    pub max_requests: u64,
    /// Penalty applied once the limit is hit. `None` only rejects.
    pub block_duration: Option<Duration>,
}

impl RateLimitConfig {
    pub fn new(name: impl Into<String>, window: Duration, max_requests: u64) -> Self {
        Self {
            name: name.into(),
            window,
            max_requests,
            block_duration: None,
        }
    }

    pub fn with_block(mut self, duration: Duration) -> Self {
        self.block_duration = Some(duration);
        self
    }

    pub fn strict() -> Self {
        Self::new("strict", Duration::from_secs(60), 10).with_block(Duration::from_secs(15 * 60))
    }

    pub fn moderate() -> Self {
        Self::new("moderate", Duration::from_secs(15 * 60), 100)
    }

    pub fn relaxed() -> Self {
        Self::new("relaxed", Duration::from_secs(15 * 60), 1000)
    }

    /// Login and password-reset style endpoints.
    pub fn auth() -> Self {
        Self::new("auth", Duration::from_secs(15 * 60), 5).with_block(Duration::from_secs(60 * 60))
    }

    pub fn public() -> Self {
        Self::new("public", Duration::from_secs(60), 300)
    }

    fn window_key(&self, identifier: &str) -> String {
        format!("ratelimit:{}:{identifier}", self.name)
    }

    fn blocked_key(&self, identifier: &str) -> String {
        format!("ratelimit:{}:{identifier}:blocked", self.name)
    }

    fn window_ms(&self) -> i64 {
        millis(self.window)
    }
}

/// Named preset, selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitClass {
    Strict,
    Moderate,
    Relaxed,
    Auth,
    Public,
}

impl RateLimitClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitClass::Strict => "strict",
            RateLimitClass::Moderate => "moderate",
            RateLimitClass::Relaxed => "relaxed",
            RateLimitClass::Auth => "auth",
            RateLimitClass::Public => "public",
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        match self {
            RateLimitClass::Strict => RateLimitConfig::strict(),
            RateLimitClass::Moderate => RateLimitConfig::moderate(),
            RateLimitClass::Relaxed => RateLimitConfig::relaxed(),
            RateLimitClass::Auth => RateLimitConfig::auth(),
            RateLimitClass::Public => RateLimitConfig::public(),
        }
    }
}

impl fmt::Display for RateLimitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(RateLimitClass::Strict),
            "moderate" => Ok(RateLimitClass::Moderate),
            "relaxed" => Ok(RateLimitClass::Relaxed),
            "auth" => Ok(RateLimitClass::Auth),
            "public" => Ok(RateLimitClass::Public),
            other => Err(format!(
                "unknown rate limit class `{other}` (expected strict, moderate, relaxed, auth or public)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// When the oldest counted request leaves the window, or when the block
    /// ends.
    pub reset_time: DateTime<Utc>,
    pub blocked: bool,
    pub limit: u64,
    /// Seconds the client should wait; set only on rejection.
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    /// Response headers describing this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_time.timestamp().to_string()),
        ];
        if let Some(secs) = self.retry_after_secs {
            headers.push(("Retry-After", secs.to_string()));
        }
        headers
    }
}

/// Read-only view of an identifier's usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub count: u64,
    pub remaining: u64,
    pub blocked: bool,
    pub reset_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    conn: Connection,
    health: StoreHealth,
    clock: SharedClock,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn at_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn retry_after(now_ms: i64, reset_ms: i64) -> u64 {
    let wait_ms = u64::try_from(reset_ms.saturating_sub(now_ms)).unwrap_or(0);
    wait_ms.div_ceil(1000).max(1)
}

impl RateLimiter {
    pub fn new(conn: Connection, health: StoreHealth, clock: SharedClock) -> Self {
        Self {
            conn,
            health,
            clock,
        }
    }

    fn fail_open(&self, config: &RateLimitConfig, now_ms: i64) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            remaining: config.max_requests.saturating_sub(1),
            reset_time: at_millis(now_ms.saturating_add(config.window_ms())),
            blocked: false,
            limit: config.max_requests,
            retry_after_secs: None,
        }
    }

    fn rejected(
        &self,
        config: &RateLimitConfig,
        now_ms: i64,
        reset_ms: i64,
        blocked: bool,
    ) -> RateLimitDecision {
        RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_time: at_millis(reset_ms),
            blocked,
            limit: config.max_requests,
            retry_after_secs: Some(retry_after(now_ms, reset_ms)),
        }
    }

    /// Block expiry in epoch-ms, if the identifier is blocked right now.
    async fn active_block(&self, key: &str, now_ms: i64) -> StoreResult<Option<i64>> {
        let raw = self.conn.store().get(key).await?;
        Ok(raw
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|until| *until > now_ms))
    }

    /// Decide whether one request from `identifier` may proceed, consuming a
    /// slot when it does.
    pub async fn check_and_consume(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> RateLimitDecision {
        let now_ms = self.clock.now_millis();
        if self.health.is_down() {
            return self.fail_open(config, now_ms);
        }

        match self.consume(identifier, config, now_ms).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    limiter = %config.name,
                    identifier,
                    error = %e,
                    "rate limit check failed, admitting request"
                );
                self.fail_open(config, now_ms)
            }
        }
    }

    async fn consume(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
        now_ms: i64,
    ) -> StoreResult<RateLimitDecision> {
        let store = self.conn.store();
        let blocked_key = config.blocked_key(identifier);

        if let Some(until) = self.active_block(&blocked_key, now_ms).await? {
            return Ok(self.rejected(config, now_ms, until, true));
        }

        let key = config.window_key(identifier);
        let member = format!("{now_ms}-{}", Uuid::now_v7());
        let outcome = store
            .sliding_window(WindowRequest {
                key: &key,
                now_ms,
                window_ms: config.window_ms(),
                limit: config.max_requests,
                member: &member,
                ttl: config.window,
            })
            .await?;

        let window_reset = outcome
            .oldest_ms
            .unwrap_or(now_ms)
            .saturating_add(config.window_ms());

        if outcome.admitted {
            return Ok(RateLimitDecision {
                allowed: true,
                remaining: config
                    .max_requests
                    .saturating_sub(outcome.count)
                    .saturating_sub(1),
                reset_time: at_millis(window_reset),
                blocked: false,
                limit: config.max_requests,
                retry_after_secs: None,
            });
        }

        match config.block_duration.filter(|d| !d.is_zero()) {
            Some(duration) => {
                let until = now_ms.saturating_add(millis(duration));
                store
                    .set(&blocked_key, &until.to_string(), Some(duration))
                    .await?;
                info!(
                    limiter = %config.name,
                    identifier,
                    ?duration,
                    "identifier blocked after exceeding limit"
                );
                Ok(self.rejected(config, now_ms, until, true))
            }
            None => Ok(self.rejected(config, now_ms, window_reset, false)),
        }
    }

    /// Operator block; replaces any existing block.
    pub async fn block_identifier(
        &self,
        identifier: &str,
        duration: Duration,
        config: &RateLimitConfig,
    ) -> StoreResult<()> {
        let key = config.blocked_key(identifier);
        if duration.is_zero() {
            self.conn.store().del(&[key]).await?;
            return Ok(());
        }
        let until = self.clock.now_millis().saturating_add(millis(duration));
        self.conn
            .store()
            .set(&key, &until.to_string(), Some(duration))
            .await?;
        info!(limiter = %config.name, identifier, ?duration, "identifier blocked by operator");
        Ok(())
    }

    /// Lift a block. Returns whether one existed.
    pub async fn unblock_identifier(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> StoreResult<bool> {
        let removed = self
            .conn
            .store()
            .del(&[config.blocked_key(identifier)])
            .await?;
        if removed > 0 {
            info!(limiter = %config.name, identifier, "identifier unblocked");
        }
        Ok(removed > 0)
    }

    /// Current usage without consuming a slot or trimming anything.
    pub async fn get_rate_limit_info(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> StoreResult<RateLimitInfo> {
        let now_ms = self.clock.now_millis();
        let store = self.conn.store();
        let key = config.window_key(identifier);
        let cutoff = ScoreBound::Exclusive(now_ms.saturating_sub(config.window_ms()) as f64);

        let block = self.active_block(&config.blocked_key(identifier), now_ms).await?;
        let count = store.zcount(&key, cutoff, ScoreBound::PosInf).await?;
        let oldest = store
            .zrange_by_score(&key, cutoff, ScoreBound::PosInf, Some(1))
            .await?
            .first()
            .map(|(_, score)| *score as i64);

        let reset_ms = match block {
            Some(until) => until,
            None => oldest.unwrap_or(now_ms).saturating_add(config.window_ms()),
        };
        Ok(RateLimitInfo {
            count,
            remaining: if block.is_some() {
                0
            } else {
                config.max_requests.saturating_sub(count)
            },
            blocked: block.is_some(),
            reset_time: at_millis(reset_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::MockClock;
    use crate::store::{MemoryStore, Purpose, Store};

    struct Fixture {
        limiter: RateLimiter,
        clock: MockClock,
        store: Arc<MemoryStore>,
        health: StoreHealth,
    }

    fn fixture() -> Fixture {
        let clock = MockClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let health = StoreHealth::new();
        let limiter = RateLimiter::new(
            Connection::new(Purpose::RateLimit, store.clone()),
            health.clone(),
            Arc::new(clock.clone()),
        );
        Fixture {
            limiter,
            clock,
            store,
            health,
        }
    }

    #[tokio::test]
    async fn admits_k_then_rejects_until_window_slides() {
        let f = fixture();
        let config = RateLimitConfig::new("test", Duration::from_secs(60), 3);

        for expected_remaining in [2, 1, 0] {
            let d = f.limiter.check_and_consume("10.0.0.1", &config).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
            f.clock.advance(Duration::from_secs(1));
        }

        let d = f.limiter.check_and_consume("10.0.0.1", &config).await;
        assert!(!d.allowed);
        assert!(!d.blocked);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.retry_after_secs, Some(57));

        // Another identifier is unaffected.
        assert!(f.limiter.check_and_consume("10.0.0.2", &config).await.allowed);

        f.clock.advance(Duration::from_secs(60));
        let d = f.limiter.check_and_consume("10.0.0.1", &config).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 2);
    }

    #[tokio::test]
    async fn rejected_requests_do_not_extend_the_window() {
        let f = fixture();
        let config = RateLimitConfig::new("test", Duration::from_secs(10), 1);
        assert!(f.limiter.check_and_consume("u", &config).await.allowed);
        for _ in 0..5 {
            f.clock.advance(Duration::from_secs(1));
            assert!(!f.limiter.check_and_consume("u", &config).await.allowed);
        }
        f.clock.advance(Duration::from_secs(5));
        assert!(f.limiter.check_and_consume("u", &config).await.allowed);
    }

    #[tokio::test]
    async fn block_outlasts_the_window() {
        let f = fixture();
        let config = RateLimitConfig::auth();
        for _ in 0..5 {
            assert!(f.limiter.check_and_consume("mallory", &config).await.allowed);
        }

        let tripped = f.limiter.check_and_consume("mallory", &config).await;
        assert!(!tripped.allowed);
        assert!(tripped.blocked);
        assert_eq!(tripped.retry_after_secs, Some(3600));

        // The window alone would have cleared by now.
        f.clock.advance(Duration::from_secs(16 * 60));
        let d = f.limiter.check_and_consume("mallory", &config).await;
        assert!(d.blocked);
        assert!(!d.allowed);

        f.clock.advance(Duration::from_secs(45 * 60));
        let d = f.limiter.check_and_consume("mallory", &config).await;
        assert!(d.allowed);
        assert!(!d.blocked);
    }

    #[tokio::test]
    async fn operator_block_and_unblock() {
        let f = fixture();
        let config = RateLimitConfig::moderate();
        f.limiter
            .block_identifier("bot", Duration::from_secs(120), &config)
            .await
            .unwrap();
        assert!(f.limiter.check_and_consume("bot", &config).await.blocked);
        assert!(f.limiter.get_rate_limit_info("bot", &config).await.unwrap().blocked);

        assert!(f.limiter.unblock_identifier("bot", &config).await.unwrap());
        assert!(!f.limiter.unblock_identifier("bot", &config).await.unwrap());
        assert!(f.limiter.check_and_consume("bot", &config).await.allowed);
    }

    #[tokio::test]
    async fn info_is_read_only() {
        let f = fixture();
        let config = RateLimitConfig::new("test", Duration::from_secs(60), 5);
        f.limiter.check_and_consume("u", &config).await;
        f.limiter.check_and_consume("u", &config).await;

        for _ in 0..3 {
            let info = f.limiter.get_rate_limit_info("u", &config).await.unwrap();
            assert_eq!(info.count, 2);
            assert_eq!(info.remaining, 3);
            assert!(!info.blocked);
        }
        assert_eq!(f.store.zcard("ratelimit:test:u").await.unwrap(), 2);

        f.clock.advance(Duration::from_secs(60));
        let info = f.limiter.get_rate_limit_info("u", &config).await.unwrap();
        assert_eq!(info.count, 0);
    }

    #[tokio::test]
    async fn unreachable_store_fails_open() {
        let f = fixture();
        f.store.set_available(false);
        let config = RateLimitConfig::strict();
        for _ in 0..50 {
            let d = f.limiter.check_and_consume("1.2.3.4", &config).await;
            assert!(d.allowed);
            assert!(!d.blocked);
            assert_eq!(d.remaining, 9);
        }
        assert!(f.limiter.get_rate_limit_info("1.2.3.4", &config).await.is_err());
    }

    #[tokio::test]
    async fn known_down_store_admits_without_touching_it() {
        let f = fixture();
        let config = RateLimitConfig::new("test", Duration::from_secs(60), 1);
        f.health.record(false);
        for _ in 0..3 {
            assert!(f.limiter.check_and_consume("u", &config).await.allowed);
        }
        assert_eq!(f.store.zcard("ratelimit:test:u").await.unwrap(), 0);
    }

    #[test]
    fn headers_include_retry_after_only_when_rejected() {
        let reset = at_millis(1_700_000_060_000);
        let mut d = RateLimitDecision {
            allowed: true,
            remaining: 4,
            reset_time: reset,
            blocked: false,
            limit: 5,
            retry_after_secs: None,
        };
        assert_eq!(
            d.headers(),
            vec![
                ("X-RateLimit-Limit", "5".to_string()),
                ("X-RateLimit-Remaining", "4".to_string()),
                ("X-RateLimit-Reset", "1700000060".to_string()),
            ]
        );

        d.allowed = false;
        d.retry_after_secs = Some(30);
        assert_eq!(d.headers().last().unwrap(), &("Retry-After", "30".to_string()));
    }

    #[test]
    fn classes_parse_and_map_to_presets() {
        assert_eq!("Auth".parse::<RateLimitClass>().unwrap(), RateLimitClass::Auth);
        assert!("lenient".parse::<RateLimitClass>().is_err());
        let public = RateLimitClass::Public.config();
        assert_eq!(public.max_requests, 300);
        assert_eq!(public.window, Duration::from_secs(60));
        assert_eq!(public.block_duration, None);
        assert_eq!(
            RateLimitClass::Strict.config().block_duration,
            Some(Duration::from_secs(900))
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64,
                ..ProptestConfig::default()
            })]

            /// Within one window exactly `limit` requests are admitted, and
            /// the window fully resets once it has elapsed.
            #[test]
            fn window_admits_exactly_limit(
                limit in 1u64..20,
                gaps in proptest::collection::vec(0u64..500, 1..60),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let f = fixture();
                    let config = RateLimitConfig::new("prop", Duration::from_secs(60), limit);

                    // At most 59 gaps of 499ms: everything lands in one window.
                    let mut admitted = 0u64;
                    for gap in &gaps {
                        f.clock.advance(Duration::from_millis(*gap));
                        let d = f.limiter.check_and_consume("id", &config).await;
                        prop_assert!(!d.blocked);
                        if d.allowed {
                            admitted += 1;
                            prop_assert_eq!(d.remaining, limit - admitted);
                        }
                    }
                    prop_assert_eq!(admitted, limit.min(gaps.len() as u64));

                    f.clock.advance(Duration::from_secs(60));
                    let d = f.limiter.check_and_consume("id", &config).await;
                    prop_assert!(d.allowed);
                    prop_assert_eq!(d.remaining, limit - 1);
                    Ok(())
                })?;
            }
        }
    }
}
