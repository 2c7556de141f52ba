//! Purpose-segregated connections to the shared store.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
    MemoryStore, OwnedMove, RedisStore, ScoreBound, Store, StoreError, StoreHealth, StoreResult,
    WindowOutcome, WindowRequest,
};

/// Which subsystem a connection serves. Each gets its own connection so a
/// backlog on one cannot delay the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Queue,
    Cache,
    RateLimit,
}

impl Purpose {
    pub const ALL: [Purpose; 3] = [Purpose::Queue, Purpose::Cache, Purpose::RateLimit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Queue => "queue",
            Purpose::Cache => "cache",
            Purpose::RateLimit => "rate_limit",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named logical handle to the store.
#[derive(Clone)]
pub struct Connection {
    purpose: Purpose,
    store: Arc<dyn Store>,
}

impl Connection {
    pub fn new(purpose: Purpose, store: Arc<dyn Store>) -> Self {
        Self { purpose, store }
    }

    /// A connection whose every call fails as unavailable. Used when the
    /// process runs degraded.
    pub fn disconnected(purpose: Purpose) -> Self {
        Self::new(purpose, Arc::new(DisconnectedStore))
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("purpose", &self.purpose)
            .field("store", &self.store)
            .finish()
    }
}

/// Where connections come from.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Redis(StoreConfig),
    /// Every purpose shares the same in-process store.
    Memory(Arc<MemoryStore>),
}

/// Connection settings. A URL wins over the individual fields.
#[derive(Clone)]
pub struct StoreConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
    pub tls: bool,
    pub command_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            db: 0,
            tls: false,
            command_timeout: Duration::from_millis(5000),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("tls", &self.tls)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl StoreConfig {
    /// Resolve the connection URL. `rediss://` selects TLS on both paths.
    pub fn redis_url(&self) -> String {
        if let Some(url) = &self.url {
            return match url.strip_prefix("redis://") {
                Some(rest) if self.tls => format!("rediss://{rest}"),
                _ => url.clone(),
            };
        }

        let scheme = if self.tls { "rediss" } else { "redis" };
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("{}:{}@", urlencoding::encode(user), urlencoding::encode(pass))
            }
            (None, Some(pass)) => format!(":{}@", urlencoding::encode(pass)),
            (Some(user), None) => format!("{}@", urlencoding::encode(user)),
            (None, None) => String::new(),
        };
        format!("{scheme}://{auth}{}:{}/{}", self.host, self.port, self.db)
    }

    pub fn uses_tls(&self) -> bool {
        self.redis_url().starts_with("rediss://")
    }
}

/// Opens, health-checks and closes the per-purpose connections.
pub struct ConnectionManager {
    backend: StoreBackend,
    health: StoreHealth,
    open: Mutex<BTreeMap<Purpose, Connection>>,
}

impl ConnectionManager {
    pub fn new(backend: StoreBackend, health: StoreHealth) -> Self {
        Self {
            backend,
            health,
            open: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn health(&self) -> &StoreHealth {
        &self.health
    }

    /// Open (or reuse) the connection for `purpose`.
    pub async fn connect(&self, purpose: Purpose) -> StoreResult<Connection> {
        if let Some(conn) = self.open.lock().await.get(&purpose) {
            return Ok(conn.clone());
        }

        let store: Arc<dyn Store> = match &self.backend {
            StoreBackend::Memory(store) => store.clone(),
            StoreBackend::Redis(config) => {
                let client = redis::Client::open(config.redis_url())
                    .map_err(|e| StoreError::Unavailable(format!("invalid store url: {e}")))?;
                Arc::new(
                    RedisStore::connect(client, purpose.as_str(), config.command_timeout).await?,
                )
            }
        };

        let conn = Connection::new(purpose, store);
        // A concurrent caller may have won the race; keep whichever landed first.
        let mut open = self.open.lock().await;
        let conn = open.entry(purpose).or_insert(conn).clone();
        info!(purpose = %purpose, "store connection opened");
        Ok(conn)
    }

    /// PING every open connection. No side effects besides updating health.
    pub async fn health_check(&self) -> bool {
        let conns: Vec<Connection> = self.open.lock().await.values().cloned().collect();
        if conns.is_empty() {
            self.health.record(false);
            return false;
        }

        let mut healthy = true;
        for conn in &conns {
            if let Err(e) = conn.store().ping().await {
                warn!(purpose = %conn.purpose(), error = %e, "store health check failed");
                healthy = false;
            }
        }

        let previous = self.health.record(healthy);
        if previous != self.health.status() {
            info!(status = ?self.health.status(), "store status changed");
        }
        healthy
    }

    pub async fn close_all(&self) {
        let conns = std::mem::take(&mut *self.open.lock().await);
        for (purpose, conn) in conns {
            conn.store().close().await;
            info!(purpose = %purpose, "store connection closed");
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("backend", &self.backend)
            .field("health", &self.health.status())
            .finish()
    }
}

#[derive(Debug)]
struct DisconnectedStore;

fn disconnected<T>() -> StoreResult<T> {
    Err(StoreError::Unavailable("store not connected".into()))
}

#[async_trait]
impl Store for DisconnectedStore {
    async fn ping(&self) -> StoreResult<()> {
        disconnected()
    }

    async fn get(&self, _: &str) -> StoreResult<Option<String>> {
        disconnected()
    }

    async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> StoreResult<()> {
        disconnected()
    }

    async fn del(&self, _: &[String]) -> StoreResult<u64> {
        disconnected()
    }

    async fn incr(&self, _: &str) -> StoreResult<u64> {
        disconnected()
    }

    async fn scan_match(&self, _: &str) -> StoreResult<Vec<String>> {
        disconnected()
    }

    async fn zadd(&self, _: &str, _: &str, _: f64) -> StoreResult<()> {
        disconnected()
    }

    async fn zrem(&self, _: &str, _: &str) -> StoreResult<bool> {
        disconnected()
    }

    async fn zcard(&self, _: &str) -> StoreResult<u64> {
        disconnected()
    }

    async fn zcount(&self, _: &str, _: ScoreBound, _: ScoreBound) -> StoreResult<u64> {
        disconnected()
    }

    async fn zrange_by_score(
        &self,
        _: &str,
        _: ScoreBound,
        _: ScoreBound,
        _: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        disconnected()
    }

    async fn zrange(&self, _: &str, _: isize, _: isize) -> StoreResult<Vec<String>> {
        disconnected()
    }

    async fn zrem_range_by_score(&self, _: &str, _: ScoreBound, _: ScoreBound) -> StoreResult<u64> {
        disconnected()
    }

    async fn zrem_range_by_rank(&self, _: &str, _: isize, _: isize) -> StoreResult<u64> {
        disconnected()
    }

    async fn zpop_min_into(&self, _: &str, _: &str, _: f64) -> StoreResult<Option<String>> {
        disconnected()
    }

    async fn zmove(&self, _: &str, _: &str, _: &str, _: f64) -> StoreResult<bool> {
        disconnected()
    }

    async fn zmove_owned(&self, _: OwnedMove<'_>) -> StoreResult<bool> {
        disconnected()
    }

    async fn sliding_window(&self, _: WindowRequest<'_>) -> StoreResult<WindowOutcome> {
        disconnected()
    }

    async fn used_memory(&self) -> StoreResult<Option<u64>> {
        disconnected()
    }
}
