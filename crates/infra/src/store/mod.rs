//! Store contract and connection management.
//!
//! Everything durable (job bodies, cache values, rate-limit markers) lives in
//! the external key-value/sorted-set store. The rest of the crate only talks
//! to it through [`Store`], so the Redis-backed implementation and the
//! in-process [`MemoryStore`] are interchangeable.
//!
//! Every mutation the coordination layer relies on is a single primitive of
//! this trait: multi-step moves (`zpop_min_into`, `zmove`, `zmove_owned`,
//! `sliding_window`) are executed atomically by the implementation.

mod connection;
mod health;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

pub use connection::{Connection, ConnectionManager, Purpose, StoreBackend, StoreConfig};
pub use health::{StoreHealth, StoreStatus};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store command {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("store command {op} failed: {message}")]
    Command { op: &'static str, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// `true` for failures that say nothing about the request itself.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// One end of a sorted-set score range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInf,
    PosInf,
    Inclusive(f64),
    Exclusive(f64),
}

impl ScoreBound {
    pub(crate) fn admits_from_below(self, score: f64) -> bool {
        match self {
            ScoreBound::NegInf => true,
            ScoreBound::PosInf => false,
            ScoreBound::Inclusive(min) => score >= min,
            ScoreBound::Exclusive(min) => score > min,
        }
    }

    pub(crate) fn admits_from_above(self, score: f64) -> bool {
        match self {
            ScoreBound::NegInf => false,
            ScoreBound::PosInf => true,
            ScoreBound::Inclusive(max) => score <= max,
            ScoreBound::Exclusive(max) => score < max,
        }
    }

    /// Redis range syntax (`-inf`, `+inf`, `5`, `(5`).
    pub(crate) fn to_arg(self) -> String {
        match self {
            ScoreBound::NegInf => "-inf".to_string(),
            ScoreBound::PosInf => "+inf".to_string(),
            ScoreBound::Inclusive(v) => v.to_string(),
            ScoreBound::Exclusive(v) => format!("({v}"),
        }
    }
}

/// Input of the atomic trim + count + conditional insert.
#[derive(Debug, Clone)]
pub struct WindowRequest<'a> {
    pub key: &'a str,
    pub now_ms: i64,
    pub window_ms: i64,
    pub limit: u64,
    /// Unique marker recorded when the request is admitted.
    pub member: &'a str,
    /// Expiry applied to the whole window key.
    pub ttl: Duration,
}

/// A string write applied together with an [`OwnedMove`].
#[derive(Debug, Clone)]
pub struct KeyWrite<'a> {
    pub key: &'a str,
    pub value: &'a str,
    pub ttl: Option<Duration>,
}

/// Input of [`Store::zmove_owned`].
#[derive(Debug, Clone)]
pub struct OwnedMove<'a> {
    pub src: &'a str,
    pub dst: &'a str,
    pub member: &'a str,
    pub score: f64,
    /// Must hold `token` for the move to happen.
    pub lock_key: &'a str,
    pub token: &'a str,
    /// Delete `lock_key` once moved.
    pub release: bool,
    pub write: Option<KeyWrite<'a>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub admitted: bool,
    /// Markers inside the window before this request.
    pub count: u64,
    /// Score of the oldest marker left in the window (after insertion).
    pub oldest_ms: Option<i64>,
}

#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// `SET`, replacing any previous value and TTL. `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Returns how many of `keys` existed.
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    async fn incr(&self, key: &str) -> StoreResult<u64>;

    /// All keys matching a glob pattern (`*`, `?`).
    async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    async fn zcount(&self, key: &str, min: ScoreBound, max: ScoreBound) -> StoreResult<u64>;

    /// Members with scores in `[min, max]`, ascending.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>>;

    /// Members by rank, ascending. Negative indexes count from the end.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    async fn zrem_range_by_score(&self, key: &str, min: ScoreBound, max: ScoreBound)
    -> StoreResult<u64>;

    async fn zrem_range_by_rank(&self, key: &str, start: isize, stop: isize) -> StoreResult<u64>;

    /// Atomically pop the lowest-scored member of `src` and add it to `dst`.
    async fn zpop_min_into(&self, src: &str, dst: &str, dst_score: f64)
    -> StoreResult<Option<String>>;

    /// Atomically move `member` from `src` to `dst`. Only the caller that
    /// actually removed it from `src` gets `true`. `src == dst` re-scores a
    /// member that is still present.
    async fn zmove(&self, src: &str, dst: &str, member: &str, score: f64) -> StoreResult<bool>;

    /// [`Store::zmove`] gated on ownership: moves only while `lock_key` holds
    /// `token`, and applies `write` in the same atomic step. `false` leaves
    /// everything untouched.
    async fn zmove_owned(&self, req: OwnedMove<'_>) -> StoreResult<bool>;

    async fn sliding_window(&self, req: WindowRequest<'_>) -> StoreResult<WindowOutcome>;

    /// Memory reported by the store, when it reports one.
    async fn used_memory(&self) -> StoreResult<Option<u64>>;

    /// Release the underlying connection. Later calls fail as unavailable.
    async fn close(&self) {}
}

/// Redis-style glob matching (`*` any run, `?` any single char).
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = candidate.chars().collect();
    let (mut pi, mut ci) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ci < c.len() {
        match p.get(pi) {
            Some('*') => {
                backtrack = Some((pi, ci));
                pi += 1;
            }
            Some(&pc) if pc == '?' || pc == c[ci] => {
                pi += 1;
                ci += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    pi = star + 1;
                    ci = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    p[pi..].iter().all(|&ch| ch == '*')
}
