//! Redis-backed store.
//!
//! One instance wraps one multiplexed `redis::aio::ConnectionManager`, which
//! reconnects on its own after a dropped connection. Every command runs under
//! the configured timeout so an unreachable server degrades instead of hanging.
//!
//! The multi-step primitives are Lua scripts: each executes as a single atomic
//! unit on the server.

use std::future::Future;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager as RedisConnection;
use redis::{RedisError, RedisResult, Script};
use tracing::{debug, instrument};

use super::{
    OwnedMove, ScoreBound, Store, StoreError, StoreResult, WindowOutcome, WindowRequest,
};

/// Keys fetched per `SCAN` round-trip.
const SCAN_BATCH: usize = 200;

static POP_MIN_INTO: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
redis.call('ZADD', KEYS[2], ARGV[1], popped[1])
return popped[1]
",
    )
});

static MOVE_MEMBER: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
  return 1
end
return 0
",
    )
});

static MOVE_OWNED: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[3]) ~= ARGV[3] then
  return 0
end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
if ARGV[4] == '1' then
  redis.call('DEL', KEYS[3])
end
if ARGV[5] == '1' then
  local ttl = tonumber(ARGV[7])
  if ttl > 0 then
    redis.call('SET', KEYS[4], ARGV[6], 'PX', ttl)
  else
    redis.call('SET', KEYS[4], ARGV[6])
  end
end
return 1
",
    )
});

static SLIDING_WINDOW: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
local admitted = 0
if count < limit then
  redis.call('ZADD', KEYS[1], now, ARGV[4])
  admitted = 1
end
redis.call('PEXPIRE', KEYS[1], ARGV[5])
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local oldest_score = -1
if #oldest > 0 then
  oldest_score = tonumber(oldest[2])
end
return {admitted, count, oldest_score}
",
    )
});

#[derive(Clone)]
pub struct RedisStore {
    conn: RedisConnection,
    name: &'static str,
    timeout: Duration,
    closed: std::sync::Arc<AtomicBool>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl StoreError {
    fn from_redis(op: &'static str, e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Unavailable(format!("{op}: {e}"))
        } else if e.is_timeout() {
            StoreError::Unavailable(format!("{op} timed out: {e}"))
        } else {
            StoreError::Command {
                op,
                message: e.to_string(),
            }
        }
    }
}

impl RedisStore {
    /// Open a dedicated connection. `name` only shows up in logs.
    pub async fn connect(
        client: redis::Client,
        name: &'static str,
        timeout: Duration,
    ) -> StoreResult<Self> {
        let conn = match tokio::time::timeout(timeout, RedisConnection::new(client)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(StoreError::Unavailable(format!("connect {name}: {e}"))),
            Err(_) => {
                return Err(StoreError::Timeout {
                    op: "CONNECT",
                    after: timeout,
                });
            }
        };
        debug!(connection = name, "redis connection established");

        Ok(Self {
            conn,
            name,
            timeout,
            closed: std::sync::Arc::new(AtomicBool::new(false)),
        })
    }

    async fn run<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable(format!(
                "{op}: connection {} is closed",
                self.name
            )));
        }
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::from_redis(op, e)),
            Err(_) => Err(StoreError::Timeout {
                op,
                after: self.timeout,
            }),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = self
            .run("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.run("GET", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = self.run("SET", cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        self.run("DEL", redis::cmd("DEL").arg(keys).query_async(&mut conn))
            .await
    }

    async fn incr(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        self.run("INCR", redis::cmd("INCR").arg(key).query_async(&mut conn))
            .await
    }

    async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: u64 = self
            .run(
                "ZADD",
                redis::cmd("ZADD")
                    .arg(key)
                    .arg(score)
                    .arg(member)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = self
            .run(
                "ZREM",
                redis::cmd("ZREM").arg(key).arg(member).query_async(&mut conn),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        self.run("ZCARD", redis::cmd("ZCARD").arg(key).query_async(&mut conn))
            .await
    }

    async fn zcount(&self, key: &str, min: ScoreBound, max: ScoreBound) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        self.run(
            "ZCOUNT",
            redis::cmd("ZCOUNT")
                .arg(key)
                .arg(min.to_arg())
                .arg(max.to_arg())
                .query_async(&mut conn),
        )
        .await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key)
            .arg(min.to_arg())
            .arg(max.to_arg())
            .arg("WITHSCORES");
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        self.run("ZRANGEBYSCORE", cmd.query_async(&mut conn)).await
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.run(
            "ZRANGE",
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .query_async(&mut conn),
        )
        .await
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        self.run(
            "ZREMRANGEBYSCORE",
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(min.to_arg())
                .arg(max.to_arg())
                .query_async(&mut conn),
        )
        .await
    }

    async fn zrem_range_by_rank(&self, key: &str, start: isize, stop: isize) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        self.run(
            "ZREMRANGEBYRANK",
            redis::cmd("ZREMRANGEBYRANK")
                .arg(key)
                .arg(start)
                .arg(stop)
                .query_async(&mut conn),
        )
        .await
    }

    async fn zpop_min_into(
        &self,
        src: &str,
        dst: &str,
        dst_score: f64,
    ) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.run(
            "ZPOPMIN_INTO",
            POP_MIN_INTO
                .key(src)
                .key(dst)
                .arg(dst_score)
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn zmove(&self, src: &str, dst: &str, member: &str, score: f64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .run(
                "ZMOVE",
                MOVE_MEMBER
                    .key(src)
                    .key(dst)
                    .arg(member)
                    .arg(score)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(moved == 1)
    }

    #[instrument(skip(self, req), fields(member = %req.member), level = "trace")]
    async fn zmove_owned(&self, req: OwnedMove<'_>) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        // KEYS[4] must be a real key even when nothing is written.
        let (write_key, value, ttl_ms) = match &req.write {
            Some(w) => (w.key, w.value, w.ttl.map(ttl_millis).unwrap_or(0)),
            None => (req.lock_key, "", 0),
        };
        let moved: i64 = self
            .run(
                "ZMOVE_OWNED",
                MOVE_OWNED
                    .key(req.src)
                    .key(req.dst)
                    .key(req.lock_key)
                    .key(write_key)
                    .arg(req.member)
                    .arg(req.score)
                    .arg(req.token)
                    .arg(u8::from(req.release))
                    .arg(u8::from(req.write.is_some()))
                    .arg(value)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(moved == 1)
    }

    #[instrument(skip(self, req), fields(key = %req.key), level = "trace")]
    async fn sliding_window(&self, req: WindowRequest<'_>) -> StoreResult<WindowOutcome> {
        let mut conn = self.conn.clone();
        let (admitted, count, oldest): (i64, u64, i64) = self
            .run(
                "SLIDING_WINDOW",
                SLIDING_WINDOW
                    .key(req.key)
                    .arg(req.now_ms)
                    .arg(req.window_ms)
                    .arg(req.limit)
                    .arg(req.member)
                    .arg(ttl_millis(req.ttl))
                    .invoke_async(&mut conn),
            )
            .await?;

        Ok(WindowOutcome {
            admitted: admitted == 1,
            count,
            oldest_ms: (oldest >= 0).then_some(oldest),
        })
    }

    async fn used_memory(&self) -> StoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        let info: String = self
            .run(
                "INFO",
                redis::cmd("INFO").arg("memory").query_async(&mut conn),
            )
            .await?;
        Ok(parse_used_memory(&info))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(connection = self.name, "redis connection closed");
        }
    }
}

fn parse_used_memory(info: &str) -> Option<u64> {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("used_memory:"))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_used_memory_from_info() {
        let info = "# Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\n";
        assert_eq!(parse_used_memory(info), Some(1_048_576));
        assert_eq!(parse_used_memory("# Memory\r\n"), None);
    }

    #[test]
    fn ttl_never_rounds_down_to_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
