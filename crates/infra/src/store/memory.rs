//! In-process store for tests and local development.
//!
//! Implements the same contract as the Redis store, including key expiry
//! (driven by the injected [`Clock`]) and the atomic multi-step primitives,
//! which here are atomic because they run under one lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    OwnedMove, ScoreBound, Store, StoreError, StoreResult, WindowOutcome, WindowRequest,
    glob_match,
};
use crate::clock::{SharedClock, SystemClock};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Lock the keyspace after dropping everything that has expired.
    fn live(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        if !self.available.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, e| e.expires_at.is_none_or(|at| at > now));
        Ok(entries)
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(op: &'static str) -> StoreError {
    StoreError::Command {
        op,
        message: "WRONGTYPE Operation against a key holding the wrong kind of value".into(),
    }
}

fn zset<'a>(
    entries: &'a HashMap<String, Entry>,
    key: &str,
    op: &'static str,
) -> StoreResult<Option<&'a HashMap<String, f64>>> {
    match entries.get(key).map(|e| &e.value) {
        None => Ok(None),
        Some(Value::ZSet(set)) => Ok(Some(set)),
        Some(Value::Str(_)) => Err(wrong_type(op)),
    }
}

fn zset_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    op: &'static str,
) -> StoreResult<&'a mut HashMap<String, f64>> {
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::ZSet(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::ZSet(set) => Ok(set),
        Value::Str(_) => Err(wrong_type(op)),
    }
}

/// Ascending by score, ties broken by member like Redis does.
fn sorted(set: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = set.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    members
}

/// Resolve Redis-style rank indexes into a `start..end` slice range.
fn rank_range(len: usize, start: isize, stop: isize) -> Option<std::ops::Range<usize>> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some(start as usize..(stop + 1) as usize)
}

/// Drop empty sorted sets so they stop counting as keys.
fn prune_empty(entries: &mut HashMap<String, Entry>, key: &str) {
    if matches!(entries.get(key).map(|e| &e.value), Some(Value::ZSet(s)) if s.is_empty()) {
        entries.remove(key);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.live().map(|_| ())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let entries = self.live()?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(Value::ZSet(_)) => Err(wrong_type("GET")),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(|ttl| self.expiry(ttl));
        let mut entries = self.live()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        let mut entries = self.live()?;
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count() as u64)
    }

    async fn incr(&self, key: &str) -> StoreResult<u64> {
        let mut entries = self.live()?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Str("0".into()),
            expires_at: None,
        });
        let Value::Str(raw) = &mut entry.value else {
            return Err(wrong_type("INCR"));
        };
        let next = raw.parse::<u64>().map_err(|_| StoreError::Command {
            op: "INCR",
            message: "value is not an integer or out of range".into(),
        })? + 1;
        *raw = next.to_string();
        Ok(next)
    }

    async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let entries = self.live()?;
        Ok(entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut entries = self.live()?;
        zset_mut(&mut entries, key, "ZADD")?.insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut entries = self.live()?;
        if zset(&entries, key, "ZREM")?.is_none() {
            return Ok(false);
        }
        let removed = zset_mut(&mut entries, key, "ZREM")?.remove(member).is_some();
        prune_empty(&mut entries, key);
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let entries = self.live()?;
        Ok(zset(&entries, key, "ZCARD")?.map_or(0, |s| s.len() as u64))
    }

    async fn zcount(&self, key: &str, min: ScoreBound, max: ScoreBound) -> StoreResult<u64> {
        let entries = self.live()?;
        Ok(zset(&entries, key, "ZCOUNT")?.map_or(0, |s| {
            s.values()
                .filter(|&&score| min.admits_from_below(score) && max.admits_from_above(score))
                .count() as u64
        }))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, f64)>> {
        let entries = self.live()?;
        let Some(set) = zset(&entries, key, "ZRANGEBYSCORE")? else {
            return Ok(Vec::new());
        };
        Ok(sorted(set)
            .into_iter()
            .filter(|(_, score)| min.admits_from_below(*score) && max.admits_from_above(*score))
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let entries = self.live()?;
        let Some(set) = zset(&entries, key, "ZRANGE")? else {
            return Ok(Vec::new());
        };
        let members = sorted(set);
        Ok(rank_range(members.len(), start, stop)
            .map(|range| members[range].iter().map(|(m, _)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> StoreResult<u64> {
        let mut entries = self.live()?;
        if zset(&entries, key, "ZREMRANGEBYSCORE")?.is_none() {
            return Ok(0);
        }
        let set = zset_mut(&mut entries, key, "ZREMRANGEBYSCORE")?;
        let before = set.len();
        set.retain(|_, score| !(min.admits_from_below(*score) && max.admits_from_above(*score)));
        let removed = (before - set.len()) as u64;
        prune_empty(&mut entries, key);
        Ok(removed)
    }

    async fn zrem_range_by_rank(&self, key: &str, start: isize, stop: isize) -> StoreResult<u64> {
        let mut entries = self.live()?;
        let Some(set) = zset(&entries, key, "ZREMRANGEBYRANK")? else {
            return Ok(0);
        };
        let members = sorted(set);
        let Some(range) = rank_range(members.len(), start, stop) else {
            return Ok(0);
        };
        let set = zset_mut(&mut entries, key, "ZREMRANGEBYRANK")?;
        for (member, _) in &members[range.clone()] {
            set.remove(member);
        }
        prune_empty(&mut entries, key);
        Ok(range.len() as u64)
    }

    async fn zpop_min_into(
        &self,
        src: &str,
        dst: &str,
        dst_score: f64,
    ) -> StoreResult<Option<String>> {
        let mut entries = self.live()?;
        let Some(set) = zset(&entries, src, "ZPOPMIN")? else {
            return Ok(None);
        };
        let Some((member, _)) = sorted(set).into_iter().next() else {
            return Ok(None);
        };
        zset_mut(&mut entries, src, "ZPOPMIN")?.remove(&member);
        prune_empty(&mut entries, src);
        zset_mut(&mut entries, dst, "ZADD")?.insert(member.clone(), dst_score);
        Ok(Some(member))
    }

    async fn zmove(&self, src: &str, dst: &str, member: &str, score: f64) -> StoreResult<bool> {
        let mut entries = self.live()?;
        let present = zset(&entries, src, "ZREM")?.is_some_and(|s| s.contains_key(member));
        if !present {
            return Ok(false);
        }
        zset_mut(&mut entries, src, "ZREM")?.remove(member);
        prune_empty(&mut entries, src);
        zset_mut(&mut entries, dst, "ZADD")?.insert(member.to_string(), score);
        Ok(true)
    }

    async fn zmove_owned(&self, req: OwnedMove<'_>) -> StoreResult<bool> {
        let write_expiry = req
            .write
            .as_ref()
            .and_then(|w| w.ttl)
            .map(|ttl| self.expiry(ttl));
        let mut entries = self.live()?;

        let owned = match entries.get(req.lock_key).map(|e| &e.value) {
            None => false,
            Some(Value::Str(held)) => held == req.token,
            Some(Value::ZSet(_)) => return Err(wrong_type("GET")),
        };
        let present = zset(&entries, req.src, "ZREM")?.is_some_and(|s| s.contains_key(req.member));
        if !owned || !present {
            return Ok(false);
        }

        zset_mut(&mut entries, req.src, "ZREM")?.remove(req.member);
        prune_empty(&mut entries, req.src);
        zset_mut(&mut entries, req.dst, "ZADD")?.insert(req.member.to_string(), req.score);
        if req.release {
            entries.remove(req.lock_key);
        }
        if let Some(write) = req.write {
            entries.insert(
                write.key.to_string(),
                Entry {
                    value: Value::Str(write.value.to_string()),
                    expires_at: write_expiry,
                },
            );
        }
        Ok(true)
    }

    async fn sliding_window(&self, req: WindowRequest<'_>) -> StoreResult<WindowOutcome> {
        let expires_at = self.expiry(req.ttl);
        let mut entries = self.live()?;
        let cutoff = (req.now_ms - req.window_ms) as f64;

        let set = zset_mut(&mut entries, req.key, "EVALSHA")?;
        set.retain(|_, score| *score > cutoff);
        let count = set.len() as u64;
        let admitted = count < req.limit;
        if admitted {
            set.insert(req.member.to_string(), req.now_ms as f64);
        }
        let oldest_ms = set
            .values()
            .copied()
            .min_by(f64::total_cmp)
            .map(|score| score as i64);

        if let Some(entry) = entries.get_mut(req.key) {
            entry.expires_at = Some(expires_at);
        }
        prune_empty(&mut entries, req.key);

        Ok(WindowOutcome {
            admitted,
            count,
            oldest_ms,
        })
    }

    async fn used_memory(&self) -> StoreResult<Option<u64>> {
        let entries = self.live()?;
        let approx = entries
            .iter()
            .map(|(k, e)| {
                k.len()
                    + match &e.value {
                        Value::Str(s) => s.len(),
                        Value::ZSet(set) => set.keys().map(|m| m.len() + 8).sum(),
                    }
            })
            .sum::<usize>();
        Ok(Some(approx as u64))
    }
}
