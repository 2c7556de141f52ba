//! Shared store reachability flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    Unknown,
    Up,
    Down,
}

/// Tri-state reachability, written by health checks and read by the cache
/// and rate limiter to decide whether to touch the store at all.
#[derive(Debug, Clone)]
pub struct StoreHealth {
    state: Arc<AtomicU8>,
}

const UNKNOWN: u8 = 0;
const UP: u8 = 1;
const DOWN: u8 = 2;

impl StoreHealth {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(UNKNOWN)),
        }
    }

    pub fn status(&self) -> StoreStatus {
        match self.state.load(Ordering::Acquire) {
            UP => StoreStatus::Up,
            DOWN => StoreStatus::Down,
            _ => StoreStatus::Unknown,
        }
    }

    pub fn is_down(&self) -> bool {
        self.status() == StoreStatus::Down
    }

    /// Record the result of a health check. Returns the previous status.
    pub fn record(&self, reachable: bool) -> StoreStatus {
        let prev = self
            .state
            .swap(if reachable { UP } else { DOWN }, Ordering::AcqRel);
        match prev {
            UP => StoreStatus::Up,
            DOWN => StoreStatus::Down,
            _ => StoreStatus::Unknown,
        }
    }
}

impl Default for StoreHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unknown_and_is_shared_between_clones() {
        let health = StoreHealth::new();
        let reader = health.clone();
        assert_eq!(reader.status(), StoreStatus::Unknown);
        assert!(!reader.is_down());

        assert_eq!(health.record(false), StoreStatus::Unknown);
        assert!(reader.is_down());
        assert_eq!(health.record(true), StoreStatus::Down);
        assert_eq!(reader.status(), StoreStatus::Up);
    }
}
