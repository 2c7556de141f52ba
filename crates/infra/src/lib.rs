//! Coordination infrastructure: store connections, job queues and workers,
//! cache-aside, rate limiting, cron scheduling and the lifecycle that ties
//! them together.

pub mod cache;
pub mod clock;
pub mod config;
pub mod jobs;
pub mod lifecycle;
pub mod rate_limit;
pub mod scheduler;
pub mod store;

pub use cache::{Cache, CacheKeys, CacheStats, CacheTtl};
pub use config::{ConfigError, Settings};
pub use lifecycle::{Collaborators, Infrastructure, Mode};
pub use rate_limit::{RateLimitClass, RateLimitConfig, RateLimitDecision, RateLimiter};
pub use scheduler::{Scheduler, SchedulerError, TriggerOutcome};
