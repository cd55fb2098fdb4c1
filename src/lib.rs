//! Fleetrate - Distributed Token Bucket Rate Limiting
//!
//! This crate implements a token bucket rate limiter whose state lives in a
//! shared key-value store, so that any number of replicas of a service
//! enforce one combined rate per key. Every read-modify-write of a bucket is
//! serialized across processes by a lease-based lock built on the store's
//! conditional operations.

pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod lock;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FleetrateConfig;
pub use error::{FleetrateError, Result};
pub use key::LimiterKey;
pub use lock::{DistributedLock, LockLease, LockOptions};
pub use ratelimit::{
    DistributedRateLimiter, GuardSpec, LimiterOptions, LimiterRegistry, RateLimitGuard,
    RefillPolicy, SmoothBursty, TokenBucket,
};
pub use store::{LimiterState, MemoryStore, RedisStore, StateStore};
