//! Rate limiting logic: the token bucket, its refill policies, and the
//! limiter built on the distributed lock.

mod bucket;
mod guard;
mod limiter;
mod policy;
mod registry;

pub use bucket::TokenBucket;
pub use guard::{GuardSpec, RateLimitGuard};
pub use limiter::{DistributedRateLimiter, LimiterOptions};
pub use policy::{RefillPolicy, SmoothBursty};
pub use registry::LimiterRegistry;
