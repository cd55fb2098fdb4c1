//! Process-wide lookup of limiters by key.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::key::LimiterKey;
use crate::store::StateStore;

use super::limiter::{DistributedRateLimiter, LimiterOptions};

/// Owns one limiter per key for the lifetime of the process.
///
/// A limiter is created, and its rate applied to the shared bucket, the
/// first time its key is requested. Later requests for the key get the same
/// instance whatever rate they declare. Entries are never evicted.
pub struct LimiterRegistry<S: StateStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    options: LimiterOptions,
    limiters: DashMap<LimiterKey, Arc<DistributedRateLimiter<S>>>,
}

impl<S: StateStore + ?Sized> LimiterRegistry<S> {
    pub fn new(store: Arc<S>, options: LimiterOptions) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), options)
    }

    pub fn with_clock(store: Arc<S>, clock: Arc<dyn Clock>, options: LimiterOptions) -> Self {
        Self {
            store,
            clock,
            options,
            limiters: DashMap::new(),
        }
    }

    /// The limiter for `key`, creating it at `permits_per_second` if this
    /// process has not used the key before.
    pub async fn get_or_create(
        &self,
        key: &LimiterKey,
        permits_per_second: f64,
    ) -> Result<Arc<DistributedRateLimiter<S>>> {
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }

        let created = Arc::new(
            DistributedRateLimiter::create_with_clock(
                self.store.clone(),
                self.clock.clone(),
                key.clone(),
                permits_per_second,
                self.options.clone(),
            )
            .await?,
        );

        // Two callers may race to create the same key; the first insert wins.
        let limiter = self
            .limiters
            .entry(key.clone())
            .or_insert_with(|| {
                info!(key = %key, rate = permits_per_second, "Registered rate limiter");
                created
            })
            .clone();
        Ok(limiter)
    }

    pub fn get(&self, key: &LimiterKey) -> Option<Arc<DistributedRateLimiter<S>>> {
        self.limiters.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &LimiterKey) -> bool {
        self.limiters.contains_key(key)
    }

    /// Number of registered limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
