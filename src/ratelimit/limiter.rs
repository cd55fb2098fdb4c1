//! Rate limiter shared by every process using the same key.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::config::FleetrateConfig;
use crate::error::{FleetrateError, Result};
use crate::key::LimiterKey;
use crate::lock::{DistributedLock, LockLease, LockOptions};
use crate::store::{LimiterState, StateStore};

use super::bucket::TokenBucket;
use super::policy::{RefillPolicy, SmoothBursty};

const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Settings for building limiters.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterOptions {
    /// Burst capacity in seconds of the configured rate
    pub max_burst_seconds: f64,
    /// How the per-key lock is taken
    pub lock: LockOptions,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            max_burst_seconds: 1.0,
            lock: LockOptions::default(),
        }
    }
}

impl From<&FleetrateConfig> for LimiterOptions {
    fn from(config: &FleetrateConfig) -> Self {
        Self {
            max_burst_seconds: config.limiter.max_burst_seconds,
            lock: config.lock.to_options(),
        }
    }
}

/// A token bucket rate limiter whose state lives in a shared store.
///
/// Instances in any number of processes that use the same key enforce one
/// combined rate. Each state transition runs under the key's distributed
/// lock; the wait a reservation implies is slept after the lock is released,
/// so lock hold time stays at a few store round-trips.
///
/// The configured rate itself is cached per instance and not read back from
/// the store: every instance sharing a key must be created with the same
/// rate.
pub struct DistributedRateLimiter<S: StateStore + ?Sized> {
    key: LimiterKey,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    lock: DistributedLock<S>,
    bucket: Mutex<TokenBucket>,
}

impl<S: StateStore + ?Sized> std::fmt::Debug for DistributedRateLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("key", &self.key)
            .field("rate", &self.bucket.lock().rate())
            .finish()
    }
}

impl<S: StateStore + ?Sized> DistributedRateLimiter<S> {
    /// Create a limiter for `key` on the system clock and apply
    /// `permits_per_second` to the shared bucket.
    pub async fn create(
        store: Arc<S>,
        key: impl Into<LimiterKey>,
        permits_per_second: f64,
        options: LimiterOptions,
    ) -> Result<Self> {
        Self::create_with_clock(store, Arc::new(SystemClock), key, permits_per_second, options)
            .await
    }

    /// Like [`create`](Self::create) with an explicit clock.
    pub async fn create_with_clock(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        key: impl Into<LimiterKey>,
        permits_per_second: f64,
        options: LimiterOptions,
    ) -> Result<Self> {
        if options.max_burst_seconds.is_nan() || options.max_burst_seconds <= 0.0 {
            return Err(FleetrateError::InvalidArgument(format!(
                "max_burst_seconds must be positive, got {}",
                options.max_burst_seconds
            )));
        }
        let policy = Box::new(SmoothBursty::new(options.max_burst_seconds));
        Self::create_with_policy(store, clock, key, permits_per_second, policy, options.lock).await
    }

    /// Build a limiter around any refill policy.
    pub async fn create_with_policy(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        key: impl Into<LimiterKey>,
        permits_per_second: f64,
        policy: Box<dyn RefillPolicy>,
        lock_options: LockOptions,
    ) -> Result<Self> {
        let limiter = Self {
            key: key.into(),
            lock: DistributedLock::new(store.clone(), lock_options),
            store,
            clock,
            bucket: Mutex::new(TokenBucket::new(policy)),
        };
        limiter.set_rate(permits_per_second).await?;
        Ok(limiter)
    }

    pub fn key(&self) -> &LimiterKey {
        &self.key
    }

    /// Change the rate of the shared bucket.
    ///
    /// Accrued permits are settled at the old rate first, then the capacity
    /// and banked permits are rescaled.
    pub async fn set_rate(&self, permits_per_second: f64) -> Result<()> {
        if permits_per_second.is_nan() || permits_per_second <= 0.0 {
            return Err(FleetrateError::InvalidArgument(format!(
                "rate must be positive, got {}",
                permits_per_second
            )));
        }

        let lease = self.lock.acquire(&self.key).await?;
        let outcome = self.set_rate_locked(permits_per_second).await;
        self.finish(lease, outcome).await
    }

    async fn set_rate_locked(&self, permits_per_second: f64) -> Result<()> {
        let now_micros = self.clock.now_micros();
        let mut state = LimiterState::load(&*self.store, &self.key).await?;
        let before = state;

        self.bucket
            .lock()
            .set_rate(&mut state, permits_per_second, now_micros);
        state.save(&*self.store, &self.key).await?;

        debug!(
            key = %self.key,
            rate = permits_per_second,
            old_max_permits = before.max_permits,
            max_permits = state.max_permits,
            stored_permits = state.stored_permits,
            "Rate applied"
        );
        Ok(())
    }

    /// The rate this instance configured, read under the lock.
    pub async fn rate(&self) -> Result<f64> {
        let lease = self.lock.acquire(&self.key).await?;
        let outcome = self.bucket.lock().rate().ok_or_else(|| {
            FleetrateError::InvalidArgument(format!("no rate set for '{}'", self.key))
        });
        self.finish(lease, outcome).await
    }

    /// Take `permits`, sleeping as long as the bucket requires. Returns the
    /// time slept in seconds.
    pub async fn acquire(&self, permits: u32) -> Result<f64> {
        let micros_to_wait = self.reserve(permits).await?;
        self.clock.sleep_micros(micros_to_wait).await;
        Ok(micros_to_wait as f64 / MICROS_PER_SECOND)
    }

    /// Take one permit. See [`acquire`](Self::acquire).
    pub async fn acquire_one(&self) -> Result<f64> {
        self.acquire(1).await
    }

    /// Take `permits` only if they become available within `timeout`.
    ///
    /// An infeasible request returns `false` without touching the bucket.
    /// A feasible one reserves, releases the lock, sleeps, and returns
    /// `true`.
    pub async fn try_acquire(&self, permits: u32, timeout: Duration) -> Result<bool> {
        check_permits(permits)?;
        let timeout_micros = i64::try_from(timeout.as_micros()).unwrap_or(i64::MAX);

        let lease = self.lock.acquire(&self.key).await?;
        let outcome = self.try_reserve_locked(permits, timeout_micros).await;
        match self.finish(lease, outcome).await? {
            Some(micros_to_wait) => {
                self.clock.sleep_micros(micros_to_wait).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Take one permit within `timeout`.
    pub async fn try_acquire_one(&self, timeout: Duration) -> Result<bool> {
        self.try_acquire(1, timeout).await
    }

    /// Take `permits` only if they are available right now.
    pub async fn try_acquire_now(&self, permits: u32) -> Result<bool> {
        self.try_acquire(permits, Duration::ZERO).await
    }

    async fn try_reserve_locked(&self, permits: u32, timeout_micros: i64) -> Result<Option<i64>> {
        let now_micros = self.clock.now_micros();
        let mut state = LimiterState::load(&*self.store, &self.key).await?;

        let micros_to_wait = {
            let bucket = self.bucket.lock();
            if !bucket.can_acquire(&state, now_micros, timeout_micros) {
                trace!(
                    key = %self.key,
                    permits,
                    timeout_micros,
                    next_free = state.next_free_ticket_micros,
                    "Permits not available within timeout"
                );
                return Ok(None);
            }
            bucket.reserve_and_get_wait_length(&mut state, permits, now_micros)
        };

        state.save(&*self.store, &self.key).await?;
        Ok(Some(micros_to_wait))
    }

    /// Reserve `permits` and return how many microseconds the caller must
    /// wait before using them. Does not sleep.
    pub async fn reserve(&self, permits: u32) -> Result<i64> {
        check_permits(permits)?;
        let lease = self.lock.acquire(&self.key).await?;
        let outcome = self.reserve_locked(permits).await;
        self.finish(lease, outcome).await
    }

    async fn reserve_locked(&self, permits: u32) -> Result<i64> {
        let now_micros = self.clock.now_micros();
        let mut state = LimiterState::load(&*self.store, &self.key).await?;

        let micros_to_wait = self
            .bucket
            .lock()
            .reserve_and_get_wait_length(&mut state, permits, now_micros);
        state.save(&*self.store, &self.key).await?;

        trace!(key = %self.key, permits, micros_to_wait, "Reservation committed");
        Ok(micros_to_wait)
    }

    /// Snapshot of the shared record, read under the lock.
    pub async fn state(&self) -> Result<LimiterState> {
        let lease = self.lock.acquire(&self.key).await?;
        let outcome = LimiterState::load(&*self.store, &self.key).await;
        self.finish(lease, outcome).await
    }

    /// Release the lease whatever the critical section produced. The
    /// section's own error wins over a release error.
    async fn finish<T>(&self, lease: LockLease<S>, outcome: Result<T>) -> Result<T> {
        let released = self.lock.release(lease).await;
        let value = outcome?;
        released?;
        Ok(value)
    }
}

fn check_permits(permits: u32) -> Result<()> {
    if permits == 0 {
        return Err(FleetrateError::InvalidArgument(
            "permits must be at least 1".into(),
        ));
    }
    Ok(())
}
