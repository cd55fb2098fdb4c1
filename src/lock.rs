//! Per-key mutual exclusion across processes.
//!
//! The lock is a lease record in the shared store, created with an atomic
//! set-if-absent and removed with an atomic compare-and-delete. A holder that
//! dies without releasing blocks the key for at most one lease. There is no
//! queueing: whichever waiter retries first after a release wins.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{FleetrateError, Result};
use crate::key::LimiterKey;
use crate::store::StateStore;

/// How the lock is taken.
#[derive(Debug, Clone, PartialEq)]
pub struct LockOptions {
    /// Lifetime of the lease record
    pub lease: Duration,
    /// Fixed pause between attempts
    pub retry_backoff: Duration,
    /// Overall bound on waiting; `None` retries forever
    pub acquire_deadline: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_millis(3000),
            retry_backoff: Duration::from_millis(200),
            acquire_deadline: None,
        }
    }
}

/// Proof of holding the lock for one key.
///
/// Hand it back to [`DistributedLock::release`]. A lease dropped without
/// being released, for instance because the future holding it was
/// cancelled, is released by a task spawned on the current runtime.
#[must_use = "a lease should be released as soon as the critical section ends"]
pub struct LockLease<S: StateStore + ?Sized> {
    store: Arc<S>,
    lock_key: String,
    token: String,
    acquired_at: Instant,
    settled: bool,
}

impl<S: StateStore + ?Sized> std::fmt::Debug for LockLease<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease")
            .field("lock_key", &self.lock_key)
            .field("token", &self.token)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

impl<S: StateStore + ?Sized> LockLease<S> {
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// The random holder identity written into the lease record.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl<S: StateStore + ?Sized> Drop for LockLease<S> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock_key = %self.lock_key, "Lease dropped outside a runtime, left to expire");
            return;
        };

        let store = self.store.clone();
        let lock_key = std::mem::take(&mut self.lock_key);
        let token = std::mem::take(&mut self.token);
        debug!(lock_key = %lock_key, "Lease dropped unreleased, releasing in background");
        runtime.spawn(async move {
            if let Err(e) = store.delete_if_equals(&lock_key, &token).await {
                warn!(lock_key = %lock_key, error = %e, "Background lease release failed");
            }
        });
    }
}

/// Spin lock with a lease, built on the store's conditional operations.
pub struct DistributedLock<S: StateStore + ?Sized> {
    store: Arc<S>,
    options: LockOptions,
}

impl<S: StateStore + ?Sized> DistributedLock<S> {
    pub fn new(store: Arc<S>, options: LockOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Block until the lock for `key` is held.
    ///
    /// Retries at the fixed backoff until it wins, or until the optional
    /// deadline passes. Store failures end the wait immediately.
    pub async fn acquire(&self, key: &LimiterKey) -> Result<LockLease<S>> {
        let lock_key = key.lock_key();
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut attempts: u32 = 0;
        let mut warned = false;

        loop {
            attempts += 1;
            if self
                .store
                .set_if_absent(&lock_key, &token, self.options.lease)
                .await?
            {
                trace!(key = %key, token = %token, attempts, "Lock acquired");
                return Ok(LockLease {
                    store: self.store.clone(),
                    lock_key,
                    token,
                    acquired_at: Instant::now(),
                    settled: false,
                });
            }

            let waited = started.elapsed();
            let mut pause = self.options.retry_backoff;
            if let Some(deadline) = self.options.acquire_deadline {
                if waited >= deadline {
                    debug!(key = %key, attempts, waited = ?waited, "Gave up waiting for lock");
                    return Err(FleetrateError::LockUnavailable {
                        key: key.to_string(),
                        waited,
                    });
                }
                pause = pause.min(deadline - waited);
            }

            if !warned && waited >= self.options.lease {
                warn!(
                    key = %key,
                    attempts,
                    waited = ?waited,
                    "Still waiting for lock after a full lease"
                );
                warned = true;
            } else {
                trace!(key = %key, attempts, "Lock held elsewhere, backing off");
            }

            tokio::time::sleep(pause).await;
        }
    }

    /// Release a lease. Returns `false` when the record no longer carries our
    /// token, which happens after the lease expired and someone else took it;
    /// their lease is left untouched.
    pub async fn release(&self, mut lease: LockLease<S>) -> Result<bool> {
        let outcome = self
            .store
            .delete_if_equals(&lease.lock_key, &lease.token)
            .await;
        lease.settled = true;
        let released = outcome?;

        if released {
            trace!(
                lock_key = %lease.lock_key,
                held = ?lease.acquired_at.elapsed(),
                "Lock released"
            );
        } else {
            warn!(
                lock_key = %lease.lock_key,
                held = ?lease.acquired_at.elapsed(),
                lease = ?self.options.lease,
                "Lease was no longer ours at release"
            );
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn lock_with(
        store: Arc<MemoryStore>,
        lease_ms: u64,
        deadline_ms: Option<u64>,
    ) -> DistributedLock<MemoryStore> {
        DistributedLock::new(
            store,
            LockOptions {
                lease: Duration::from_millis(lease_ms),
                retry_backoff: Duration::from_millis(10),
                acquire_deadline: deadline_ms.map(Duration::from_millis),
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store = Arc::new(MemoryStore::new());
        let lock = lock_with(store.clone(), 3000, None);
        let key = LimiterKey::new("junit");

        let lease = lock.acquire(&key).await.unwrap();
        assert_eq!(lease.lock_key(), "junitLock");
        assert_eq!(store.lease_holder("junitLock").as_deref(), Some(lease.token()));

        assert!(lock.release(lease).await.unwrap());
        assert_eq!(store.lease_holder("junitLock"), None);
    }

    #[tokio::test]
    async fn test_fresh_token_per_acquisition() {
        let store = Arc::new(MemoryStore::new());
        let lock = lock_with(store, 3000, None);
        let key = LimiterKey::new("junit");

        let first = lock.acquire(&key).await.unwrap();
        let first_token = first.token().to_string();
        lock.release(first).await.unwrap();

        let second = lock.acquire(&key).await.unwrap();
        assert_ne!(first_token, second.token());
        lock.release(second).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released_in_background() {
        let store = Arc::new(MemoryStore::new());
        let lock = lock_with(store.clone(), 10_000, None);
        let key = LimiterKey::new("dropped");

        let lease = lock.acquire(&key).await.unwrap();
        assert!(store.lease_holder("droppedLock").is_some());
        drop(lease);

        for _ in 0..10 {
            if store.lease_holder("droppedLock").is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.lease_holder("droppedLock"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_lock_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let holder = lock_with(store.clone(), 10_000, None);
        let waiter = lock_with(store, 10_000, Some(100));
        let key = LimiterKey::new("busy");

        let _held = holder.acquire(&key).await.unwrap();
        let err = waiter.acquire(&key).await.unwrap_err();
        match err {
            FleetrateError::LockUnavailable { key, waited } => {
                assert_eq!(key, "busy");
                assert!(waited >= Duration::from_millis(100));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_proceeds_after_release() {
        let store = Arc::new(MemoryStore::new());
        let lock = Arc::new(lock_with(store, 10_000, None));
        let key = LimiterKey::new("handoff");

        let held = lock.acquire(&key).await.unwrap();
        let waiter = {
            let lock = lock.clone();
            let key = key.clone();
            tokio::spawn(async move { lock.acquire(&key).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        lock.release(held).await.unwrap();

        let lease = waiter.await.unwrap().unwrap();
        lock.release(lease).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_heals_and_stale_release_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let lock = lock_with(store.clone(), 100, None);
        let key = LimiterKey::new("crashy");

        // First holder never releases in time.
        let stale = lock.acquire(&key).await.unwrap();
        let fresh = lock.acquire(&key).await.unwrap();
        assert_ne!(stale.token(), fresh.token());

        // The stale holder's release must not remove the new lease.
        assert!(!lock.release(stale).await.unwrap());
        assert_eq!(
            store.lease_holder("crashyLock").as_deref(),
            Some(fresh.token())
        );
        assert!(lock.release(fresh).await.unwrap());
    }
}
