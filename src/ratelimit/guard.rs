//! Guarding calls with a declared rate.
//!
//! A call site declares a rate and a key; the guard takes one permit from
//! that key's limiter before the call runs.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::key::LimiterKey;
use crate::store::StateStore;

use super::registry::LimiterRegistry;

/// Rate limit declared by a call site.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardSpec {
    pub permits_per_second: f64,
    pub key: LimiterKey,
}

impl GuardSpec {
    pub fn new(permits_per_second: f64, key: impl Into<LimiterKey>) -> Self {
        Self {
            permits_per_second,
            key: key.into(),
        }
    }
}

/// Runs calls behind the limiter their spec names.
pub struct RateLimitGuard<S: StateStore + ?Sized> {
    registry: Arc<LimiterRegistry<S>>,
}

impl<S: StateStore + ?Sized> Clone for RateLimitGuard<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<S: StateStore + ?Sized> RateLimitGuard<S> {
    pub fn new(registry: Arc<LimiterRegistry<S>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry<S>> {
        &self.registry
    }

    /// Acquire one permit for `spec`, then run `call`.
    ///
    /// If the limiter fails (an invalid declared rate, an unreachable
    /// store) `call` is never invoked.
    pub async fn run<F, Fut>(&self, spec: &GuardSpec, call: F) -> Result<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let limiter = self
            .registry
            .get_or_create(&spec.key, spec.permits_per_second)
            .await?;
        let waited = limiter.acquire_one().await?;
        debug!(key = %spec.key, waited_secs = waited, "Guarded call admitted");
        Ok(call().await)
    }
}
