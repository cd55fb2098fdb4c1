//! Refill policies for the token bucket.
//!
//! A policy decides how capacity follows the rate, what spending banked
//! permits costs, and how quickly an idle bucket refills.

use std::fmt;

use crate::store::LimiterState;

const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Behavior that differs between token bucket flavors.
pub trait RefillPolicy: Send + Sync + fmt::Debug {
    /// Apply a new rate to the bucket capacity, rescaling banked permits.
    fn rescale(
        &self,
        state: &mut LimiterState,
        permits_per_second: f64,
        stable_interval_micros: f64,
    );

    /// Extra wait, in microseconds, for spending `permits_to_take` banked
    /// permits out of `state.stored_permits`.
    fn stored_permits_to_wait_time(&self, state: &LimiterState, permits_to_take: f64) -> i64;

    /// Microseconds it takes an idle bucket to regain one permit.
    fn cool_down_interval_micros(&self, stable_interval_micros: f64) -> f64;

    /// The stable interval implied by a stored capacity, for refilling a
    /// bucket before this process knows its own rate.
    fn interval_for_capacity(&self, max_permits: f64) -> Option<f64>;
}

/// Bursty token bucket: banked permits are free, capacity is
/// `max_burst_seconds` worth of the rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothBursty {
    max_burst_seconds: f64,
}

impl SmoothBursty {
    pub fn new(max_burst_seconds: f64) -> Self {
        Self { max_burst_seconds }
    }

    pub fn max_burst_seconds(&self) -> f64 {
        self.max_burst_seconds
    }
}

impl Default for SmoothBursty {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl RefillPolicy for SmoothBursty {
    fn rescale(
        &self,
        state: &mut LimiterState,
        permits_per_second: f64,
        _stable_interval_micros: f64,
    ) {
        let old_max_permits = state.max_permits;
        // An unchanged rate on an existing record leaves it alone.
        if permits_per_second == old_max_permits {
            return;
        }

        let max_permits = self.max_burst_seconds * permits_per_second;
        state.max_permits = max_permits;
        state.stored_permits = if old_max_permits == f64::INFINITY {
            max_permits
        } else if old_max_permits == 0.0 {
            0.0
        } else {
            state.stored_permits * max_permits / old_max_permits
        };
    }

    fn stored_permits_to_wait_time(&self, _state: &LimiterState, _permits_to_take: f64) -> i64 {
        0
    }

    fn cool_down_interval_micros(&self, stable_interval_micros: f64) -> f64 {
        stable_interval_micros
    }

    fn interval_for_capacity(&self, max_permits: f64) -> Option<f64> {
        if max_permits.is_finite() && max_permits > 0.0 {
            Some(self.max_burst_seconds * MICROS_PER_SECOND / max_permits)
        } else {
            None
        }
    }
}
