//! Token bucket arithmetic.
//!
//! The bucket is continuous-time: permits accrue linearly at the configured
//! rate up to the capacity, and a reservation that outruns the bank pushes
//! `next_free_ticket_micros` into the future. The reservation itself is
//! granted at the old `next_free_ticket_micros`, so a request pays for its
//! own debt by delaying the next caller.
//!
//! Nothing here touches the store. Callers load a [`LimiterState`], run these
//! operations while holding the key's lock, and write the state back.

use tracing::trace;

use crate::store::LimiterState;

use super::policy::RefillPolicy;

const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// The process-local half of a bucket: its refill policy and the rate this
/// process configured.
#[derive(Debug)]
pub struct TokenBucket {
    policy: Box<dyn RefillPolicy>,
    /// Zero until a rate has been set through this bucket
    stable_interval_micros: f64,
}

impl TokenBucket {
    pub fn new(policy: Box<dyn RefillPolicy>) -> Self {
        Self {
            policy,
            stable_interval_micros: 0.0,
        }
    }

    /// Microseconds between permits at the stable rate, once set.
    pub fn stable_interval_micros(&self) -> Option<f64> {
        (self.stable_interval_micros > 0.0).then_some(self.stable_interval_micros)
    }

    /// Permits per second as last set through this bucket.
    pub fn rate(&self) -> Option<f64> {
        self.stable_interval_micros()
            .map(|interval| MICROS_PER_SECOND / interval)
    }

    /// Credit permits accrued since `next_free_ticket_micros` and move that
    /// instant up to `now_micros`. No-op while the bucket is in debt.
    pub fn resync(&self, state: &mut LimiterState, now_micros: i64) {
        if now_micros <= state.next_free_ticket_micros {
            return;
        }

        if let Some(interval) = self.cool_down_interval(state) {
            let new_permits = (now_micros - state.next_free_ticket_micros) as f64 / interval;
            state.stored_permits = state.max_permits.min(state.stored_permits + new_permits);
        }
        state.next_free_ticket_micros = now_micros;
    }

    fn cool_down_interval(&self, state: &LimiterState) -> Option<f64> {
        match self.stable_interval_micros() {
            Some(interval) => Some(self.policy.cool_down_interval_micros(interval)),
            None => self.policy.interval_for_capacity(state.max_permits),
        }
    }

    /// Settle the bucket under the old rate, then switch to
    /// `permits_per_second` and rescale the capacity.
    pub fn set_rate(&mut self, state: &mut LimiterState, permits_per_second: f64, now_micros: i64) {
        self.resync(state, now_micros);
        let stable_interval_micros = MICROS_PER_SECOND / permits_per_second;
        self.stable_interval_micros = stable_interval_micros;
        self.policy
            .rescale(state, permits_per_second, stable_interval_micros);
    }

    /// Commit `required_permits` and return the instant they become
    /// available.
    pub fn reserve_earliest_available(
        &self,
        state: &mut LimiterState,
        required_permits: u32,
        now_micros: i64,
    ) -> i64 {
        self.resync(state, now_micros);
        let return_value = state.next_free_ticket_micros;

        let required = f64::from(required_permits);
        let stored_permits_to_spend = required.min(state.stored_permits);
        let fresh_permits = required - stored_permits_to_spend;
        // Float-to-int casts saturate, so huge debts clamp instead of wrapping.
        let wait_micros = self
            .policy
            .stored_permits_to_wait_time(state, stored_permits_to_spend)
            .saturating_add((fresh_permits * self.stable_interval_micros) as i64);

        state.next_free_ticket_micros = return_value.saturating_add(wait_micros);
        state.stored_permits -= stored_permits_to_spend;

        trace!(
            required = required_permits,
            from_bank = stored_permits_to_spend,
            fresh = fresh_permits,
            available_at = return_value,
            next_free = state.next_free_ticket_micros,
            "Reserved permits"
        );
        return_value
    }

    /// Reserve and convert the availability instant into a wait relative to
    /// `now_micros`. Never negative.
    pub fn reserve_and_get_wait_length(
        &self,
        state: &mut LimiterState,
        permits: u32,
        now_micros: i64,
    ) -> i64 {
        let moment_available = self.reserve_earliest_available(state, permits, now_micros);
        moment_available.saturating_sub(now_micros).max(0)
    }

    /// The instant the next reservation would be granted, without refilling.
    pub fn query_earliest_available(&self, state: &LimiterState, _now_micros: i64) -> i64 {
        state.next_free_ticket_micros
    }

    /// Whether a reservation made now would be granted within `timeout_micros`.
    pub fn can_acquire(&self, state: &LimiterState, now_micros: i64, timeout_micros: i64) -> bool {
        self.query_earliest_available(state, now_micros)
            .saturating_sub(timeout_micros)
            <= now_micros
    }
}
