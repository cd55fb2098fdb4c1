//! Time source and sleeping for the limiter.
//!
//! Every process sharing a key writes absolute timestamps into the store, so
//! all of them must read the same time domain. `SystemClock` therefore reads
//! wall-clock microseconds since the UNIX epoch rather than a process-local
//! monotonic instant.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;

/// A microsecond clock plus a sleep that runs to completion.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time in microseconds.
    fn now_micros(&self) -> i64;

    /// Sleep for `micros`. Non-positive durations return immediately.
    async fn sleep_micros(&self, micros: i64);
}

/// Wall clock backed by `SystemTime` and `tokio::time::sleep`.
///
/// A tokio sleep cannot be interrupted, only dropped together with the
/// future awaiting it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }

    async fn sleep_micros(&self, micros: i64) {
        if micros > 0 {
            tokio::time::sleep(Duration::from_micros(micros as u64)).await;
        }
    }
}

/// A clock that only moves when told to.
///
/// By default `sleep_micros` advances the clock by the slept amount and
/// returns at once, so a single caller observes the same timeline it would
/// with a real clock. A frozen clock records sleeps without advancing, which
/// keeps concurrent callers on one instant.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
    advance_on_sleep: bool,
    sleeps: Mutex<Vec<i64>>,
}

impl ManualClock {
    pub fn new(start_micros: i64) -> Self {
        Self {
            now: AtomicI64::new(start_micros),
            advance_on_sleep: true,
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// A clock whose sleeps do not move time.
    pub fn frozen(start_micros: i64) -> Self {
        Self {
            advance_on_sleep: false,
            ..Self::new(start_micros)
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_micros() as i64, Ordering::SeqCst);
    }

    pub fn set_micros(&self, micros: i64) {
        self.now.store(micros, Ordering::SeqCst);
    }

    /// Every positive sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<i64> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep_micros(&self, micros: i64) {
        if micros <= 0 {
            return;
        }
        self.sleeps.lock().push(micros);
        if self.advance_on_sleep {
            self.now.fetch_add(micros, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_epoch_micros() {
        let now = SystemClock.now_micros();
        // Later than 2020-01-01 in microseconds.
        assert!(now > 1_577_836_800_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_sleep_runs_to_completion() {
        let start = tokio::time::Instant::now();
        SystemClock.sleep_micros(250_000).await;
        assert!(start.elapsed() >= Duration::from_millis(250));

        let start = tokio::time::Instant::now();
        SystemClock.sleep_micros(-5).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_manual_clock_advances_on_sleep() {
        let clock = ManualClock::new(1_000);
        clock.sleep_micros(500).await;
        clock.sleep_micros(0).await;
        assert_eq!(clock.now_micros(), 1_500);
        assert_eq!(clock.sleeps(), vec![500]);

        clock.advance(Duration::from_millis(1));
        assert_eq!(clock.now_micros(), 2_500);
    }

    #[tokio::test]
    async fn test_frozen_clock_records_without_advancing() {
        let clock = ManualClock::frozen(42);
        clock.sleep_micros(10).await;
        assert_eq!(clock.now_micros(), 42);
        assert_eq!(clock.sleeps(), vec![10]);
    }
}
