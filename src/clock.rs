//! Time and cancellation for the polling loops.
//!
//! Drivers never call `std::thread::sleep` or `Instant::now` directly. They go
//! through a [`Clock`] so tests can run a multi-minute stabilization in
//! microseconds with a [`ManualClock`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock time with real, blocking sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock that only moves when told to.
///
/// `sleep` returns immediately after advancing the clock, so a poll loop with a
/// one second interval runs as fast as the test can execute it. Clones share
/// the same time, which lets a [`SimulatedTransport`](crate::sim::SimulatedTransport)
/// charge read timeouts against the driver's clock.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    elapsed_nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Total time advanced since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Cross-thread request to abandon a long-running poll loop.
///
/// Every driver owns one; hand a clone to another thread and call
/// [`cancel`](Self::cancel). The loop notices it between attempts and returns
/// [`InstrumentError::Cancelled`](crate::InstrumentError::Cancelled), which
/// consumes the request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Clear a pending request without acting on it.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub(crate) fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_sleep_advances_shared_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let start = clock.now();

        other.sleep(Duration::from_secs(3));

        assert_eq!(clock.now() - start, Duration::from_secs(3));
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_cancel_token_is_consumed_once() {
        let token = CancelToken::new();
        let remote = token.clone();
        assert!(!token.take());

        remote.cancel();
        assert!(token.is_cancelled());
        assert!(token.take());
        assert!(!token.take());
    }

    #[test]
    fn test_cancel_token_reset() {
        let token = CancelToken::new();
        token.cancel();
        token.reset();
        assert!(!token.is_cancelled());
    }
}
