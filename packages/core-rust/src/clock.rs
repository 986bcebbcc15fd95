//! Time sources for stage tracing and deadline enforcement.
//!
//! Every timestamp recorded by a [`StageTrace`](crate::StageTrace) comes from a
//! [`NanoClock`]. Monotonic readings are nanoseconds since an arbitrary process
//! anchor and are never `0`, because `0` is reserved for "instant not reached".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Abstraction over the process clocks for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a
/// [`ManualClock`]. The default implementation is [`MonotonicClock`].
pub trait NanoClock: Send + Sync {
    /// Monotonic nanoseconds. Must be strictly positive.
    fn nano_time(&self) -> u64;

    /// Wall-clock milliseconds since Unix epoch.
    fn millis_time(&self) -> u64;
}

/// Default clock backed by `std::time::Instant` and `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

fn process_anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

impl NanoClock for MonotonicClock {
    fn nano_time(&self) -> u64 {
        // +1 keeps the first reading away from the "unset" sentinel.
        #[allow(clippy::cast_possible_truncation)]
        let nanos = process_anchor().elapsed().as_nanos() as u64;
        nanos + 1
    }

    fn millis_time(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Manually advanced clock for tests.
///
/// Both readings move together when [`ManualClock::advance`] is called.
#[derive(Debug)]
pub struct ManualClock {
    nanos: AtomicU64,
    millis: AtomicU64,
}

impl ManualClock {
    /// Creates a clock at the given monotonic nanos and wall-clock millis.
    ///
    /// A `nanos` of `0` is bumped to `1`.
    #[must_use]
    pub fn new(nanos: u64, millis: u64) -> Self {
        Self {
            nanos: AtomicU64::new(nanos.max(1)),
            millis: AtomicU64::new(millis),
        }
    }

    /// Moves both readings forward.
    pub fn advance(&self, by: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        let nanos = by.as_nanos() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let millis = by.as_millis() as u64;
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_000, 1_700_000_000_000)
    }
}

impl NanoClock for ManualClock {
    fn nano_time(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }

    fn millis_time(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_returns_zero() {
        let clock = MonotonicClock;
        let a = clock.nano_time();
        let b = clock.nano_time();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances_both_readings() {
        let clock = ManualClock::new(10, 500);
        clock.advance(Duration::from_millis(3));
        assert_eq!(clock.nano_time(), 10 + 3_000_000);
        assert_eq!(clock.millis_time(), 503);
    }

    #[test]
    fn manual_clock_bumps_zero_nanos() {
        let clock = ManualClock::new(0, 0);
        assert_eq!(clock.nano_time(), 1);
    }
}
