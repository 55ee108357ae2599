use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use std::time::Instant;

/// Source of monotonic time for everything that measures segment durations.
///
/// Production code uses [`MonotonicClock`]; tests drive a [`ManualClock`] so
/// that reported means are exact.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;

    fn elapsed_since(&self, mark: Duration) -> Duration {
        self.now().saturating_sub(mark)
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    pub fn set(&self, at: Duration) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

/// Returns the duration since the Unix epoch for the current instant.
pub fn duration_since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Milliseconds since the Unix epoch.
pub fn unix_timestamp_ms() -> u64 {
    duration_since_epoch().as_millis().min(u64::MAX as u128) as u64
}

/// Duration expressed as fractional milliseconds, the unit reports are printed in.
pub fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.advance_ms(5);
        let mark = clock.now();
        clock.advance(Duration::from_micros(250));
        assert_eq!(clock.elapsed_since(mark), Duration::from_micros(250));
    }

    #[test]
    fn manual_clock_clones_share_state() {
        let clock = ManualClock::new();
        let other = clock.clone();
        other.advance_ms(3);
        assert_eq!(clock.now(), Duration::from_millis(3));
    }

    #[test]
    fn monotonic_clock_is_non_decreasing() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn millis_conversion() {
        assert_eq!(as_millis_f64(Duration::from_micros(1500)), 1.5);
        assert!(unix_timestamp_ms() > 1_600_000_000_000);
    }
}
