use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock timestamps for the queue.
///
/// Segment ages and stats timestamps are tracked in milliseconds since the
/// UNIX epoch, matching the sample timestamps flowing through the relay.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current wall-clock time in milliseconds since the UNIX epoch.
    fn now_ms(&self) -> i64;
}

/// A clock backed by `std::time::SystemTime`.
///
/// The default implementation. Susceptible to NTP adjustments, but requires
/// no calibration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch");
        i64::try_from(timestamp.as_millis()).expect("system time exceeds timestamp range")
    }
}

/// A clock that uses the CPU's Time-Stamp Counter via the `quanta` crate.
///
/// Anchors to SystemTime once at initialization and then progresses by TSC
/// ticks, so it is monotonic and considerably cheaper to read under the
/// per-enqueue age accounting the queue performs.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall_ms: i64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        let start_wall_ms = SystemClock.now_ms();

        Self {
            clock,
            start_wall_ms,
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now_ms(&self) -> i64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ms + delta.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, QuantaClock, SystemClock};

    #[test]
    fn quanta_tracks_system_clock() {
        let system = SystemClock;
        let quanta = QuantaClock::new();
        let diff = (system.now_ms() - quanta.now_ms()).abs();
        // Both anchored to the same wall clock; allow generous slack for CI.
        assert!(diff < 5_000, "clock drift too large: {diff}ms");
    }
}
