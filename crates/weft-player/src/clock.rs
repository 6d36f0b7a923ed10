use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Time source injected into the coordinator and streams.
///
/// Monotonic time drives ABR hysteresis and timers; wall-clock time drives
/// live segment availability.
pub trait Clock: Send + Sync {
    fn monotonic(&self) -> Instant;
    /// Seconds since the Unix epoch.
    fn wall_secs(&self) -> f64;
}

/// Default clock. Monotonic time goes through the tokio clock so paused-time
/// tests stay deterministic.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn monotonic(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn wall_secs(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}
