use std::time::Duration;

use weft_core::TrackId;

/// One observed fetch, as reported by a stream after a segment download.
#[derive(Clone, Copy, Debug)]
pub struct ThroughputSample {
    pub bytes: u64,
    pub duration: Duration,
}

/// A representation the manager may pick: identity plus declared bitrate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub track: TrackId,
    pub bandwidth_bps: u64,
}

/// ABR tuning knobs.
#[derive(Clone, Debug)]
pub struct AbrOptions {
    /// Fraction of the estimate considered actually usable when picking a
    /// representation.
    pub bandwidth_safety_factor: f64,
    /// Upswitch requires the estimate to exceed the target bitrate by this
    /// ratio...
    pub up_hysteresis_ratio: f64,
    /// ...sustained for at least this long.
    pub up_sustain: Duration,
    /// Downswitch fires immediately once the estimate drops below the
    /// current bitrate times this ratio.
    pub down_hysteresis_ratio: f64,
}

impl Default for AbrOptions {
    fn default() -> Self {
        Self {
            bandwidth_safety_factor: 0.8,
            up_hysteresis_ratio: 1.15,
            up_sustain: Duration::from_secs(5),
            down_hysteresis_ratio: 0.8,
        }
    }
}
