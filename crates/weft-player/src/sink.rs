//! The media sink consumed by the core: an append-only byte buffer per
//! track with a shared playhead, modelled on a media-source style surface.
//!
//! The sink parses appended containers itself; the core only observes the
//! resulting buffered ranges (which is how the timestamp correction is
//! measured).

use std::ops::Range;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// Identifies one per-type append channel inside the sink.
pub type TrackHandle = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkReadyState {
    Closed,
    Open,
    Ended,
}

/// Events observed from the sink.
#[derive(Clone, Copy, Debug)]
pub enum SinkEvent {
    Open,
    Seeking { position: f64 },
    TimeUpdate { position: f64 },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("append rejected: {0}")]
    Append(String),
    #[error("unknown track handle")]
    InvalidHandle,
    #[error("sink is closed")]
    Closed,
}

/// Append-only media sink shared by every stream. The coordinator enforces
/// one track per content type; each stream owns its own append channel.
pub trait MediaSink: Send + Sync {
    fn add_track(&self, mime: &str) -> Result<TrackHandle, SinkError>;

    fn append(&self, track: TrackHandle, bytes: Bytes) -> Result<(), SinkError>;

    /// Remove buffered media intersecting `range` (presentation seconds).
    fn evict(&self, track: TrackHandle, range: Range<f64>) -> Result<(), SinkError>;

    fn set_timestamp_offset(&self, track: TrackHandle, offset: f64) -> Result<(), SinkError>;

    /// Continuous buffered range of a track, when anything is buffered.
    fn buffered(&self, track: TrackHandle) -> Option<(f64, f64)>;

    fn set_duration(&self, duration: f64);

    fn duration(&self) -> Option<f64>;

    fn seek(&self, position: f64);

    /// Current playhead in presentation seconds.
    fn position(&self) -> f64;

    fn set_playback_rate(&self, rate: f64);

    fn playback_rate(&self) -> f64;

    /// Signal that every stream has appended its final segment.
    fn end_of_stream(&self);

    fn ready_state(&self) -> SinkReadyState;

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent>;
}
