#![forbid(unsafe_code)]

//! Playback coordination core: per-type segment-fetching streams driven by
//! a [`StreamCoordinator`] against an abstract media sink.
//!
//! The coordinator owns the processed manifest, selects a compatible subset
//! of stream sets per content type, computes the common play window, and
//! runs one [`StreamPhase`] state machine per type. Fetching goes through
//! the `weft-net` [`weft_net::Fetcher`] seam, bitrate decisions through
//! `weft-abr`, and everything observable is published on the `weft-events`
//! bus.

mod clock;
mod coordinator;
mod error;
pub mod fixture;
mod params;
mod sink;
mod stream;
mod tracks;
mod window;

pub use clock::{Clock, SystemClock};
pub use coordinator::{ManifestSource, Restrictions, StreamCoordinator};
pub use error::{PlayerError, PlayerResult};
pub use params::{PlayerParams, TypeSupport};
pub use sink::{MediaSink, SinkError, SinkEvent, SinkReadyState, TrackHandle};
pub use stream::StreamPhase;
pub use tracks::Track;
pub use window::PlayWindow;
