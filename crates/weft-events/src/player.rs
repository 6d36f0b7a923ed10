use weft_abr::AbrReason;
use weft_core::{ContentType, TrackId};

/// Events emitted during playback coordination.
#[derive(Clone, Debug)]
pub enum PlayerEvent {
    /// User-visible failure.
    Error { kind: String, message: String },
    /// A stream appended its first segment; carries the measured offset
    /// between container time and index time.
    Started {
        content_type: ContentType,
        timestamp_correction: f64,
    },
    /// A stream reached the end of a static presentation.
    Ended { content_type: ContentType },
    /// An adaptive or requested representation switch completed.
    Adaptation {
        content_type: ContentType,
        from: TrackId,
        to: TrackId,
        reason: AbrReason,
    },
    /// Track listings changed (selection or restrictions).
    TracksChanged,
}
