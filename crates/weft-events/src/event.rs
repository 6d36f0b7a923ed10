use crate::PlayerEvent;

/// Unified event for the full streaming pipeline.
///
/// Hierarchical: each subsystem has its own variant with a sub-enum.
#[derive(Clone, Debug)]
pub enum Event {
    /// Playback/coordination event.
    Player(PlayerEvent),
    /// Bandwidth-estimation event.
    Abr(AbrEvent),
}

/// Events from the bandwidth estimation side.
#[derive(Clone, Debug)]
pub enum AbrEvent {
    /// New throughput estimate after an observed fetch.
    Bandwidth { bits_per_second: u64 },
}

impl From<PlayerEvent> for Event {
    fn from(e: PlayerEvent) -> Self {
        Self::Player(e)
    }
}

impl From<AbrEvent> for Event {
    fn from(e: AbrEvent) -> Self {
        Self::Abr(e)
    }
}
