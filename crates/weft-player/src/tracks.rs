use weft_core::{ContentType, SetId, TrackId};
use weft_manifest::StreamSet;

/// Materialized view over one selectable representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    pub id: TrackId,
    pub set: SetId,
    pub content_type: ContentType,
    pub lang: Option<String>,
    pub bandwidth_bps: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Whether this representation is currently feeding its stream.
    pub active: bool,
}

/// Flatten the eligible sets of one type into track views, keeping only
/// enabled representations and flagging the active one.
pub(crate) fn list_tracks(sets: &[&StreamSet], active: Option<TrackId>) -> Vec<Track> {
    sets.iter()
        .flat_map(|set| {
            set.streams.iter().filter(|info| info.enabled).map(|info| Track {
                id: info.id,
                set: set.id,
                content_type: set.content_type,
                lang: set.lang.clone(),
                bandwidth_bps: info.bandwidth_bps,
                width: info.width,
                height: info.height,
                active: active == Some(info.id),
            })
        })
        .collect()
}
