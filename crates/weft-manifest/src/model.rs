use std::sync::Arc;

use url::Url;
use weft_core::{ContentType, SetId, TrackId};
use weft_net::RangeSpec;

use crate::source::SegmentIndexSource;

/// Whether the presentation is fixed or expected to be refetched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentationKind {
    Static,
    Dynamic,
}

/// Root description of streaming content, already parsed upstream.
#[derive(Clone, Debug)]
pub struct Manifest {
    pub kind: PresentationKind,
    /// Seconds of buffer a stream needs before playback can resume.
    pub min_buffer_time: f64,
    /// Where to refetch the manifest from; dynamic only.
    pub update_url: Option<Url>,
    /// Suggested refetch interval in seconds; dynamic only.
    pub update_period: Option<f64>,
    /// Presentation time before which segments are no longer available;
    /// dynamic only.
    pub availability_start: Option<f64>,
    pub periods: Vec<Period>,
}

impl Manifest {
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.kind == PresentationKind::Dynamic
    }

    /// Highest assigned ids, for allocating fresh ones during updates.
    #[must_use]
    pub fn max_ids(&self) -> (u32, u32) {
        let mut max_set = 0;
        let mut max_track = 0;
        for period in &self.periods {
            for set in &period.stream_sets {
                max_set = max_set.max(set.id.0 + 1);
                for info in &set.streams {
                    max_track = max_track.max(info.id.0 + 1);
                }
            }
        }
        (max_set, max_track)
    }
}

#[derive(Clone, Debug)]
pub struct Period {
    /// Presentation-time start in seconds.
    pub start: f64,
    /// Required for static presentations.
    pub duration: Option<f64>,
    pub stream_sets: Vec<StreamSet>,
}

/// Opaque DRM descriptor; negotiation happens outside the core.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrmScheme {
    pub scheme_id: String,
}

/// Group of interchangeable representations of one component
/// (a DASH adaptation set).
#[derive(Clone, Debug)]
pub struct StreamSet {
    pub id: SetId,
    pub content_type: ContentType,
    /// BCP-47 tag, when declared.
    pub lang: Option<String>,
    pub main: bool,
    pub drm_schemes: Vec<DrmScheme>,
    pub streams: Vec<StreamInfo>,
}

/// Initialization bytes of a representation, when the container needs them.
#[derive(Clone, Debug)]
pub struct InitSource {
    pub url: Url,
    pub byte_range: Option<RangeSpec>,
}

/// One representation: a single encoding of one component.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub id: TrackId,
    pub full_mime_type: String,
    pub bandwidth_bps: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Signed shift between media time and presentation time, in seconds.
    pub timestamp_offset: f64,
    pub index_source: Arc<SegmentIndexSource>,
    pub init_source: Option<InitSource>,
    /// Cleared by restrictions; a disabled representation is never selected,
    /// presented, or fetched.
    pub enabled: bool,
}

/// Locates one media segment: url, optional byte range, time range.
#[derive(Clone, Debug)]
pub struct SegmentReference {
    /// Monotonic position within the representation, stable across eviction.
    pub index: u64,
    pub start_time: f64,
    /// `None` only for the trailing reference of a live stream.
    pub end_time: Option<f64>,
    pub url: Url,
    pub byte_range: Option<RangeSpec>,
}

impl SegmentReference {
    /// Whether `t` falls inside this reference's time range.
    #[must_use]
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start_time && self.end_time.map_or(true, |end| t < end)
    }
}
