#![forbid(unsafe_code)]

//! Manifest layer of the weft streaming core.
//!
//! Holds the processed manifest model (periods, stream sets,
//! representations), per-representation segment indices with the mutation
//! operations live playback needs (correction, merge, eviction), the lazy
//! [`SegmentIndexSource`] that materializes them, and the two manifest-level
//! transformations: [`process_manifest`] normalizing a freshly parsed
//! manifest and [`merge_update`] reconciling a live refetch.
//!
//! Parsing itself (XML/JSON to [`Manifest`]) happens upstream and is not
//! this crate's concern.

mod error;
mod index;
mod language;
mod model;
mod processor;
mod source;
mod updater;

pub use error::{ManifestError, ManifestResult};
pub use index::{SegmentIndex, SharedIndex};
pub use language::{match_level, select_preferred, LanguageMatch};
pub use model::{
    DrmScheme, InitSource, Manifest, Period, PresentationKind, SegmentReference, StreamInfo,
    StreamSet,
};
pub use processor::process_manifest;
pub use source::{IndexSourceKind, LiveEdge, SegmentIndexSource, TimelineEntry, UrlTemplate};
pub use updater::merge_update;
