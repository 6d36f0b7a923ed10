//! Play-window computation: the mutually available time range across the
//! currently selected segment indices.

use weft_manifest::{PresentationKind, SharedIndex};

/// Time range in which every active stream has data.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlayWindow {
    pub start: f64,
    pub end: f64,
}

/// Compute the common play window, or `None` when any index is empty or the
/// ranges are disjoint.
///
/// For live presentations the end is pulled back by `min_buffer_time` from
/// the newest segment so a stream never starts at an edge it cannot buffer
/// past. For static presentations an index with an open-ended tail falls
/// back to the period duration.
pub(crate) fn compute_play_window(
    indices: &[SharedIndex],
    kind: PresentationKind,
    min_buffer_time: f64,
    period_duration: Option<f64>,
) -> Option<PlayWindow> {
    if indices.is_empty() {
        return None;
    }

    let mut start = f64::NEG_INFINITY;
    let mut end = f64::INFINITY;

    for shared in indices {
        let index = shared.lock();
        let (first, last) = match (index.first(), index.last()) {
            (Some(f), Some(l)) => (f.clone(), l.clone()),
            _ => return None,
        };

        start = start.max(first.start_time);
        end = end.min(match kind {
            PresentationKind::Dynamic => (last.start_time - min_buffer_time).max(0.0),
            PresentationKind::Static => last.end_time.unwrap_or(f64::INFINITY),
        });
    }

    if end.is_infinite() {
        end = period_duration?;
    }

    if start > end {
        tracing::warn!(start, end, "selected indices have disjoint play windows");
        return None;
    }
    Some(PlayWindow { start, end })
}
