//! Ordered, mutable segment index for one representation.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::SegmentReference;

/// An index shared between a stream (fetch loop) and the coordinator
/// (track listing, play-window computation). Mutation happens under the
/// lock and is visible atomically.
pub type SharedIndex = Arc<Mutex<SegmentIndex>>;

/// Tolerance for comparing reference start times during merges.
const TIME_EPS: f64 = 1e-6;

/// Ordered sequence of [`SegmentReference`]s.
///
/// Invariants: references sorted by `start_time`, adjacent references may
/// touch but not overlap, and live append/evict keeps the index contiguous.
#[derive(Clone, Debug, Default)]
pub struct SegmentIndex {
    refs: Vec<SegmentReference>,
}

impl SegmentIndex {
    #[must_use]
    pub fn new(mut refs: Vec<SegmentReference>) -> Self {
        refs.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        Self { refs }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<&SegmentReference> {
        self.refs.first()
    }

    #[must_use]
    pub fn last(&self) -> Option<&SegmentReference> {
        self.refs.last()
    }

    #[must_use]
    pub fn references(&self) -> &[SegmentReference] {
        &self.refs
    }

    /// Look up a reference by its monotonic per-stream index.
    #[must_use]
    pub fn by_index(&self, index: u64) -> Option<&SegmentReference> {
        self.refs
            .binary_search_by_key(&index, |r| r.index)
            .ok()
            .map(|i| &self.refs[i])
    }

    /// The reference containing `t`, or the nearest following reference when
    /// `t` falls in a gap; `None` beyond the tail (or on an empty index).
    #[must_use]
    pub fn find(&self, t: f64) -> Option<&SegmentReference> {
        let after = self.refs.partition_point(|r| r.start_time <= t);
        if after > 0 {
            let candidate = &self.refs[after - 1];
            if candidate.contains(t) {
                return Some(candidate);
            }
        }
        // Gap between references, or t before the head.
        self.refs.get(after)
    }

    /// Shift every reference by `delta` seconds. Callers apply this exactly
    /// once per index.
    pub fn correct(&mut self, delta: f64) {
        for r in &mut self.refs {
            r.start_time += delta;
            if let Some(end) = r.end_time.as_mut() {
                *end += delta;
            }
        }
    }

    /// Replace the tail of this index with `other`, starting at the first
    /// existing reference whose start time is at or past `other`'s head.
    /// Used by live updates.
    pub fn merge(&mut self, other: SegmentIndex) {
        let Some(head) = other.refs.first() else {
            return;
        };
        let cut = self
            .refs
            .partition_point(|r| r.start_time < head.start_time - TIME_EPS);
        self.refs.truncate(cut);
        self.refs.extend(other.refs);
    }

    /// Append a reference at the tail, closing a trailing open-ended
    /// reference if the newcomer starts at or after it.
    pub fn append(&mut self, reference: SegmentReference) {
        if let Some(last) = self.refs.last_mut() {
            if last.end_time.is_none() {
                last.end_time = Some(reference.start_time);
            }
            debug_assert!(reference.start_time >= last.start_time);
        }
        self.refs.push(reference);
    }

    /// Drop references that end at or before `threshold`.
    pub fn evict(&mut self, threshold: f64) {
        self.refs
            .retain(|r| r.end_time.map_or(true, |end| end > threshold));
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use url::Url;

    use super::*;

    fn seg(index: u64, start: f64, end: Option<f64>) -> SegmentReference {
        SegmentReference {
            index,
            start_time: start,
            end_time: end,
            url: Url::parse(&format!("http://example.com/seg_{index}.m4s")).unwrap(),
            byte_range: None,
        }
    }

    fn index_10x6() -> SegmentIndex {
        SegmentIndex::new(
            (0..10)
                .map(|i| seg(i, i as f64 * 6.0, Some((i + 1) as f64 * 6.0)))
                .collect(),
        )
    }

    #[test]
    fn find_on_empty_returns_none() {
        let index = SegmentIndex::default();
        assert!(index.find(0.0).is_none());
        assert!(index.first().is_none());
        assert!(index.last().is_none());
    }

    #[rstest]
    #[case::head(0.0, Some(0))]
    #[case::inside(7.5, Some(1))]
    #[case::boundary(6.0, Some(1))]
    #[case::last(59.9, Some(9))]
    #[case::beyond_tail(60.0, None)]
    fn find_by_time(#[case] t: f64, #[case] expect: Option<u64>) {
        let index = index_10x6();
        assert_eq!(index.find(t).map(|r| r.index), expect);
    }

    #[test]
    fn find_in_gap_returns_following() {
        let index = SegmentIndex::new(vec![
            seg(0, 0.0, Some(4.0)),
            seg(1, 6.0, Some(10.0)),
        ]);
        assert_eq!(index.find(5.0).unwrap().index, 1);
        // Before the head the first reference is the nearest following one.
        let late = SegmentIndex::new(vec![seg(3, 18.0, Some(24.0))]);
        assert_eq!(late.find(2.0).unwrap().index, 3);
    }

    #[test]
    fn trailing_open_reference_contains_everything_after_start() {
        let index = SegmentIndex::new(vec![seg(0, 0.0, Some(6.0)), seg(1, 6.0, None)]);
        assert_eq!(index.find(100.0).unwrap().index, 1);
    }

    #[test]
    fn correct_shifts_everything() {
        let mut index = index_10x6();
        index.correct(0.02);
        for (i, r) in index.references().iter().enumerate() {
            assert!((r.start_time - (i as f64 * 6.0 + 0.02)).abs() < 1e-9);
            assert!((r.end_time.unwrap() - ((i + 1) as f64 * 6.0 + 0.02)).abs() < 1e-9);
        }
        // Ordering invariant preserved.
        let starts: Vec<f64> = index.references().iter().map(|r| r.start_time).collect();
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn merge_replaces_tail() {
        let mut index = index_10x6();
        // Updated tail: refs 8 and 9 re-declared, plus a new ref 10.
        let update = SegmentIndex::new(vec![
            seg(8, 48.0, Some(54.0)),
            seg(9, 54.0, Some(60.0)),
            seg(10, 60.0, Some(66.0)),
        ]);
        index.merge(update);

        assert_eq!(index.len(), 11);
        assert_eq!(index.last().unwrap().index, 10);
        let starts: Vec<f64> = index.references().iter().map(|r| r.start_time).collect();
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn merge_past_tail_appends() {
        let mut index = SegmentIndex::new(vec![seg(0, 0.0, Some(6.0))]);
        index.merge(SegmentIndex::new(vec![seg(1, 6.0, Some(12.0))]));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn merge_empty_is_noop() {
        let mut index = index_10x6();
        index.merge(SegmentIndex::default());
        assert_eq!(index.len(), 10);
    }

    #[test]
    fn evict_drops_expired_head() {
        let mut index = index_10x6();
        index.evict(18.0);
        assert_eq!(index.len(), 7);
        assert_eq!(index.first().unwrap().index, 3);

        // Open-ended trailing references are never evicted.
        let mut live = SegmentIndex::new(vec![seg(0, 0.0, Some(6.0)), seg(1, 6.0, None)]);
        live.evict(100.0);
        assert_eq!(live.len(), 1);
        assert_eq!(live.first().unwrap().index, 1);
    }

    #[test]
    fn append_closes_open_tail() {
        let mut index = SegmentIndex::new(vec![seg(0, 0.0, None)]);
        index.append(seg(1, 6.0, None));
        assert_eq!(index.references()[0].end_time, Some(6.0));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn by_index_survives_eviction() {
        let mut index = index_10x6();
        index.evict(18.0);
        assert!(index.by_index(2).is_none());
        assert_eq!(index.by_index(5).unwrap().start_time, 30.0);
    }
}
