//! Lazy construction of segment indices from manifest entries.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use url::Url;

use crate::{
    error::{ManifestError, ManifestResult},
    index::{SegmentIndex, SharedIndex},
    model::SegmentReference,
};

/// Segment URL template with `$Number$` / `$Time$` substitution.
#[derive(Clone, Debug)]
pub struct UrlTemplate {
    pattern: String,
}

impl UrlTemplate {
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn instantiate(&self, number: u64, time: u64) -> ManifestResult<Url> {
        let raw = self
            .pattern
            .replace("$Number$", &number.to_string())
            .replace("$Time$", &time.to_string());
        Url::parse(&raw).map_err(|e| ManifestError::Template(format!("{raw}: {e}")))
    }
}

/// One `<S>` element of a segment timeline: `repeat + 1` segments of equal
/// duration starting at `start` (both in timescale ticks).
#[derive(Clone, Copy, Debug)]
pub struct TimelineEntry {
    pub start: u64,
    pub duration: u64,
    pub repeat: u32,
}

/// Live-edge parameters for a dynamic timeline source.
#[derive(Clone, Copy, Debug)]
pub struct LiveEdge {
    /// Wall-clock seconds at which the first segment became available.
    pub availability_start_wall: f64,
    /// Duration of segments produced past the declared timeline, in ticks.
    pub segment_duration: u64,
    /// Seconds a segment stays available once superseded.
    pub window: f64,
}

/// How a representation's segment index is obtained.
#[derive(Clone, Debug)]
pub enum IndexSourceKind {
    /// References provided directly by the manifest.
    Explicit { references: Vec<SegmentReference> },
    /// Fixed-duration template addressing: the whole period is covered by
    /// equal segments generated up front.
    TemplateDuration {
        template: UrlTemplate,
        start_number: u64,
        timescale: u64,
        /// Segment duration in timescale ticks.
        segment_duration: u64,
        period_start: f64,
        period_duration: f64,
    },
    /// Explicit timeline, optionally extended at the live edge as the wall
    /// clock advances.
    TemplateTimeline {
        template: UrlTemplate,
        start_number: u64,
        timescale: u64,
        period_start: f64,
        entries: Vec<TimelineEntry>,
        live: Option<LiveEdge>,
    },
}

#[derive(Debug, Default)]
struct CorrectionState {
    /// Correction requested before the index existed.
    pending: Option<f64>,
    /// Correction already applied, added to any references generated later.
    applied: f64,
    done: bool,
}

/// Lazily constructs and caches the [`SegmentIndex`] for one representation.
///
/// `create()` is idempotent: the first call materializes the index, later
/// calls return the same shared handle. Dynamic timeline sources grow their
/// cached index on [`SegmentIndexSource::refresh`].
#[derive(Debug)]
pub struct SegmentIndexSource {
    kind: IndexSourceKind,
    cache: OnceCell<SharedIndex>,
    correction: Mutex<CorrectionState>,
}

impl SegmentIndexSource {
    #[must_use]
    pub fn new(kind: IndexSourceKind) -> Self {
        Self {
            kind,
            cache: OnceCell::new(),
            correction: Mutex::new(CorrectionState::default()),
        }
    }

    /// Shorthand for an explicit reference list.
    #[must_use]
    pub fn explicit(references: Vec<SegmentReference>) -> Self {
        Self::new(IndexSourceKind::Explicit { references })
    }

    /// Materialize (or return the cached) segment index.
    pub async fn create(&self) -> ManifestResult<SharedIndex> {
        let shared = self
            .cache
            .get_or_try_init(|| async {
                let index = self.build()?;
                Ok::<_, ManifestError>(Arc::new(Mutex::new(index)))
            })
            .await?;

        let mut correction = self.correction.lock();
        if let Some(delta) = correction.pending.take() {
            shared.lock().correct(delta);
            correction.applied = delta;
            correction.done = true;
        }

        Ok(Arc::clone(shared))
    }

    /// The cached index, if `create()` has completed.
    #[must_use]
    pub fn cached(&self) -> Option<SharedIndex> {
        self.cache.get().map(Arc::clone)
    }

    /// Apply the global timestamp correction exactly once. If the index is
    /// not materialized yet, the shift is held back and applied at
    /// `create()` time.
    pub fn apply_correction(&self, delta: f64) {
        let mut correction = self.correction.lock();
        if correction.done {
            return;
        }
        match self.cached() {
            Some(index) => {
                index.lock().correct(delta);
                correction.applied = delta;
                correction.done = true;
            }
            None => correction.pending = Some(delta),
        }
    }

    /// Advance a dynamic timeline source to `now_wall` (wall-clock seconds):
    /// append references that became available and evict those that aged out
    /// of the availability window. No-op for static sources.
    pub fn refresh(&self, now_wall: f64) {
        let IndexSourceKind::TemplateTimeline {
            template,
            start_number,
            timescale,
            period_start,
            live: Some(live),
            ..
        } = &self.kind
        else {
            return;
        };
        let Some(shared) = self.cached() else {
            return;
        };

        let seg_secs = live.segment_duration as f64 / *timescale as f64;
        if seg_secs <= 0.0 {
            return;
        }
        let available = ((now_wall - live.availability_start_wall) / seg_secs).floor();
        if available < 0.0 {
            return;
        }
        let available = available as u64;

        let applied = self.correction.lock().applied;
        let mut index = shared.lock();
        let next = index.last().map_or(0, |r| r.index + 1);
        for i in next..available {
            let start = period_start + i as f64 * seg_secs + applied;
            let time_ticks = i * live.segment_duration;
            let Ok(url) = template.instantiate(start_number + i, time_ticks) else {
                tracing::warn!(number = start_number + i, "segment template failed, stopping refresh");
                break;
            };
            index.append(SegmentReference {
                index: i,
                start_time: start,
                end_time: Some(start + seg_secs),
                url,
                byte_range: None,
            });
        }

        let threshold = index.last().map(|r| r.start_time - live.window);
        if let Some(threshold) = threshold {
            index.evict(threshold);
        }
    }

    fn build(&self) -> ManifestResult<SegmentIndex> {
        match &self.kind {
            IndexSourceKind::Explicit { references } => {
                Ok(SegmentIndex::new(references.clone()))
            }
            IndexSourceKind::TemplateDuration {
                template,
                start_number,
                timescale,
                segment_duration,
                period_start,
                period_duration,
            } => {
                let seg_secs = *segment_duration as f64 / *timescale as f64;
                if seg_secs <= 0.0 {
                    return Err(ManifestError::Template(
                        "segment duration must be positive".into(),
                    ));
                }
                let count = (period_duration / seg_secs).ceil() as u64;
                let mut refs = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let start = period_start + i as f64 * seg_secs;
                    let end = (start + seg_secs).min(period_start + period_duration);
                    refs.push(SegmentReference {
                        index: i,
                        start_time: start,
                        end_time: Some(end),
                        url: template.instantiate(start_number + i, i * segment_duration)?,
                        byte_range: None,
                    });
                }
                Ok(SegmentIndex::new(refs))
            }
            IndexSourceKind::TemplateTimeline {
                template,
                start_number,
                timescale,
                period_start,
                entries,
                ..
            } => {
                let scale = *timescale as f64;
                let mut refs = Vec::new();
                let mut number = *start_number;
                for entry in entries {
                    for rep in 0..=entry.repeat as u64 {
                        let ticks = entry.start + rep * entry.duration;
                        let start = period_start + ticks as f64 / scale;
                        let end = start + entry.duration as f64 / scale;
                        refs.push(SegmentReference {
                            index: number - *start_number,
                            start_time: start,
                            end_time: Some(end),
                            url: template.instantiate(number, ticks)?,
                            byte_range: None,
                        });
                        number += 1;
                    }
                }
                Ok(SegmentIndex::new(refs))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> UrlTemplate {
        UrlTemplate::new("http://example.com/seg_$Number$.m4s")
    }

    #[tokio::test]
    async fn create_is_cached() {
        let source = SegmentIndexSource::explicit(vec![SegmentReference {
            index: 0,
            start_time: 0.0,
            end_time: Some(6.0),
            url: Url::parse("http://example.com/0.m4s").unwrap(),
            byte_range: None,
        }]);

        let a = source.create().await.unwrap();
        let b = source.create().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn duration_template_generates_ceil_count() {
        // 60s period, 7s segments -> 9 references, last one clipped.
        let source = SegmentIndexSource::new(IndexSourceKind::TemplateDuration {
            template: template(),
            start_number: 1,
            timescale: 1000,
            segment_duration: 7000,
            period_start: 0.0,
            period_duration: 60.0,
        });

        let index = source.create().await.unwrap();
        let index = index.lock();
        assert_eq!(index.len(), 9);
        assert_eq!(index.last().unwrap().end_time, Some(60.0));
        assert!(index
            .references()
            .first()
            .unwrap()
            .url
            .as_str()
            .ends_with("seg_1.m4s"));
    }

    #[tokio::test]
    async fn timeline_expands_repeats() {
        let source = SegmentIndexSource::new(IndexSourceKind::TemplateTimeline {
            template: template(),
            start_number: 0,
            timescale: 10,
            period_start: 0.0,
            entries: vec![
                TimelineEntry {
                    start: 0,
                    duration: 60,
                    repeat: 2,
                },
                TimelineEntry {
                    start: 180,
                    duration: 40,
                    repeat: 0,
                },
            ],
            live: None,
        });

        let index = source.create().await.unwrap();
        let index = index.lock();
        assert_eq!(index.len(), 4);
        assert_eq!(index.references()[2].start_time, 12.0);
        assert_eq!(index.last().unwrap().end_time, Some(22.0));
    }

    #[tokio::test]
    async fn dynamic_source_grows_and_ages_out() {
        let source = SegmentIndexSource::new(IndexSourceKind::TemplateTimeline {
            template: template(),
            start_number: 0,
            timescale: 1,
            period_start: 0.0,
            entries: vec![TimelineEntry {
                start: 0,
                duration: 6,
                repeat: 0,
            }],
            live: Some(LiveEdge {
                availability_start_wall: 1000.0,
                segment_duration: 6,
                window: 30.0,
            }),
        });

        let index = source.create().await.unwrap();
        assert_eq!(index.lock().len(), 1);

        // Five segments available after 30 wall seconds.
        source.refresh(1030.0);
        assert_eq!(index.lock().len(), 5);
        assert_eq!(index.lock().last().unwrap().index, 4);

        // Much later, the head has aged out of the window.
        source.refresh(1120.0);
        let head = index.lock().first().unwrap().index;
        assert!(head > 0, "expired head should be evicted, head={head}");
    }

    #[tokio::test]
    async fn correction_applies_once_now_or_at_create() {
        let refs = vec![SegmentReference {
            index: 0,
            start_time: 1.0,
            end_time: Some(7.0),
            url: Url::parse("http://example.com/0.m4s").unwrap(),
            byte_range: None,
        }];

        // Applied before create: held back, then applied.
        let source = SegmentIndexSource::explicit(refs.clone());
        source.apply_correction(0.02);
        let index = source.create().await.unwrap();
        assert!((index.lock().first().unwrap().start_time - 1.02).abs() < 1e-9);

        // A second application is ignored.
        source.apply_correction(0.02);
        assert!((index.lock().first().unwrap().start_time - 1.02).abs() < 1e-9);

        // Applied after create: immediate.
        let source = SegmentIndexSource::explicit(refs);
        let index = source.create().await.unwrap();
        source.apply_correction(-0.5);
        assert!((index.lock().first().unwrap().start_time - 0.5).abs() < 1e-9);
    }

    #[test]
    fn template_rejects_garbage() {
        let template = UrlTemplate::new("not a url $Number$");
        assert!(template.instantiate(1, 0).is_err());
    }
}
