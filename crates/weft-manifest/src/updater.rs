//! Reconciliation of a freshly fetched live manifest into the current one.

use weft_core::{mime::basic_mime, SetId, TrackId};

use crate::{
    error::{ManifestError, ManifestResult},
    model::{Manifest, Period, PresentationKind, StreamInfo, StreamSet},
};

/// Periods whose starts differ by less than this are the same period.
const PERIOD_EPS: f64 = 0.5;

/// Merge `new` into `old` and return the representations that disappeared.
///
/// Periods are matched by start, stream sets by identity signature
/// (content type, language, DRM schemes, basic MIME type), representations
/// by their encoding signature. Matched representations get their segment
/// references merged and pruned against the new availability start; brand
/// new sets and representations are adopted with freshly allocated ids.
///
/// Fails with [`ManifestError::Incompatible`] when the presentation kind
/// changed or an existing period has no counterpart in the update.
pub async fn merge_update(old: &mut Manifest, new: Manifest) -> ManifestResult<Vec<StreamInfo>> {
    if old.kind != PresentationKind::Dynamic || new.kind != PresentationKind::Dynamic {
        return Err(ManifestError::Incompatible(
            "presentation kind changed".into(),
        ));
    }

    old.min_buffer_time = new.min_buffer_time;
    old.update_period = new.update_period;
    if new.update_url.is_some() {
        old.update_url = new.update_url;
    }
    old.availability_start = new.availability_start;

    let (mut next_set, mut next_track) = old.max_ids();
    let availability = old.availability_start;
    let mut removed = Vec::new();
    let mut new_periods = new.periods;

    for old_period in &mut old.periods {
        let pos = new_periods
            .iter()
            .position(|p| (p.start - old_period.start).abs() < PERIOD_EPS);
        let Some(pos) = pos else {
            return Err(ManifestError::Incompatible(format!(
                "no period matching start {}",
                old_period.start
            )));
        };
        let new_period = new_periods.remove(pos);
        merge_period(
            old_period,
            new_period,
            availability,
            &mut next_set,
            &mut next_track,
            &mut removed,
        )
        .await?;
    }

    // Periods that appeared in the update are adopted wholesale.
    for mut period in new_periods {
        for set in &mut period.stream_sets {
            set.id = SetId(next_set);
            next_set += 1;
            for info in &mut set.streams {
                info.id = TrackId(next_track);
                next_track += 1;
            }
        }
        tracing::debug!(start = period.start, "adopting new period from update");
        old.periods.push(period);
    }

    Ok(removed)
}

async fn merge_period(
    old: &mut Period,
    new: Period,
    availability: Option<f64>,
    next_set: &mut u32,
    next_track: &mut u32,
    removed: &mut Vec<StreamInfo>,
) -> ManifestResult<()> {
    old.duration = new.duration;

    let mut new_sets = new.stream_sets;
    let mut dropped_sets = Vec::new();

    for (set_pos, old_set) in old.stream_sets.iter_mut().enumerate() {
        let matched = new_sets
            .iter()
            .position(|candidate| same_set(old_set, candidate));
        let Some(matched) = matched else {
            dropped_sets.push(set_pos);
            continue;
        };
        let mut new_set = new_sets.remove(matched);
        merge_set(old_set, &mut new_set, availability, next_track, removed).await?;
    }

    // Sets present before but absent from the update: every representation
    // in them is gone.
    for pos in dropped_sets.iter().rev() {
        let set = old.stream_sets.remove(*pos);
        tracing::debug!(set = %set.id, "stream set removed by update");
        removed.extend(set.streams);
    }

    // Sets that appeared in the update.
    for mut set in new_sets {
        set.id = SetId(*next_set);
        *next_set += 1;
        for info in &mut set.streams {
            info.id = TrackId(*next_track);
            *next_track += 1;
        }
        old.stream_sets.push(set);
    }

    Ok(())
}

async fn merge_set(
    old: &mut StreamSet,
    new: &mut StreamSet,
    availability: Option<f64>,
    next_track: &mut u32,
    removed: &mut Vec<StreamInfo>,
) -> ManifestResult<()> {
    let mut dropped = Vec::new();

    for (pos, old_info) in old.streams.iter_mut().enumerate() {
        let matched = new
            .streams
            .iter()
            .position(|candidate| same_stream(old_info, candidate));
        let Some(matched) = matched else {
            dropped.push(pos);
            continue;
        };
        let new_info = new.streams.remove(matched);

        match old_info.index_source.cached() {
            Some(shared) => {
                // Splice the refreshed references into the live index.
                let fresh = new_info.index_source.create().await?;
                let snapshot = fresh.lock().clone();
                let mut index = shared.lock();
                index.merge(snapshot);
                if let Some(threshold) = availability {
                    index.evict(threshold);
                }
            }
            // Index never materialized; the new source supersedes it.
            None => old_info.index_source = new_info.index_source,
        }
    }

    for pos in dropped.iter().rev() {
        let info = old.streams.remove(*pos);
        tracing::debug!(track = %info.id, "representation removed by update");
        removed.push(info);
    }

    for mut info in new.streams.drain(..) {
        info.id = TrackId(*next_track);
        *next_track += 1;
        old.streams.push(info);
    }

    Ok(())
}

fn same_set(a: &StreamSet, b: &StreamSet) -> bool {
    let mime = |set: &StreamSet| {
        set.streams
            .first()
            .and_then(|s| basic_mime(&s.full_mime_type))
    };
    let drm = |set: &StreamSet| {
        let mut schemes = set.drm_schemes.clone();
        schemes.sort();
        schemes
    };
    a.content_type == b.content_type && a.lang == b.lang && drm(a) == drm(b) && mime(a) == mime(b)
}

fn same_stream(a: &StreamInfo, b: &StreamInfo) -> bool {
    a.full_mime_type == b.full_mime_type
        && a.bandwidth_bps == b.bandwidth_bps
        && a.width == b.width
        && a.height == b.height
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use url::Url;
    use weft_core::ContentType;

    use super::*;
    use crate::{model::SegmentReference, source::SegmentIndexSource};

    fn seg(index: u64, start: f64) -> SegmentReference {
        SegmentReference {
            index,
            start_time: start,
            end_time: Some(start + 6.0),
            url: Url::parse(&format!("http://example.com/{index}.m4s")).unwrap(),
            byte_range: None,
        }
    }

    fn info(bandwidth: u64, refs: Vec<SegmentReference>) -> StreamInfo {
        StreamInfo {
            id: TrackId(0),
            full_mime_type: "video/mp4; codecs=\"avc1.4d401f\"".into(),
            bandwidth_bps: bandwidth,
            width: None,
            height: None,
            timestamp_offset: 0.0,
            index_source: Arc::new(SegmentIndexSource::explicit(refs)),
            init_source: None,
            enabled: true,
        }
    }

    fn live_manifest(streams: Vec<StreamInfo>) -> Manifest {
        let mut next = 0u32;
        let mut sets = vec![StreamSet {
            id: SetId(0),
            content_type: ContentType::Video,
            lang: None,
            main: true,
            drm_schemes: Vec::new(),
            streams,
        }];
        for set in &mut sets {
            for info in &mut set.streams {
                info.id = TrackId(next);
                next += 1;
            }
        }
        Manifest {
            kind: PresentationKind::Dynamic,
            min_buffer_time: 2.0,
            update_url: Some(Url::parse("http://example.com/live.mpd").unwrap()),
            update_period: Some(10.0),
            availability_start: None,
            periods: vec![Period {
                start: 0.0,
                duration: None,
                stream_sets: sets,
            }],
        }
    }

    #[tokio::test]
    async fn kind_change_is_incompatible() {
        let mut old = live_manifest(vec![info(1_000_000, vec![seg(0, 0.0)])]);
        let mut new = live_manifest(vec![info(1_000_000, vec![seg(0, 0.0)])]);
        new.kind = PresentationKind::Static;

        let err = merge_update(&mut old, new).await.unwrap_err();
        assert!(matches!(err, ManifestError::Incompatible(_)));
    }

    #[tokio::test]
    async fn period_misalignment_is_incompatible() {
        let mut old = live_manifest(vec![info(1_000_000, vec![seg(0, 0.0)])]);
        let mut new = live_manifest(vec![info(1_000_000, vec![seg(0, 0.0)])]);
        new.periods[0].start = 100.0;

        let err = merge_update(&mut old, new).await.unwrap_err();
        assert!(matches!(err, ManifestError::Incompatible(_)));
    }

    #[tokio::test]
    async fn matched_stream_gets_new_references_merged() {
        let mut old = live_manifest(vec![info(
            1_000_000,
            vec![seg(0, 0.0), seg(1, 6.0)],
        )]);
        // Materialize the live index first, as the coordinator would.
        let shared = old.periods[0].stream_sets[0].streams[0]
            .index_source
            .create()
            .await
            .unwrap();

        let mut new = live_manifest(vec![info(
            1_000_000,
            vec![seg(1, 6.0), seg(2, 12.0), seg(3, 18.0)],
        )]);
        new.availability_start = Some(6.0);

        let removed = merge_update(&mut old, new).await.unwrap();
        assert!(removed.is_empty());

        let index = shared.lock();
        // Ref 0 pruned by availability, refs 1..=3 present.
        assert_eq!(index.first().unwrap().index, 1);
        assert_eq!(index.last().unwrap().index, 3);
    }

    #[tokio::test]
    async fn vanished_representation_is_returned() {
        let mut old = live_manifest(vec![
            info(1_000_000, vec![seg(0, 0.0)]),
            info(3_000_000, vec![seg(0, 0.0)]),
        ]);
        let new = live_manifest(vec![info(1_000_000, vec![seg(0, 0.0)])]);

        let removed = merge_update(&mut old, new).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].bandwidth_bps, 3_000_000);
        assert_eq!(old.periods[0].stream_sets[0].streams.len(), 1);
    }

    #[tokio::test]
    async fn new_representation_gets_fresh_id() {
        let mut old = live_manifest(vec![info(1_000_000, vec![seg(0, 0.0)])]);
        let new = live_manifest(vec![
            info(1_000_000, vec![seg(0, 0.0)]),
            info(3_000_000, vec![seg(0, 0.0)]),
        ]);

        let removed = merge_update(&mut old, new).await.unwrap();
        assert!(removed.is_empty());

        let streams = &old.periods[0].stream_sets[0].streams;
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].id, TrackId(0));
        // Allocated past the previous maximum.
        assert_eq!(streams[1].id, TrackId(1));
    }

    #[tokio::test]
    async fn appended_period_is_adopted() {
        let mut old = live_manifest(vec![info(1_000_000, vec![seg(0, 0.0)])]);
        let mut new = live_manifest(vec![info(1_000_000, vec![seg(0, 0.0)])]);
        new.periods.push(Period {
            start: 60.0,
            duration: None,
            stream_sets: vec![StreamSet {
                id: SetId(0),
                content_type: ContentType::Video,
                lang: None,
                main: false,
                drm_schemes: Vec::new(),
                streams: vec![info(2_000_000, vec![seg(0, 60.0)])],
            }],
        });

        merge_update(&mut old, new).await.unwrap();
        assert_eq!(old.periods.len(), 2);
        assert_eq!(old.periods[1].stream_sets[0].id, SetId(1));
    }
}
