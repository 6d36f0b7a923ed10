//! Normalization of a freshly parsed manifest.

use weft_core::{mime::basic_mime, BasicMime, SetId, TrackId};

use crate::{
    error::{ManifestError, ManifestResult},
    model::{Manifest, StreamSet},
};

/// Normalize a parsed manifest in place:
///
/// 1. assign dense, manifest-scoped ids to every set and representation;
/// 2. drop representations whose full MIME type the media sink rejects;
/// 3. drop stream sets left empty;
/// 4. per period and content type, keep the maximal compatibility group:
///    for video exactly one set, for audio every MIME-compatible set, for
///    text all sets.
///
/// Fails with [`ManifestError::Empty`] when nothing playable remains.
pub fn process_manifest(
    manifest: &mut Manifest,
    supports: &dyn Fn(&str) -> bool,
) -> ManifestResult<()> {
    let mut next_set = 0u32;
    let mut next_track = 0u32;

    for period in &mut manifest.periods {
        for set in &mut period.stream_sets {
            set.id = SetId(next_set);
            next_set += 1;

            // Representations the sink cannot accept are unplayable.
            set.streams.retain(|info| {
                let ok = supports(&info.full_mime_type);
                if !ok {
                    tracing::debug!(mime = %info.full_mime_type, "dropping unsupported representation");
                }
                ok
            });

            // Enforce in-set compatibility: every representation must share
            // the set's basic MIME type.
            if let Some(reference) = set.streams.first().and_then(|s| basic_mime(&s.full_mime_type))
            {
                set.streams
                    .retain(|info| basic_mime(&info.full_mime_type).as_ref() == Some(&reference));
            }

            for info in &mut set.streams {
                info.id = TrackId(next_track);
                next_track += 1;
            }
        }

        period.stream_sets.retain(|set| !set.streams.is_empty());
        retain_compatibility_groups(&mut period.stream_sets);
    }

    manifest.periods.retain(|p| !p.stream_sets.is_empty());
    if manifest.periods.is_empty() {
        return Err(ManifestError::Empty);
    }
    Ok(())
}

fn set_basic_mime(set: &StreamSet) -> Option<BasicMime> {
    set.streams.first().and_then(|s| basic_mime(&s.full_mime_type))
}

fn retain_compatibility_groups(sets: &mut Vec<StreamSet>) {
    use weft_core::ContentType;

    for content_type in [ContentType::Video, ContentType::Audio] {
        let reference = sets
            .iter()
            .find(|s| s.content_type == content_type)
            .and_then(set_basic_mime);

        let Some(ref_mime) = reference else {
            continue;
        };

        let mut kept_video = false;
        sets.retain(|set| {
            if set.content_type != content_type {
                return true;
            }
            match content_type {
                // Only one video set survives.
                ContentType::Video => {
                    let keep = !kept_video && set_basic_mime(set).as_ref() == Some(&ref_mime);
                    kept_video |= keep;
                    keep
                }
                ContentType::Audio => set_basic_mime(set).as_ref() == Some(&ref_mime),
                ContentType::Text => true,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use weft_core::ContentType;

    use super::*;
    use crate::{
        model::{Period, PresentationKind, StreamInfo},
        source::SegmentIndexSource,
    };

    fn info(mime: &str, bandwidth: u64) -> StreamInfo {
        StreamInfo {
            id: TrackId(999),
            full_mime_type: mime.to_string(),
            bandwidth_bps: bandwidth,
            width: None,
            height: None,
            timestamp_offset: 0.0,
            index_source: Arc::new(SegmentIndexSource::explicit(Vec::new())),
            init_source: None,
            enabled: true,
        }
    }

    fn set(content_type: ContentType, streams: Vec<StreamInfo>) -> StreamSet {
        StreamSet {
            id: SetId(999),
            content_type,
            lang: None,
            main: false,
            drm_schemes: Vec::new(),
            streams,
        }
    }

    fn manifest(sets: Vec<StreamSet>) -> Manifest {
        Manifest {
            kind: PresentationKind::Static,
            min_buffer_time: 2.0,
            update_url: None,
            update_period: None,
            availability_start: None,
            periods: vec![Period {
                start: 0.0,
                duration: Some(60.0),
                stream_sets: sets,
            }],
        }
    }

    #[test]
    fn assigns_dense_ids() {
        let mut m = manifest(vec![
            set(
                ContentType::Video,
                vec![
                    info("video/mp4; codecs=\"avc1.4d401f\"", 1_000_000),
                    info("video/mp4; codecs=\"avc1.64001f\"", 3_000_000),
                ],
            ),
            set(
                ContentType::Audio,
                vec![info("audio/mp4; codecs=\"mp4a.40.2\"", 128_000)],
            ),
        ]);

        process_manifest(&mut m, &|_| true).unwrap();

        let sets = &m.periods[0].stream_sets;
        assert_eq!(sets[0].id, SetId(0));
        assert_eq!(sets[1].id, SetId(1));
        assert_eq!(sets[0].streams[0].id, TrackId(0));
        assert_eq!(sets[0].streams[1].id, TrackId(1));
        assert_eq!(sets[1].streams[0].id, TrackId(2));
    }

    #[test]
    fn unsupported_mime_is_dropped_and_empty_sets_removed() {
        let mut m = manifest(vec![
            set(
                ContentType::Video,
                vec![info("video/mp4; codecs=\"avc1.4d401f\"", 1_000_000)],
            ),
            set(
                ContentType::Video,
                vec![info("video/webm; codecs=\"vp9\"", 1_000_000)],
            ),
        ]);

        process_manifest(&mut m, &|mime| !mime.contains("webm")).unwrap();

        let sets = &m.periods[0].stream_sets;
        assert_eq!(sets.len(), 1);
        assert!(sets[0].streams[0].full_mime_type.contains("mp4"));
    }

    #[test]
    fn nothing_playable_is_an_error() {
        let mut m = manifest(vec![set(
            ContentType::Video,
            vec![info("video/mp4; codecs=\"avc1.4d401f\"", 1_000_000)],
        )]);

        let err = process_manifest(&mut m, &|_| false).unwrap_err();
        assert!(matches!(err, ManifestError::Empty));
    }

    #[test]
    fn only_one_video_set_survives() {
        let mut m = manifest(vec![
            set(
                ContentType::Video,
                vec![info("video/mp4; codecs=\"avc1.4d401f\"", 1_000_000)],
            ),
            set(
                ContentType::Video,
                vec![info("video/mp4; codecs=\"avc1.64001f\"", 3_000_000)],
            ),
        ]);

        process_manifest(&mut m, &|_| true).unwrap();
        let video: Vec<_> = m.periods[0]
            .stream_sets
            .iter()
            .filter(|s| s.content_type == ContentType::Video)
            .collect();
        assert_eq!(video.len(), 1);
    }

    #[test]
    fn audio_keeps_all_compatible_sets() {
        let mut m = manifest(vec![
            set(
                ContentType::Audio,
                vec![info("audio/mp4; codecs=\"mp4a.40.2\"", 128_000)],
            ),
            set(
                ContentType::Audio,
                vec![info("audio/mp4; codecs=\"mp4a.40.5\"", 64_000)],
            ),
            set(
                ContentType::Audio,
                vec![info("audio/webm; codecs=\"opus\"", 96_000)],
            ),
        ]);

        process_manifest(&mut m, &|_| true).unwrap();
        let audio: Vec<_> = m.periods[0]
            .stream_sets
            .iter()
            .filter(|s| s.content_type == ContentType::Audio)
            .collect();
        assert_eq!(audio.len(), 2, "opus set is incompatible with the mp4a reference");
    }

    #[test]
    fn incompatible_stream_within_set_is_dropped() {
        let mut m = manifest(vec![set(
            ContentType::Video,
            vec![
                info("video/mp4; codecs=\"avc1.4d401f\"", 1_000_000),
                info("video/mp4; codecs=\"hvc1.1.6\"", 2_000_000),
            ],
        )]);

        process_manifest(&mut m, &|_| true).unwrap();
        assert_eq!(m.periods[0].stream_sets[0].streams.len(), 1);
    }

    #[test]
    fn text_sets_are_always_kept() {
        let mut m = manifest(vec![
            set(ContentType::Text, vec![info("text/vtt", 1_000)]),
            set(ContentType::Text, vec![info("application/ttml+xml", 1_000)]),
        ]);

        process_manifest(&mut m, &|_| true).unwrap();
        assert_eq!(m.periods[0].stream_sets.len(), 2);
    }
}
