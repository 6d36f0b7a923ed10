//! Fuzzy BCP-47 matching used to order audio and text sets by preferred
//! language.

use crate::model::StreamSet;

/// Match quality, best first. Variant order matters: selection walks the
/// ladder top to bottom and the first level with any hit wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LanguageMatch {
    /// Full tag equality.
    Exact,
    /// Primary subtag and region equal, variants ignored.
    PrimaryRegion,
    /// Primary subtag only.
    Primary,
}

fn normalize(tag: &str) -> Vec<String> {
    tag.trim()
        .replace('_', "-")
        .to_ascii_lowercase()
        .split('-')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// How well `candidate` matches `preferred`, or `None` for no match.
#[must_use]
pub fn match_level(preferred: &str, candidate: &str) -> Option<LanguageMatch> {
    let p = normalize(preferred);
    let c = normalize(candidate);
    if p.is_empty() || c.is_empty() {
        return None;
    }

    if p == c {
        return Some(LanguageMatch::Exact);
    }
    if p.len() >= 2 && c.len() >= 2 && p[0] == c[0] && p[1] == c[1] {
        return Some(LanguageMatch::PrimaryRegion);
    }
    if p[0] == c[0] {
        return Some(LanguageMatch::Primary);
    }
    None
}

/// Index of the set best matching `preferred`, walking the fuzz ladder:
/// exact, then primary+region, then primary, then the `main`-flagged set.
/// Deterministic: within a level the first set in order wins.
#[must_use]
pub fn select_preferred(preferred: Option<&str>, sets: &[StreamSet]) -> Option<usize> {
    if let Some(preferred) = preferred {
        for level in [
            LanguageMatch::Exact,
            LanguageMatch::PrimaryRegion,
            LanguageMatch::Primary,
        ] {
            let hit = sets.iter().position(|set| {
                set.lang
                    .as_deref()
                    .and_then(|lang| match_level(preferred, lang))
                    == Some(level)
            });
            if hit.is_some() {
                return hit;
            }
        }
    }
    sets.iter().position(|set| set.main)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;
    use weft_core::{ContentType, SetId};

    use super::*;
    use crate::source::SegmentIndexSource;

    #[rstest]
    #[case("en", "en", Some(LanguageMatch::Exact))]
    #[case("en-US", "en-us", Some(LanguageMatch::Exact))]
    #[case("pt_BR", "pt-br", Some(LanguageMatch::Exact))]
    #[case("en-US-posix", "en-US", Some(LanguageMatch::PrimaryRegion))]
    #[case("fr-CA", "fr-CA-variant", Some(LanguageMatch::PrimaryRegion))]
    #[case("fr-CA", "fr", Some(LanguageMatch::Primary))]
    #[case("fr", "fr-FR", Some(LanguageMatch::Primary))]
    #[case("fr-CA", "fr-FR", Some(LanguageMatch::Primary))]
    #[case("de", "en", None)]
    #[case("", "en", None)]
    fn ladder(
        #[case] preferred: &str,
        #[case] candidate: &str,
        #[case] expected: Option<LanguageMatch>,
    ) {
        assert_eq!(match_level(preferred, candidate), expected);
    }

    fn lang_set(lang: Option<&str>, main: bool) -> StreamSet {
        StreamSet {
            id: SetId(0),
            content_type: ContentType::Audio,
            lang: lang.map(str::to_owned),
            main,
            drm_schemes: Vec::new(),
            streams: vec![crate::model::StreamInfo {
                id: weft_core::TrackId(0),
                full_mime_type: "audio/mp4; codecs=\"mp4a.40.2\"".into(),
                bandwidth_bps: 128_000,
                width: None,
                height: None,
                timestamp_offset: 0.0,
                index_source: Arc::new(SegmentIndexSource::explicit(Vec::new())),
                init_source: None,
                enabled: true,
            }],
        }
    }

    #[test]
    fn primary_beats_main_flag() {
        let sets = vec![
            lang_set(Some("en"), true),
            lang_set(Some("fr"), false),
            lang_set(Some("de"), false),
        ];
        assert_eq!(select_preferred(Some("fr-CA"), &sets), Some(1));
    }

    #[test]
    fn exact_beats_primary() {
        let sets = vec![lang_set(Some("fr"), false), lang_set(Some("fr-CA"), false)];
        assert_eq!(select_preferred(Some("fr-CA"), &sets), Some(1));
    }

    #[test]
    fn falls_back_to_main() {
        let sets = vec![
            lang_set(Some("en"), false),
            lang_set(Some("de"), true),
        ];
        assert_eq!(select_preferred(Some("ja"), &sets), Some(1));
        assert_eq!(select_preferred(None, &sets), Some(1));
    }

    #[test]
    fn no_match_no_main_is_none() {
        let sets = vec![lang_set(Some("en"), false)];
        assert_eq!(select_preferred(Some("ja"), &sets), None);
    }
}
