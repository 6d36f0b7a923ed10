//! Test fixtures: an in-memory media sink, a scripted fetcher, a settable
//! clock, and manifest builders. Used by the scenario tests and available
//! to embedders for their own harnesses.

use std::{
    collections::{HashMap, VecDeque},
    ops::Range,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use url::Url;
use weft_core::{ContentType, SetId, TrackId};
use weft_manifest::{
    Manifest, Period, PresentationKind, SegmentIndexSource, SegmentReference, StreamInfo,
    StreamSet,
};
use weft_net::{Fetcher, NetError, RangeSpec};

use crate::{
    clock::Clock,
    coordinator::ManifestSource,
    error::{PlayerError, PlayerResult},
    sink::{MediaSink, SinkError, SinkEvent, SinkReadyState, TrackHandle},
};

const PAYLOAD_MAGIC: &[u8; 4] = b"WFSG";

/// Encode a segment payload the [`FakeSink`] can "demux": magic plus the
/// segment's start and end time, padded to `len` bytes.
#[must_use]
pub fn segment_payload_sized(start: f64, end: f64, len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(len.max(20));
    buf.extend_from_slice(PAYLOAD_MAGIC);
    buf.extend_from_slice(&start.to_le_bytes());
    buf.extend_from_slice(&end.to_le_bytes());
    if buf.len() < len {
        buf.resize(len, 0);
    }
    buf.freeze()
}

/// Encode a minimal segment payload.
#[must_use]
pub fn segment_payload(start: f64, end: f64) -> Bytes {
    segment_payload_sized(start, end, 0)
}

fn decode_payload(bytes: &[u8]) -> Option<(f64, f64)> {
    if bytes.len() < 20 || &bytes[0..4] != PAYLOAD_MAGIC {
        return None;
    }
    let start = f64::from_le_bytes(bytes[4..12].try_into().ok()?);
    let end = f64::from_le_bytes(bytes[12..20].try_into().ok()?);
    Some((start, end))
}

struct FakeTrack {
    mime: String,
    timestamp_offset: f64,
    pts_shift: f64,
    buffered: Vec<(f64, f64)>,
    appends: usize,
}

struct SinkState {
    tracks: Vec<FakeTrack>,
    position: f64,
    duration: Option<f64>,
    rate: f64,
    ready: SinkReadyState,
    eos: bool,
    seeks: Vec<f64>,
    rate_changes: Vec<f64>,
    pts_shifts: Vec<(String, f64)>,
}

/// In-memory media sink. Appended payloads carry their own timing (see
/// [`segment_payload`]); a configurable per-MIME PTS shift simulates
/// containers whose timestamps disagree with the manifest.
pub struct FakeSink {
    state: Mutex<SinkState>,
    events: broadcast::Sender<SinkEvent>,
}

impl FakeSink {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(SinkState {
                tracks: Vec::new(),
                position: 0.0,
                duration: None,
                rate: 1.0,
                ready: SinkReadyState::Closed,
                eos: false,
                seeks: Vec::new(),
                rate_changes: Vec::new(),
                pts_shifts: Vec::new(),
            }),
            events,
        })
    }

    /// Transition to `Open` and emit the event.
    pub fn open(&self) {
        self.state.lock().ready = SinkReadyState::Open;
        let _ = self.events.send(SinkEvent::Open);
    }

    /// Containers for MIME types starting with `prefix` report timestamps
    /// shifted by `delta` relative to what the payload declares.
    pub fn set_pts_shift(&self, prefix: &str, delta: f64) {
        let mut state = self.state.lock();
        state.pts_shifts.push((prefix.to_string(), delta));
        for track in &mut state.tracks {
            if track.mime.starts_with(prefix) {
                track.pts_shift = delta;
            }
        }
    }

    /// Move the playhead without a seek event, as if playback progressed.
    pub fn set_position(&self, position: f64) {
        self.state.lock().position = position;
        let _ = self.events.send(SinkEvent::TimeUpdate { position });
    }

    #[must_use]
    pub fn appends_for(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .tracks
            .iter()
            .filter(|t| t.mime.starts_with(prefix))
            .map(|t| t.appends)
            .sum()
    }

    #[must_use]
    pub fn buffered_for(&self, prefix: &str) -> Option<(f64, f64)> {
        let state = self.state.lock();
        let track = state.tracks.iter().find(|t| t.mime.starts_with(prefix))?;
        buffered_span(&track.buffered)
    }

    #[must_use]
    pub fn seeks(&self) -> Vec<f64> {
        self.state.lock().seeks.clone()
    }

    #[must_use]
    pub fn rate_changes(&self) -> Vec<f64> {
        self.state.lock().rate_changes.clone()
    }

    #[must_use]
    pub fn ended(&self) -> bool {
        self.state.lock().eos
    }
}

fn buffered_span(intervals: &[(f64, f64)]) -> Option<(f64, f64)> {
    let start = intervals
        .iter()
        .map(|(s, _)| *s)
        .fold(f64::INFINITY, f64::min);
    let end = intervals
        .iter()
        .map(|(_, e)| *e)
        .fold(f64::NEG_INFINITY, f64::max);
    (start <= end).then_some((start, end))
}

impl MediaSink for FakeSink {
    fn add_track(&self, mime: &str) -> Result<TrackHandle, SinkError> {
        let mut state = self.state.lock();
        if state.ready == SinkReadyState::Closed {
            return Err(SinkError::Closed);
        }
        let pts_shift = state
            .pts_shifts
            .iter()
            .find(|(prefix, _)| mime.starts_with(prefix))
            .map_or(0.0, |(_, delta)| *delta);
        state.tracks.push(FakeTrack {
            mime: mime.to_string(),
            timestamp_offset: 0.0,
            pts_shift,
            buffered: Vec::new(),
            appends: 0,
        });
        Ok(state.tracks.len() - 1)
    }

    fn append(&self, track: TrackHandle, bytes: Bytes) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        let track = state.tracks.get_mut(track).ok_or(SinkError::InvalidHandle)?;
        track.appends += 1;
        if let Some((start, end)) = decode_payload(&bytes) {
            let shift = track.pts_shift + track.timestamp_offset;
            track.buffered.push((start + shift, end + shift));
        }
        Ok(())
    }

    fn evict(&self, track: TrackHandle, range: Range<f64>) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        let track = state.tracks.get_mut(track).ok_or(SinkError::InvalidHandle)?;
        let mut kept = Vec::new();
        for (start, end) in track.buffered.drain(..) {
            if end <= range.start || start >= range.end {
                kept.push((start, end));
                continue;
            }
            if start < range.start {
                kept.push((start, range.start));
            }
            if end > range.end {
                kept.push((range.end, end));
            }
        }
        track.buffered = kept;
        Ok(())
    }

    fn set_timestamp_offset(&self, track: TrackHandle, offset: f64) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        let track = state.tracks.get_mut(track).ok_or(SinkError::InvalidHandle)?;
        track.timestamp_offset = offset;
        Ok(())
    }

    fn buffered(&self, track: TrackHandle) -> Option<(f64, f64)> {
        let state = self.state.lock();
        buffered_span(&state.tracks.get(track)?.buffered)
    }

    fn set_duration(&self, duration: f64) {
        self.state.lock().duration = Some(duration);
    }

    fn duration(&self) -> Option<f64> {
        self.state.lock().duration
    }

    fn seek(&self, position: f64) {
        {
            let mut state = self.state.lock();
            state.position = position;
            state.seeks.push(position);
        }
        let _ = self.events.send(SinkEvent::Seeking { position });
    }

    fn position(&self) -> f64 {
        self.state.lock().position
    }

    fn set_playback_rate(&self, rate: f64) {
        let mut state = self.state.lock();
        state.rate = rate;
        state.rate_changes.push(rate);
    }

    fn playback_rate(&self) -> f64 {
        self.state.lock().rate
    }

    fn end_of_stream(&self) {
        let mut state = self.state.lock();
        state.eos = true;
        state.ready = SinkReadyState::Ended;
    }

    fn ready_state(&self) -> SinkReadyState {
        self.state.lock().ready
    }

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.events.subscribe()
    }
}

/// Fetcher serving canned responses keyed by URL, with optional scripted
/// failures consumed before the canned bytes.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: Mutex<HashMap<String, Bytes>>,
    failures: Mutex<HashMap<String, VecDeque<NetError>>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, url: &Url, bytes: Bytes) {
        self.responses.lock().insert(url.to_string(), bytes);
    }

    /// Queue `times` failures for a URL before its canned response applies.
    pub fn fail(&self, url: &Url, error: NetError, times: usize) {
        let mut failures = self.failures.lock();
        let queue = failures.entry(url.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: Url, _range: Option<RangeSpec>) -> Result<Bytes, NetError> {
        let key = url.to_string();
        self.log.lock().push(key.clone());

        if let Some(queue) = self.failures.lock().get_mut(&key) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }

        self.responses
            .lock()
            .get(&key)
            .cloned()
            .ok_or(NetError::HttpStatus { status: 404, url })
    }
}

/// Clock with a settable wall time; monotonic time follows tokio so paused
/// tests stay deterministic.
pub struct FakeClock {
    wall: Mutex<f64>,
}

impl FakeClock {
    #[must_use]
    pub fn new(wall: f64) -> Arc<Self> {
        Arc::new(Self {
            wall: Mutex::new(wall),
        })
    }

    pub fn advance_wall(&self, secs: f64) {
        *self.wall.lock() += secs;
    }
}

impl Clock for FakeClock {
    fn monotonic(&self) -> std::time::Instant {
        tokio::time::Instant::now().into_std()
    }

    fn wall_secs(&self) -> f64 {
        *self.wall.lock()
    }
}

/// Manifest source handing out queued manifests; repeats the last one once
/// the queue drains.
#[derive(Default)]
pub struct QueuedManifests {
    queue: Mutex<VecDeque<Manifest>>,
    last: Mutex<Option<Manifest>>,
    fetches: Mutex<usize>,
}

impl QueuedManifests {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, manifest: Manifest) {
        self.queue.lock().push_back(manifest);
    }

    #[must_use]
    pub fn fetches(&self) -> usize {
        *self.fetches.lock()
    }
}

#[async_trait]
impl ManifestSource for QueuedManifests {
    async fn fetch_manifest(&self, _url: Option<&Url>) -> PlayerResult<Manifest> {
        *self.fetches.lock() += 1;
        let next = self.queue.lock().pop_front();
        match next {
            Some(manifest) => {
                *self.last.lock() = Some(manifest.clone());
                Ok(manifest)
            }
            None => self
                .last
                .lock()
                .clone()
                .ok_or(PlayerError::StreamFetch { status: None }),
        }
    }
}

/// Evenly spaced segment references under `base`, with payloads registered
/// in the fetcher.
pub fn scripted_segments(
    fetcher: &ScriptedFetcher,
    base: &str,
    count: u64,
    seg_duration: f64,
    first_start: f64,
) -> Vec<SegmentReference> {
    (0..count)
        .map(|i| {
            let start = first_start + i as f64 * seg_duration;
            let end = start + seg_duration;
            let url = Url::parse(&format!("http://test.local/{base}/seg_{i}.m4s"))
                .expect("fixture url");
            fetcher.insert(&url, segment_payload(start, end));
            SegmentReference {
                index: i,
                start_time: start,
                end_time: Some(end),
                url,
                byte_range: None,
            }
        })
        .collect()
}

/// A representation over an explicit reference list.
#[must_use]
pub fn stream_info(
    mime: &str,
    bandwidth_bps: u64,
    dimensions: Option<(u32, u32)>,
    references: Vec<SegmentReference>,
) -> StreamInfo {
    StreamInfo {
        id: TrackId(0), // assigned by the processor
        full_mime_type: mime.to_string(),
        bandwidth_bps,
        width: dimensions.map(|(w, _)| w),
        height: dimensions.map(|(_, h)| h),
        timestamp_offset: 0.0,
        index_source: Arc::new(SegmentIndexSource::explicit(references)),
        init_source: None,
        enabled: true,
    }
}

#[must_use]
pub fn stream_set(
    content_type: ContentType,
    lang: Option<&str>,
    main: bool,
    streams: Vec<StreamInfo>,
) -> StreamSet {
    StreamSet {
        id: SetId(0), // assigned by the processor
        content_type,
        lang: lang.map(str::to_owned),
        main,
        drm_schemes: Vec::new(),
        streams,
    }
}

#[must_use]
pub fn static_manifest(duration: f64, stream_sets: Vec<StreamSet>) -> Manifest {
    Manifest {
        kind: PresentationKind::Static,
        min_buffer_time: 2.0,
        update_url: None,
        update_period: None,
        availability_start: None,
        periods: vec![Period {
            start: 0.0,
            duration: Some(duration),
            stream_sets,
        }],
    }
}

#[must_use]
pub fn live_manifest(update_period: f64, stream_sets: Vec<StreamSet>) -> Manifest {
    Manifest {
        kind: PresentationKind::Dynamic,
        min_buffer_time: 2.0,
        update_url: Some(Url::parse("http://test.local/live.mpd").expect("fixture url")),
        update_period: Some(update_period),
        availability_start: None,
        periods: vec![Period {
            start: 0.0,
            duration: None,
            stream_sets,
        }],
    }
}
