//! Stream coordination: owns the manifest and one stream per content type,
//! selects representations, computes the common play window, and drives
//! start, seek, restrictions, live updates, and end of stream.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::{
    sync::{mpsc, Mutex, Notify},
    time::{sleep, Duration},
};
use tokio_util::sync::CancellationToken;
use url::Url;
use weft_abr::{AbrManager, AbrReason, BandwidthEstimator, Candidate};
use weft_core::{basic_mime, ContentType, SetId, TrackId};
use weft_events::{EventBus, PlayerEvent};
use weft_manifest::{
    match_level, merge_update, process_manifest, select_preferred, DrmScheme, Manifest,
    PresentationKind, SharedIndex, StreamInfo, StreamSet,
};
use weft_net::Fetcher;

use crate::{
    clock::{Clock, SystemClock},
    error::{PlayerError, PlayerResult},
    params::PlayerParams,
    sink::{MediaSink, SinkEvent, SinkReadyState},
    stream::{MediaStream, StreamContext, StreamMsg},
    tracks::{list_tracks, Track},
    window::compute_play_window,
};

/// Hook fetching a fresh manifest during live playback. Parsing happens on
/// the embedder's side; the coordinator only consumes the result.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch_manifest(&self, url: Option<&Url>) -> PlayerResult<Manifest>;
}

/// Stream selection limits applied across every period.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Restrictions {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub max_bandwidth_bps: Option<u64>,
    pub min_bandwidth_bps: Option<u64>,
}

impl Restrictions {
    fn allows(&self, info: &StreamInfo) -> bool {
        let too_wide = self
            .max_width
            .zip(info.width)
            .is_some_and(|(max, w)| w > max);
        let too_tall = self
            .max_height
            .zip(info.height)
            .is_some_and(|(max, h)| h > max);
        let too_fast = self
            .max_bandwidth_bps
            .is_some_and(|max| info.bandwidth_bps > max);
        let too_slow = self
            .min_bandwidth_bps
            .is_some_and(|min| info.bandwidth_bps < min);
        !(too_wide || too_tall || too_fast || too_slow)
    }
}

struct Inner {
    manifest: Option<Manifest>,
    params: PlayerParams,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    manifest_source: Option<Arc<dyn ManifestSource>>,
    sink: Option<Arc<dyn MediaSink>>,
    bus: EventBus,

    loaded: bool,
    configured: bool,
    destroyed: bool,
    preferred_language: Option<String>,
    text_enabled: bool,

    /// Ordered eligible sets per content type, best language match first.
    sets_by_type: HashMap<ContentType, Vec<SetId>>,
    /// The set currently feeding each stream.
    active_set: HashMap<ContentType, SetId>,
    /// Enabled representations of the active set, shared with stream tasks.
    peers: HashMap<ContentType, Arc<SyncMutex<Vec<StreamInfo>>>>,
    streams: HashMap<ContentType, MediaStream>,

    estimator: Arc<SyncMutex<BandwidthEstimator>>,
    abr: Arc<SyncMutex<AbrManager>>,
    restrictions: Restrictions,

    msg_tx: mpsc::Sender<StreamMsg>,
    msg_rx: Option<mpsc::Receiver<StreamMsg>>,

    /// Startup bookkeeping: corrections reported so far, how many streams
    /// must report, and how `attach` learns the outcome.
    pending_corrections: Vec<f64>,
    awaiting_start: usize,
    start_error: Option<PlayerError>,
    start_notify: Arc<Notify>,
    /// Playback rate frozen during startup, restored after correction.
    original_rate: f64,
    seek_target: f64,
    seek_armed: bool,
    update_armed: bool,
    ended: HashSet<ContentType>,
}

impl Inner {
    fn manifest(&self) -> PlayerResult<&Manifest> {
        self.manifest.as_ref().ok_or(PlayerError::NotLoaded)
    }

    fn is_live(&self) -> bool {
        self.manifest.as_ref().is_some_and(Manifest::is_live)
    }

    fn guard(&self) -> PlayerResult<()> {
        if self.destroyed {
            return Err(PlayerError::Destroyed);
        }
        Ok(())
    }

    fn refresh_peers(&self, content_type: ContentType) {
        let Some(set_id) = self.active_set.get(&content_type) else {
            return;
        };
        let Some(manifest) = self.manifest.as_ref() else {
            return;
        };
        if let (Some(set), Some(peers)) =
            (find_set(manifest, *set_id), self.peers.get(&content_type))
        {
            *peers.lock() = set.streams.clone();
        }
    }
}

/// Owns the per-type streams and drives the whole buffering loop.
///
/// Every public operation is atomic with respect to concurrent calls: state
/// lives behind one async mutex that is held across the operation's
/// suspension points.
pub struct StreamCoordinator {
    inner: Arc<Mutex<Inner>>,
    bus: EventBus,
    cancel: CancellationToken,
}

impl StreamCoordinator {
    pub fn new(manifest: Manifest, fetcher: Arc<dyn Fetcher>, params: PlayerParams) -> Self {
        let bus = EventBus::new(params.event_capacity);
        let cancel = params.cancel.clone().unwrap_or_default();
        let (msg_tx, msg_rx) = mpsc::channel(32);

        let mut estimator = BandwidthEstimator::new();
        if let Some(bps) = params.initial_bandwidth_bps {
            estimator = estimator.with_initial_estimate(bps);
        }
        let abr = AbrManager::new(params.abr.clone());

        let inner = Inner {
            manifest: Some(manifest),
            params,
            fetcher,
            clock: Arc::new(SystemClock),
            manifest_source: None,
            sink: None,
            bus: bus.clone(),
            loaded: false,
            configured: false,
            destroyed: false,
            preferred_language: None,
            text_enabled: false,
            sets_by_type: HashMap::new(),
            active_set: HashMap::new(),
            peers: HashMap::new(),
            streams: HashMap::new(),
            estimator: Arc::new(SyncMutex::new(estimator)),
            abr: Arc::new(SyncMutex::new(abr)),
            restrictions: Restrictions::default(),
            msg_tx,
            msg_rx: Some(msg_rx),
            pending_corrections: Vec::new(),
            awaiting_start: 0,
            start_error: None,
            start_notify: Arc::new(Notify::new()),
            original_rate: 1.0,
            seek_target: 0.0,
            seek_armed: false,
            update_armed: false,
            ended: HashSet::new(),
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
            bus,
            cancel,
        }
    }

    /// Replace the time source; builder-style, before the coordinator is
    /// shared.
    #[must_use]
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        self.inner.try_lock().expect("builder before sharing").clock = clock;
        self
    }

    /// Install the live manifest refetch hook; builder-style.
    #[must_use]
    pub fn with_manifest_source(self, source: Arc<dyn ManifestSource>) -> Self {
        self.inner
            .try_lock()
            .expect("builder before sharing")
            .manifest_source = Some(source);
        self
    }

    /// The bus carrying every produced event.
    #[must_use]
    pub fn events(&self) -> EventBus {
        self.bus.clone()
    }

    /// Process the manifest and remember the preferred language.
    pub async fn load(&self, preferred_language: Option<&str>) -> PlayerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        if inner.loaded {
            return Err(PlayerError::AlreadyLoaded);
        }

        let supports = inner.params.type_support.clone();
        let manifest = inner.manifest.as_mut().ok_or(PlayerError::NotLoaded)?;
        match &supports {
            Some(predicate) => process_manifest(manifest, &|mime| predicate(mime))?,
            None => process_manifest(manifest, &|_| true)?,
        }

        inner.preferred_language = preferred_language.map(str::to_owned);
        inner.loaded = true;
        tracing::debug!(
            periods = inner.manifest()?.periods.len(),
            live = inner.is_live(),
            "manifest loaded"
        );
        Ok(())
    }

    /// Bind to the media sink, start every stream, and return once all of
    /// them have appended their first bytes. A live start that finds no
    /// common play window is suppressed and retried by the update loop.
    pub async fn attach(&self, sink: Arc<dyn MediaSink>) -> PlayerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        if !inner.loaded {
            return Err(PlayerError::NotLoaded);
        }
        if inner.sink.is_some() {
            return Err(PlayerError::AlreadyLoaded);
        }

        // Wait for the sink to open before touching it.
        let mut sink_events = sink.subscribe();
        while sink.ready_state() == SinkReadyState::Closed {
            tokio::select! {
                () = self.cancel.cancelled() => return Err(PlayerError::Destroyed),
                event = sink_events.recv() => match event {
                    Ok(SinkEvent::Open) => break,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => return Err(PlayerError::Destroyed),
                },
            }
        }
        inner.sink = Some(Arc::clone(&sink));

        if !inner.configured {
            select_configurations_inner(&mut inner, &HashMap::new())?;
        }

        let started = start_streams(&mut inner, &self.cancel).await;
        let wait_for_start = match started {
            Ok(()) => true,
            Err(PlayerError::StreamsNotAvailable) if inner.is_live() => {
                tracing::warn!("no common play window yet, retrying on next update");
                false
            }
            Err(e) => {
                self.publish_error(&e);
                return Err(e);
            }
        };

        // From here on the pump owns the stream messages.
        if let Some(msg_rx) = inner.msg_rx.take() {
            tokio::spawn(run_msg_pump(
                Arc::clone(&self.inner),
                self.bus.clone(),
                self.cancel.clone(),
                msg_rx,
            ));
        }
        self.arm_update_timer(&mut inner);

        if wait_for_start {
            let notify = Arc::clone(&inner.start_notify);
            drop(inner);
            tokio::select! {
                () = self.cancel.cancelled() => return Err(PlayerError::Destroyed),
                () = notify.notified() => {}
            }
            let mut inner = self.inner.lock().await;
            if let Some(error) = inner.start_error.take() {
                self.publish_error(&error);
                return Err(error);
            }
        }
        Ok(())
    }

    /// DRM scheme options per content type, for negotiation by the embedder.
    pub async fn configurations(&self) -> PlayerResult<HashMap<ContentType, Vec<DrmScheme>>> {
        let inner = self.inner.lock().await;
        inner.guard()?;
        let manifest = inner.manifest()?;
        let period = manifest.periods.first().ok_or(PlayerError::NotLoaded)?;

        let mut out: HashMap<ContentType, Vec<DrmScheme>> = HashMap::new();
        for set in &period.stream_sets {
            let entry = out.entry(set.content_type).or_default();
            for scheme in &set.drm_schemes {
                if !entry.contains(scheme) {
                    entry.push(scheme.clone());
                }
            }
        }
        Ok(out)
    }

    /// Fix the DRM configuration per content type and compute the ordered
    /// eligible stream sets.
    pub async fn select_configurations(
        &self,
        chosen: HashMap<ContentType, Option<DrmScheme>>,
    ) -> PlayerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        if !inner.loaded {
            return Err(PlayerError::NotLoaded);
        }
        select_configurations_inner(&mut inner, &chosen)
    }

    pub async fn video_tracks(&self) -> Vec<Track> {
        self.tracks_of(ContentType::Video).await
    }

    pub async fn audio_tracks(&self) -> Vec<Track> {
        self.tracks_of(ContentType::Audio).await
    }

    pub async fn text_tracks(&self) -> Vec<Track> {
        self.tracks_of(ContentType::Text).await
    }

    async fn tracks_of(&self, content_type: ContentType) -> Vec<Track> {
        let inner = self.inner.lock().await;
        if inner.destroyed {
            return Vec::new();
        }
        let Ok(manifest) = inner.manifest() else {
            return Vec::new();
        };
        let Some(period) = manifest.periods.first() else {
            return Vec::new();
        };
        let Some(ids) = inner.sets_by_type.get(&content_type) else {
            return Vec::new();
        };

        let sets: Vec<&StreamSet> = ids
            .iter()
            .filter_map(|id| period.stream_sets.iter().find(|s| s.id == *id))
            .collect();
        let active = inner
            .streams
            .get(&content_type)
            .map(MediaStream::active_track);
        list_tracks(&sets, active)
    }

    pub async fn select_video_track(&self, id: TrackId, immediate: bool) -> bool {
        self.select_track(ContentType::Video, id, immediate).await
    }

    pub async fn select_audio_track(&self, id: TrackId) -> bool {
        self.select_track(ContentType::Audio, id, true).await
    }

    pub async fn select_text_track(&self, id: TrackId) -> bool {
        self.select_track(ContentType::Text, id, true).await
    }

    async fn select_track(&self, content_type: ContentType, id: TrackId, immediate: bool) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.destroyed || !inner.streams.contains_key(&content_type) {
            return false;
        }

        let found = {
            let Ok(manifest) = inner.manifest() else {
                return false;
            };
            let Some(period) = manifest.periods.first() else {
                return false;
            };
            let Some(ids) = inner.sets_by_type.get(&content_type) else {
                return false;
            };
            ids.iter()
                .filter_map(|set_id| period.stream_sets.iter().find(|s| s.id == *set_id))
                .find_map(|set| {
                    set.streams
                        .iter()
                        .find(|info| info.id == id && info.enabled)
                        .map(|info| (set.id, set.streams.clone(), info.clone()))
                })
        };
        let Some((set_id, set_streams, info)) = found else {
            return false;
        };

        inner.active_set.insert(content_type, set_id);
        if let Some(peers) = inner.peers.get(&content_type) {
            *peers.lock() = set_streams;
        }
        if let Some(stream) = inner.streams.get(&content_type) {
            stream.switch(info, immediate);
        }
        self.bus.publish(PlayerEvent::TracksChanged);
        true
    }

    /// Show or hide the text stream. Enabling after attach spawns the
    /// stream; disabling destroys it.
    pub async fn enable_text_track(&self, enabled: bool) -> PlayerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        inner.text_enabled = enabled;

        if !enabled {
            if let Some(stream) = inner.streams.remove(&ContentType::Text) {
                stream.destroy();
                inner.ended.remove(&ContentType::Text);
            }
            return Ok(());
        }

        if inner.sink.is_some() && !inner.streams.contains_key(&ContentType::Text) {
            spawn_type_stream(&mut inner, ContentType::Text, &self.cancel);
        }
        Ok(())
    }

    /// Whether the text stream is currently shown.
    pub async fn text_enabled(&self) -> bool {
        self.inner.lock().await.text_enabled
    }

    /// Current phase of one stream's state machine, when that type is
    /// active.
    pub async fn stream_phase(&self, content_type: ContentType) -> Option<crate::StreamPhase> {
        self.inner
            .lock()
            .await
            .streams
            .get(&content_type)
            .map(MediaStream::phase)
    }

    /// Toggle automatic bitrate adaptation.
    pub async fn enable_adaptation(&self, enabled: bool) -> PlayerResult<()> {
        let inner = self.inner.lock().await;
        inner.guard()?;
        inner.abr.lock().enable(enabled);
        Ok(())
    }

    /// Apply selection limits across every period. A currently playing but
    /// now restricted representation is switched away from immediately.
    pub async fn set_restrictions(&self, restrictions: Restrictions) -> PlayerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        inner.restrictions = restrictions;
        let result = apply_restrictions(&mut inner);
        if let Err(e) = &result {
            self.publish_error(e);
        }
        result
    }

    pub async fn restrictions(&self) -> Restrictions {
        self.inner.lock().await.restrictions
    }

    pub async fn is_live(&self) -> bool {
        self.inner.lock().await.is_live()
    }

    /// Seconds of buffer needed before playback resumes.
    pub async fn resume_threshold(&self) -> f64 {
        let inner = self.inner.lock().await;
        inner.manifest.as_ref().map_or(0.0, |m| m.min_buffer_time)
    }

    /// Tear everything down. Idempotent; after this every operation is a
    /// no-op or returns `Destroyed`.
    pub async fn destroy(&self) {
        self.cancel.cancel();
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }
        for (_, stream) in inner.streams.drain() {
            stream.destroy();
        }
        inner.peers.clear();
        inner.active_set.clear();
        inner.manifest = None;
        inner.sink = None;
        inner.destroyed = true;
        tracing::debug!("coordinator destroyed");
    }

    fn publish_error(&self, error: &PlayerError) {
        if matches!(error, PlayerError::Aborted) {
            return;
        }
        self.bus.publish(PlayerEvent::Error {
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }

    fn arm_update_timer(&self, inner: &mut Inner) {
        if inner.update_armed || !inner.is_live() {
            return;
        }
        let Some(source) = inner.manifest_source.clone() else {
            return;
        };
        let has_period = inner
            .manifest
            .as_ref()
            .is_some_and(|m| m.update_period.is_some());
        if !has_period {
            return;
        }
        inner.update_armed = true;
        tokio::spawn(run_update_loop(
            Arc::clone(&self.inner),
            self.bus.clone(),
            self.cancel.clone(),
            source,
        ));
    }
}

fn find_set(manifest: &Manifest, id: SetId) -> Option<&StreamSet> {
    manifest
        .periods
        .first()?
        .stream_sets
        .iter()
        .find(|s| s.id == id)
}

fn set_mime(set: &StreamSet) -> Option<weft_core::BasicMime> {
    set.streams
        .first()
        .and_then(|info| basic_mime(&info.full_mime_type))
}

/// Compute `sets_by_type`: DRM filtering, the selection policy (one video
/// set, MIME-compatible audio sets, all text sets), and language ordering.
fn select_configurations_inner(
    inner: &mut Inner,
    chosen: &HashMap<ContentType, Option<DrmScheme>>,
) -> PlayerResult<()> {
    let preferred = inner.preferred_language.clone();
    let manifest = inner.manifest.as_ref().ok_or(PlayerError::NotLoaded)?;
    let period = manifest.periods.first().ok_or(PlayerError::NotLoaded)?;

    let mut sets_by_type: HashMap<ContentType, Vec<SetId>> = HashMap::new();
    let mut audio_lang_matched = false;

    for content_type in ContentType::ALL {
        let mut eligible: Vec<&StreamSet> = period
            .stream_sets
            .iter()
            .filter(|set| set.content_type == content_type)
            .filter(|set| match chosen.get(&content_type) {
                Some(Some(scheme)) => set.drm_schemes.contains(scheme),
                Some(None) => set.drm_schemes.is_empty(),
                None => true,
            })
            .collect();

        match content_type {
            // Exactly one video set.
            ContentType::Video => eligible.truncate(1),
            // Audio keeps the sets sharing the first chosen set's basic
            // MIME type.
            ContentType::Audio => {
                if let Some(reference) = eligible.first().copied().and_then(set_mime) {
                    eligible.retain(|set| set_mime(set).as_ref() == Some(&reference));
                }
            }
            // All text sets.
            ContentType::Text => {}
        }

        // Best language match (or the main-flagged set) moves to the front.
        if content_type != ContentType::Video && !eligible.is_empty() {
            let owned: Vec<StreamSet> = eligible.iter().map(|s| (*s).clone()).collect();
            if let Some(best) = select_preferred(preferred.as_deref(), &owned) {
                let best_set = eligible.remove(best);
                eligible.insert(0, best_set);
            }
            if content_type == ContentType::Audio {
                audio_lang_matched = match (preferred.as_deref(), eligible.first()) {
                    (Some(p), Some(front)) => front
                        .lang
                        .as_deref()
                        .and_then(|lang| match_level(p, lang))
                        .is_some(),
                    _ => false,
                };
            }
        }

        if !eligible.is_empty() {
            sets_by_type.insert(content_type, eligible.iter().map(|s| s.id).collect());
        }
    }

    inner.sets_by_type = sets_by_type;
    // Subtitles are only shown by default when the audio cannot serve the
    // preferred language.
    if preferred.is_some() {
        inner.text_enabled = !audio_lang_matched && inner.sets_by_type.contains_key(&ContentType::Text);
    }
    inner.configured = true;
    inner.bus.publish(PlayerEvent::TracksChanged);
    Ok(())
}

/// Spawn one stream for `content_type` using the front set of its eligible
/// list. Returns false when the type has nothing playable.
fn spawn_type_stream(
    inner: &mut Inner,
    content_type: ContentType,
    cancel: &CancellationToken,
) -> bool {
    let Some(manifest) = inner.manifest.as_ref() else {
        return false;
    };
    let Some(set_id) = inner
        .sets_by_type
        .get(&content_type)
        .and_then(|ids| ids.first())
        .copied()
    else {
        return false;
    };
    let Some(set) = find_set(manifest, set_id) else {
        return false;
    };
    let enabled: Vec<&StreamInfo> = set.streams.iter().filter(|i| i.enabled).collect();
    if enabled.is_empty() {
        return false;
    }

    // Initial pick per type: ABR for video, middle for audio, first for
    // text.
    let initial = match content_type {
        ContentType::Video => {
            let candidates: Vec<Candidate> = enabled
                .iter()
                .map(|i| Candidate {
                    track: i.id,
                    bandwidth_bps: i.bandwidth_bps,
                })
                .collect();
            let estimate = inner.estimator.lock().estimate_bps();
            let picked = inner.abr.lock().initial_video(estimate, &candidates);
            match picked.and_then(|id| enabled.iter().find(|i| i.id == id)) {
                Some(info) => (*info).clone(),
                None => return false,
            }
        }
        ContentType::Audio => enabled[enabled.len() / 2].clone(),
        ContentType::Text => enabled[0].clone(),
    };

    let Some(sink) = inner.sink.clone() else {
        return false;
    };
    let peers = Arc::new(SyncMutex::new(set.streams.clone()));
    let kind = manifest.kind;
    let min_buffer_time = manifest.min_buffer_time;
    inner.peers.insert(content_type, Arc::clone(&peers));
    inner.active_set.insert(content_type, set_id);

    let ctx = StreamContext {
        content_type,
        kind,
        min_buffer_time,
        behind: inner.params.behind_buffer,
        ahead: inner.params.ahead_buffer,
        fetcher: Arc::clone(&inner.fetcher),
        retry: inner.params.retry.clone(),
        sink,
        clock: Arc::clone(&inner.clock),
        estimator: Arc::clone(&inner.estimator),
        abr: (content_type == ContentType::Video).then(|| Arc::clone(&inner.abr)),
        peers,
        bus: inner.bus.clone(),
        msg_tx: inner.msg_tx.clone(),
        command_capacity: inner.params.command_capacity,
        cancel: cancel.child_token(),
    };

    tracing::debug!(content_type = %content_type, track = %initial.id, "spawning stream");
    inner
        .streams
        .insert(content_type, MediaStream::spawn(ctx, initial));
    true
}

/// Start sequence: pick an initial representation per type, materialize the
/// segment indices in parallel, validate the play window, freeze playback,
/// seek to the window edge, and spawn the streams. The message pump
/// completes the sequence once every stream reports `started`.
async fn start_streams(inner: &mut Inner, cancel: &CancellationToken) -> PlayerResult<()> {
    let manifest = inner.manifest()?;
    let kind = manifest.kind;
    let min_buffer_time = manifest.min_buffer_time;
    let period_duration = manifest.periods.first().and_then(|p| p.duration);

    let mut types: Vec<ContentType> = Vec::new();
    for content_type in ContentType::ALL {
        if content_type == ContentType::Text && !inner.text_enabled {
            continue;
        }
        if inner.sets_by_type.contains_key(&content_type) {
            types.push(content_type);
        }
    }
    if types.is_empty() {
        return Err(PlayerError::StreamsNotAvailable);
    }

    // Materialize the indices of every enabled candidate in the first set
    // of each type. Sets are time-aligned, so the window over these equals
    // the window over the initial picks, and later switches find their
    // indices ready.
    let mut sources = Vec::new();
    for content_type in &types {
        let set_id = inner.sets_by_type[content_type][0];
        let set =
            find_set(inner.manifest()?, set_id).ok_or(PlayerError::StreamsNotAvailable)?;
        for info in set.streams.iter().filter(|i| i.enabled) {
            sources.push(Arc::clone(&info.index_source));
        }
    }
    let indices: Vec<SharedIndex> =
        futures::future::try_join_all(sources.iter().map(|source| source.create()))
            .await
            .map_err(PlayerError::Manifest)?;

    if kind == PresentationKind::Dynamic {
        let now_wall = inner.clock.wall_secs();
        for source in &sources {
            source.refresh(now_wall);
        }
    }

    let window = compute_play_window(&indices, kind, min_buffer_time, period_duration)
        .ok_or(PlayerError::StreamsNotAvailable)?;

    let sink = inner.sink.clone().ok_or(PlayerError::NotLoaded)?;
    inner.original_rate = sink.playback_rate();
    sink.set_playback_rate(0.0);
    sink.set_duration(period_duration.unwrap_or(window.end));

    let target = if kind == PresentationKind::Dynamic {
        window.end
    } else {
        window.start
    };
    inner.seek_target = target;
    sink.seek(target);
    tracing::debug!(start = window.start, end = window.end, target, "play window");

    inner.pending_corrections.clear();
    inner.start_error = None;
    let mut spawned = 0;
    for content_type in types {
        if spawn_type_stream(inner, content_type, cancel) {
            spawned += 1;
        }
    }
    if spawned == 0 {
        return Err(PlayerError::StreamsNotAvailable);
    }
    inner.awaiting_start = spawned;
    Ok(())
}

/// Finish the start sequence once every stream has reported `started`:
/// compute the global correction, apply it to every known index, nudge the
/// sink playhead, restore the playback rate, and arm the seek listener.
fn finish_start(inner_arc: &Arc<Mutex<Inner>>, inner: &mut Inner, cancel: &CancellationToken) {
    let corrections = std::mem::take(&mut inner.pending_corrections);
    inner.awaiting_start = 0;

    let max_correction = corrections
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let min_correction = corrections.iter().copied().fold(f64::INFINITY, f64::min);
    if max_correction * min_correction < 0.0 {
        tracing::warn!(
            max_correction,
            min_correction,
            "timestamp corrections disagree in sign"
        );
    }

    if let Some(manifest) = inner.manifest.as_ref() {
        for period in &manifest.periods {
            for set in &period.stream_sets {
                for info in &set.streams {
                    info.index_source.apply_correction(max_correction);
                }
            }
        }
    }

    // The listener must be armed before the correction seek so that exactly
    // that seek is the one it ignores.
    let will_seek = max_correction != 0.0;
    arm_seek_listener(inner_arc, inner, cancel, will_seek);

    if let Some(sink) = inner.sink.as_ref() {
        if will_seek {
            sink.seek(inner.seek_target + max_correction);
        }
        sink.set_playback_rate(inner.original_rate);
    }

    tracing::debug!(max_correction, "all streams started");
    inner.bus.publish(PlayerEvent::TracksChanged);
    inner.start_notify.notify_one();
}

/// Re-evaluate `enabled` across every representation and move playing
/// streams off representations that restrictions just excluded.
fn apply_restrictions(inner: &mut Inner) -> PlayerResult<()> {
    let restrictions = inner.restrictions;
    {
        let Some(manifest) = inner.manifest.as_mut() else {
            return Ok(());
        };
        for period in &mut manifest.periods {
            for set in &mut period.stream_sets {
                for info in &mut set.streams {
                    info.enabled = restrictions.allows(info);
                }
            }
        }
    }

    for content_type in ContentType::ALL {
        inner.refresh_peers(content_type);
    }

    // Streams playing a representation that just got disabled must move.
    let mut switches: Vec<(ContentType, TrackId, StreamInfo, Option<SetId>)> = Vec::new();
    {
        let Some(manifest) = inner.manifest.as_ref() else {
            return Ok(());
        };
        for (content_type, stream) in &inner.streams {
            let active_id = stream.active_track();
            let Some(set_id) = inner.active_set.get(content_type).copied() else {
                continue;
            };
            let Some(set) = find_set(manifest, set_id) else {
                continue;
            };
            let Some(active_info) = set.streams.iter().find(|i| i.id == active_id) else {
                continue;
            };
            if active_info.enabled {
                continue;
            }

            let current_bw = active_info.bandwidth_bps;
            // Best enabled peer in the same set, then any other set of the
            // same type.
            let mut replacement = closest_enabled(set, current_bw).map(|info| (info, None));
            if replacement.is_none() {
                if let Some(ids) = inner.sets_by_type.get(content_type) {
                    for other_id in ids.iter().filter(|id| **id != set_id) {
                        if let Some(info) = find_set(manifest, *other_id)
                            .and_then(|other| closest_enabled(other, current_bw))
                        {
                            replacement = Some((info, Some(*other_id)));
                            break;
                        }
                    }
                }
            }

            match replacement {
                Some((info, new_set)) => switches.push((*content_type, active_id, info, new_set)),
                None => return Err(PlayerError::NoPlayableStream),
            }
        }
    }

    for (content_type, from, info, new_set) in switches {
        if let Some(set_id) = new_set {
            inner.active_set.insert(content_type, set_id);
            inner.refresh_peers(content_type);
        }
        tracing::debug!(
            content_type = %content_type,
            from = %from,
            to = %info.id,
            "restriction forced a switch"
        );
        inner.bus.publish(PlayerEvent::Adaptation {
            content_type,
            from,
            to: info.id,
            reason: AbrReason::ManualOverride,
        });
        if let Some(stream) = inner.streams.get(&content_type) {
            stream.switch(info, true);
        }
    }

    inner.bus.publish(PlayerEvent::TracksChanged);
    Ok(())
}

fn closest_enabled(set: &StreamSet, bandwidth: u64) -> Option<StreamInfo> {
    set.streams
        .iter()
        .filter(|i| i.enabled)
        .min_by_key(|i| i.bandwidth_bps.abs_diff(bandwidth))
        .cloned()
}

/// Ongoing stream message handling: startup completion, end of stream,
/// fetch failures.
async fn run_msg_pump(
    inner_arc: Arc<Mutex<Inner>>,
    bus: EventBus,
    cancel: CancellationToken,
    mut msg_rx: mpsc::Receiver<StreamMsg>,
) {
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = msg_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let mut inner = inner_arc.lock().await;
        if inner.destroyed {
            break;
        }
        match msg {
            StreamMsg::Started {
                content_type,
                correction,
            } => {
                tracing::debug!(content_type = %content_type, correction, "stream started");
                if inner.awaiting_start > 0 {
                    inner.pending_corrections.push(correction);
                    if inner.pending_corrections.len() >= inner.awaiting_start {
                        finish_start(&inner_arc, &mut inner, &cancel);
                    }
                }
            }
            StreamMsg::Ended { content_type } => {
                inner.ended.insert(content_type);
                let all_ended = !inner.streams.is_empty()
                    && inner.streams.keys().all(|ct| inner.ended.contains(ct));
                if all_ended && !inner.is_live() {
                    if let Some(sink) = inner.sink.as_ref() {
                        if sink.ready_state() == SinkReadyState::Open {
                            tracing::debug!("all streams ended, signalling end of stream");
                            sink.end_of_stream();
                        }
                    }
                }
            }
            StreamMsg::Failed {
                content_type,
                error,
            } => {
                if matches!(error, PlayerError::Aborted) {
                    continue;
                }
                // A failure before startup completes fails the attach.
                if inner.awaiting_start > 0
                    && inner.pending_corrections.len() < inner.awaiting_start
                    && !inner.is_live()
                {
                    inner.awaiting_start = 0;
                    inner.start_error = Some(error);
                    inner.start_notify.notify_one();
                    continue;
                }
                bus.publish(PlayerEvent::Error {
                    kind: error.kind().to_string(),
                    message: error.to_string(),
                });
                // Live fetch failures: ask the stream to skip ahead.
                if inner.is_live() && matches!(error, PlayerError::StreamFetch { .. }) {
                    if let Some(stream) = inner.streams.get(&content_type) {
                        stream.resync();
                    }
                }
            }
        }
    }
}

/// Resync every stream when the sink seeks. When `skip_first` is set, the
/// first observed seek is the one the coordinator itself is about to issue
/// and is ignored.
fn arm_seek_listener(
    inner_arc: &Arc<Mutex<Inner>>,
    inner: &mut Inner,
    cancel: &CancellationToken,
    skip_first: bool,
) {
    if inner.seek_armed {
        return;
    }
    let Some(sink) = inner.sink.as_ref() else {
        return;
    };
    inner.seek_armed = true;

    let mut events = sink.subscribe();
    let inner_arc = Arc::clone(inner_arc);
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let mut skip_next = skip_first;
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(SinkEvent::Seeking { position }) => {
                    if skip_next {
                        skip_next = false;
                        continue;
                    }
                    let inner = inner_arc.lock().await;
                    if inner.destroyed {
                        break;
                    }
                    tracing::debug!(position, "sink seeking, resyncing streams");
                    for stream in inner.streams.values() {
                        stream.resync();
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
    });
}

/// Live manifest refresh loop. Serialized by construction: one task, one
/// update in flight, a second timer fire coalesces into the next iteration.
async fn run_update_loop(
    inner_arc: Arc<Mutex<Inner>>,
    bus: EventBus,
    cancel: CancellationToken,
    source: Arc<dyn ManifestSource>,
) {
    let clock = inner_arc.lock().await.clock.clone();
    let mut last_fetch: Option<std::time::Instant> = None;
    loop {
        let delay = {
            let inner = inner_arc.lock().await;
            if inner.destroyed {
                break;
            }
            let period = inner
                .manifest
                .as_ref()
                .and_then(|m| m.update_period)
                .unwrap_or(10.0);
            let elapsed = last_fetch.map_or(0.0, |at| {
                clock.monotonic().duration_since(at).as_secs_f64()
            });
            // A failed start (no common play window yet) retries at the
            // floor instead of waiting a whole period.
            let interval = if inner.streams.is_empty() && inner.sink.is_some() {
                inner.params.min_update_delay
            } else {
                period - elapsed
            };
            Duration::from_secs_f64(interval.max(inner.params.min_update_delay))
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(delay) => {}
        }

        let url = {
            let inner = inner_arc.lock().await;
            if inner.destroyed {
                break;
            }
            inner.manifest.as_ref().and_then(|m| m.update_url.clone())
        };

        let fetched = source.fetch_manifest(url.as_ref()).await;
        last_fetch = Some(clock.monotonic());
        let new_manifest = match fetched {
            Ok(manifest) => manifest,
            Err(PlayerError::Aborted) => break,
            Err(error) => {
                tracing::warn!(%error, "manifest refetch failed");
                bus.publish(PlayerEvent::Error {
                    kind: error.kind().to_string(),
                    message: error.to_string(),
                });
                continue; // reschedule regardless
            }
        };

        let mut inner = inner_arc.lock().await;
        if inner.destroyed {
            break;
        }
        if let Err(error) = reconcile_update(&mut inner, new_manifest, &cancel).await {
            tracing::warn!(%error, "manifest update could not be applied");
            bus.publish(PlayerEvent::Error {
                kind: error.kind().to_string(),
                message: error.to_string(),
            });
        }
    }
}

/// Apply one fetched manifest: process, merge, move streams off removed
/// representations, re-apply restrictions, and retry a failed start.
async fn reconcile_update(
    inner: &mut Inner,
    mut new_manifest: Manifest,
    cancel: &CancellationToken,
) -> PlayerResult<()> {
    let supports = inner.params.type_support.clone();
    match &supports {
        Some(predicate) => process_manifest(&mut new_manifest, &|mime| predicate(mime))?,
        None => process_manifest(&mut new_manifest, &|_| true)?,
    }

    let old = inner.manifest.as_mut().ok_or(PlayerError::NotLoaded)?;
    let removed = merge_update(old, new_manifest).await?;

    // Streams playing a removed representation switch to a survivor.
    for info in &removed {
        for (content_type, stream) in &inner.streams {
            if stream.active_track() != info.id {
                continue;
            }
            let manifest = inner.manifest.as_ref().expect("manifest present");
            let replacement = inner
                .active_set
                .get(content_type)
                .and_then(|set_id| find_set(manifest, *set_id))
                .and_then(|set| closest_enabled(set, info.bandwidth_bps));
            match replacement {
                Some(next) => {
                    tracing::debug!(
                        content_type = %content_type,
                        from = %info.id,
                        to = %next.id,
                        "active representation removed by update"
                    );
                    inner.bus.publish(PlayerEvent::Adaptation {
                        content_type: *content_type,
                        from: info.id,
                        to: next.id,
                        reason: AbrReason::ManualOverride,
                    });
                    stream.switch(next, true);
                }
                None => {
                    tracing::warn!(
                        content_type = %content_type,
                        track = %info.id,
                        "active representation removed with no surviving peer"
                    );
                }
            }
        }
    }

    // Peer lists follow the updated manifest.
    for content_type in ContentType::ALL {
        inner.refresh_peers(content_type);
    }

    apply_restrictions(inner)?;

    // An earlier start that found no common window gets another chance.
    if inner.streams.is_empty() && inner.sink.is_some() {
        match start_streams(inner, cancel).await {
            Ok(()) => {}
            Err(PlayerError::StreamsNotAvailable) => {
                tracing::debug!("play window still unavailable after update");
            }
            Err(e) => return Err(e),
        }
    }

    inner.bus.publish(PlayerEvent::TracksChanged);
    Ok(())
}
