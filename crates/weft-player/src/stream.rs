//! Per-type fetch/append state machine.
//!
//! One `MediaStream` exists per active content type. Its task fetches
//! segments for the current representation, appends them to the shared
//! sink, evicts media outside the buffer window, and consults ABR at
//! segment boundaries. Switching, resync, and destruction arrive as
//! commands; lifecycle results flow back to the coordinator as messages.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    time::{sleep, Duration},
};
use tokio_util::sync::CancellationToken;
use weft_abr::{AbrManager, BandwidthEstimator, Candidate, ThroughputSample};
use weft_core::{ContentType, TrackId};
use weft_events::{AbrEvent, EventBus, PlayerEvent};
use weft_manifest::{PresentationKind, StreamInfo};
use weft_net::{Fetcher, NetError, RetryFetcher, RetryPolicy};

use crate::{clock::Clock, error::PlayerError, sink::MediaSink};

/// An immediate switch clears buffered media from `playhead + SWITCH_EPS`.
const SWITCH_EPS: f64 = 0.1;
/// Poll interval while waiting for buffer drain or live index growth.
const IDLE_POLL: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Starting,
    Buffering,
    Playing,
    Switching,
    Ended,
    Destroyed,
}

/// Commands from the coordinator to a stream task.
pub(crate) enum StreamCommand {
    Switch { info: StreamInfo, immediate: bool },
    Resync,
}

/// Lifecycle messages from a stream task to the coordinator.
#[derive(Debug)]
pub(crate) enum StreamMsg {
    Started {
        content_type: ContentType,
        correction: f64,
    },
    Ended {
        content_type: ContentType,
    },
    Failed {
        content_type: ContentType,
        error: PlayerError,
    },
}

/// Everything a stream task needs, wired up by the coordinator.
pub(crate) struct StreamContext {
    pub content_type: ContentType,
    pub kind: PresentationKind,
    pub min_buffer_time: f64,
    pub behind: f64,
    pub ahead: f64,
    pub fetcher: Arc<dyn Fetcher>,
    pub retry: RetryPolicy,
    pub sink: Arc<dyn MediaSink>,
    pub clock: Arc<dyn Clock>,
    pub estimator: Arc<Mutex<BandwidthEstimator>>,
    /// Present for the adapting type (video) only.
    pub abr: Option<Arc<Mutex<AbrManager>>>,
    /// Enabled representations of the active stream set, kept fresh by the
    /// coordinator across restrictions and updates.
    pub peers: Arc<Mutex<Vec<StreamInfo>>>,
    pub bus: EventBus,
    pub msg_tx: mpsc::Sender<StreamMsg>,
    pub command_capacity: usize,
    pub cancel: CancellationToken,
}

/// Handle to one per-type stream task, exclusively owned by the
/// coordinator.
pub(crate) struct MediaStream {
    cmd_tx: mpsc::Sender<StreamCommand>,
    cancel: CancellationToken,
    phase: Arc<Mutex<StreamPhase>>,
    active: Arc<Mutex<TrackId>>,
}

impl MediaStream {
    pub fn spawn(ctx: StreamContext, initial: StreamInfo) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(ctx.command_capacity.max(1));
        let phase = Arc::new(Mutex::new(StreamPhase::Idle));
        let active = Arc::new(Mutex::new(initial.id));
        let cancel = ctx.cancel.clone();

        let task_phase = Arc::clone(&phase);
        let task_active = Arc::clone(&active);
        tokio::spawn(run(ctx, cmd_rx, initial, task_phase, task_active));

        Self {
            cmd_tx,
            cancel,
            phase,
            active,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        *self.phase.lock()
    }

    pub fn active_track(&self) -> TrackId {
        *self.active.lock()
    }

    /// Request a representation switch. The active track is updated
    /// eagerly so listings reflect the selection immediately.
    pub fn switch(&self, info: StreamInfo, immediate: bool) {
        *self.active.lock() = info.id;
        let _ = self.cmd_tx.try_send(StreamCommand::Switch { info, immediate });
    }

    /// Relocate to the reference containing the playhead.
    pub fn resync(&self) {
        let _ = self.cmd_tx.try_send(StreamCommand::Resync);
    }

    pub fn destroy(&self) {
        self.cancel.cancel();
        *self.phase.lock() = StreamPhase::Destroyed;
    }
}

/// What the fetch loop should do after a command.
enum Step {
    /// Re-enter the representation loop, recomputing position from the
    /// playhead.
    Restart,
    Continue,
}

struct TaskState {
    current: StreamInfo,
    phase: Arc<Mutex<StreamPhase>>,
    active: Arc<Mutex<TrackId>>,
    started: bool,
    /// Switch queued for the next segment boundary.
    pending: Option<StreamInfo>,
}

impl TaskState {
    fn set_phase(&self, phase: StreamPhase) {
        *self.phase.lock() = phase;
    }

    fn handle_command(
        &mut self,
        cmd: StreamCommand,
        ctx: &StreamContext,
        track_handle: Option<usize>,
    ) -> Step {
        match cmd {
            StreamCommand::Switch { info, immediate } => {
                tracing::debug!(
                    content_type = %ctx.content_type,
                    to = %info.id,
                    immediate,
                    "switch requested"
                );
                if immediate {
                    self.set_phase(StreamPhase::Switching);
                    if let Some(handle) = track_handle {
                        clear_forward(ctx.sink.as_ref(), handle);
                    }
                    self.current = info;
                    self.pending = None;
                    Step::Restart
                } else {
                    self.pending = Some(info);
                    Step::Continue
                }
            }
            StreamCommand::Resync => {
                tracing::debug!(content_type = %ctx.content_type, "resync requested");
                self.set_phase(StreamPhase::Buffering);
                Step::Restart
            }
        }
    }
}

async fn run(
    ctx: StreamContext,
    mut cmd_rx: mpsc::Receiver<StreamCommand>,
    initial: StreamInfo,
    phase: Arc<Mutex<StreamPhase>>,
    active: Arc<Mutex<TrackId>>,
) {
    let mut state = TaskState {
        current: initial,
        phase,
        active,
        started: false,
        pending: None,
    };
    let fetcher = RetryFetcher::new(Arc::clone(&ctx.fetcher), ctx.retry.clone());

    let mut track_handle = None;
    // Segment index to resume at after a boundary switch; `None` derives the
    // position from the playhead.
    let mut resume_at: Option<u64> = None;

    'representation: loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        state.set_phase(if state.started {
            StreamPhase::Buffering
        } else {
            StreamPhase::Starting
        });
        *state.active.lock() = state.current.id;

        let index = match state.current.index_source.create().await {
            Ok(index) => index,
            Err(e) => {
                fail(&ctx, PlayerError::Manifest(e)).await;
                break;
            }
        };

        let handle = match track_handle {
            Some(handle) => handle,
            None => match ctx.sink.add_track(&state.current.full_mime_type) {
                Ok(handle) => {
                    track_handle = Some(handle);
                    handle
                }
                Err(e) => {
                    fail(&ctx, PlayerError::AppendFailed(e.to_string())).await;
                    break;
                }
            },
        };
        let _ = ctx
            .sink
            .set_timestamp_offset(handle, state.current.timestamp_offset);

        // Initialization bytes, when the container needs them.
        if let Some(init) = state.current.init_source.clone() {
            let bytes = tokio::select! {
                () = ctx.cancel.cancelled() => break 'representation,
                r = fetcher.fetch(init.url, init.byte_range) => r,
            };
            match bytes {
                Ok(bytes) => {
                    if let Err(e) = ctx.sink.append(handle, bytes) {
                        fail(&ctx, PlayerError::AppendFailed(e.to_string())).await;
                        break;
                    }
                }
                Err(NetError::Aborted) => break,
                Err(e) => {
                    fail(&ctx, e.into()).await;
                    break;
                }
            }
        }

        let mut next = match resume_at.take() {
            Some(index) => index,
            None => {
                let playhead = ctx.sink.position();
                let locked = index.lock();
                match locked.find(playhead).or_else(|| locked.first()) {
                    Some(r) => r.index,
                    // Empty index: for live the refresh below may fill it.
                    None => 0,
                }
            }
        };

        loop {
            if ctx.cancel.is_cancelled() {
                break 'representation;
            }

            // Commands take priority over fetching.
            while let Ok(cmd) = cmd_rx.try_recv() {
                match state.handle_command(cmd, &ctx, track_handle) {
                    Step::Restart => continue 'representation,
                    _ => {}
                }
            }

            // Backpressure: never fetch past the ahead window.
            let playhead = ctx.sink.position();
            if let Some((_, buffered_end)) = ctx.sink.buffered(handle) {
                if buffered_end - playhead >= ctx.ahead {
                    tokio::select! {
                        () = ctx.cancel.cancelled() => break 'representation,
                        cmd = cmd_rx.recv() => {
                            let Some(cmd) = cmd else { break 'representation };
                            if let Step::Restart = state.handle_command(cmd, &ctx, track_handle) {
                                continue 'representation;
                            }
                        }
                        () = sleep(IDLE_POLL) => {}
                    }
                    continue;
                }
            }

            let reference = index.lock().by_index(next).cloned();
            let Some(reference) = reference else {
                if ctx.kind == PresentationKind::Static {
                    if state.started {
                        state.set_phase(StreamPhase::Ended);
                        ctx.bus.publish(PlayerEvent::Ended {
                            content_type: ctx.content_type,
                        });
                        let _ = ctx
                            .msg_tx
                            .send(StreamMsg::Ended {
                                content_type: ctx.content_type,
                            })
                            .await;
                    }
                    break 'representation;
                }
                // Live: wait for the index to grow past the tail.
                state.current.index_source.refresh(ctx.clock.wall_secs());
                if index.lock().by_index(next).is_none() {
                    tokio::select! {
                        () = ctx.cancel.cancelled() => break 'representation,
                        cmd = cmd_rx.recv() => {
                            let Some(cmd) = cmd else { break 'representation };
                            if let Step::Restart = state.handle_command(cmd, &ctx, track_handle) {
                                continue 'representation;
                            }
                        }
                        () = sleep(IDLE_POLL) => {}
                    }
                    // The head may have been evicted while we waited.
                    if let Some(first) = index.lock().first() {
                        if first.index > next {
                            next = first.index;
                        }
                    }
                }
                continue;
            };

            let fetch_started = ctx.clock.monotonic();
            let result = tokio::select! {
                () = ctx.cancel.cancelled() => Err(NetError::Aborted),
                r = fetcher.fetch(reference.url.clone(), reference.byte_range) => r,
            };
            let bytes = match result {
                Ok(bytes) => bytes,
                Err(NetError::Aborted) => break 'representation,
                Err(e) => {
                    let error: PlayerError = e.into();
                    tracing::warn!(
                        content_type = %ctx.content_type,
                        segment = reference.index,
                        %error,
                        "segment fetch failed after retries"
                    );
                    let _ = ctx
                        .msg_tx
                        .send(StreamMsg::Failed {
                            content_type: ctx.content_type,
                            error,
                        })
                        .await;
                    if ctx.kind == PresentationKind::Static {
                        break 'representation;
                    }
                    // Live: skip the unfetchable segment and keep going.
                    next = reference.index + 1;
                    continue;
                }
            };

            let elapsed = ctx.clock.monotonic().duration_since(fetch_started);
            let estimate = {
                let mut estimator = ctx.estimator.lock();
                estimator.push_sample(ThroughputSample {
                    bytes: bytes.len() as u64,
                    duration: elapsed,
                });
                estimator.estimate_bps()
            };
            if let Some(bits_per_second) = estimate {
                ctx.bus.publish(AbrEvent::Bandwidth { bits_per_second });
            }

            if let Err(e) = ctx.sink.append(handle, bytes) {
                fail(&ctx, PlayerError::AppendFailed(e.to_string())).await;
                break 'representation;
            }

            if !state.started {
                state.started = true;
                // The container's first PTS may disagree with the index.
                let observed = ctx
                    .sink
                    .buffered(handle)
                    .map_or(reference.start_time, |(start, _)| start);
                let correction = observed - reference.start_time;
                state.set_phase(StreamPhase::Buffering);
                ctx.bus.publish(PlayerEvent::Started {
                    content_type: ctx.content_type,
                    timestamp_correction: correction,
                });
                let _ = ctx
                    .msg_tx
                    .send(StreamMsg::Started {
                        content_type: ctx.content_type,
                        correction,
                    })
                    .await;
            }

            let playhead = ctx.sink.position();
            let _ = ctx
                .sink
                .evict(handle, f64::NEG_INFINITY..(playhead - ctx.behind));

            if *state.phase.lock() != StreamPhase::Playing {
                if let Some((_, buffered_end)) = ctx.sink.buffered(handle) {
                    if buffered_end - playhead >= ctx.min_buffer_time {
                        state.set_phase(StreamPhase::Playing);
                    }
                }
            }

            if let Some(abr) = &ctx.abr {
                if let Some(target) = consult_abr(&ctx, abr, state.current.id) {
                    ctx.bus.publish(PlayerEvent::Adaptation {
                        content_type: ctx.content_type,
                        from: state.current.id,
                        to: target.0.id,
                        reason: target.1,
                    });
                    state.pending = Some(target.0);
                }
            }

            next = reference.index + 1;

            if let Some(info) = state.pending.take() {
                state.current = info;
                resume_at = Some(next);
                continue 'representation;
            }
        }
    }

    if ctx.cancel.is_cancelled() {
        state.set_phase(StreamPhase::Destroyed);
    }
}

/// Run one ABR consult; returns the new representation when a switch is due.
fn consult_abr(
    ctx: &StreamContext,
    abr: &Arc<Mutex<AbrManager>>,
    current: TrackId,
) -> Option<(StreamInfo, weft_abr::AbrReason)> {
    let candidates: Vec<Candidate> = ctx
        .peers
        .lock()
        .iter()
        .filter(|p| p.enabled)
        .map(|p| Candidate {
            track: p.id,
            bandwidth_bps: p.bandwidth_bps,
        })
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let estimate = ctx.estimator.lock().estimate_bps();
    let mut abr = abr.lock();
    let decision = abr.choose(estimate, current, &candidates, ctx.clock.monotonic());
    if !decision.changed {
        return None;
    }
    let info = ctx.peers.lock().iter().find(|p| p.id == decision.target).cloned()?;
    abr.apply(&decision);
    Some((info, decision.reason))
}

async fn fail(ctx: &StreamContext, error: PlayerError) {
    tracing::warn!(content_type = %ctx.content_type, %error, "stream failed");
    let _ = ctx
        .msg_tx
        .send(StreamMsg::Failed {
            content_type: ctx.content_type,
            error,
        })
        .await;
}

/// Clear buffered media from just past the playhead; used by immediate
/// switches before the new representation appends.
pub(crate) fn clear_forward(sink: &dyn MediaSink, handle: usize) {
    let from = sink.position() + SWITCH_EPS;
    let _ = sink.evict(handle, from..f64::INFINITY);
}
