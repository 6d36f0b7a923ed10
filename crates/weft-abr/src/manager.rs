use std::time::Instant;

use weft_core::TrackId;

use crate::{AbrOptions, Candidate};

/// Why a decision came out the way it did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AbrReason {
    Initial,
    /// Switch requested by the embedder or forced by restrictions rather
    /// than decided from the estimate.
    ManualOverride,
    Disabled,
    NoEstimate,
    UpSwitch,
    /// Upswitch target identified but the sustain window has not elapsed.
    UpPending,
    DownSwitch,
    AlreadyOptimal,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AbrDecision {
    pub target: TrackId,
    pub reason: AbrReason,
    pub changed: bool,
}

impl AbrDecision {
    fn hold(current: TrackId, reason: AbrReason) -> Self {
        Self {
            target: current,
            reason,
            changed: false,
        }
    }
}

/// Chooses representations from a bandwidth estimate.
///
/// Upswitches require the estimate to sit above the target bitrate (times
/// the hysteresis ratio) for a sustained window; downswitches fire
/// immediately once the estimate falls below the current bitrate times the
/// down ratio. When disabled, [`AbrManager::choose`] always holds.
pub struct AbrManager {
    opts: AbrOptions,
    enabled: bool,
    /// Upswitch target and the instant its headroom was first observed.
    up_pending: Option<(TrackId, Instant)>,
}

impl AbrManager {
    #[must_use]
    pub fn new(opts: AbrOptions) -> Self {
        Self {
            opts,
            enabled: true,
            up_pending: None,
        }
    }

    pub fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.up_pending = None;
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Starting representation: highest bitrate fitting within the usable
    /// share of the estimate, otherwise the lowest available.
    #[must_use]
    pub fn initial_video(
        &self,
        estimate_bps: Option<u64>,
        candidates: &[Candidate],
    ) -> Option<TrackId> {
        let usable = estimate_bps.unwrap_or(0) as f64 * self.opts.bandwidth_safety_factor;
        let picked = candidates
            .iter()
            .filter(|c| (c.bandwidth_bps as f64) <= usable)
            .max_by_key(|c| c.bandwidth_bps)
            .or_else(|| candidates.iter().min_by_key(|c| c.bandwidth_bps))?;

        tracing::debug!(
            track = %picked.track,
            bandwidth_bps = picked.bandwidth_bps,
            estimate_bps,
            "initial representation"
        );
        Some(picked.track)
    }

    /// Decide whether to switch away from `current`.
    pub fn choose(
        &mut self,
        estimate_bps: Option<u64>,
        current: TrackId,
        candidates: &[Candidate],
        now: Instant,
    ) -> AbrDecision {
        if !self.enabled {
            return AbrDecision::hold(current, AbrReason::Disabled);
        }

        let Some(estimate) = estimate_bps else {
            return AbrDecision::hold(current, AbrReason::NoEstimate);
        };

        let current_bw = candidates
            .iter()
            .find(|c| c.track == current)
            .map_or(0, |c| c.bandwidth_bps);

        let usable = estimate as f64 * self.opts.bandwidth_safety_factor;
        let best = candidates
            .iter()
            .filter(|c| (c.bandwidth_bps as f64) <= usable)
            .max_by_key(|c| c.bandwidth_bps)
            .or_else(|| candidates.iter().min_by_key(|c| c.bandwidth_bps));

        let Some(&best) = best else {
            return AbrDecision::hold(current, AbrReason::AlreadyOptimal);
        };

        if best.track == current || best.bandwidth_bps == current_bw {
            self.up_pending = None;
            return AbrDecision::hold(current, AbrReason::AlreadyOptimal);
        }

        if best.bandwidth_bps > current_bw {
            let headroom_ok =
                estimate as f64 >= best.bandwidth_bps as f64 * self.opts.up_hysteresis_ratio;
            if !headroom_ok {
                self.up_pending = None;
                return AbrDecision::hold(current, AbrReason::AlreadyOptimal);
            }

            match self.up_pending {
                Some((track, since)) if track == best.track => {
                    if now.duration_since(since) >= self.opts.up_sustain {
                        tracing::debug!(from = %current, to = %best.track, estimate, "upswitch");
                        return AbrDecision {
                            target: best.track,
                            reason: AbrReason::UpSwitch,
                            changed: true,
                        };
                    }
                    AbrDecision::hold(current, AbrReason::UpPending)
                }
                _ => {
                    self.up_pending = Some((best.track, now));
                    AbrDecision::hold(current, AbrReason::UpPending)
                }
            }
        } else {
            self.up_pending = None;
            if (estimate as f64) < current_bw as f64 * self.opts.down_hysteresis_ratio {
                tracing::debug!(from = %current, to = %best.track, estimate, "downswitch");
                return AbrDecision {
                    target: best.track,
                    reason: AbrReason::DownSwitch,
                    changed: true,
                };
            }
            AbrDecision::hold(current, AbrReason::AlreadyOptimal)
        }
    }

    /// Record that a decision was acted on.
    pub fn apply(&mut self, decision: &AbrDecision) {
        if decision.changed {
            self.up_pending = None;
        }
    }
}
