//! Adaptive bitrate selection for weft.
//!
//! Two halves, both protocol-agnostic:
//!
//! - [`BandwidthEstimator`]: exponentially-weighted throughput estimate fed
//!   by observed segment fetches.
//! - [`AbrManager`]: turns the estimate plus the current representation into
//!   an [`AbrDecision`], with hysteresis so transient throughput spikes do
//!   not cause oscillation.
//!
//! The manager never performs the switch itself; callers apply the decision
//! and report back via [`AbrManager::apply`].

#![forbid(unsafe_code)]

mod estimator;
mod manager;
mod types;

pub use estimator::{BandwidthEstimator, Estimator};
pub use manager::{AbrDecision, AbrManager, AbrReason};
pub use types::{AbrOptions, Candidate, ThroughputSample};
