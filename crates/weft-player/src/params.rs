use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use weft_abr::AbrOptions;
use weft_net::RetryPolicy;

/// Predicate deciding whether the media sink accepts a full MIME type.
pub type TypeSupport = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Coordinator and stream configuration.
#[derive(Clone)]
pub struct PlayerParams {
    pub abr: AbrOptions,
    /// Retry policy for segment fetches.
    pub retry: RetryPolicy,
    /// Seconds of appended media kept behind the playhead.
    pub behind_buffer: f64,
    /// Seconds fetched and kept ahead of the playhead.
    pub ahead_buffer: f64,
    /// Floor for re-arming the live manifest update timer, in seconds.
    pub min_update_delay: f64,
    /// Seed for the bandwidth estimate before any fetch completes.
    pub initial_bandwidth_bps: Option<u64>,
    /// MIME acceptance predicate; `None` accepts everything.
    pub type_support: Option<TypeSupport>,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Capacity of per-stream command channels.
    pub command_capacity: usize,
    /// Cancellation token for graceful shutdown.
    pub cancel: Option<CancellationToken>,
}

impl Default for PlayerParams {
    fn default() -> Self {
        Self {
            abr: AbrOptions::default(),
            retry: RetryPolicy::default(),
            behind_buffer: 30.0,
            ahead_buffer: 30.0,
            min_update_delay: 3.0,
            initial_bandwidth_bps: None,
            type_support: None,
            event_capacity: 32,
            command_capacity: 8,
            cancel: None,
        }
    }
}

impl PlayerParams {
    #[must_use]
    pub fn with_abr(mut self, abr: AbrOptions) -> Self {
        self.abr = abr;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_buffer_window(mut self, behind: f64, ahead: f64) -> Self {
        self.behind_buffer = behind;
        self.ahead_buffer = ahead;
        self
    }

    #[must_use]
    pub fn with_initial_bandwidth(mut self, bps: u64) -> Self {
        self.initial_bandwidth_bps = Some(bps);
        self
    }

    #[must_use]
    pub fn with_type_support(mut self, supports: TypeSupport) -> Self {
        self.type_support = Some(supports);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}
