use thiserror::Error;
use weft_manifest::ManifestError;
use weft_net::NetError;

pub type PlayerResult<T> = Result<T, PlayerError>;

/// Player-level failures.
///
/// `Aborted` marks cancellation and is swallowed internally; everything
/// else surfaces to the embedder, usually both as a returned error and an
/// `Error` event on the bus.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("operation aborted")]
    Aborted,

    #[error("content already loaded")]
    AlreadyLoaded,

    #[error("no content loaded")]
    NotLoaded,

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Segment fetch failed after retries.
    #[error("segment fetch failed (status {status:?})")]
    StreamFetch { status: Option<u16> },

    /// Selected indices are empty or their play windows are disjoint.
    #[error("selected streams share no play window")]
    StreamsNotAvailable,

    #[error("restrictions exclude every representation")]
    NoPlayableStream,

    #[error("media sink rejected appended bytes: {0}")]
    AppendFailed(String),

    #[error("player destroyed")]
    Destroyed,
}

impl PlayerError {
    /// Stable kind tag used in `Error` events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Aborted => "Aborted",
            Self::AlreadyLoaded => "AlreadyLoaded",
            Self::NotLoaded => "NotLoaded",
            Self::Manifest(ManifestError::Empty) => "ManifestEmpty",
            Self::Manifest(ManifestError::Incompatible(_)) => "ManifestIncompatible",
            Self::Manifest(ManifestError::Template(_)) => "UnsupportedMedia",
            Self::StreamFetch { .. } => "StreamFetch",
            Self::StreamsNotAvailable => "StreamsNotAvailable",
            Self::NoPlayableStream => "NoPlayableStream",
            Self::AppendFailed(_) => "AppendFailed",
            Self::Destroyed => "Destroyed",
        }
    }
}

impl From<NetError> for PlayerError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::Aborted => Self::Aborted,
            other => Self::StreamFetch {
                status: other.status(),
            },
        }
    }
}
