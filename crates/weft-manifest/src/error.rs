use thiserror::Error;

/// Manifest-level failures.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// After filtering, no period has a playable stream set.
    #[error("no playable streams in manifest")]
    Empty,

    /// A live update cannot be reconciled with the current manifest.
    #[error("incompatible manifest update: {0}")]
    Incompatible(String),

    /// A segment URL template could not be instantiated.
    #[error("invalid segment template: {0}")]
    Template(String),
}

pub type ManifestResult<T> = Result<T, ManifestError>;
