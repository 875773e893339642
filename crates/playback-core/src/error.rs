use thiserror::Error;

use crate::backend::BackendError;
use crate::directory::DirectoryError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Recording unavailable: {0}")]
    Unavailable(String),
    #[error("No stream URL for this recording")]
    MissingStreamUrl,
    #[error("Invalid stream URL '{url}': {reason}")]
    InvalidStreamUrl { url: String, reason: String },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("Unknown tier {index}, {available} tiers available")]
    UnknownTier { index: usize, available: usize },
    #[error("Tier menu generation {requested} is stale, current generation is {current}")]
    StaleTierGeneration { requested: u64, current: u64 },
    #[error("Progressive source has no quality tiers")]
    NotAdaptive,
    #[error("Playback session is closed")]
    Closed,
}

impl SessionError {
    /// True for faults raised before any playback was attempted.
    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            Self::Backend(_)
                | Self::Unavailable(_)
                | Self::MissingStreamUrl
                | Self::InvalidStreamUrl { .. }
                | Self::Directory(_)
        )
    }
}
