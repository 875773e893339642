mod http;
mod substitute;

pub use http::HttpLoader;
pub use substitute::{renumber_segment, substitute, SessionGuard, Substitution, SubstitutingLoader};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::classify::RequestKind;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("HTTP error {status} fetching {url}: {message}")]
    Http {
        url: String,
        status: u16,
        message: String,
        is_last_retry: bool,
    },
    #[error("Network error fetching {url}: {reason}")]
    Network {
        url: String,
        reason: String,
        is_last_retry: bool,
    },
    #[error("Timeout fetching {url}")]
    Timeout { url: String, is_last_retry: bool },
    #[error("Session closed, refusing to fetch {url}")]
    SessionClosed { url: String },
}

impl LoadError {
    pub fn is_last_retry(&self) -> bool {
        match self {
            Self::Http { is_last_retry, .. } => *is_last_retry,
            Self::Network { is_last_retry, .. } => *is_last_retry,
            Self::Timeout { is_last_retry, .. } => *is_last_retry,
            Self::SessionClosed { .. } => true,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Http { url, .. }
            | Self::Network { url, .. }
            | Self::Timeout { url, .. }
            | Self::SessionClosed { url } => url,
        }
    }
}

/// A single fetch issued by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub url: String,
    pub kind: RequestKind,
}

impl LoadRequest {
    pub fn new(url: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            url: url.into(),
            kind,
        }
    }

    pub fn manifest(url: impl Into<String>) -> Self {
        Self::new(url, RequestKind::Manifest)
    }

    pub fn level(url: impl Into<String>) -> Self {
        Self::new(url, RequestKind::Level)
    }

    pub fn segment(url: impl Into<String>) -> Self {
        Self::new(url, RequestKind::Segment)
    }
}

/// Raw response body. `url` is the location that was actually fetched.
#[derive(Debug, Clone)]
pub struct LoadResponse {
    pub url: String,
    pub body: Bytes,
}

impl LoadResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Network fetch hook the playback engine issues every request through.
///
/// The trait is object-safe and Send + Sync so one loader can be shared
/// between the engine and anything decorating it.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, request: &LoadRequest) -> Result<LoadResponse, LoadError>;
}
