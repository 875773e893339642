//! Client for the recording service that hands out stream URLs and their
//! signed-URL directories.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::directory::{SignedUrlDirectory, TierLabel};
use crate::error::SessionError;

const STREAM_URL_PATH: [&str; 3] = ["api", "recordings", "get-stream-url"];

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Recording service returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Recording service unreachable: {0}")]
    Network(String),
    #[error("Unexpected recording service response: {0}")]
    Decode(String),
    #[error("Invalid recording service URL '{0}'")]
    InvalidBaseUrl(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Hls,
    Mp4,
    #[serde(other)]
    Unknown,
}

/// Body of `GET /api/recordings/get-stream-url/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StreamDescriptor {
    Success {
        #[serde(default)]
        url: Option<String>,
        #[serde(rename = "type", default)]
        stream_type: Option<StreamType>,
        #[serde(default)]
        quality_variants: Option<String>,
        #[serde(default)]
        signed_urls: Option<HashMap<String, String>>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

impl StreamDescriptor {
    /// Turn a backend answer into something playable.
    ///
    /// Tiers listed in `quality_variants` but absent from the directory are
    /// logged; playback of those tiers falls back to the original URLs.
    pub fn into_source(self) -> Result<StreamSource, SessionError> {
        let (url, stream_type, quality_variants, signed_urls) = match self {
            Self::Error { message } => {
                return Err(SessionError::Unavailable(
                    message.unwrap_or_else(|| "recording failed processing".to_string()),
                ))
            }
            Self::Success {
                url,
                stream_type,
                quality_variants,
                signed_urls,
            } => (url, stream_type, quality_variants, signed_urls),
        };

        let url = url
            .filter(|u| !u.trim().is_empty())
            .ok_or(SessionError::MissingStreamUrl)?;
        let parsed = parse_stream_url(&url)?;

        let adaptive = match stream_type {
            Some(StreamType::Hls) => true,
            Some(StreamType::Mp4) => false,
            Some(StreamType::Unknown) | None => is_adaptive_url(&url),
        };
        if !adaptive {
            return Ok(StreamSource::progressive(parsed));
        }

        let directory = match signed_urls {
            Some(entries) => Some(SignedUrlDirectory::from_entries(entries)?),
            None => None,
        };

        if let Some(directory) = &directory {
            let expected = parse_quality_variants(quality_variants.as_deref().unwrap_or_default());
            for tier in directory.missing_tiers(expected.iter().map(String::as_str)) {
                warn!(%tier, "Signed URL directory is missing entries for tier");
            }
        }

        Ok(StreamSource::adaptive(parsed, directory))
    }
}

/// Split a `"320p,480p"` style list.
pub fn parse_quality_variants(list: &str) -> Vec<TierLabel> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Adaptive,
    Progressive,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adaptive => write!(f, "adaptive"),
            Self::Progressive => write!(f, "progressive"),
        }
    }
}

/// What a playback surface is asked to play.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSource {
    /// An HLS manifest, optionally with the signed URLs to reach its parts.
    Adaptive {
        url: Url,
        directory: Option<Arc<SignedUrlDirectory>>,
    },
    /// A plain media file played directly.
    Progressive { url: Url },
}

impl StreamSource {
    pub fn adaptive(url: Url, directory: Option<SignedUrlDirectory>) -> Self {
        Self::Adaptive {
            url,
            directory: directory.map(Arc::new),
        }
    }

    pub fn progressive(url: Url) -> Self {
        Self::Progressive { url }
    }

    /// A URL mentioning `.m3u8` is adaptive; anything else is progressive and
    /// any directory is ignored.
    pub fn from_url(
        url: &str,
        directory: Option<SignedUrlDirectory>,
    ) -> Result<Self, SessionError> {
        let parsed = parse_stream_url(url)?;
        if is_adaptive_url(url) {
            Ok(Self::adaptive(parsed, directory))
        } else {
            if directory.is_some() {
                debug!(url, "Ignoring signed URLs for a progressive source");
            }
            Ok(Self::progressive(parsed))
        }
    }

    pub fn url(&self) -> &Url {
        match self {
            Self::Adaptive { url, .. } | Self::Progressive { url } => url,
        }
    }

    pub fn directory(&self) -> Option<&Arc<SignedUrlDirectory>> {
        match self {
            Self::Adaptive { directory, .. } => directory.as_ref(),
            Self::Progressive { .. } => None,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Adaptive { .. } => SourceKind::Adaptive,
            Self::Progressive { .. } => SourceKind::Progressive,
        }
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(self, Self::Adaptive { .. })
    }
}

fn is_adaptive_url(url: &str) -> bool {
    url.contains(".m3u8")
}

fn parse_stream_url(url: &str) -> Result<Url, SessionError> {
    Url::parse(url).map_err(|e| SessionError::InvalidStreamUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Fetches stream descriptors from the recording service.
#[derive(Debug, Clone)]
pub struct RecordingClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl RecordingClient {
    pub fn new(base_url: Url, token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");
        Self::with_client(client, base_url, token)
    }

    pub fn with_client(client: Client, base_url: Url, token: Option<String>) -> Self {
        Self {
            client,
            base_url,
            token,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn descriptor_url(&self, recording_id: &str) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(STREAM_URL_PATH)
            .push(recording_id);
        Ok(url)
    }

    pub async fn stream_descriptor(
        &self,
        recording_id: &str,
    ) -> Result<StreamDescriptor, BackendError> {
        let url = self.descriptor_url(recording_id)?;
        debug!(%url, recording_id, "Requesting stream descriptor");

        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Http {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        response
            .json::<StreamDescriptor>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    /// Fetch and interpret the descriptor for `recording_id`.
    pub async fn resolve(&self, recording_id: &str) -> Result<StreamSource, SessionError> {
        self.stream_descriptor(recording_id).await?.into_source()
    }
}
