use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};
use url::Url;

use super::{LoadError, LoadRequest, LoadResponse, Loader};
use crate::classify::{classify, StreamReference};
use crate::directory::SignedUrlDirectory;

/// Liveness flag shared between a session and the loader it installed.
///
/// Once closed, the loader refuses every request without classifying it.
#[derive(Debug, Clone)]
pub struct SessionGuard {
    open: Arc<AtomicBool>,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of looking a request up in the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substitution {
    Rewritten {
        reference: StreamReference,
        url: Url,
    },
    /// Classified, but the directory has no (usable) entry for it.
    DirectoryMiss(StreamReference),
    Unclassified,
}

impl Substitution {
    /// The request to actually send: rewritten, or the original unchanged.
    pub fn resolve(&self, original: &LoadRequest) -> LoadRequest {
        match self {
            Self::Rewritten { url, .. } => LoadRequest::new(url.as_str(), original.kind),
            Self::DirectoryMiss(_) | Self::Unclassified => original.clone(),
        }
    }
}

/// Classify `request` and find its signed replacement.
pub fn substitute(directory: &SignedUrlDirectory, request: &LoadRequest) -> Substitution {
    let reference = classify(&request.url, request.kind);

    let target = match &reference {
        StreamReference::Master => directory.master().cloned(),
        StreamReference::TierManifest(label) => directory.tier_manifest(label).cloned(),
        StreamReference::Segment { tier, sequence } => directory
            .segment_base(tier)
            .and_then(|base| renumber_segment(base, sequence)),
        StreamReference::Unknown => return Substitution::Unclassified,
    };

    match target {
        Some(url) => Substitution::Rewritten { reference, url },
        None => Substitution::DirectoryMiss(reference),
    }
}

/// Replace the numeric suffix of `base`'s last path component with `sequence`,
/// keeping its prefix, extension, and every other part of the URL.
///
/// `.../abc_320p_00001.ts?sig=x` with `"00042"` gives `.../abc_320p_00042.ts?sig=x`.
/// Returns `None` when the last component carries no numeric suffix.
pub fn renumber_segment(base: &Url, sequence: &str) -> Option<Url> {
    let path = base.path();
    let (dir, last) = path.rsplit_once('/').unwrap_or(("", path));
    let (stem, ext) = match last.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (last, None),
    };

    let digits = stem.bytes().rev().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let prefix = &stem[..stem.len() - digits];

    let renamed = match ext {
        Some(ext) => format!("{prefix}{sequence}.{ext}"),
        None => format!("{prefix}{sequence}"),
    };

    let mut url = base.clone();
    url.set_path(&format!("{dir}/{renamed}"));
    Some(url)
}

/// Decorates the engine's default loader with signed-URL substitution.
///
/// The engine never learns whether a request was rewritten: the response
/// carries the URL it asked for. No retry or caching happens here.
pub struct SubstitutingLoader {
    inner: Arc<dyn Loader>,
    directory: Arc<SignedUrlDirectory>,
    guard: SessionGuard,
}

impl SubstitutingLoader {
    pub fn new(
        inner: Arc<dyn Loader>,
        directory: Arc<SignedUrlDirectory>,
        guard: SessionGuard,
    ) -> Self {
        Self {
            inner,
            directory,
            guard,
        }
    }
}

#[async_trait]
impl Loader for SubstitutingLoader {
    async fn load(&self, request: &LoadRequest) -> Result<LoadResponse, LoadError> {
        if !self.guard.is_open() {
            return Err(LoadError::SessionClosed {
                url: request.url.clone(),
            });
        }

        let substitution = substitute(&self.directory, request);
        match &substitution {
            Substitution::Rewritten { reference, url } => {
                debug!(%reference, from = %request.url, to = %url, "Substituted signed URL");
            }
            Substitution::DirectoryMiss(reference) => {
                warn!(%reference, url = %request.url, "No signed URL, passing original through");
            }
            Substitution::Unclassified => {
                trace!(url = %request.url, kind = %request.kind, "Unclassified request");
            }
        }

        let resolved = substitution.resolve(request);
        let response = self.inner.load(&resolved).await?;

        Ok(LoadResponse {
            url: request.url.clone(),
            body: response.body,
        })
    }
}
