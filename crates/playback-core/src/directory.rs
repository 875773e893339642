//! The signed-URL directory handed over by the recording service.
//!
//! The wire shape is a flat JSON object:
//!
//! ```json
//! {
//!   "master": "https://bucket.s3.amazonaws.com/rec/abc.m3u8?X-Amz-Signature=...",
//!   "320p": "https://bucket.s3.amazonaws.com/rec/abc_320p.m3u8?X-Amz-Signature=...",
//!   "segment_320p": "https://bucket.s3.amazonaws.com/rec/abc_320p_00001.ts?X-Amz-Signature=..."
//! }
//! ```
//!
//! Keys other than `master`, `<digits>p` and `segment_<digits>p` are ignored.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// A quality label such as `"720p"`.
pub type TierLabel = String;

const MASTER_KEY: &str = "master";
const SEGMENT_KEY_PREFIX: &str = "segment_";

static TIER_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+p$").expect("tier label pattern must compile"));

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Invalid signed URL for '{key}': {reason}")]
    InvalidUrl { key: String, reason: String },
}

/// Logical stream identifiers mapped to currently valid, time-limited URLs.
///
/// Immutable once built; a new playback session needs a new directory because
/// the signatures expire (nominally after an hour).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "HashMap<String, String>", into = "BTreeMap<String, String>")]
pub struct SignedUrlDirectory {
    master: Option<Url>,
    tier_manifest: HashMap<TierLabel, Url>,
    tier_segment_base: HashMap<TierLabel, Url>,
}

impl SignedUrlDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from backend key/value pairs.
    pub fn from_entries<I, K, V>(entries: I) -> Result<Self, DirectoryError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut directory = Self::default();

        for (key, value) in entries {
            let key = key.as_ref();
            let parse = || {
                Url::parse(value.as_ref()).map_err(|e| DirectoryError::InvalidUrl {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            };

            if key == MASTER_KEY {
                directory.master = Some(parse()?);
            } else if TIER_LABEL.is_match(key) {
                directory.tier_manifest.insert(key.to_string(), parse()?);
            } else if let Some(label) = key
                .strip_prefix(SEGMENT_KEY_PREFIX)
                .filter(|label| TIER_LABEL.is_match(label))
            {
                directory.tier_segment_base.insert(label.to_string(), parse()?);
            } else {
                debug!(key, "Ignoring unrecognised signed URL key");
            }
        }

        Ok(directory)
    }

    pub fn with_master(mut self, url: Url) -> Self {
        self.master = Some(url);
        self
    }

    pub fn with_tier_manifest(mut self, label: impl Into<TierLabel>, url: Url) -> Self {
        self.tier_manifest.insert(label.into(), url);
        self
    }

    pub fn with_segment_base(mut self, label: impl Into<TierLabel>, url: Url) -> Self {
        self.tier_segment_base.insert(label.into(), url);
        self
    }

    pub fn master(&self) -> Option<&Url> {
        self.master.as_ref()
    }

    pub fn tier_manifest(&self, label: &str) -> Option<&Url> {
        self.tier_manifest.get(label)
    }

    pub fn segment_base(&self, label: &str) -> Option<&Url> {
        self.tier_segment_base.get(label)
    }

    /// Every tier label present in either map, sorted.
    pub fn tiers(&self) -> Vec<TierLabel> {
        self.tier_manifest
            .keys()
            .chain(self.tier_segment_base.keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Labels lacking an entry in either the manifest or the segment map.
    pub fn missing_tiers<'a>(&self, labels: impl IntoIterator<Item = &'a str>) -> Vec<TierLabel> {
        labels
            .into_iter()
            .filter(|label| {
                !self.tier_manifest.contains_key(*label)
                    || !self.tier_segment_base.contains_key(*label)
            })
            .map(str::to_string)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.master.is_none() && self.tier_manifest.is_empty() && self.tier_segment_base.is_empty()
    }
}

impl TryFrom<HashMap<String, String>> for SignedUrlDirectory {
    type Error = DirectoryError;

    fn try_from(map: HashMap<String, String>) -> Result<Self, Self::Error> {
        Self::from_entries(map)
    }
}

impl From<SignedUrlDirectory> for BTreeMap<String, String> {
    fn from(directory: SignedUrlDirectory) -> Self {
        let mut out = BTreeMap::new();
        if let Some(master) = directory.master {
            out.insert(MASTER_KEY.to_string(), master.to_string());
        }
        for (label, url) in directory.tier_manifest {
            out.insert(label, url.to_string());
        }
        for (label, url) in directory.tier_segment_base {
            out.insert(format!("{SEGMENT_KEY_PREFIX}{label}"), url.to_string());
        }
        out
    }
}
