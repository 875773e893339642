//! Best-effort inference of what an engine request points at, from the
//! `<base>_<height>p.m3u8` / `<base>_<height>p_<sequence>.ts` naming convention.
//!
//! Classification never fails: anything that does not fit the convention is
//! [`StreamReference::Unknown`] and is passed through untouched.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::directory::TierLabel;

/// File extensions treated as media segments.
pub const SEGMENT_EXTENSIONS: &[&str] = &["ts"];

const MANIFEST_EXTENSION: &str = ".m3u8";

static TIER_MANIFEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_(\d+p)\.m3u8$").expect("tier manifest pattern must compile"));

static SEGMENT_TIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_(\d+p)_").expect("segment tier pattern must compile"));

/// Request kind as declared by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Top-level manifest.
    Manifest,
    /// Per-tier sub-manifest.
    Level,
    /// Media segment.
    Segment,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manifest => write!(f, "manifest"),
            Self::Level => write!(f, "level"),
            Self::Segment => write!(f, "segment"),
        }
    }
}

impl std::str::FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manifest" => Ok(Self::Manifest),
            "level" => Ok(Self::Level),
            "segment" | "frag" => Ok(Self::Segment),
            other => Err(format!("unknown request kind '{}'", other)),
        }
    }
}

/// Logical identity of a request. Derived per request, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamReference {
    Master,
    TierManifest(TierLabel),
    Segment { tier: TierLabel, sequence: String },
    Unknown,
}

impl fmt::Display for StreamReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::TierManifest(tier) => write!(f, "manifest[{}]", tier),
            Self::Segment { tier, sequence } => write!(f, "segment[{}#{}]", tier, sequence),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classify a request URL (absolute or relative) by its final path segment.
pub fn classify(url: &str, kind: RequestKind) -> StreamReference {
    let file_name = file_name(url);

    match kind {
        RequestKind::Manifest | RequestKind::Level => {
            if let Some(caps) = TIER_MANIFEST.captures(file_name) {
                StreamReference::TierManifest(caps[1].to_string())
            } else if file_name.ends_with(MANIFEST_EXTENSION) {
                StreamReference::Master
            } else {
                StreamReference::Unknown
            }
        }
        RequestKind::Segment => {
            let Some(stem) = segment_stem(file_name) else {
                return StreamReference::Unknown;
            };
            let Some(caps) = SEGMENT_TIER.captures(file_name) else {
                return StreamReference::Unknown;
            };
            match stem.rsplit('_').next() {
                Some(sequence) if is_numeric(sequence) => StreamReference::Segment {
                    tier: caps[1].to_string(),
                    sequence: sequence.to_string(),
                },
                _ => StreamReference::Unknown,
            }
        }
    }
}

/// Last path segment, ignoring any query string or fragment.
pub(crate) fn file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

fn segment_stem(file_name: &str) -> Option<&str> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    SEGMENT_EXTENSIONS
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
        .then_some(stem)
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
