//! Quality tier selection: the initial pin on manifest parse, manual
//! overrides, and tracking of the tier the engine actually plays.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::directory::TierLabel;
use crate::error::SessionError;

/// One rendition reported by the engine after a manifest parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityTier {
    pub index: usize,
    pub label: TierLabel,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u64,
}

impl QualityTier {
    pub fn new(index: usize, width: u32, height: u32, bitrate_bps: u64) -> Self {
        let label = if height > 0 {
            format!("{}p", height)
        } else {
            format!("level{}", index)
        };
        Self {
            index,
            label,
            width,
            height,
            bitrate_bps,
        }
    }

    /// Menu text, e.g. `720p (2800kbps)`.
    pub fn display_name(&self) -> String {
        format!(
            "{}p ({}kbps)",
            self.height,
            (self.bitrate_bps as f64 / 1000.0).round() as u64
        )
    }
}

/// A level field value: a tier index, or the engine's own choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "SelectionRepr", into = "SelectionRepr")]
pub enum TierSelection {
    #[default]
    Auto,
    Index(usize),
}

impl TierSelection {
    pub fn index(self) -> Option<usize> {
        match self {
            Self::Auto => None,
            Self::Index(i) => Some(i),
        }
    }

    pub fn is_auto(self) -> bool {
        matches!(self, Self::Auto)
    }
}

impl fmt::Display for TierSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Index(i) => write!(f, "{}", i),
        }
    }
}

impl std::str::FromStr for TierSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        s.parse::<usize>()
            .map(Self::Index)
            .map_err(|_| format!("expected a tier index or 'auto', got '{}'", s))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SelectionRepr {
    Index(usize),
    Keyword(String),
}

impl TryFrom<SelectionRepr> for TierSelection {
    type Error = String;

    fn try_from(repr: SelectionRepr) -> Result<Self, Self::Error> {
        match repr {
            SelectionRepr::Index(i) => Ok(Self::Index(i)),
            SelectionRepr::Keyword(word) => word.parse(),
        }
    }
}

impl From<TierSelection> for SelectionRepr {
    fn from(selection: TierSelection) -> Self {
        match selection {
            TierSelection::Auto => Self::Keyword("auto".to_string()),
            TierSelection::Index(i) => Self::Index(i),
        }
    }
}

/// Menu entry exposed for manual override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierOption {
    pub id: usize,
    pub height: u32,
    pub width: u32,
    pub bitrate: u64,
    pub name: String,
}

impl From<&QualityTier> for TierOption {
    fn from(tier: &QualityTier) -> Self {
        Self {
            id: tier.index,
            height: tier.height,
            width: tier.width,
            bitrate: tier.bitrate_bps,
            name: tier.display_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierMenu {
    pub generation: u64,
    pub active: TierSelection,
    pub tiers: Vec<TierOption>,
}

/// Pick the tier to pin: exact height match first, otherwise the greatest
/// height not above `target_height`. Ties keep the earlier tier. Tiers with
/// unknown height never qualify.
pub fn select_initial_tier(tiers: &[QualityTier], target_height: u32) -> Option<usize> {
    let candidates = || tiers.iter().enumerate().filter(|(_, t)| t.height > 0);

    if let Some((i, _)) = candidates().find(|(_, t)| t.height == target_height) {
        return Some(i);
    }

    candidates()
        .filter(|(_, t)| t.height <= target_height)
        .fold(None::<(usize, u32)>, |best, (i, t)| match best {
            Some((_, h)) if h >= t.height => best,
            _ => Some((i, t.height)),
        })
        .map(|(i, _)| i)
}

/// Tracks the tier list and active tier of one session.
///
/// Every manifest parse opens a new generation; indices from an older
/// generation are refused.
#[derive(Debug, Clone)]
pub struct QualityTierManager {
    target_height: u32,
    generation: u64,
    tiers: Vec<QualityTier>,
    options: Vec<TierOption>,
    active: TierSelection,
}

impl QualityTierManager {
    pub fn new(target_height: u32) -> Self {
        Self {
            target_height,
            generation: 0,
            tiers: Vec::new(),
            options: Vec::new(),
            active: TierSelection::Auto,
        }
    }

    /// Install a freshly parsed tier list and return the index to pin, if any.
    pub fn on_manifest_parsed(&mut self, tiers: Vec<QualityTier>) -> Option<usize> {
        self.generation += 1;
        self.tiers = tiers;
        self.active = TierSelection::Auto;
        self.refresh_options();

        let pin = select_initial_tier(&self.tiers, self.target_height);
        match pin {
            Some(index) => {
                self.active = TierSelection::Index(index);
                info!(
                    generation = self.generation,
                    tier = %self.tiers[index].label,
                    index,
                    target_height = self.target_height,
                    "Pinning initial tier"
                );
            }
            None => info!(
                generation = self.generation,
                target_height = self.target_height,
                tiers = self.tiers.len(),
                "No tier at or below target height, keeping engine default"
            ),
        }
        pin
    }

    /// Nothing was pinned and the engine will not adapt, so it plays the
    /// level it starts on. Record that instead of `Auto`.
    pub fn assume_engine_level(&mut self, level: TierSelection) {
        if !self.active.is_auto() {
            return;
        }
        if let Some(index) = level.index().filter(|i| *i < self.tiers.len()) {
            debug!(generation = self.generation, index, "Tracking the engine start level");
            self.active = TierSelection::Index(index);
        }
    }

    /// Level metadata was reloaded without a new manifest.
    pub fn on_levels_updated(&mut self, tiers: Vec<QualityTier>) {
        self.tiers = tiers;
        self.refresh_options();
    }

    /// Validate and record a manual override.
    ///
    /// `generation` names the menu the request was built from; `None` trusts
    /// the current one.
    pub fn request(
        &mut self,
        selection: TierSelection,
        generation: Option<u64>,
    ) -> Result<TierSelection, SessionError> {
        if let Some(requested) = generation.filter(|g| *g != self.generation) {
            return Err(SessionError::StaleTierGeneration {
                requested,
                current: self.generation,
            });
        }
        if let TierSelection::Index(index) = selection {
            if index >= self.tiers.len() {
                return Err(SessionError::UnknownTier {
                    index,
                    available: self.tiers.len(),
                });
            }
        }

        debug!(from = %self.active, to = %selection, "Tier switch requested");
        self.active = selection;
        Ok(selection)
    }

    /// The engine finished switching; this is the authoritative active tier.
    pub fn on_level_switched(&mut self, level: usize) -> Option<&QualityTier> {
        let Some(tier) = self.tiers.get(level) else {
            warn!(level, tiers = self.tiers.len(), "Switched to a level outside the tier list");
            return None;
        };
        self.active = TierSelection::Index(level);
        info!(tier = %tier.label, bitrate = tier.bitrate_bps, "Now playing tier");
        Some(tier)
    }

    fn refresh_options(&mut self) {
        self.options = self.tiers.iter().map(TierOption::from).collect();
    }

    pub fn active(&self) -> TierSelection {
        self.active
    }

    pub fn active_tier(&self) -> Option<&QualityTier> {
        self.active.index().and_then(|i| self.tiers.get(i))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn target_height(&self) -> u32 {
        self.target_height
    }

    pub fn tiers(&self) -> &[QualityTier] {
        &self.tiers
    }

    pub fn options(&self) -> &[TierOption] {
        &self.options
    }

    pub fn menu(&self) -> TierMenu {
        TierMenu {
            generation: self.generation,
            active: self.active,
            tiers: self.options.clone(),
        }
    }
}
