//! The playback engine contract the session drives, plus a headless
//! implementation that fetches and parses HLS without decoding.

mod abr;
mod events;
mod headless;

pub use abr::ThroughputEstimator;
pub use events::{EventHub, Subscription};
pub use headless::HeadlessEngine;

use async_trait::async_trait;

use crate::quality::{QualityTier, TierSelection};
use crate::recovery::Fault;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ManifestParsed {
        levels: Vec<QualityTier>,
    },
    LevelLoaded {
        level: usize,
        segment_count: usize,
        duration: f64,
    },
    LevelSwitching {
        level: usize,
    },
    LevelSwitched {
        level: usize,
    },
    FragmentLoaded {
        level: usize,
        sequence: u64,
        url: String,
        bytes: usize,
        duration: f64,
    },
    Fault(Fault),
    EndOfStream,
}

/// What the last [`PlaybackEngine::tick`] accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Work was done and more may be pending.
    Busy,
    /// Nothing to do until a control call changes state.
    Idle,
    Ended,
    Destroyed,
}

/// Operations the playback layer needs from an HLS engine.
///
/// Level fields follow the usual engine semantics: `current` switches
/// immediately, `next` and `load` at the next segment boundary, `start` only
/// applies before the first fragment.
#[async_trait]
pub trait PlaybackEngine: Send {
    fn load_source(&mut self, url: &str);

    fn levels(&self) -> &[QualityTier];

    fn current_level(&self) -> TierSelection;
    fn set_current_level(&mut self, level: TierSelection);
    fn next_level(&self) -> TierSelection;
    fn set_next_level(&mut self, level: TierSelection);
    fn load_level(&self) -> TierSelection;
    fn set_load_level(&mut self, level: TierSelection);
    fn start_level(&self) -> TierSelection;
    fn set_start_level(&mut self, level: TierSelection);

    /// Begin (or resume) network loading, optionally from `position` seconds.
    fn start_load(&mut self, position: Option<f64>);
    fn stop_load(&mut self);
    fn recover_media_error(&mut self);
    /// Release loaders and timers. Terminal.
    fn destroy(&mut self);

    fn seek(&mut self, position: f64);
    fn position(&self) -> f64;
    fn duration(&self) -> Option<f64>;

    fn subscribe(&self) -> Subscription;

    /// Perform the next unit of pending I/O.
    async fn tick(&mut self) -> EngineStatus;
}
