//! Transport controls and the media surface they drive. State here is local
//! to one playback surface.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::StreamSource;

/// A transport control request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Control {
    TogglePlay,
    Seek { position: f64 },
    SetVolume { volume: f64 },
    ToggleMute,
    ToggleFullscreen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transport {
    pub playing: bool,
    pub position: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub volume: f64,
    pub muted: bool,
    pub fullscreen: bool,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            playing: true,
            position: 0.0,
            duration: None,
            volume: 1.0,
            muted: false,
            fullscreen: false,
        }
    }
}

impl Transport {
    pub fn toggle_play(&mut self) -> bool {
        self.playing = !self.playing;
        self.playing
    }

    /// Clamp `position` into the known timeline and record it.
    pub fn seek(&mut self, position: f64) -> f64 {
        let mut position = if position.is_finite() { position.max(0.0) } else { 0.0 };
        if let Some(duration) = self.duration {
            position = position.min(duration);
        }
        self.position = position;
        position
    }

    pub fn set_volume(&mut self, volume: f64) {
        let volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 0.0 };
        self.volume = volume;
        self.muted = volume == 0.0;
    }

    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        self.muted
    }

    pub fn toggle_fullscreen(&mut self) -> bool {
        self.fullscreen = !self.fullscreen;
        self.fullscreen
    }

    pub fn update_timeline(&mut self, position: f64, duration: Option<f64>) {
        self.position = position;
        if duration.is_some() {
            self.duration = duration;
        }
    }
}

/// Render seconds as `m:ss`.
pub fn format_time(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    format!("{}:{:02}", total / 60, total % 60)
}

/// The session-scoped resource a stream is rendered into.
pub trait MediaSurface: Send {
    fn attach(&mut self, source: &StreamSource);
    fn release(&mut self);
    fn is_attached(&self) -> bool;
}

/// Surface with nothing to render; remembers what is attached.
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    attached: Option<String>,
    releases: u32,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attached_url(&self) -> Option<&str> {
        self.attached.as_deref()
    }

    pub fn releases(&self) -> u32 {
        self.releases
    }
}

impl MediaSurface for HeadlessSurface {
    fn attach(&mut self, source: &StreamSource) {
        debug!(url = %source.url(), "Surface attached");
        self.attached = Some(source.url().to_string());
    }

    fn release(&mut self) {
        if let Some(url) = self.attached.take() {
            debug!(url = %url, "Surface released");
            self.releases += 1;
        }
    }

    fn is_attached(&self) -> bool {
        self.attached.is_some()
    }
}
