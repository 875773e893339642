use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a playback session and the engine it drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Tier height pinned on manifest parse (default: 320).
    pub target_height: u32,
    /// Let the engine switch tiers on its own while in `Auto` (default: false).
    pub abr_enabled: bool,
    /// Start segment loading as soon as the manifest is parsed (default: false).
    /// Kept off so the tier pin lands before any segment request.
    pub auto_start_load: bool,
    /// Tier used by the engine when nothing is pinned.
    pub start_level: usize,
    /// HTTP request timeout for manifest and segment fetches.
    pub request_timeout: Duration,
    /// Maximum number of retries for a failed fetch.
    pub max_retries: u32,
    /// Base backoff duration for retries (doubled each attempt). Also paces
    /// consecutive fatal-fault recoveries.
    pub retry_backoff: Duration,
    /// Ceiling for the pause before a recovery re-issues requests.
    pub max_recovery_backoff: Duration,
    /// Maximum number of faults retained per session (ring buffer capacity).
    pub fault_limit: usize,
    /// Consecutive fatal recoveries of one kind before escalating to teardown.
    /// `None` recovers indefinitely.
    pub recovery_limit: Option<u32>,
    /// Throughput assumed before the first fragment has been measured.
    pub abr_default_estimate_bps: u64,
    /// How long the player worker waits for commands while the engine is idle.
    pub idle_poll_interval: Duration,
    /// Stop after this many fragments. `None` plays to the end of the stream.
    pub max_segments: Option<u64>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            target_height: 320,
            abr_enabled: false,
            auto_start_load: false,
            start_level: 0,
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            max_recovery_backoff: Duration::from_secs(8),
            fault_limit: 100,
            recovery_limit: None,
            abr_default_estimate_bps: 500_000,
            idle_poll_interval: Duration::from_millis(250),
            max_segments: None,
        }
    }
}

impl PlayerConfig {
    pub fn with_target_height(mut self, height: u32) -> Self {
        self.target_height = height;
        self
    }

    pub fn with_abr(mut self, enabled: bool) -> Self {
        self.abr_enabled = enabled;
        self
    }

    pub fn with_auto_start_load(mut self, enabled: bool) -> Self {
        self.auto_start_load = enabled;
        self
    }

    pub fn with_start_level(mut self, level: usize) -> Self {
        self.start_level = level;
        self
    }

    pub fn with_request_timeout(mut self, ms: u64) -> Self {
        self.request_timeout = Duration::from_millis(ms);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, ms: u64) -> Self {
        self.retry_backoff = Duration::from_millis(ms);
        self
    }

    pub fn with_max_recovery_backoff(mut self, ms: u64) -> Self {
        self.max_recovery_backoff = Duration::from_millis(ms);
        self
    }

    pub fn with_fault_limit(mut self, limit: usize) -> Self {
        self.fault_limit = limit.max(1);
        self
    }

    pub fn with_recovery_limit(mut self, limit: Option<u32>) -> Self {
        self.recovery_limit = limit;
        self
    }

    pub fn with_idle_poll_interval(mut self, ms: u64) -> Self {
        self.idle_poll_interval = Duration::from_millis(ms.max(1));
        self
    }

    pub fn with_max_segments(mut self, max: Option<u64>) -> Self {
        self.max_segments = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pin_320_with_abr_off() {
        let c = PlayerConfig::default();
        assert_eq!(c.target_height, 320);
        assert!(!c.abr_enabled);
        assert!(!c.auto_start_load);
        assert!(c.recovery_limit.is_none());
    }

    #[test]
    fn builders_clamp_degenerate_values() {
        let c = PlayerConfig::default()
            .with_fault_limit(0)
            .with_idle_poll_interval(0);
        assert_eq!(c.fault_limit, 1);
        assert_eq!(c.idle_poll_interval, Duration::from_millis(1));
    }
}
