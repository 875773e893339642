//! Fault classification and the recovery action taken for each fault.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::PlayerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Network,
    Media,
    Mux,
    KeySystem,
    Other,
}

impl FaultKind {
    pub const ALL: [FaultKind; 5] = [
        FaultKind::Network,
        FaultKind::Media,
        FaultKind::Mux,
        FaultKind::KeySystem,
        FaultKind::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Media => "media",
            Self::Mux => "mux",
            Self::KeySystem => "key_system",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A fault notification raised by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub fatal: bool,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl Fault {
    pub fn new(kind: FaultKind, fatal: bool, details: impl Into<String>) -> Self {
        Self {
            kind,
            fatal,
            details: details.into(),
            url: None,
            status_code: None,
        }
    }

    pub fn network(fatal: bool, details: impl Into<String>) -> Self {
        Self::new(FaultKind::Network, fatal, details)
    }

    pub fn media(fatal: bool, details: impl Into<String>) -> Self {
        Self::new(FaultKind::Media, fatal, details)
    }

    pub fn other(fatal: bool, details: impl Into<String>) -> Self {
        Self::new(FaultKind::Other, fatal, details)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_status_code(mut self, code: Option<u16>) -> Self {
        self.status_code = code;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Non-fatal: logged only.
    Ignore,
    /// Restart network loading from the current position.
    RestartLoad,
    /// Run the engine's media-error recovery routine.
    RecoverMediaError,
    /// Destroy the engine; playback cannot continue.
    Teardown,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ignore => write!(f, "ignore"),
            Self::RestartLoad => write!(f, "restart_load"),
            Self::RecoverMediaError => write!(f, "recover_media_error"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

/// A fault as retained for inspection, with the action it triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: FaultKind,
    pub fatal: bool,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub action: RecoveryAction,
}

impl FaultRecord {
    pub fn new(fault: &Fault, action: RecoveryAction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind: fault.kind,
            fatal: fault.fatal,
            details: fault.details.clone(),
            url: fault.url.clone(),
            status_code: fault.status_code,
            action,
        }
    }
}

/// Fixed-capacity circular buffer of recent faults. Evicts the oldest when full.
#[derive(Debug, Clone)]
pub struct FaultRing {
    buffer: VecDeque<FaultRecord>,
    capacity: usize,
}

impl FaultRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, record: FaultRecord) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(record);
    }

    /// Newest first.
    pub fn list(&self) -> Vec<FaultRecord> {
        self.buffer.iter().rev().cloned().collect()
    }

    pub fn list_chronological(&self) -> Vec<FaultRecord> {
        self.buffer.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&FaultRecord> {
        self.buffer.back()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Maps each fault to a [`RecoveryAction`].
///
/// Fatal network faults restart loading, fatal media faults run media
/// recovery, any other fatal fault tears the engine down. With a
/// `recovery_limit`, more than that many consecutive recoveries of one kind
/// escalate to teardown; a loaded fragment resets the streak.
///
/// Recoveries are paced: the n-th consecutive one waits `retry_backoff`
/// doubled n-1 times, up to `max_backoff`.
#[derive(Debug, Clone)]
pub struct FaultRecoveryController {
    recovery_limit: Option<u32>,
    retry_backoff: Duration,
    max_backoff: Duration,
    counts: HashMap<FaultKind, u64>,
    consecutive: HashMap<FaultKind, u32>,
    ring: FaultRing,
}

impl FaultRecoveryController {
    pub fn new(fault_limit: usize, recovery_limit: Option<u32>) -> Self {
        Self {
            recovery_limit,
            retry_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            counts: HashMap::new(),
            consecutive: HashMap::new(),
            ring: FaultRing::new(fault_limit),
        }
    }

    pub fn from_config(config: &PlayerConfig) -> Self {
        Self::new(config.fault_limit, config.recovery_limit)
            .with_backoff(config.retry_backoff, config.max_recovery_backoff)
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff = base;
        self.max_backoff = max.max(base);
        self
    }

    pub fn handle(&mut self, fault: &Fault) -> RecoveryAction {
        *self.counts.entry(fault.kind).or_insert(0) += 1;

        let action = if !fault.fatal {
            warn!(kind = %fault.kind, details = %fault.details, "Non-fatal playback fault");
            RecoveryAction::Ignore
        } else {
            error!(
                kind = %fault.kind,
                details = %fault.details,
                url = ?fault.url,
                "Fatal playback fault"
            );
            self.escalate(fault.kind, recovery_for(fault.kind))
        };

        if action != RecoveryAction::Ignore {
            info!(kind = %fault.kind, %action, "Recovery action");
        }
        self.ring.push(FaultRecord::new(fault, action));
        action
    }

    fn escalate(&mut self, kind: FaultKind, action: RecoveryAction) -> RecoveryAction {
        if action == RecoveryAction::Teardown {
            return action;
        }
        let streak = self.consecutive.entry(kind).or_insert(0);
        *streak += 1;
        match self.recovery_limit {
            Some(limit) if *streak > limit => {
                warn!(%kind, streak = *streak, limit, "Recovery limit exceeded, tearing down");
                RecoveryAction::Teardown
            }
            _ => action,
        }
    }

    /// Pause before the recovery for the current `kind` streak re-issues
    /// requests. Zero when nothing is outstanding.
    pub fn backoff(&self, kind: FaultKind) -> Duration {
        let streak = self.consecutive.get(&kind).copied().unwrap_or(0);
        if streak == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(streak.saturating_sub(1).min(16));
        self.retry_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Playback made progress; consecutive recovery streaks start over.
    pub fn on_fragment_loaded(&mut self) {
        self.consecutive.clear();
    }

    pub fn count(&self, kind: FaultKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> HashMap<FaultKind, u64> {
        self.counts.clone()
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn recent(&self) -> Vec<FaultRecord> {
        self.ring.list()
    }

    pub fn last_record(&self) -> Option<&FaultRecord> {
        self.ring.latest()
    }
}

fn recovery_for(kind: FaultKind) -> RecoveryAction {
    match kind {
        FaultKind::Network => RecoveryAction::RestartLoad,
        FaultKind::Media => RecoveryAction::RecoverMediaError,
        FaultKind::Mux | FaultKind::KeySystem | FaultKind::Other => RecoveryAction::Teardown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> FaultRecoveryController {
        FaultRecoveryController::new(10, None)
    }

    #[test]
    fn non_fatal_faults_are_ignored_but_counted() {
        let mut c = controller();
        assert_eq!(c.handle(&Fault::network(false, "segment 404")), RecoveryAction::Ignore);
        assert_eq!(c.handle(&Fault::media(false, "buffer stalled")), RecoveryAction::Ignore);
        assert_eq!(c.count(FaultKind::Network), 1);
        assert_eq!(c.count(FaultKind::Media), 1);
    }

    #[test]
    fn fatal_faults_route_by_kind() {
        let mut c = controller();
        assert_eq!(c.handle(&Fault::network(true, "manifest")), RecoveryAction::RestartLoad);
        assert_eq!(c.handle(&Fault::media(true, "decode")), RecoveryAction::RecoverMediaError);
        for kind in [FaultKind::Mux, FaultKind::KeySystem, FaultKind::Other] {
            assert_eq!(c.handle(&Fault::new(kind, true, "boom")), RecoveryAction::Teardown);
        }
    }

    #[test]
    fn unbounded_by_default() {
        let mut c = controller();
        for _ in 0..50 {
            assert_eq!(c.handle(&Fault::network(true, "again")), RecoveryAction::RestartLoad);
        }
        assert_eq!(c.count(FaultKind::Network), 50);
    }

    #[test]
    fn recovery_limit_escalates_consecutive_faults() {
        let mut c = FaultRecoveryController::new(10, Some(2));
        assert_eq!(c.handle(&Fault::media(true, "1")), RecoveryAction::RecoverMediaError);
        assert_eq!(c.handle(&Fault::media(true, "2")), RecoveryAction::RecoverMediaError);
        assert_eq!(c.handle(&Fault::media(true, "3")), RecoveryAction::Teardown);
    }

    #[test]
    fn fragment_progress_resets_the_streak() {
        let mut c = FaultRecoveryController::new(10, Some(1));
        assert_eq!(c.handle(&Fault::network(true, "1")), RecoveryAction::RestartLoad);
        c.on_fragment_loaded();
        assert_eq!(c.handle(&Fault::network(true, "2")), RecoveryAction::RestartLoad);
        assert_eq!(c.handle(&Fault::network(true, "3")), RecoveryAction::Teardown);
    }

    #[test]
    fn recovery_backoff_doubles_and_caps() {
        let mut c = FaultRecoveryController::new(10, None)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(c.backoff(FaultKind::Network), Duration::ZERO);

        c.handle(&Fault::network(true, "1"));
        assert_eq!(c.backoff(FaultKind::Network), Duration::from_millis(100));
        c.handle(&Fault::network(true, "2"));
        assert_eq!(c.backoff(FaultKind::Network), Duration::from_millis(200));
        c.handle(&Fault::network(true, "3"));
        assert_eq!(c.backoff(FaultKind::Network), Duration::from_millis(350));
        assert_eq!(c.backoff(FaultKind::Media), Duration::ZERO);

        c.on_fragment_loaded();
        assert_eq!(c.backoff(FaultKind::Network), Duration::ZERO);
    }

    #[test]
    fn records_are_newest_first_and_bounded() {
        let mut c = FaultRecoveryController::new(2, None);
        c.handle(&Fault::network(false, "a"));
        c.handle(
            &Fault::network(true, "b")
                .with_url("https://cdn/x.ts")
                .with_status_code(Some(403)),
        );
        c.handle(&Fault::other(true, "c"));

        let recent = c.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].details, "c");
        assert_eq!(recent[0].action, RecoveryAction::Teardown);
        assert_eq!(recent[1].status_code, Some(403));
        assert_eq!(c.total(), 3);
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut ring = FaultRing::new(2);
        for d in ["a", "b", "c"] {
            ring.push(FaultRecord::new(&Fault::media(false, d), RecoveryAction::Ignore));
        }
        let chrono_order: Vec<_> = ring
            .list_chronological()
            .into_iter()
            .map(|r| r.details)
            .collect();
        assert_eq!(chrono_order, vec!["b", "c"]);
    }
}
