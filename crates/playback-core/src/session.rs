//! One playback session: an engine instance wired to the substitution
//! loader, the tier manager, the recovery controller and a media surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{SourceKind, StreamSource};
use crate::config::PlayerConfig;
use crate::directory::SignedUrlDirectory;
use crate::engine::{EngineEvent, EngineStatus, PlaybackEngine, Subscription};
use crate::error::SessionError;
use crate::loader::{Loader, SessionGuard, SubstitutingLoader};
use crate::quality::{QualityTier, QualityTierManager, TierMenu, TierOption, TierSelection};
use crate::recovery::{FaultKind, FaultRecord, FaultRecoveryController, RecoveryAction};
use crate::transport::{Control, MediaSurface, Transport};
use crate::webhook::Notification;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Ended,
    Failed { message: String },
    Closed,
}

impl SessionState {
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        matches!(
            (self, target),
            (SessionState::Active, SessionState::Ended)
                | (SessionState::Active, SessionState::Failed { .. })
                | (SessionState::Active, SessionState::Closed)
                | (SessionState::Ended, SessionState::Active)
                | (SessionState::Ended, SessionState::Closed)
                | (SessionState::Failed { .. }, SessionState::Closed)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Failed { .. } => "failed",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { message } => write!(f, "failed: {}", message),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceInfo {
    pub kind: SourceKind,
    pub url: String,
    pub signed: bool,
}

/// Serialisable view of a session at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    #[serde(flatten)]
    pub state: SessionState,
    pub source: SourceInfo,
    /// `None` for progressive sources and once playback failed or closed.
    pub tiers: Option<TierMenu>,
    pub active_tier: Option<TierOption>,
    /// Reset to a stopped default once playback failed or closed.
    pub transport: Transport,
    pub fault_counts: BTreeMap<FaultKind, u64>,
    pub recent_faults: Vec<FaultRecord>,
    pub fragments_loaded: u64,
    pub created_at: DateTime<Utc>,
}

/// Owns one engine instance for one playback surface.
///
/// Engine events are only acted upon from [`pump`](Self::pump), so the
/// session processes them one at a time in emission order.
pub struct PlaybackSession {
    id: String,
    config: PlayerConfig,
    source: StreamSource,
    engine: Option<Box<dyn PlaybackEngine>>,
    subscriptions: Vec<Subscription>,
    guard: SessionGuard,
    quality: QualityTierManager,
    recovery: FaultRecoveryController,
    transport: Transport,
    surface: Box<dyn MediaSurface>,
    state: SessionState,
    fragments_loaded: u64,
    created_at: DateTime<Utc>,
    notifier: Option<UnboundedSender<Notification>>,
    resume_at: Option<Instant>,
    released: bool,
}

impl PlaybackSession {
    /// Attach `source` to `surface` and, for adaptive sources, build an
    /// engine whose every fetch goes through signed-URL substitution.
    ///
    /// `fetch` is the plain network loader the substitution wraps.
    pub fn start<F>(
        source: StreamSource,
        config: PlayerConfig,
        mut surface: Box<dyn MediaSurface>,
        fetch: Arc<dyn Loader>,
        make_engine: F,
    ) -> Self
    where
        F: FnOnce(Arc<dyn Loader>, &PlayerConfig) -> Box<dyn PlaybackEngine>,
    {
        let id = Uuid::new_v4().to_string();
        let guard = SessionGuard::new();
        surface.attach(&source);

        let mut subscriptions = Vec::new();
        let engine = match &source {
            StreamSource::Adaptive { url, directory } => {
                let directory = directory
                    .clone()
                    .unwrap_or_else(|| Arc::new(SignedUrlDirectory::new()));
                if directory.is_empty() {
                    warn!(
                        session_id = %id,
                        "No signed URLs for this stream, requesting original URLs"
                    );
                }
                let loader: Arc<dyn Loader> =
                    Arc::new(SubstitutingLoader::new(fetch, directory, guard.clone()));
                let mut engine = make_engine(loader, &config);
                subscriptions.push(engine.subscribe());
                engine.load_source(url.as_str());
                Some(engine)
            }
            StreamSource::Progressive { url } => {
                debug!(session_id = %id, %url, "Progressive source, playing directly");
                None
            }
        };

        info!(
            session_id = %id,
            kind = ?source.kind(),
            url = %source.url(),
            "Playback session started"
        );

        Self {
            id,
            quality: QualityTierManager::new(config.target_height),
            recovery: FaultRecoveryController::from_config(&config),
            config,
            source,
            engine,
            subscriptions,
            guard,
            transport: Transport::default(),
            surface,
            state: SessionState::Active,
            fragments_loaded: 0,
            created_at: Utc::now(),
            notifier: None,
            resume_at: None,
            released: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_notifier(mut self, notifier: Option<UnboundedSender<Notification>>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn source(&self) -> &StreamSource {
        &self.source
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn notifier(&self) -> Option<&UnboundedSender<Notification>> {
        self.notifier.as_ref()
    }

    pub fn quality(&self) -> &QualityTierManager {
        &self.quality
    }

    pub fn recovery(&self) -> &FaultRecoveryController {
        &self.recovery
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn fragments_loaded(&self) -> u64 {
        self.fragments_loaded
    }

    /// True while the engine should be driven.
    pub fn is_running(&self) -> bool {
        self.state == SessionState::Active && self.engine.is_some()
    }

    pub fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    /// Drive the engine one step and react to whatever it emitted. Waits out
    /// any pending recovery backoff first.
    pub async fn tick(&mut self) -> EngineStatus {
        if let Some(at) = self.resume_at {
            tokio::time::sleep_until(at).await;
            self.resume_at = None;
        }
        let Some(engine) = self.engine.as_deref_mut() else {
            return if self.released {
                EngineStatus::Destroyed
            } else {
                EngineStatus::Idle
            };
        };
        let status = engine.tick().await;
        self.pump();

        match self.engine.as_deref() {
            Some(engine) => {
                self.transport.update_timeline(engine.position(), engine.duration());
                status
            }
            None => EngineStatus::Destroyed,
        }
    }

    /// Process every queued engine event. Stops early once the session has
    /// been torn down. Returns the number of events handled.
    pub fn pump(&mut self) -> usize {
        let events: Vec<EngineEvent> = self
            .subscriptions
            .iter_mut()
            .flat_map(|s| s.drain())
            .collect();

        let mut handled = 0;
        for event in events {
            if self.engine.is_none() {
                break;
            }
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ManifestParsed { levels } => self.on_manifest_parsed(levels),
            EngineEvent::LevelLoaded {
                level,
                segment_count,
                duration,
            } => {
                debug!(session_id = %self.id, level, segment_count, duration, "Level loaded");
                if let Some(engine) = self.engine.as_deref() {
                    self.quality.on_levels_updated(engine.levels().to_vec());
                    self.transport.update_timeline(engine.position(), engine.duration());
                }
            }
            EngineEvent::LevelSwitching { level } => {
                debug!(session_id = %self.id, level, "Level switching");
            }
            EngineEvent::LevelSwitched { level } => {
                if let Some(tier) = self.quality.on_level_switched(level).cloned() {
                    self.notify(Notification::TierSwitched {
                        session_id: self.id.clone(),
                        tier,
                    });
                }
            }
            EngineEvent::FragmentLoaded {
                level,
                sequence,
                bytes,
                ..
            } => {
                self.fragments_loaded += 1;
                self.recovery.on_fragment_loaded();
                if let Some(engine) = self.engine.as_deref() {
                    self.transport.update_timeline(engine.position(), engine.duration());
                }
                debug!(
                    session_id = %self.id,
                    level,
                    sequence,
                    bytes,
                    fragments = self.fragments_loaded,
                    "Fragment loaded"
                );
                if self
                    .config
                    .max_segments
                    .is_some_and(|max| self.fragments_loaded >= max)
                {
                    info!(
                        session_id = %self.id,
                        fragments = self.fragments_loaded,
                        "Segment limit reached"
                    );
                    self.finish();
                }
            }
            EngineEvent::Fault(fault) => {
                let action = self.recovery.handle(&fault);
                if let Some(record) = self.recovery.last_record().cloned() {
                    self.notify(Notification::Fault {
                        session_id: self.id.clone(),
                        record,
                    });
                }
                match action {
                    RecoveryAction::Ignore => {}
                    RecoveryAction::RestartLoad => {
                        self.pace_recovery(fault.kind);
                        if let Some(engine) = self.engine.as_deref_mut() {
                            engine.start_load(None);
                        }
                    }
                    RecoveryAction::RecoverMediaError => {
                        self.pace_recovery(fault.kind);
                        if let Some(engine) = self.engine.as_deref_mut() {
                            engine.recover_media_error();
                        }
                    }
                    RecoveryAction::Teardown => {
                        self.fail(format!("Failed to load or play the stream: {}", fault.details));
                    }
                }
            }
            EngineEvent::EndOfStream => self.finish(),
        }
    }

    /// Hold the next engine step back by the recovery backoff for `kind`.
    fn pace_recovery(&mut self, kind: FaultKind) {
        let backoff = self.recovery.backoff(kind);
        if backoff.is_zero() {
            return;
        }
        debug!(session_id = %self.id, %kind, backoff_ms = backoff.as_millis(), "Delaying recovery");
        self.resume_at = Some(Instant::now() + backoff);
    }

    /// Pin the initial tier on all four level fields, then start loading.
    fn on_manifest_parsed(&mut self, levels: Vec<QualityTier>) {
        let pin = self.quality.on_manifest_parsed(levels);
        let Some(engine) = self.engine.as_deref_mut() else {
            return;
        };

        match pin {
            Some(index) => {
                let level = TierSelection::Index(index);
                engine.set_current_level(level);
                engine.set_next_level(level);
                engine.set_load_level(level);
                engine.set_start_level(level);
            }
            None if !self.config.abr_enabled => {
                self.quality.assume_engine_level(engine.start_level());
            }
            None => {}
        }

        if self.transport.playing {
            engine.start_load(None);
        } else {
            debug!(session_id = %self.id, "Paused, deferring load until play");
        }
    }

    /// Record a manual tier override. Index requests apply at the next
    /// segment boundary; `Auto` hands selection back to the engine.
    pub fn request_tier(
        &mut self,
        selection: TierSelection,
        generation: Option<u64>,
    ) -> Result<TierMenu, SessionError> {
        if !self.source.is_adaptive() {
            return Err(SessionError::NotAdaptive);
        }
        let Some(engine) = self.engine.as_deref_mut() else {
            return Err(SessionError::Closed);
        };

        let selection = self.quality.request(selection, generation)?;
        match selection {
            TierSelection::Auto => {
                engine.set_current_level(TierSelection::Auto);
                engine.set_load_level(TierSelection::Auto);
            }
            TierSelection::Index(_) => {
                engine.set_next_level(selection);
                engine.set_load_level(selection);
            }
        }
        info!(session_id = %self.id, tier = %selection, "Tier override applied");
        Ok(self.quality.menu())
    }

    pub fn control(&mut self, control: Control) -> Result<Transport, SessionError> {
        if matches!(self.state, SessionState::Failed { .. } | SessionState::Closed) {
            return Err(SessionError::Closed);
        }

        match control {
            Control::TogglePlay => {
                let playing = self.transport.toggle_play();
                if let Some(engine) = self.engine.as_deref_mut() {
                    if playing {
                        engine.start_load(None);
                    } else {
                        engine.stop_load();
                    }
                }
            }
            Control::Seek { position } => {
                let position = self.transport.seek(position);
                if let Some(engine) = self.engine.as_deref_mut() {
                    engine.seek(position);
                    let before_end = self.transport.duration.map_or(true, |d| position < d);
                    if self.state == SessionState::Ended && before_end {
                        self.state = SessionState::Active;
                        debug!(session_id = %self.id, position, "Seek reopened an ended session");
                        if self.transport.playing {
                            engine.start_load(None);
                        }
                    }
                }
            }
            Control::SetVolume { volume } => self.transport.set_volume(volume),
            Control::ToggleMute => {
                self.transport.toggle_mute();
            }
            Control::ToggleFullscreen => {
                self.transport.toggle_fullscreen();
            }
        }
        Ok(self.transport.clone())
    }

    fn transition(&mut self, target: SessionState) -> bool {
        if !self.state.can_transition_to(&target) {
            debug!(
                session_id = %self.id,
                from = %self.state,
                to = %target,
                "Ignoring state transition"
            );
            return false;
        }
        self.state = target;
        true
    }

    fn finish(&mut self) {
        if !self.transition(SessionState::Ended) {
            return;
        }
        if let Some(engine) = self.engine.as_deref_mut() {
            engine.stop_load();
        }
        info!(session_id = %self.id, fragments = self.fragments_loaded, "Playback ended");
        self.notify(Notification::SessionEnded {
            session_id: self.id.clone(),
            fragments_loaded: self.fragments_loaded,
        });
    }

    /// Terminal failure: one message, and nothing left attached.
    fn fail(&mut self, message: String) {
        if !self.transition(SessionState::Failed {
            message: message.clone(),
        }) {
            return;
        }
        error!(session_id = %self.id, %message, "Playback failed");
        self.release();
        self.notify(Notification::SessionFailed {
            session_id: self.id.clone(),
            message,
        });
    }

    /// Tear the session down. Safe to call more than once.
    pub fn close(&mut self) {
        if self.transition(SessionState::Closed) {
            info!(
                session_id = %self.id,
                fragments = self.fragments_loaded,
                "Playback session closed"
            );
        }
        self.release();
    }

    /// Subscriptions first, then the loader guard, the engine, and finally
    /// the surface.
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.resume_at = None;
        self.transport.playing = false;
        for subscription in &mut self.subscriptions {
            subscription.dispose();
        }
        self.subscriptions.clear();
        self.guard.close();
        if let Some(mut engine) = self.engine.take() {
            engine.destroy();
        }
        self.surface.release();
        debug!(session_id = %self.id, "Session resources released");
    }

    fn notify(&self, notification: Notification) {
        if let Some(tx) = &self.notifier {
            let _ = tx.send(notification);
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let live = matches!(self.state, SessionState::Active | SessionState::Ended);
        let tiers = (live && self.source.is_adaptive()).then(|| self.quality.menu());
        let active_tier = if live {
            self.quality.active_tier().map(TierOption::from)
        } else {
            None
        };
        let transport = if live {
            self.transport.clone()
        } else {
            Transport {
                playing: false,
                ..Transport::default()
            }
        };
        let mut fault_counts: BTreeMap<FaultKind, u64> =
            FaultKind::ALL.iter().map(|k| (*k, 0)).collect();
        fault_counts.extend(self.recovery.counts());

        SessionSnapshot {
            id: self.id.clone(),
            state: self.state.clone(),
            source: SourceInfo {
                kind: self.source.kind(),
                url: self.source.url().to_string(),
                signed: self.source.directory().is_some_and(|d| !d.is_empty()),
            },
            tiers,
            active_tier,
            transport,
            fault_counts,
            recent_faults: self.recovery.recent(),
            fragments_loaded: self.fragments_loaded,
            created_at: self.created_at,
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.release();
    }
}
