use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use playback_core::{
    notification_channel, Control, EngineEvent, EngineStatus, EventHub, Fault, FaultKind,
    LoadError, LoadRequest, LoadResponse, Loader, MediaSurface, Notification, PlaybackEngine,
    PlaybackSession, PlayerConfig, QualityTier, SessionError, SessionState, SignedUrlDirectory,
    StreamSource, Subscription, TierSelection,
};

const MASTER: &str = "https://cdn.example.com/rec/abc.m3u8";

#[derive(Debug, Clone, PartialEq)]
enum Call {
    LoadSource(String),
    SetCurrent(TierSelection),
    SetNext(TierSelection),
    SetLoad(TierSelection),
    SetStart(TierSelection),
    StartLoad,
    StopLoad,
    RecoverMedia,
    Destroy {
        subscribers: usize,
        loader_refused: bool,
    },
    Seek(f64),
    SurfaceRelease,
}

type CallLog = Arc<Mutex<Vec<Call>>>;

enum Step {
    Emit(EngineEvent),
    Fetch(LoadRequest),
}

/// Engine that replays a script, one batch per tick.
struct ScriptedEngine {
    hub: EventHub,
    loader: Arc<dyn Loader>,
    calls: CallLog,
    script: VecDeque<Vec<Step>>,
    levels: Vec<QualityTier>,
    destroyed: bool,
}

impl ScriptedEngine {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PlaybackEngine for ScriptedEngine {
    fn load_source(&mut self, url: &str) {
        self.record(Call::LoadSource(url.to_string()));
    }

    fn levels(&self) -> &[QualityTier] {
        &self.levels
    }

    fn current_level(&self) -> TierSelection {
        TierSelection::Auto
    }

    fn set_current_level(&mut self, level: TierSelection) {
        self.record(Call::SetCurrent(level));
    }

    fn next_level(&self) -> TierSelection {
        TierSelection::Auto
    }

    fn set_next_level(&mut self, level: TierSelection) {
        self.record(Call::SetNext(level));
    }

    fn load_level(&self) -> TierSelection {
        TierSelection::Auto
    }

    fn set_load_level(&mut self, level: TierSelection) {
        self.record(Call::SetLoad(level));
    }

    fn start_level(&self) -> TierSelection {
        TierSelection::Auto
    }

    fn set_start_level(&mut self, level: TierSelection) {
        self.record(Call::SetStart(level));
    }

    fn start_load(&mut self, _position: Option<f64>) {
        self.record(Call::StartLoad);
    }

    fn stop_load(&mut self) {
        self.record(Call::StopLoad);
    }

    fn recover_media_error(&mut self) {
        self.record(Call::RecoverMedia);
    }

    fn destroy(&mut self) {
        let late = LoadRequest::segment("https://cdn.example.com/rec/abc_320p_00009.ts");
        let loader_refused = matches!(
            futures::executor::block_on(self.loader.load(&late)),
            Err(LoadError::SessionClosed { .. })
        );
        self.record(Call::Destroy {
            subscribers: self.hub.subscriber_count(),
            loader_refused,
        });
        self.destroyed = true;
        self.hub.close();
    }

    fn seek(&mut self, position: f64) {
        self.record(Call::Seek(position));
    }

    fn position(&self) -> f64 {
        0.0
    }

    fn duration(&self) -> Option<f64> {
        Some(20.0)
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    async fn tick(&mut self) -> EngineStatus {
        if self.destroyed {
            return EngineStatus::Destroyed;
        }
        let Some(batch) = self.script.pop_front() else {
            return EngineStatus::Idle;
        };
        for step in batch {
            match step {
                Step::Emit(event) => self.hub.emit(event),
                Step::Fetch(request) => {
                    let _ = self.loader.load(&request).await;
                }
            }
        }
        EngineStatus::Busy
    }
}

/// Network stand-in that counts what reaches it.
#[derive(Default)]
struct CountingLoader {
    requests: Mutex<Vec<String>>,
    hits: AtomicUsize,
}

#[async_trait]
impl Loader for CountingLoader {
    async fn load(&self, request: &LoadRequest) -> Result<LoadResponse, LoadError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.url.clone());
        Ok(LoadResponse {
            url: request.url.clone(),
            body: Bytes::from_static(b"#EXTM3U\n"),
        })
    }
}

struct RecordingSurface {
    calls: CallLog,
    attached: bool,
}

impl MediaSurface for RecordingSurface {
    fn attach(&mut self, _source: &StreamSource) {
        self.attached = true;
    }

    fn release(&mut self) {
        if self.attached {
            self.attached = false;
            self.calls.lock().unwrap().push(Call::SurfaceRelease);
        }
    }

    fn is_attached(&self) -> bool {
        self.attached
    }
}

struct Harness {
    session: PlaybackSession,
    calls: CallLog,
    network: Arc<CountingLoader>,
    engine_loader: Arc<Mutex<Option<Arc<dyn Loader>>>>,
}

impl Harness {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn destroys(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Destroy { .. }))
            .count()
    }

    fn engine_loader(&self) -> Arc<dyn Loader> {
        self.engine_loader.lock().unwrap().clone().unwrap()
    }

    fn notify_to(mut self, tx: tokio::sync::mpsc::UnboundedSender<Notification>) -> Self {
        self.session = self.session.with_notifier(Some(tx));
        self
    }
}

fn tiers(heights: &[u32]) -> Vec<QualityTier> {
    heights
        .iter()
        .enumerate()
        .map(|(i, h)| QualityTier::new(i, h * 16 / 9, *h, u64::from(*h) * 3000))
        .collect()
}

fn directory() -> SignedUrlDirectory {
    SignedUrlDirectory::new()
        .with_master("https://signed.example.com/abc.m3u8?sig=m".parse().unwrap())
        .with_tier_manifest(
            "320p",
            "https://signed.example.com/abc_320p.m3u8?sig=t".parse().unwrap(),
        )
        .with_segment_base(
            "320p",
            "https://signed.example.com/abc_320p_00001.ts?sig=s".parse().unwrap(),
        )
}

fn harness(config: PlayerConfig, script: Vec<Vec<Step>>, levels: Vec<QualityTier>) -> Harness {
    let calls: CallLog = Arc::default();
    let network = Arc::new(CountingLoader::default());
    let engine_loader: Arc<Mutex<Option<Arc<dyn Loader>>>> = Arc::default();

    let source = StreamSource::adaptive(MASTER.parse().unwrap(), Some(directory()));
    let surface = Box::new(RecordingSurface {
        calls: Arc::clone(&calls),
        attached: false,
    });

    let engine_calls = Arc::clone(&calls);
    let slot = Arc::clone(&engine_loader);
    let session = PlaybackSession::start(
        source,
        config,
        surface,
        network.clone(),
        move |loader: Arc<dyn Loader>, _config: &PlayerConfig| -> Box<dyn PlaybackEngine> {
            *slot.lock().unwrap() = Some(Arc::clone(&loader));
            Box::new(ScriptedEngine {
                hub: EventHub::new(),
                loader,
                calls: engine_calls,
                script: script.into(),
                levels,
                destroyed: false,
            })
        },
    );

    Harness {
        session,
        calls,
        network,
        engine_loader,
    }
}

fn parsed(heights: &[u32]) -> Step {
    Step::Emit(EngineEvent::ManifestParsed {
        levels: tiers(heights),
    })
}

fn fault(f: Fault) -> Step {
    Step::Emit(EngineEvent::Fault(f))
}

fn fragment(sequence: u64) -> Step {
    Step::Emit(EngineEvent::FragmentLoaded {
        level: 1,
        sequence,
        url: format!("https://cdn.example.com/rec/abc_320p_{:05}.ts", sequence),
        bytes: 188 * 100,
        duration: 10.0,
    })
}

#[tokio::test]
async fn pin_lands_on_all_level_fields_before_loading_starts() {
    let mut h = harness(
        PlayerConfig::default(),
        vec![vec![parsed(&[180, 320, 480, 720])]],
        tiers(&[180, 320, 480, 720]),
    );
    h.session.tick().await;

    let pin = TierSelection::Index(1);
    assert_eq!(
        h.calls(),
        vec![
            Call::LoadSource(MASTER.to_string()),
            Call::SetCurrent(pin),
            Call::SetNext(pin),
            Call::SetLoad(pin),
            Call::SetStart(pin),
            Call::StartLoad,
        ]
    );
    assert_eq!(h.session.quality().active(), pin);
}

#[tokio::test]
async fn falls_back_to_greatest_height_below_target() {
    let mut h = harness(
        PlayerConfig::default(),
        vec![vec![parsed(&[180, 480, 720])]],
        tiers(&[180, 480, 720]),
    );
    h.session.tick().await;
    assert_eq!(h.count(&Call::SetStart(TierSelection::Index(0))), 1);
}

#[tokio::test]
async fn no_qualifying_tier_leaves_levels_alone_but_still_loads() {
    let mut h = harness(
        PlayerConfig::default(),
        vec![vec![parsed(&[480, 720])]],
        tiers(&[480, 720]),
    );
    h.session.tick().await;
    assert_eq!(
        h.calls(),
        vec![Call::LoadSource(MASTER.to_string()), Call::StartLoad]
    );
    assert!(h.session.quality().active().is_auto());
}

#[tokio::test]
async fn fatal_network_fault_reloads_exactly_once() {
    let mut h = harness(
        PlayerConfig::default(),
        vec![vec![fault(Fault::network(true, "level 403"))]],
        Vec::new(),
    );
    h.session.tick().await;

    assert_eq!(h.count(&Call::StartLoad), 1);
    assert_eq!(h.count(&Call::RecoverMedia), 0);
    assert_eq!(h.destroys(), 0);
    assert_eq!(h.session.state(), &SessionState::Active);
    assert_eq!(h.session.recovery().count(FaultKind::Network), 1);
}

#[tokio::test]
async fn fatal_media_fault_runs_recovery_exactly_once() {
    let mut h = harness(
        PlayerConfig::default(),
        vec![vec![fault(Fault::media(true, "bad sync byte"))]],
        Vec::new(),
    );
    h.session.tick().await;

    assert_eq!(h.count(&Call::RecoverMedia), 1);
    assert_eq!(h.count(&Call::StartLoad), 0);
    assert_eq!(h.destroys(), 0);
}

#[tokio::test]
async fn non_fatal_faults_take_no_action() {
    let mut h = harness(
        PlayerConfig::default(),
        vec![vec![
            fault(Fault::network(false, "segment retry")),
            fault(Fault::media(false, "buffer stall")),
        ]],
        Vec::new(),
    );
    h.session.tick().await;

    assert_eq!(h.calls(), vec![Call::LoadSource(MASTER.to_string())]);
    assert_eq!(h.session.recovery().total(), 2);
}

#[tokio::test]
async fn other_fatal_fault_tears_down_and_nothing_follows() {
    let (tx, mut rx) = notification_channel();
    let mut h = harness(
        PlayerConfig::default(),
        vec![
            vec![
                fault(Fault::new(FaultKind::KeySystem, true, "no key")),
                parsed(&[320]),
            ],
            vec![Step::Fetch(LoadRequest::manifest(MASTER))],
        ],
        tiers(&[320]),
    )
    .notify_to(tx);

    let status = h.session.tick().await;
    assert_eq!(status, EngineStatus::Destroyed);
    assert_eq!(h.destroys(), 1);
    assert!(matches!(
        h.session.state(),
        SessionState::Failed { message } if message.contains("no key")
    ));

    // The manifest event queued behind the fault is never acted upon.
    assert_eq!(h.session.quality().generation(), 0);
    assert_eq!(h.count(&Call::StartLoad), 0);

    // No further ticks, fetches or substitutions for this engine.
    assert_eq!(h.session.tick().await, EngineStatus::Destroyed);
    let refused = h
        .engine_loader()
        .load(&LoadRequest::segment(
            "https://cdn.example.com/rec/abc_320p_00003.ts",
        ))
        .await;
    assert!(matches!(refused, Err(LoadError::SessionClosed { .. })));
    assert_eq!(h.network.hits.load(Ordering::SeqCst), 0);

    let snapshot = h.session.snapshot();
    assert!(snapshot.tiers.is_none());
    assert!(snapshot.active_tier.is_none());
    assert!(!snapshot.transport.playing);
    assert!(!h.session.transport().playing);

    let mut kinds = Vec::new();
    while let Ok(n) = rx.try_recv() {
        kinds.push(n.notification_type());
    }
    assert_eq!(kinds, vec!["fault", "session_failed"]);
}

#[tokio::test]
async fn failure_after_the_pin_leaves_no_playback_state_behind() {
    let mut h = harness(
        PlayerConfig::default(),
        vec![
            vec![parsed(&[180, 320])],
            vec![fault(Fault::other(true, "decoder gone"))],
        ],
        tiers(&[180, 320]),
    );

    h.session.tick().await;
    let playing = h.session.snapshot();
    assert_eq!(playing.active_tier.as_ref().map(|t| t.height), Some(320));
    assert!(playing.transport.playing);
    assert!(playing.tiers.is_some());

    h.session.tick().await;
    let failed = h.session.snapshot();
    assert!(matches!(failed.state, SessionState::Failed { .. }));
    assert!(failed.tiers.is_none());
    assert!(failed.active_tier.is_none());
    assert!(!failed.transport.playing);
    assert_eq!(failed.transport.duration, None);

    let json = serde_json::to_value(&failed).unwrap();
    assert!(json["active_tier"].is_null());
    assert_eq!(json["transport"]["playing"], false);
}

#[tokio::test(start_paused = true)]
async fn consecutive_restarts_wait_out_a_growing_backoff() {
    let forbidden = || vec![fault(Fault::network(true, "segment 403"))];
    let mut h = harness(
        PlayerConfig::default()
            .with_retry_backoff(100)
            .with_max_recovery_backoff(250),
        vec![
            forbidden(),
            forbidden(),
            forbidden(),
            vec![fragment(1)],
            forbidden(),
            Vec::new(),
        ],
        tiers(&[320]),
    );
    let started = tokio::time::Instant::now();
    let within = |ms: u64| {
        let elapsed = started.elapsed();
        elapsed >= Duration::from_millis(ms) && elapsed < Duration::from_millis(ms + 20)
    };

    h.session.tick().await;
    assert!(within(0));
    h.session.tick().await;
    assert!(within(100));
    h.session.tick().await;
    assert!(within(300));
    // capped, and the fragment it loads resets the streak
    h.session.tick().await;
    assert!(within(550));
    h.session.tick().await;
    assert!(within(550));
    h.session.tick().await;
    assert!(within(650));

    assert_eq!(h.count(&Call::StartLoad), 4);
    assert_eq!(h.session.recovery().count(FaultKind::Network), 4);
    assert_eq!(h.session.state(), &SessionState::Active);
}

#[tokio::test]
async fn teardown_disposes_subscriptions_then_guard_then_engine_then_surface() {
    let mut h = harness(PlayerConfig::default(), Vec::new(), Vec::new());
    h.session.close();

    let calls = h.calls();
    assert_eq!(
        &calls[1..],
        &[
            Call::Destroy {
                subscribers: 0,
                loader_refused: true,
            },
            Call::SurfaceRelease,
        ]
    );
    assert_eq!(h.session.state(), &SessionState::Closed);

    h.session.close();
    assert_eq!(h.destroys(), 1);
}

#[tokio::test]
async fn loader_substitutes_through_the_session_directory() {
    let mut h = harness(
        PlayerConfig::default(),
        vec![vec![
            Step::Fetch(LoadRequest::manifest(MASTER)),
            Step::Fetch(LoadRequest::level("https://cdn.example.com/rec/abc_320p.m3u8")),
            Step::Fetch(LoadRequest::segment(
                "https://cdn.example.com/rec/abc_320p_00042.ts",
            )),
            Step::Fetch(LoadRequest::level("https://cdn.example.com/rec/abc_720p.m3u8")),
            Step::Fetch(LoadRequest::segment("https://cdn.example.com/rec/poster.jpg")),
        ]],
        Vec::new(),
    );
    h.session.tick().await;

    let requests = h.network.requests.lock().unwrap().clone();
    assert_eq!(
        requests,
        vec![
            "https://signed.example.com/abc.m3u8?sig=m",
            "https://signed.example.com/abc_320p.m3u8?sig=t",
            "https://signed.example.com/abc_320p_00042.ts?sig=s",
            "https://cdn.example.com/rec/abc_720p.m3u8",
            "https://cdn.example.com/rec/poster.jpg",
        ]
    );
}

#[tokio::test]
async fn level_switch_updates_active_tier_and_notifies() {
    let (tx, mut rx) = notification_channel();
    let mut h = harness(
        PlayerConfig::default(),
        vec![
            vec![parsed(&[180, 320, 720])],
            vec![Step::Emit(EngineEvent::LevelSwitched { level: 2 })],
        ],
        tiers(&[180, 320, 720]),
    )
    .notify_to(tx);
    h.session.tick().await;
    h.session.tick().await;

    assert_eq!(h.session.quality().active(), TierSelection::Index(2));
    assert_eq!(h.session.snapshot().active_tier.unwrap().height, 720);
    match rx.try_recv() {
        Ok(Notification::TierSwitched { tier, .. }) => assert_eq!(tier.label, "720p"),
        other => panic!("expected tier switch notification, got {:?}", other),
    }
}

#[tokio::test]
async fn manual_override_sets_next_and_load_level_only() {
    let mut h = harness(
        PlayerConfig::default(),
        vec![vec![parsed(&[180, 320, 720])]],
        tiers(&[180, 320, 720]),
    );
    h.session.tick().await;
    h.calls.lock().unwrap().clear();

    let generation = h.session.quality().generation();
    let menu = h
        .session
        .request_tier(TierSelection::Index(2), Some(generation))
        .unwrap();
    assert_eq!(menu.active, TierSelection::Index(2));
    assert_eq!(
        h.calls(),
        vec![
            Call::SetNext(TierSelection::Index(2)),
            Call::SetLoad(TierSelection::Index(2)),
        ]
    );

    h.calls.lock().unwrap().clear();
    h.session.request_tier(TierSelection::Auto, None).unwrap();
    assert_eq!(
        h.calls(),
        vec![
            Call::SetCurrent(TierSelection::Auto),
            Call::SetLoad(TierSelection::Auto),
        ]
    );
}

#[tokio::test]
async fn stale_tier_indices_are_refused_after_a_reparse() {
    let mut h = harness(
        PlayerConfig::default(),
        vec![vec![parsed(&[180, 320, 720])], vec![parsed(&[320])]],
        tiers(&[180, 320, 720]),
    );
    h.session.tick().await;
    let first = h.session.quality().generation();
    h.session.tick().await;

    assert!(matches!(
        h.session.request_tier(TierSelection::Index(2), Some(first)),
        Err(SessionError::StaleTierGeneration { .. })
    ));
    assert!(matches!(
        h.session.request_tier(TierSelection::Index(2), None),
        Err(SessionError::UnknownTier { index: 2, available: 1 })
    ));
}

#[tokio::test]
async fn segment_limit_ends_the_session() {
    let (tx, mut rx) = notification_channel();
    let mut h = harness(
        PlayerConfig::default().with_max_segments(Some(2)),
        vec![vec![fragment(1)], vec![fragment(2)]],
        Vec::new(),
    )
    .notify_to(tx);
    h.session.tick().await;
    assert_eq!(h.session.state(), &SessionState::Active);
    h.session.tick().await;

    assert_eq!(h.session.state(), &SessionState::Ended);
    assert_eq!(h.session.fragments_loaded(), 2);
    assert_eq!(h.count(&Call::StopLoad), 1);
    assert!(matches!(
        rx.try_recv(),
        Ok(Notification::SessionEnded { fragments_loaded: 2, .. })
    ));
}

#[tokio::test]
async fn seeking_back_reopens_an_ended_session() {
    let mut h = harness(
        PlayerConfig::default(),
        vec![vec![Step::Emit(EngineEvent::EndOfStream)]],
        Vec::new(),
    );
    h.session.tick().await;
    assert_eq!(h.session.state(), &SessionState::Ended);

    h.session.control(Control::Seek { position: 5.0 }).unwrap();
    assert_eq!(h.session.state(), &SessionState::Active);
    assert!(h.calls().ends_with(&[Call::Seek(5.0), Call::StartLoad]));
}

#[tokio::test]
async fn pause_stops_loading_and_play_resumes_it() {
    let mut h = harness(PlayerConfig::default(), Vec::new(), Vec::new());
    let transport = h.session.control(Control::TogglePlay).unwrap();
    assert!(!transport.playing);
    h.session.control(Control::TogglePlay).unwrap();
    assert!(h.calls().ends_with(&[Call::StopLoad, Call::StartLoad]));
}
