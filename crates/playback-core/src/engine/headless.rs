use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use m3u8_rs::{MediaPlaylist, Playlist};
use tracing::{debug, trace, warn};
use url::Url;

use super::abr::ThroughputEstimator;
use super::events::{EventHub, Subscription};
use super::{EngineEvent, EngineStatus, PlaybackEngine};
use crate::classify::file_name;
use crate::config::PlayerConfig;
use crate::loader::{LoadError, LoadRequest, Loader};
use crate::quality::{QualityTier, TierSelection};
use crate::recovery::Fault;

const TS_SYNC_BYTE: u8 = 0x47;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unloaded,
    Manifest,
    Parsed,
    Ended,
    Destroyed,
}

#[derive(Debug, Clone)]
struct Fragment {
    url: String,
    sequence: u64,
    start: f64,
    duration: f64,
}

#[derive(Debug, Clone)]
struct LevelPlaylist {
    fragments: Vec<Fragment>,
    duration: f64,
}

impl LevelPlaylist {
    fn from_media(base: &str, media: &MediaPlaylist) -> Self {
        let mut start = 0.0;
        let fragments = media
            .segments
            .iter()
            .enumerate()
            .map(|(i, seg)| {
                let fragment = Fragment {
                    url: resolve_uri(base, &seg.uri),
                    sequence: media.media_sequence + i as u64,
                    start,
                    duration: seg.duration as f64,
                };
                start += fragment.duration;
                fragment
            })
            .collect();
        Self {
            fragments,
            duration: start,
        }
    }

    /// The fragment covering `position`, or the next one after it.
    fn fragment_at(&self, position: f64) -> Option<&Fragment> {
        self.fragments
            .iter()
            .find(|f| f.start + f.duration > position + 1e-3)
    }
}

#[derive(Debug, Clone)]
struct Level {
    url: String,
    playlist: Option<LevelPlaylist>,
}

/// Engine that walks an HLS presentation through a [`Loader`] without
/// decoding media.
///
/// Every manifest, level playlist and segment goes through the injected
/// loader. Position advances by the duration of each loaded fragment.
pub struct HeadlessEngine {
    loader: Arc<dyn Loader>,
    hub: EventHub,
    abr_enabled: bool,
    auto_start_load: bool,
    estimator: ThroughputEstimator,
    source: Option<String>,
    phase: Phase,
    levels: Vec<Level>,
    tiers: Vec<QualityTier>,
    manual: TierSelection,
    start: TierSelection,
    loading_level: Option<usize>,
    playing_level: Option<usize>,
    pending_switch: Option<usize>,
    loading: bool,
    stalled: bool,
    position: f64,
    duration: Option<f64>,
}

impl HeadlessEngine {
    pub fn new(loader: Arc<dyn Loader>, config: &PlayerConfig) -> Self {
        Self {
            loader,
            hub: EventHub::new(),
            abr_enabled: config.abr_enabled,
            auto_start_load: config.auto_start_load,
            estimator: ThroughputEstimator::new(config.abr_default_estimate_bps),
            source: None,
            phase: Phase::Unloaded,
            levels: Vec::new(),
            tiers: Vec::new(),
            manual: TierSelection::Auto,
            start: TierSelection::Index(config.start_level),
            loading_level: None,
            playing_level: None,
            pending_switch: None,
            loading: false,
            stalled: false,
            position: 0.0,
            duration: None,
        }
    }

    pub fn estimated_bandwidth(&self) -> u64 {
        self.estimator.estimate_bps()
    }

    fn raise(&mut self, fault: Fault) {
        if fault.fatal {
            self.stalled = true;
        }
        self.hub.emit(EngineEvent::Fault(fault));
    }

    fn raise_load_error(&mut self, err: &LoadError) {
        let fault = Fault::network(err.is_last_retry(), err.to_string())
            .with_url(err.url())
            .with_status_code(err.status_code());
        self.raise(fault);
    }

    fn target_level(&self) -> Option<usize> {
        if self.levels.is_empty() {
            return None;
        }
        match self.manual {
            TierSelection::Index(i) => Some(i),
            TierSelection::Auto if self.abr_enabled => self.estimator.pick(&self.tiers),
            TierSelection::Auto => Some(self.start.index().unwrap_or(0)),
        }
    }

    async fn load_manifest(&mut self) -> EngineStatus {
        if self.stalled {
            return EngineStatus::Idle;
        }
        let Some(url) = self.source.clone() else {
            return EngineStatus::Idle;
        };

        let response = match self.loader.load(&LoadRequest::manifest(&url)).await {
            Ok(response) => response,
            Err(e) => {
                self.raise_load_error(&e);
                return EngineStatus::Busy;
            }
        };

        let (tiers, levels) = match m3u8_rs::parse_playlist_res(&response.body) {
            Ok(Playlist::MasterPlaylist(master)) => master
                .variants
                .iter()
                .filter(|v| !v.is_i_frame)
                .enumerate()
                .map(|(i, v)| {
                    let (width, height) = v
                        .resolution
                        .as_ref()
                        .map(|r| (r.width as u32, r.height as u32))
                        .unwrap_or((0, 0));
                    let level = Level {
                        url: resolve_uri(&url, &v.uri),
                        playlist: None,
                    };
                    (QualityTier::new(i, width, height, v.bandwidth), level)
                })
                .unzip::<_, _, Vec<_>, Vec<_>>(),
            Ok(Playlist::MediaPlaylist(media)) => {
                debug!(url = %url, "Source is a media playlist, using it as the only level");
                let level = Level {
                    url: url.clone(),
                    playlist: Some(LevelPlaylist::from_media(&url, &media)),
                };
                (vec![QualityTier::new(0, 0, 0, 0)], vec![level])
            }
            Err(e) => {
                self.raise(
                    Fault::network(true, format!("Failed to parse manifest: {}", e)).with_url(&url),
                );
                return EngineStatus::Busy;
            }
        };

        if levels.is_empty() {
            self.raise(Fault::network(true, "Manifest lists no playable variants").with_url(&url));
            return EngineStatus::Busy;
        }

        self.tiers = tiers;
        self.levels = levels;
        self.phase = Phase::Parsed;
        debug!(url = %url, levels = self.levels.len(), "Manifest parsed");
        self.hub.emit(EngineEvent::ManifestParsed {
            levels: self.tiers.clone(),
        });

        if let Some(playlist) = &self.levels[0].playlist {
            if self.levels.len() == 1 {
                self.duration = Some(playlist.duration);
                self.hub.emit(EngineEvent::LevelLoaded {
                    level: 0,
                    segment_count: playlist.fragments.len(),
                    duration: playlist.duration,
                });
            }
        }

        if self.auto_start_load {
            self.loading = true;
        }
        EngineStatus::Busy
    }

    async fn load_level_playlist(&mut self, level: usize) -> EngineStatus {
        let url = self.levels[level].url.clone();
        let response = match self.loader.load(&LoadRequest::level(&url)).await {
            Ok(response) => response,
            Err(e) => {
                self.raise_load_error(&e);
                return EngineStatus::Busy;
            }
        };

        let media = match m3u8_rs::parse_media_playlist_res(&response.body) {
            Ok(media) => media,
            Err(e) => {
                self.raise(
                    Fault::network(true, format!("Failed to parse level {} playlist: {}", level, e))
                        .with_url(&url),
                );
                return EngineStatus::Busy;
            }
        };

        let playlist = LevelPlaylist::from_media(&url, &media);
        if playlist.fragments.is_empty() {
            self.raise(
                Fault::network(true, format!("Level {} playlist is empty", level)).with_url(&url),
            );
            return EngineStatus::Busy;
        }

        debug!(
            level,
            fragments = playlist.fragments.len(),
            duration = playlist.duration,
            "Level loaded"
        );
        self.duration.get_or_insert(playlist.duration);
        self.hub.emit(EngineEvent::LevelLoaded {
            level,
            segment_count: playlist.fragments.len(),
            duration: playlist.duration,
        });
        self.levels[level].playlist = Some(playlist);
        EngineStatus::Busy
    }

    async fn load_next(&mut self) -> EngineStatus {
        if self.stalled || !self.loading {
            return EngineStatus::Idle;
        }
        let Some(level) = self.target_level() else {
            return EngineStatus::Idle;
        };
        if level >= self.levels.len() {
            let count = self.levels.len();
            self.raise(Fault::other(
                true,
                format!("Level {} is outside the {} parsed levels", level, count),
            ));
            return EngineStatus::Busy;
        }

        if self.loading_level != Some(level) {
            trace!(from = ?self.loading_level, to = level, "Level switching");
            self.loading_level = Some(level);
            self.pending_switch = Some(level);
            self.hub.emit(EngineEvent::LevelSwitching { level });
        }

        if self.levels[level].playlist.is_none() {
            return self.load_level_playlist(level).await;
        }
        let position = self.position;
        let fragment = self.levels[level]
            .playlist
            .as_ref()
            .and_then(|p| p.fragment_at(position).cloned());
        let Some(fragment) = fragment else {
            debug!(position = self.position, "End of stream");
            self.phase = Phase::Ended;
            self.loading = false;
            self.hub.emit(EngineEvent::EndOfStream);
            return EngineStatus::Ended;
        };

        let started = Instant::now();
        let response = match self.loader.load(&LoadRequest::segment(&fragment.url)).await {
            Ok(response) => response,
            Err(e) => {
                self.raise_load_error(&e);
                return EngineStatus::Busy;
            }
        };

        if is_transport_stream(&fragment.url) && response.body.first() != Some(&TS_SYNC_BYTE) {
            self.raise(
                Fault::media(
                    true,
                    format!("Fragment {} is not an MPEG-TS stream", fragment.sequence),
                )
                .with_url(&fragment.url),
            );
            return EngineStatus::Busy;
        }

        self.estimator.push_sample(response.body.len(), started.elapsed());
        self.position = fragment.start + fragment.duration;
        self.playing_level = Some(level);

        self.hub.emit(EngineEvent::FragmentLoaded {
            level,
            sequence: fragment.sequence,
            url: fragment.url,
            bytes: response.body.len(),
            duration: fragment.duration,
        });
        if self.pending_switch == Some(level) {
            self.pending_switch = None;
            self.hub.emit(EngineEvent::LevelSwitched { level });
        }
        EngineStatus::Busy
    }
}

#[async_trait]
impl PlaybackEngine for HeadlessEngine {
    fn load_source(&mut self, url: &str) {
        if self.phase == Phase::Destroyed {
            warn!(url, "load_source on a destroyed engine");
            return;
        }
        self.source = Some(url.to_string());
        self.phase = Phase::Manifest;
        self.levels.clear();
        self.tiers.clear();
        self.manual = TierSelection::Auto;
        self.loading_level = None;
        self.playing_level = None;
        self.pending_switch = None;
        self.loading = false;
        self.stalled = false;
        self.position = 0.0;
        self.duration = None;
    }

    fn levels(&self) -> &[QualityTier] {
        &self.tiers
    }

    fn current_level(&self) -> TierSelection {
        self.playing_level
            .map_or(TierSelection::Auto, TierSelection::Index)
    }

    fn set_current_level(&mut self, level: TierSelection) {
        self.manual = level;
    }

    fn next_level(&self) -> TierSelection {
        self.manual
    }

    fn set_next_level(&mut self, level: TierSelection) {
        self.manual = level;
    }

    fn load_level(&self) -> TierSelection {
        self.manual
    }

    fn set_load_level(&mut self, level: TierSelection) {
        self.manual = level;
    }

    fn start_level(&self) -> TierSelection {
        self.start
    }

    fn set_start_level(&mut self, level: TierSelection) {
        self.start = level;
    }

    fn start_load(&mut self, position: Option<f64>) {
        if self.phase == Phase::Destroyed {
            return;
        }
        self.loading = true;
        self.stalled = false;
        if let Some(position) = position {
            self.seek(position);
        }
    }

    fn stop_load(&mut self) {
        self.loading = false;
    }

    fn recover_media_error(&mut self) {
        if self.phase == Phase::Destroyed {
            return;
        }
        self.stalled = false;
    }

    fn destroy(&mut self) {
        if self.phase == Phase::Destroyed {
            return;
        }
        self.phase = Phase::Destroyed;
        self.loading = false;
        self.levels.clear();
        self.tiers.clear();
        self.hub.close();
    }

    fn seek(&mut self, position: f64) {
        let mut position = position.max(0.0);
        if let Some(duration) = self.duration {
            position = position.min(duration);
            if self.phase == Phase::Ended && position < duration {
                self.phase = Phase::Parsed;
            }
        }
        self.position = position;
    }

    fn position(&self) -> f64 {
        self.position
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    async fn tick(&mut self) -> EngineStatus {
        match self.phase {
            Phase::Destroyed => EngineStatus::Destroyed,
            Phase::Unloaded => EngineStatus::Idle,
            Phase::Ended => EngineStatus::Ended,
            Phase::Manifest => self.load_manifest().await,
            Phase::Parsed => self.load_next().await,
        }
    }
}

fn resolve_uri(base: &str, uri: &str) -> String {
    match Url::parse(base).and_then(|b| b.join(uri)) {
        Ok(url) => url.to_string(),
        Err(_) => uri.to_string(),
    }
}

fn is_transport_stream(url: &str) -> bool {
    file_name(url)
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("ts"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::loader::LoadResponse;
    use crate::recovery::FaultKind;

    const BASE: &str = "https://cdn.example.com/rec";

    struct MapLoader {
        bodies: Mutex<HashMap<String, Vec<u8>>>,
        log: Mutex<Vec<LoadRequest>>,
    }

    impl MapLoader {
        fn new(entries: Vec<(String, Vec<u8>)>) -> Arc<Self> {
            Arc::new(Self {
                bodies: Mutex::new(entries.into_iter().collect()),
                log: Mutex::new(Vec::new()),
            })
        }

        fn set(&self, url: &str, body: Vec<u8>) {
            self.bodies.lock().unwrap().insert(url.to_string(), body);
        }

        fn urls(&self) -> Vec<String> {
            self.log.lock().unwrap().iter().map(|r| r.url.clone()).collect()
        }
    }

    #[async_trait]
    impl Loader for MapLoader {
        async fn load(&self, request: &LoadRequest) -> Result<LoadResponse, LoadError> {
            self.log.lock().unwrap().push(request.clone());
            match self.bodies.lock().unwrap().get(&request.url) {
                Some(body) => Ok(LoadResponse {
                    url: request.url.clone(),
                    body: Bytes::from(body.clone()),
                }),
                None => Err(LoadError::Http {
                    url: request.url.clone(),
                    status: 404,
                    message: "Not Found".into(),
                    is_last_retry: true,
                }),
            }
        }
    }

    fn master() -> Vec<u8> {
        b"#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=400000,RESOLUTION=568x320\n\
abc_320p.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=1200000,RESOLUTION=854x480\n\
abc_480p.m3u8\n"
            .to_vec()
    }

    fn level(label: &str) -> Vec<u8> {
        format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:1\n\
#EXTINF:4.0,\nabc_{label}_00001.ts\n#EXTINF:4.0,\nabc_{label}_00002.ts\n#EXT-X-ENDLIST\n"
        )
        .into_bytes()
    }

    fn ts() -> Vec<u8> {
        let mut body = vec![0u8; 188];
        body[0] = TS_SYNC_BYTE;
        body
    }

    fn full_stream() -> Vec<(String, Vec<u8>)> {
        let mut entries = vec![(format!("{BASE}/abc.m3u8"), master())];
        for label in ["320p", "480p"] {
            entries.push((format!("{BASE}/abc_{label}.m3u8"), level(label)));
            for n in 1..=2 {
                entries.push((format!("{BASE}/abc_{label}_0000{n}.ts"), ts()));
            }
        }
        entries
    }

    fn engine(loader: Arc<MapLoader>) -> HeadlessEngine {
        let mut engine = HeadlessEngine::new(loader, &PlayerConfig::default());
        engine.load_source(&format!("{BASE}/abc.m3u8"));
        engine
    }

    async fn run(engine: &mut HeadlessEngine, max_ticks: usize) -> EngineStatus {
        let mut status = EngineStatus::Busy;
        for _ in 0..max_ticks {
            status = engine.tick().await;
            if status != EngineStatus::Busy {
                break;
            }
        }
        status
    }

    #[tokio::test]
    async fn parses_master_and_waits_for_start_load() {
        let loader = MapLoader::new(full_stream());
        let mut engine = engine(loader.clone());
        let mut events = engine.subscribe();

        assert_eq!(run(&mut engine, 10).await, EngineStatus::Idle);

        let levels = engine.levels();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].label, "320p");
        assert_eq!(levels[1].bitrate_bps, 1_200_000);
        let seen = events.drain();
        assert!(matches!(seen.as_slice(), [EngineEvent::ManifestParsed { .. }]));
        assert_eq!(loader.urls(), vec![format!("{BASE}/abc.m3u8")]);
    }

    #[tokio::test]
    async fn plays_pinned_level_to_the_end() {
        let loader = MapLoader::new(full_stream());
        let mut engine = engine(loader.clone());
        let mut events = engine.subscribe();
        run(&mut engine, 10).await;

        engine.set_next_level(TierSelection::Index(1));
        engine.set_load_level(TierSelection::Index(1));
        engine.start_load(None);
        assert_eq!(run(&mut engine, 20).await, EngineStatus::Ended);

        assert_eq!(engine.position(), 8.0);
        assert_eq!(engine.duration(), Some(8.0));
        assert_eq!(engine.current_level(), TierSelection::Index(1));
        assert_eq!(
            loader.urls()[1..],
            [
                format!("{BASE}/abc_480p.m3u8"),
                format!("{BASE}/abc_480p_00001.ts"),
                format!("{BASE}/abc_480p_00002.ts"),
            ]
        );

        let kinds: Vec<_> = events
            .drain()
            .into_iter()
            .map(|e| match e {
                EngineEvent::ManifestParsed { .. } => "parsed",
                EngineEvent::LevelSwitching { .. } => "switching",
                EngineEvent::LevelLoaded { .. } => "level",
                EngineEvent::FragmentLoaded { .. } => "fragment",
                EngineEvent::LevelSwitched { .. } => "switched",
                EngineEvent::EndOfStream => "end",
                EngineEvent::Fault(_) => "fault",
            })
            .collect();
        assert_eq!(
            kinds,
            ["parsed", "switching", "level", "fragment", "switched", "fragment", "end"]
        );
    }

    #[tokio::test]
    async fn switch_applies_at_next_fragment() {
        let loader = MapLoader::new(full_stream());
        let mut engine = engine(loader.clone());
        run(&mut engine, 10).await;
        engine.set_load_level(TierSelection::Index(0));
        engine.start_load(None);

        // level playlist, first fragment
        engine.tick().await;
        engine.tick().await;
        engine.set_next_level(TierSelection::Index(1));
        run(&mut engine, 20).await;

        let urls = loader.urls();
        assert_eq!(urls[2], format!("{BASE}/abc_320p_00001.ts"));
        assert_eq!(urls[3], format!("{BASE}/abc_480p.m3u8"));
        assert_eq!(urls[4], format!("{BASE}/abc_480p_00002.ts"));
    }

    #[tokio::test]
    async fn missing_sync_byte_is_a_fatal_media_fault() {
        let loader = MapLoader::new(full_stream());
        loader.set(&format!("{BASE}/abc_320p_00001.ts"), b"<html>denied</html>".to_vec());
        let mut engine = engine(loader.clone());
        let mut events = engine.subscribe();
        run(&mut engine, 10).await;
        engine.start_load(None);

        assert_eq!(run(&mut engine, 10).await, EngineStatus::Idle);
        let fault = events
            .drain()
            .into_iter()
            .find_map(|e| match e {
                EngineEvent::Fault(f) => Some(f),
                _ => None,
            })
            .unwrap();
        assert_eq!(fault.kind, FaultKind::Media);
        assert!(fault.fatal);

        loader.set(&format!("{BASE}/abc_320p_00001.ts"), ts());
        engine.recover_media_error();
        assert_eq!(run(&mut engine, 10).await, EngineStatus::Ended);
        let retries = loader
            .urls()
            .iter()
            .filter(|u| u.ends_with("abc_320p_00001.ts"))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn failed_fragment_stalls_until_restart() {
        let mut entries = full_stream();
        entries.retain(|(url, _)| !url.ends_with("abc_320p_00002.ts"));
        let loader = MapLoader::new(entries);
        let mut engine = engine(loader.clone());
        let mut events = engine.subscribe();
        run(&mut engine, 10).await;
        engine.start_load(None);

        assert_eq!(run(&mut engine, 10).await, EngineStatus::Idle);
        assert_eq!(engine.position(), 4.0);
        let fault = events
            .drain()
            .into_iter()
            .find_map(|e| match e {
                EngineEvent::Fault(f) => Some(f),
                _ => None,
            })
            .unwrap();
        assert_eq!(fault.kind, FaultKind::Network);
        assert_eq!(fault.status_code, Some(404));

        loader.set(&format!("{BASE}/abc_320p_00002.ts"), ts());
        engine.start_load(None);
        assert_eq!(run(&mut engine, 10).await, EngineStatus::Ended);
    }

    #[tokio::test]
    async fn out_of_range_level_is_an_other_fault() {
        let loader = MapLoader::new(full_stream());
        let mut engine = engine(loader);
        let mut events = engine.subscribe();
        run(&mut engine, 10).await;
        engine.set_load_level(TierSelection::Index(7));
        engine.start_load(None);
        run(&mut engine, 10).await;

        let fault = events
            .drain()
            .into_iter()
            .find_map(|e| match e {
                EngineEvent::Fault(f) => Some(f),
                _ => None,
            })
            .unwrap();
        assert_eq!(fault.kind, FaultKind::Other);
        assert!(fault.fatal);
    }

    #[tokio::test]
    async fn media_playlist_source_is_a_single_level() {
        let loader = MapLoader::new(full_stream());
        let config = PlayerConfig::default().with_auto_start_load(true);
        let mut engine = HeadlessEngine::new(loader.clone(), &config);
        engine.load_source(&format!("{BASE}/abc_320p.m3u8"));

        assert_eq!(run(&mut engine, 10).await, EngineStatus::Ended);
        assert_eq!(engine.duration(), Some(8.0));
        // the playlist is not fetched twice
        assert_eq!(loader.urls().len(), 3);
    }

    #[tokio::test]
    async fn destroy_is_terminal_and_silent() {
        let loader = MapLoader::new(full_stream());
        let mut engine = engine(loader.clone());
        let mut events = engine.subscribe();
        engine.destroy();

        assert_eq!(engine.tick().await, EngineStatus::Destroyed);
        engine.start_load(None);
        assert_eq!(engine.tick().await, EngineStatus::Destroyed);
        assert!(events.try_recv().is_none());
        assert!(loader.urls().is_empty());
    }

    #[test]
    fn relative_uris_resolve_against_the_playlist() {
        assert_eq!(
            resolve_uri("https://cdn.example.com/rec/abc.m3u8?sig=1", "abc_320p.m3u8"),
            "https://cdn.example.com/rec/abc_320p.m3u8"
        );
        assert_eq!(
            resolve_uri("https://cdn.example.com/rec/abc.m3u8", "https://other.example.com/x.ts"),
            "https://other.example.com/x.ts"
        );
    }
}
