use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;

use playback_core::{
    headless_factory, EngineFactory, HttpLoader, Loader, Notification, PlayerConfig,
    PlayerHandle, RecordingClient,
};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<DashMap<String, PlayerHandle>>,
    pub default_config: PlayerConfig,
    pub notification_tx: Option<UnboundedSender<Notification>>,
    /// Needed to open sessions by recording id.
    pub backend: Option<RecordingClient>,
    pub fetch: Arc<dyn Loader>,
    pub factory: EngineFactory,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            default_config: PlayerConfig::default(),
            notification_tx: None,
            backend: None,
            fetch: Arc::new(HttpLoader::default()),
            factory: headless_factory(),
        }
    }

    pub fn with_notification_tx(mut self, tx: UnboundedSender<Notification>) -> Self {
        self.notification_tx = Some(tx);
        self
    }

    /// Also rebuilds the network loader from the new timeouts and retries.
    pub fn with_default_config(mut self, config: PlayerConfig) -> Self {
        self.fetch = Arc::new(HttpLoader::from_config(&config));
        self.default_config = config;
        self
    }

    pub fn with_backend(mut self, backend: RecordingClient) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_fetch(mut self, fetch: Arc<dyn Loader>) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_factory(mut self, factory: EngineFactory) -> Self {
        self.factory = factory;
        self
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
