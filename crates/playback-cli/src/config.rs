//! TOML configuration file schema and parsing.
//!
//! Example config file:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! log_format = "json"
//!
//! [player]
//! target_height = 320
//! abr = false
//! request_timeout_ms = 10000
//! recovery_limit = 5
//!
//! [backend]
//! base_url = "http://localhost:8001"
//! token = "service-token"
//!
//! [[webhook]]
//! url = "https://hooks.example.com/playback"
//! events = ["fault", "session_failed"]
//! secret = "signing-key"
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use playback_core::{Notification, PlayerConfig, RecordingClient, WebhookConfig};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub player: PlayerSection,

    #[serde(default)]
    pub backend: Option<BackendConfig>,

    #[serde(default)]
    pub webhook: Vec<WebhookConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_format: default_log_format(),
        }
    }
}

pub fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_log_format() -> String {
    "pretty".into()
}

/// Defaults applied to every session the server opens.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerSection {
    #[serde(default = "default_target_height")]
    pub target_height: u32,

    #[serde(default)]
    pub abr: bool,

    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default)]
    pub fault_limit: Option<usize>,

    #[serde(default)]
    pub recovery_limit: Option<u32>,

    #[serde(default)]
    pub max_segments: Option<u64>,
}

impl Default for PlayerSection {
    fn default() -> Self {
        Self {
            target_height: default_target_height(),
            abr: false,
            request_timeout_ms: None,
            max_retries: None,
            fault_limit: None,
            recovery_limit: None,
            max_segments: None,
        }
    }
}

fn default_target_height() -> u32 {
    320
}

impl PlayerSection {
    pub fn to_player_config(&self) -> PlayerConfig {
        let mut c = PlayerConfig::default()
            .with_target_height(self.target_height)
            .with_abr(self.abr)
            .with_recovery_limit(self.recovery_limit)
            .with_max_segments(self.max_segments);
        if let Some(ms) = self.request_timeout_ms {
            c = c.with_request_timeout(ms);
        }
        if let Some(retries) = self.max_retries {
            c = c.with_max_retries(retries);
        }
        if let Some(limit) = self.fault_limit {
            c = c.with_fault_limit(limit);
        }
        c
    }
}

/// The recording service used to resolve recording ids.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_backend_timeout_ms() -> u64 {
    10_000
}

impl BackendConfig {
    pub fn to_client(&self) -> Result<RecordingClient, String> {
        let base_url = parse_http_url(&self.base_url)
            .map_err(|e| format!("Invalid backend base_url: {}", e))?;
        let timeout = Duration::from_millis(self.timeout_ms);
        let client = playback_core::HttpLoader::build_client(timeout);
        Ok(RecordingClient::with_client(client, base_url, self.token.clone()))
    }
}

pub fn parse_http_url(raw: &str) -> Result<Url, String> {
    let parsed = Url::parse(raw).map_err(|e| format!("{} ({})", raw, e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(format!("{} (scheme '{}' is not http or https)", raw, other)),
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;

        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {}", path.display(), e))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        match self.server.log_format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(format!(
                    "Invalid log_format '{}': must be 'pretty' or 'json'",
                    other
                ));
            }
        }

        if self.player.target_height == 0 {
            return Err("player.target_height must be greater than 0".into());
        }

        if let Some(backend) = &self.backend {
            backend.to_client()?;
        }

        for (i, wh) in self.webhook.iter().enumerate() {
            parse_http_url(&wh.url)
                .map_err(|e| format!("Invalid webhook URL at index {}: {}", i, e))?;
            if let Some(unknown) = wh
                .events
                .iter()
                .find(|e| !Notification::TYPES.contains(&e.as_str()))
            {
                return Err(format!(
                    "Unknown notification type '{}' for webhook at index {}",
                    unknown, i
                ));
            }
        }

        Ok(())
    }
}
