//! Webhook notifications.
//!
//! Playback sessions push [`Notification`]s into an unbounded channel. The
//! [`WebhookDispatcher`] drains that channel and POSTs a JSON envelope to
//! every configured endpoint that accepts the notification type.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::quality::QualityTier;
use crate::recovery::FaultRecord;

pub const SIGNATURE_HEADER: &str = "X-Playback-Signature-256";

/// Configuration for a single webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,

    /// Notification types to deliver. Empty means all.
    #[serde(default)]
    pub events: Vec<String>,

    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_webhook_retries")]
    pub max_retries: u32,

    /// HMAC-SHA256 key for the signature header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

fn default_webhook_timeout_ms() -> u64 {
    5000
}

fn default_webhook_retries() -> u32 {
    2
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            events: Vec::new(),
            timeout_ms: default_webhook_timeout_ms(),
            max_retries: default_webhook_retries(),
            secret: None,
        }
    }

    pub fn accepts(&self, notification_type: &str) -> bool {
        self.events.is_empty() || self.events.iter().any(|e| e == notification_type)
    }
}

#[derive(Debug, Clone)]
pub enum Notification {
    Fault {
        session_id: String,
        record: FaultRecord,
    },
    TierSwitched {
        session_id: String,
        tier: QualityTier,
    },
    SessionFailed {
        session_id: String,
        message: String,
    },
    SessionEnded {
        session_id: String,
        fragments_loaded: u64,
    },
}

impl Notification {
    pub const TYPES: [&'static str; 4] =
        ["fault", "tier_switched", "session_failed", "session_ended"];

    pub fn notification_type(&self) -> &'static str {
        match self {
            Self::Fault { .. } => "fault",
            Self::TierSwitched { .. } => "tier_switched",
            Self::SessionFailed { .. } => "session_failed",
            Self::SessionEnded { .. } => "session_ended",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Fault { session_id, .. }
            | Self::TierSwitched { session_id, .. }
            | Self::SessionFailed { session_id, .. }
            | Self::SessionEnded { session_id, .. } => session_id,
        }
    }
}

/// The JSON envelope POSTed to webhook endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub version: u8,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub session_id: String,
    pub data: serde_json::Value,
}

impl WebhookPayload {
    pub fn from_notification(notification: &Notification) -> Self {
        let (timestamp, data) = match notification {
            Notification::Fault { record, .. } => (
                record.timestamp,
                serde_json::json!({
                    "kind": record.kind,
                    "fatal": record.fatal,
                    "details": record.details,
                    "url": record.url,
                    "status_code": record.status_code,
                    "action": record.action,
                }),
            ),
            Notification::TierSwitched { tier, .. } => (
                Utc::now(),
                serde_json::json!({
                    "index": tier.index,
                    "label": tier.label,
                    "height": tier.height,
                    "bitrate": tier.bitrate_bps,
                }),
            ),
            Notification::SessionFailed { message, .. } => {
                (Utc::now(), serde_json::json!({ "message": message }))
            }
            Notification::SessionEnded {
                fragments_loaded, ..
            } => (
                Utc::now(),
                serde_json::json!({ "fragments_loaded": fragments_loaded }),
            ),
        };

        Self {
            version: 1,
            id: Uuid::new_v4().to_string(),
            timestamp,
            notification_type: notification.notification_type().to_string(),
            session_id: notification.session_id().to_string(),
            data,
        }
    }
}

/// Background task delivering notifications to webhook endpoints.
pub struct WebhookDispatcher {
    rx: mpsc::UnboundedReceiver<Notification>,
    webhooks: Vec<WebhookConfig>,
    client: Client,
}

impl WebhookDispatcher {
    pub fn new(
        rx: mpsc::UnboundedReceiver<Notification>,
        webhooks: Vec<WebhookConfig>,
        client: Client,
    ) -> Self {
        Self {
            rx,
            webhooks,
            client,
        }
    }

    /// Run until every sender is dropped.
    pub async fn run(mut self) {
        debug!(webhook_count = self.webhooks.len(), "Webhook dispatcher started");

        while let Some(notification) = self.rx.recv().await {
            let notification_type = notification.notification_type();
            let payload = WebhookPayload::from_notification(&notification);
            let body = match serde_json::to_vec(&payload) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize webhook payload");
                    continue;
                }
            };

            for wh in self.webhooks.iter().filter(|wh| wh.accepts(notification_type)) {
                let timeout = Duration::from_millis(wh.timeout_ms);
                let secret = wh.secret.as_deref();
                match deliver(&self.client, &wh.url, &body, secret, timeout, wh.max_retries).await {
                    Ok(()) => debug!(url = %wh.url, notification_type, "Webhook delivered"),
                    Err(e) => warn!(
                        url = %wh.url,
                        notification_type,
                        error = %e,
                        "Webhook delivery failed"
                    ),
                }
            }
        }

        debug!("Webhook dispatcher shutting down");
    }
}

pub fn notification_channel() -> (
    mpsc::UnboundedSender<Notification>,
    mpsc::UnboundedReceiver<Notification>,
) {
    mpsc::unbounded_channel()
}

async fn deliver(
    client: &Client,
    url: &str,
    body: &[u8],
    secret: Option<&str>,
    timeout: Duration,
    max_retries: u32,
) -> Result<(), String> {
    let mut last_error = String::new();

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(500 * 2u64.pow(attempt - 1))).await;
        }

        let mut req = client
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", concat!("hls-playback/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .body(body.to_vec());

        if let Some(secret) = secret {
            req = req.header(SIGNATURE_HEADER, format!("sha256={}", sign_payload(body, secret)));
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => {
                let status = resp.status().as_u16();
                last_error = format!("HTTP {} from {}", status, url);
                if (400..500).contains(&status) && status != 429 {
                    return Err(last_error);
                }
            }
            Err(e) => {
                last_error = format!("Request to {} failed: {}", url, e);
            }
        }
    }

    Err(last_error)
}

fn sign_payload(body: &[u8], secret: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
