//! Argus webhook registration.
//!
//! The gateway stores a webhook spec as an item in an Argus bucket so the
//! fabric's event deliverer knows where to POST. The item uses the legacy
//! Caduceus shape and a deterministic id (SHA-256 of the lowercased callback
//! URL) so re-registration overwrites rather than duplicates. Registration is
//! best-effort: failures are logged and retried a bounded number of times,
//! never fatal to the gateway itself.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::WebhookConfig;

/// Pause between registration attempts.
const RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Duration advertised when the operator sets none (~7.5 years, the fabric's
/// conventional "effectively forever").
const DEFAULT_DURATION: Duration = Duration::from_secs(0xffff * 3600);

/// Registers this gateway's event callback with the fabric's directory.
/// Swappable so deployments with a different directory service (or none) can
/// plug in their own.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self);
}

/// Item stored in the Argus bucket.
#[derive(Debug, Serialize)]
struct Item {
    id: String,
    data: LegacyWebhookData,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u64>,
}

/// Payload shape the legacy event deliverer expects.
#[derive(Debug, Serialize)]
struct LegacyWebhookData {
    #[serde(rename = "PartnerIDs")]
    partner_ids: Vec<String>,
    #[serde(rename = "Webhook")]
    webhook: LegacyWebhook,
}

#[derive(Debug, Serialize)]
struct LegacyWebhook {
    config: LegacyWebhookConfig,
    events: Vec<String>,
    matcher: LegacyWebhookMatcher,
    failure_url: String,
    /// Nanoseconds, per the legacy duration encoding.
    duration: i64,
    until: DateTime<Utc>,
    #[serde(skip_serializing_if = "String::is_empty")]
    registered_from_address: String,
}

#[derive(Debug, Serialize)]
struct LegacyWebhookConfig {
    url: String,
    content_type: String,
}

#[derive(Debug, Serialize)]
struct LegacyWebhookMatcher {
    device_id: Vec<String>,
}

/// [`Registrar`] backed by the Argus store API.
pub struct ArgusRegistrar {
    http: reqwest::Client,
    config: WebhookConfig,
}

impl ArgusRegistrar {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn item(&self) -> Item {
        let events = if self.config.events.is_empty() {
            vec![".*".to_string()]
        } else {
            self.config.events.clone()
        };
        let devices = if self.config.device_matchers.is_empty() {
            vec![".*".to_string()]
        } else {
            self.config.device_matchers.clone()
        };
        Item {
            id: item_id(&self.config.callback_url),
            data: LegacyWebhookData {
                partner_ids: Vec::new(),
                webhook: LegacyWebhook {
                    config: LegacyWebhookConfig {
                        url: self.config.callback_url.clone(),
                        content_type: "application/msgpack".to_string(),
                    },
                    events,
                    matcher: LegacyWebhookMatcher { device_id: devices },
                    failure_url: String::new(),
                    duration: duration_nanos(DEFAULT_DURATION),
                    until: Utc::now() + DEFAULT_DURATION,
                    registered_from_address: "wrp-gateway".to_string(),
                },
            },
            ttl: (self.config.ttl_secs > 0).then_some(self.config.ttl_secs),
        }
    }
}

#[async_trait]
impl Registrar for ArgusRegistrar {
    async fn register(&self) {
        if !self.config.enable {
            info!("webhook registration disabled");
            return;
        }
        if self.config.argus_url.is_empty() || self.config.callback_url.is_empty() {
            warn!("webhook registration skipped: missing argus_url or callback_url");
            return;
        }

        let item = self.item();
        let url = format!(
            "{}/api/v1/store/{}/{}",
            self.config.argus_url.trim_end_matches('/'),
            self.config.bucket,
            item.id
        );

        for attempt in 0..=self.config.retries {
            info!(
                id = %item.id,
                callback = %self.config.callback_url,
                attempt,
                "registering webhook"
            );
            let mut request = self.http.put(&url).json(&item);
            if !self.config.auth_basic.is_empty() {
                request = request.header(reqwest::header::AUTHORIZATION, &self.config.auth_basic);
            }
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(status = %resp.status(), id = %item.id, "webhook registered");
                    return;
                }
                Ok(resp) => warn!(status = %resp.status(), "unexpected registration status"),
                Err(e) => warn!("registration request failed: {e}"),
            }
            tokio::time::sleep(RETRY_PAUSE).await;
        }
        warn!("webhook registration retries exhausted");
    }
}

/// Deterministic item id: hex SHA-256 of the lowercased callback URL.
fn item_id(callback_url: &str) -> String {
    use std::fmt::Write as _;

    let digest = Sha256::digest(callback_url.to_lowercase().as_bytes());
    let mut id = String::with_capacity(64);
    for byte in digest {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

#[allow(clippy::cast_possible_truncation)]
fn duration_nanos(d: Duration) -> i64 {
    d.as_nanos() as i64
}
