//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — the fabric-deployment names are honored:
//!    `SCYTALE_URL`, `SCYTALE_AUTH`, `DEST_PREFIX`, `CANONICAL_SERVICE_NAME`,
//!    `DEST_SERVICE_FALLBACKS`, `GATEWAY_ACK`, `WEBHOOK_ENABLE`, `ARGUS_URL`,
//!    `ARGUS_BASIC_AUTH`, `ARGUS_BUCKET`, `WEBHOOK_URL`, `WEBHOOK_EVENTS`,
//!    `WEBHOOK_DEVICE_MATCH`, `WEBHOOK_TTL`, `WEBHOOK_MAX_RETRIES`, plus
//!    `WRPGW_LISTEN`.
//! 2. **Config file** — path via `--config <path>`, or `wrpgw.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8920"
//!
//! [upstream]
//! url = "http://localhost:6300/api/v2/device"
//! authorization = "dXNlcjpwYXNz"   # base64 user:pass; schemes pass through
//!
//! [gateway]
//! dest_prefix = "mac:"
//! canonical_service = "BlizzardRDK"
//! fallback_services = []           # e.g. ["config"]
//! synthetic_ack = false
//!
//! [session]
//! read_limit = 524288              # 512 KiB per frame
//! pong_wait_secs = 75
//! write_wait_secs = 10
//! event_buffer = 64
//!
//! [webhook]
//! enable = true
//! argus_url = "http://argus:6600"
//! bucket = "hooks"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8920`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Scytale request/response endpoint. A blank `url` disables WRP bridging and
/// the gateway answers every request from the echo dispatcher instead.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream URL accepting one WRP message per POST. Override with
    /// `SCYTALE_URL`.
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Credential for the Authorization header. Values already starting with
    /// `Basic`/`Bearer`/`Digest` are sent verbatim, anything else gets a
    /// `Basic ` prefix. Override with `SCYTALE_AUTH`.
    #[serde(default = "default_upstream_auth")]
    pub authorization: String,
}

/// Destination composition and per-session behavior toggles.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Prefix for device destinations, e.g. `mac:` (default). Override with
    /// `DEST_PREFIX`.
    #[serde(default = "default_dest_prefix")]
    pub dest_prefix: String,
    /// Service name the device registered with the fabric; all upstream
    /// destinations use it regardless of the alias in the client's URL path.
    /// Override with `CANONICAL_SERVICE_NAME`.
    #[serde(default = "default_canonical_service")]
    pub canonical_service: String,
    /// Additional services to try, in order, when the canonical one is not
    /// routable. Override with `DEST_SERVICE_FALLBACKS` (comma-separated).
    #[serde(default)]
    pub fallback_services: Vec<String>,
    /// Emit a synthetic `Gateway.Ack` notification after each response.
    /// Default off; `GATEWAY_ACK` accepts 1/true/yes/on/enable/enabled.
    #[serde(default)]
    pub synthetic_ack: bool,
}

/// WebSocket session tuning. Timing follows the usual keepalive pattern:
/// pings fire at 90% of the pong wait so a live peer always answers in time.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Maximum inbound frame size in bytes (default 512 KiB).
    #[serde(default = "default_read_limit")]
    pub read_limit: usize,
    /// Seconds to wait for any inbound frame before declaring the peer dead
    /// (default 75).
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,
    /// Per-write deadline in seconds (default 10).
    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,
    /// Event-bus queue capacity per session (default 64). A session that
    /// falls this far behind starts losing events.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl SessionConfig {
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    /// Ping interval: 90% of the pong wait.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }
}

/// Argus webhook registration. Ingestion itself is always routed; this only
/// controls whether the gateway registers its callback with the fabric.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Register the callback on startup (default true). Override with
    /// `WEBHOOK_ENABLE`.
    #[serde(default = "default_webhook_enable")]
    pub enable: bool,
    /// Argus store base URL. Override with `ARGUS_URL`.
    #[serde(default = "default_argus_url")]
    pub argus_url: String,
    /// Argus bucket holding webhook items. Override with `ARGUS_BUCKET`.
    #[serde(default = "default_argus_bucket")]
    pub bucket: String,
    /// Authorization header value for Argus. Override with `ARGUS_BASIC_AUTH`.
    #[serde(default)]
    pub auth_basic: String,
    /// Externally reachable URL of this gateway's ingestion endpoint.
    /// Override with `WEBHOOK_URL`.
    #[serde(default = "default_callback_url")]
    pub callback_url: String,
    /// Event regexes to subscribe to (default `.*`). Override with
    /// `WEBHOOK_EVENTS` (comma-separated).
    #[serde(default = "default_match_all")]
    pub events: Vec<String>,
    /// Device-id regexes to match (default `.*`). Override with
    /// `WEBHOOK_DEVICE_MATCH` (comma-separated).
    #[serde(default = "default_match_all")]
    pub device_matchers: Vec<String>,
    /// Argus item TTL in seconds (default 86400). Override with `WEBHOOK_TTL`.
    #[serde(default = "default_webhook_ttl")]
    pub ttl_secs: u64,
    /// Registration attempts before giving up (default 3). Override with
    /// `WEBHOOK_MAX_RETRIES`.
    #[serde(default = "default_webhook_retries")]
    pub retries: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8920".to_string()
}
fn default_upstream_url() -> String {
    "http://localhost:6300/api/v2/device".to_string()
}
fn default_upstream_auth() -> String {
    "dXNlcjpwYXNz".to_string()
}
fn default_dest_prefix() -> String {
    "mac:".to_string()
}
fn default_canonical_service() -> String {
    "BlizzardRDK".to_string()
}
fn default_read_limit() -> usize {
    512 * 1024
}
fn default_pong_wait_secs() -> u64 {
    75
}
fn default_write_wait_secs() -> u64 {
    10
}
fn default_event_buffer() -> usize {
    64
}
fn default_webhook_enable() -> bool {
    true
}
fn default_argus_url() -> String {
    "http://argus:6600".to_string()
}
fn default_argus_bucket() -> String {
    "hooks".to_string()
}
fn default_callback_url() -> String {
    "http://wrpgw:8920/webhook/events".to_string()
}
fn default_match_all() -> Vec<String> {
    vec![".*".to_string()]
}
fn default_webhook_ttl() -> u64 {
    86_400
}
fn default_webhook_retries() -> u32 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            authorization: default_upstream_auth(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dest_prefix: default_dest_prefix(),
            canonical_service: default_canonical_service(),
            fallback_services: Vec::new(),
            synthetic_ack: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_limit: default_read_limit(),
            pong_wait_secs: default_pong_wait_secs(),
            write_wait_secs: default_write_wait_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enable: default_webhook_enable(),
            argus_url: default_argus_url(),
            bucket: default_argus_bucket(),
            auth_basic: String::new(),
            callback_url: default_callback_url(),
            events: default_match_all(),
            device_matchers: default_match_all(),
            ttl_secs: default_webhook_ttl(),
            retries: default_webhook_retries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `wrpgw.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("wrpgw.toml").exists() {
            let content =
                std::fs::read_to_string("wrpgw.toml").expect("Failed to read wrpgw.toml");
            toml::from_str(&content).expect("Failed to parse wrpgw.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(v) = std::env::var("WRPGW_LISTEN") {
            config.server.listen = v;
        }
        if let Ok(v) = std::env::var("SCYTALE_URL") {
            config.upstream.url = v;
        }
        if let Ok(v) = std::env::var("SCYTALE_AUTH") {
            config.upstream.authorization = v;
        }
        if let Ok(v) = std::env::var("DEST_PREFIX") {
            config.gateway.dest_prefix = v;
        }
        if let Ok(v) = std::env::var("CANONICAL_SERVICE_NAME") {
            config.gateway.canonical_service = v;
        }
        if let Ok(v) = std::env::var("DEST_SERVICE_FALLBACKS") {
            config.gateway.fallback_services = split_csv(&v);
        }
        if let Ok(v) = std::env::var("GATEWAY_ACK") {
            config.gateway.synthetic_ack = truthy(&v);
        }
        if let Ok(v) = std::env::var("WEBHOOK_ENABLE") {
            config.webhook.enable = truthy(&v);
        }
        if let Ok(v) = std::env::var("ARGUS_URL") {
            config.webhook.argus_url = v;
        }
        if let Ok(v) = std::env::var("ARGUS_BASIC_AUTH") {
            config.webhook.auth_basic = v;
        }
        if let Ok(v) = std::env::var("ARGUS_BUCKET") {
            config.webhook.bucket = v;
        }
        if let Ok(v) = std::env::var("WEBHOOK_URL") {
            config.webhook.callback_url = v;
        }
        if let Ok(v) = std::env::var("WEBHOOK_EVENTS") {
            config.webhook.events = split_csv(&v);
        }
        if let Ok(v) = std::env::var("WEBHOOK_DEVICE_MATCH") {
            config.webhook.device_matchers = split_csv(&v);
        }
        if let Ok(v) = std::env::var("WEBHOOK_TTL") {
            if let Ok(ttl) = v.parse() {
                config.webhook.ttl_secs = ttl;
            }
        }
        if let Ok(v) = std::env::var("WEBHOOK_MAX_RETRIES") {
            if let Ok(retries) = v.parse() {
                config.webhook.retries = retries;
            }
        }

        config
    }
}

/// Recognized enable values for operator flags. Anything else — including
/// the empty string — means disabled.
pub fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "enable" | "enabled"
    )
}

/// Split a comma-separated list, trimming entries and dropping empties.
pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_expectations() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:8920");
        assert_eq!(config.gateway.dest_prefix, "mac:");
        assert_eq!(config.gateway.canonical_service, "BlizzardRDK");
        assert!(config.gateway.fallback_services.is_empty());
        assert!(!config.gateway.synthetic_ack);
        assert_eq!(config.session.read_limit, 512 * 1024);
        assert_eq!(config.session.pong_wait(), Duration::from_secs(75));
        assert_eq!(config.session.ping_period(), Duration::from_millis(67_500));
        assert_eq!(config.session.write_wait(), Duration::from_secs(10));
    }

    #[test]
    fn truthy_accepts_only_recognized_values() {
        for v in ["1", "true", "YES", " on ", "Enable", "enabled"] {
            assert!(truthy(v), "{v:?} should enable");
        }
        for v in ["", "0", "false", "off", "2", "si"] {
            assert!(!truthy(v), "{v:?} should disable");
        }
    }

    #[test]
    fn split_csv_trims_and_drops_empties() {
        assert_eq!(
            split_csv("config, iot ,,parodus,"),
            vec!["config", "iot", "parodus"]
        );
        assert!(split_csv("  ").is_empty());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            fallback_services = ["config"]

            [upstream]
            url = ""
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.fallback_services, vec!["config"]);
        assert_eq!(config.gateway.canonical_service, "BlizzardRDK");
        assert!(config.upstream.url.is_empty());
        assert_eq!(config.server.listen, "0.0.0.0:8920");
    }
}
