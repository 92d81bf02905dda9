//! Upstream WRP transport.
//!
//! [`WrpClient`] POSTs one binary-framed WRP message per request to the
//! Scytale endpoint and decodes one framed message out of the 2xx response
//! body. The configured credential is normalized once at construction: values
//! already carrying a `Basic`/`Bearer`/`Digest` scheme pass through verbatim,
//! anything else is sent as `Basic <value>`, and an empty credential omits
//! the header entirely.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;

use super::wrp;

/// Applied when the caller does not supply a per-call deadline.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the diagnostic body excerpt kept from a non-2xx reply.
const STATUS_EXCERPT_LIMIT: usize = 512;

/// Failure modes of one upstream round trip. Dispatchers treat every variant
/// as a routing failure; only the diagnostics differ.
#[derive(Debug, Error)]
pub enum WrpClientError {
    #[error("encode wrp: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("upstream returned non-2xx status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("decode wrp: {0}")]
    UpstreamDecode(#[source] rmp_serde::decode::Error),
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
}

/// The minimal send-one-receive-one contract dispatchers need; lets tests
/// substitute a scripted upstream.
#[async_trait]
pub trait WrpDoer: Send + Sync {
    async fn call(
        &self,
        msg: &wrp::Message,
        timeout: Option<Duration>,
    ) -> Result<wrp::Message, WrpClientError>;
}

/// Synchronous request/response client for the Scytale HTTP endpoint.
pub struct WrpClient {
    http: reqwest::Client,
    url: String,
    authorization: Option<String>,
}

impl WrpClient {
    /// Build a client for `url`. `credential` is the raw configured
    /// authorization string; see the module docs for normalization.
    pub fn new(url: impl Into<String>, credential: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            authorization: normalize_authorization(credential),
        }
    }

    /// The Authorization header value this client sends, if any.
    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }
}

#[async_trait]
impl WrpDoer for WrpClient {
    async fn call(
        &self,
        msg: &wrp::Message,
        timeout: Option<Duration>,
    ) -> Result<wrp::Message, WrpClientError> {
        let body = wrp::encode(msg)?;
        let mut req = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, wrp::CONTENT_TYPE)
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .body(body);
        if let Some(auth) = &self.authorization {
            req = req.header(AUTHORIZATION, auth);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            let excerpt = String::from_utf8_lossy(&bytes[..bytes.len().min(STATUS_EXCERPT_LIMIT)]);
            return Err(WrpClientError::UpstreamStatus {
                status: status.as_u16(),
                body: excerpt.into_owned(),
            });
        }
        wrp::decode(&bytes).map_err(WrpClientError::UpstreamDecode)
    }
}

/// Normalize a configured credential into an Authorization header value.
///
/// Trims whitespace, then lowercases only to inspect the scheme prefix; the
/// original casing is what goes on the wire.
fn normalize_authorization(credential: &str) -> Option<String> {
    let trimmed = credential.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("basic ") || lower.starts_with("bearer ") || lower.starts_with("digest ") {
        Some(trimmed.to_string())
    } else {
        Some(format!("Basic {trimmed}"))
    }
}
