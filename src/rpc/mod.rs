//! JSON-RPC 2.0 message model and the dispatch contract.
//!
//! Inbound WebSocket frames are parsed into [`Request`]s, handed to a
//! [`Dispatcher`], and the resulting [`Response`] is written back on the same
//! socket. Device events are pushed as [`Notification`]s (no id).
//!
//! Ids are kept as raw JSON text ([`RawValue`]) rather than decoded values:
//! the gateway must echo the exact bytes the client sent, and the upstream
//! transaction UUID aliases those bytes verbatim — including any surrounding
//! quotes.

pub mod client;
pub mod dispatch;
pub mod multi;
pub mod wrp;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{json, Value};
use thiserror::Error;

/// The only protocol version the gateway speaks.
pub const VERSION: &str = "2.0";

/// JSON-RPC error codes surfaced by the gateway itself. Device-originated
/// error codes are forwarded unchanged.
pub const INVALID_REQUEST: i64 = -32600;
pub const INTERNAL_ERROR: i64 = -32603;
pub const TRANSPORT_ERROR: i64 = -32100;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Box<RawValue>>,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
}

impl Request {
    /// The raw id bytes as they appeared on the wire (`"abc"` keeps its
    /// quotes, `7` is bare). Empty string when the request carried no id.
    pub fn raw_id(&self) -> &str {
        self.id.as_deref().map_or("", RawValue::get)
    }
}

/// A JSON-RPC 2.0 response. Exactly one of `result`/`error` is set by the
/// gateway; both may be absent only on malformed device replies, which are
/// never constructed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Success response echoing the request id.
    pub fn result(id: Option<Box<RawValue>>, result: Value) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response echoing the request id (omitted when the request had
    /// none, or when the frame never parsed far enough to yield one).
    pub fn error(id: Option<Box<RawValue>>, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server→client push message. Never carries an id.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// Why an inbound frame was rejected before dispatch.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("unsupported jsonrpc version")]
    UnsupportedVersion,
    #[error("method required")]
    MethodRequired,
}

/// Decode raw frame bytes into a [`Request`] with basic validation.
pub fn parse_request(raw: &[u8]) -> Result<Request, ParseError> {
    let req: Request = serde_json::from_slice(raw)?;
    if req.jsonrpc != VERSION {
        return Err(ParseError::UnsupportedVersion);
    }
    if req.method.is_empty() {
        return Err(ParseError::MethodRequired);
    }
    Ok(req)
}

/// Processes JSON-RPC requests. Implementations return exactly one response
/// per request and echo the request id into it, even on error.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn handle(&self, req: &Request) -> Response;
}

/// Dispatcher selected at startup. Sessions use the echo variant as-is and
/// specialize the WRP variant per connection.
pub enum BaseDispatcher {
    Echo(EchoDispatcher),
    Wrp(dispatch::WrpDispatcher),
}

/// Loopback dispatcher used when no upstream is configured, and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoDispatcher;

#[async_trait]
impl Dispatcher for EchoDispatcher {
    async fn handle(&self, req: &Request) -> Response {
        if req.method.is_empty() {
            return Response::error(req.id.clone(), INVALID_REQUEST, "invalid request", None);
        }
        // Simulate a tiny processing delay.
        tokio::time::sleep(Duration::from_millis(5)).await;
        Response::result(req.id.clone(), json!({"echo": true, "method": req.method}))
    }
}
