//! Single-service WRP dispatcher.
//!
//! Converts one JSON-RPC request into one WRP `SimpleRequestResponse`. The
//! WRP payload carries the original JSON-RPC envelope verbatim so the device
//! runtime can parse it; the JSON-RPC id is aliased into `transaction_uuid`
//! (raw bytes, quotes and all) for correlation. The reply payload is expected
//! to be a JSON-RPC response, which is forwarded unchanged; anything else is
//! wrapped as an opaque `result` blob.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::value::RawValue;
use serde_json::{json, Value};

use super::client::{WrpClient, WrpDoer};
use super::wrp::{Message, MessageType};
use super::{Dispatcher, Request, Response, INTERNAL_ERROR, TRANSPORT_ERROR, VERSION};

/// Deadline for one upstream attempt (single dispatch or one fallback leg).
pub(crate) const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(8);

/// Bridges one device+service pair. Sessions clone this to bind their own
/// destination; the clone shares the underlying HTTP client.
#[derive(Clone)]
pub struct WrpDispatcher {
    pub client: Arc<WrpClient>,
    pub source: String,
    pub destination: String,
    pub service_name: String,
}

#[async_trait]
impl Dispatcher for WrpDispatcher {
    async fn handle(&self, req: &Request) -> Response {
        // Re-serialize the request for embedding as the WRP payload.
        let raw = match serde_json::to_vec(req) {
            Ok(raw) => raw,
            Err(e) => {
                return Response::error(
                    req.id.clone(),
                    INTERNAL_ERROR,
                    "marshal request failed",
                    Some(json!(e.to_string())),
                )
            }
        };
        let msg = Message {
            msg_type: MessageType::SimpleRequestResponse,
            source: self.source.clone(),
            destination: self.destination.clone(),
            transaction_uuid: req.raw_id().to_string(),
            content_type: "application/json".into(),
            service_name: self.service_name.clone(),
            payload: raw,
        };
        match self.client.call(&msg, Some(ATTEMPT_TIMEOUT)).await {
            Ok(reply) => unwrap_reply(&reply.payload, &req.id),
            Err(e) => Response::error(
                req.id.clone(),
                TRANSPORT_ERROR,
                "transport error",
                Some(json!(format!(
                    "dest={} service={} err={}",
                    self.destination, self.service_name, e
                ))),
            ),
        }
    }
}

/// Interpret an upstream WRP payload as the response to `request_id`.
///
/// A well-formed JSON-RPC envelope is forwarded as-is (device error objects
/// included), back-filling the id if the device left it blank. Any other
/// payload becomes an opaque `result` value; bytes that are not JSON at all
/// are carried as a JSON string.
pub(crate) fn unwrap_reply(payload: &[u8], request_id: &Option<Box<RawValue>>) -> Response {
    if let Ok(mut reply) = serde_json::from_slice::<Response>(payload) {
        if reply.jsonrpc == VERSION {
            if reply.id.is_none() {
                reply.id = request_id.clone();
            }
            return reply;
        }
    }
    let result = serde_json::from_slice::<Value>(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()));
    Response::result(request_id.clone(), result)
}
