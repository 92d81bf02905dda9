//! Multi-service fallback dispatcher.
//!
//! Tries one request against an ordered list of service names on the same
//! device, stopping at the first attempt that gets routed. A transport-level
//! failure moves on to the next candidate; any decoded reply — including a
//! device-side JSON-RPC error — means routing succeeded and ends the loop.
//! Used to bridge devices transitioning between service registrations (e.g.
//! `BlizzardRDK` falling back to legacy `config`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::client::WrpDoer;
use super::dispatch::{unwrap_reply, ATTEMPT_TIMEOUT};
use super::wrp::{Message, MessageType};
use super::{Dispatcher, Request, Response, INTERNAL_ERROR, TRANSPORT_ERROR};

pub struct MultiServiceDispatcher {
    pub client: Arc<dyn WrpDoer>,
    pub source: String,
    pub device_id: String,
    pub dest_prefix: String,
    /// Candidates in strict try order; the caller places the canonical
    /// service first and deduplicates.
    pub services: Vec<String>,
    /// Per-attempt deadline; each fallback leg gets a fresh one.
    pub timeout: Duration,
}

impl MultiServiceDispatcher {
    pub fn new(
        client: Arc<dyn WrpDoer>,
        source: impl Into<String>,
        device_id: impl Into<String>,
        dest_prefix: impl Into<String>,
        services: Vec<String>,
    ) -> Self {
        Self {
            client,
            source: source.into(),
            device_id: device_id.into(),
            dest_prefix: dest_prefix.into(),
            services,
            timeout: ATTEMPT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Dispatcher for MultiServiceDispatcher {
    async fn handle(&self, req: &Request) -> Response {
        if self.services.is_empty() {
            return Response::error(req.id.clone(), INTERNAL_ERROR, "no services configured", None);
        }
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

        let mut attempts: Vec<String> = Vec::with_capacity(self.services.len());
        let mut last_err = String::new();
        for svc in &self.services {
            let dest = format!("{}{}/{}", self.dest_prefix, self.device_id, svc);
            let msg = Message {
                msg_type: MessageType::SimpleRequestResponse,
                source: self.source.clone(),
                destination: dest.clone(),
                transaction_uuid: req.raw_id().to_string(),
                content_type: "application/json".into(),
                service_name: svc.clone(),
                payload: raw.clone(),
            };
            match self.client.call(&msg, Some(self.timeout)).await {
                Ok(reply) => return unwrap_reply(&reply.payload, &req.id),
                Err(e) => {
                    last_err = format!("svc={svc} dest={dest} err={e}");
                    attempts.push(format!("svc={svc} status=transport_error"));
                }
            }
        }
        Response::error(
            req.id.clone(),
            TRANSPORT_ERROR,
            "transport error",
            Some(json!(format!(
                "attempts=[{}] last={last_err}",
                attempts.join(", ")
            ))),
        )
    }
}
