//! Webhook ingestion.
//!
//! The fabric's event deliverer POSTs device events to `/webhook/events`.
//! Three delivery formats are accepted, tried in order:
//!
//! 1. **Binary-framed WRP** — content type contains `msgpack` and the body
//!    decodes as a WRP message. Device and service come from the source
//!    (`mac:<id>/<service>`), the event name from the destination
//!    (`event:<Service>/<Name...>` → parts after the first joined with `.`),
//!    and the WRP payload is forwarded as-is.
//! 2. **JSON envelope** — `{device, service, name, payload}` with non-empty
//!    device and name.
//! 3. **Header fallback** — device from `X-Xmidt-Device`/`X-Device-ID`, name
//!    from `X-Event-Name`, service from `X-Service`, the raw body as payload.
//!    This path always succeeds.
//!
//! Accepted deliveries answer `202`; the router rejects non-POST methods with
//! `405`. Publication onto the bus is fire-and-forget: a session with a full
//! queue misses the event, ingestion never fails for it.

pub mod registrar;

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::debug;

use crate::events::Event;
use crate::rpc::wrp;
use crate::AppState;

/// Cap on the inbound delivery body.
const BODY_LIMIT: usize = 512 * 1024;

/// Liberal JSON envelope for device events.
#[derive(Debug, Deserialize)]
struct IncomingEvent {
    #[serde(default)]
    device: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

/// `POST /webhook/events` — ingest one device-event delivery.
pub async fn ingest(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let Ok(body) = to_bytes(body, BODY_LIMIT).await else {
        return (StatusCode::BAD_REQUEST, "read error").into_response();
    };

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.contains("msgpack") && !body.is_empty() {
        match wrp::decode(&body) {
            Ok(msg) => {
                let device = device_from_source(&msg.source);
                let mut service = service_from_source(&msg.source);
                if service.is_empty() {
                    service = "BlizzardRDK".to_string();
                }
                let mut name = event_from_destination(&msg.destination);
                if name.is_empty() {
                    name = "Unknown".to_string();
                }
                debug!(%device, %service, %name, payload_bytes = msg.payload.len(), "webhook event (wrp)");
                state.bus.publish(&Event {
                    device,
                    service,
                    name,
                    payload: msg.payload,
                });
                return StatusCode::ACCEPTED.into_response();
            }
            // Not actually WRP despite the label; try the other formats.
            Err(e) => debug!("wrp decode failed: {e}"),
        }
    }

    if let Ok(evt) = serde_json::from_slice::<IncomingEvent>(&body) {
        if !evt.device.is_empty() && !evt.name.is_empty() {
            let payload = evt
                .payload
                .map(|p| p.get().as_bytes().to_vec())
                .unwrap_or_default();
            debug!(
                device = %evt.device,
                service = %evt.service,
                name = %evt.name,
                payload_bytes = payload.len(),
                "webhook event (json)"
            );
            state.bus.publish(&Event {
                device: evt.device,
                service: evt.service,
                name: evt.name,
                payload,
            });
            return StatusCode::ACCEPTED.into_response();
        }
    }

    // Last resort: identify the event from headers, carry the body opaquely.
    let device = header_value(&parts.headers, "X-Xmidt-Device")
        .or_else(|| header_value(&parts.headers, "X-Device-ID"))
        .unwrap_or_default()
        .trim()
        .to_string();
    let name = header_value(&parts.headers, "X-Event-Name")
        .unwrap_or("Unknown")
        .to_string();
    let service = header_value(&parts.headers, "X-Service")
        .unwrap_or("BlizzardRDK")
        .to_string();
    debug!(%device, %service, %name, payload_bytes = body.len(), "webhook event (headers)");
    state.bus.publish(&Event {
        device,
        service,
        name,
        payload: body.to_vec(),
    });
    StatusCode::ACCEPTED.into_response()
}

/// Header value, treating an empty string the same as absent.
fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Device id from a WRP source: `mac:112233445566/service` → `mac:112233445566`.
fn device_from_source(source: &str) -> String {
    source.split('/').next().unwrap_or(source).to_string()
}

/// Service name from a WRP source: `mac:112233445566/service` → `service`.
fn service_from_source(source: &str) -> String {
    source.split('/').nth(1).unwrap_or("").to_string()
}

/// Event name from a WRP destination. The `event:` scheme is stripped, the
/// first path segment names the emitting service, and the rest is the event:
/// `event:Blizzard/Time/TimerElapsed` → `Time.TimerElapsed`.
fn event_from_destination(destination: &str) -> String {
    if destination.is_empty() {
        return String::new();
    }
    let rest = destination.strip_prefix("event:").unwrap_or(destination);
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() > 1 {
        parts[1..].join(".")
    } else {
        rest.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::post;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::events::{Bus, Subscription};
    use crate::rpc::wrp::{Message, MessageType};
    use crate::rpc::{BaseDispatcher, EchoDispatcher};

    #[test]
    fn device_from_source_cases() {
        let cases = [
            ("mac:06cbd937c9d2/BlizzardRDK", "mac:06cbd937c9d2"),
            ("mac:06cbd937c9d2", "mac:06cbd937c9d2"),
            ("", ""),
        ];
        for (source, want) in cases {
            assert_eq!(device_from_source(source), want, "source {source:?}");
        }
    }

    #[test]
    fn service_from_source_cases() {
        let cases = [
            ("mac:06cbd937c9d2/BlizzardRDK", "BlizzardRDK"),
            ("mac:06cbd937c9d2", ""),
            ("", ""),
        ];
        for (source, want) in cases {
            assert_eq!(service_from_source(source), want, "source {source:?}");
        }
    }

    #[test]
    fn event_from_destination_cases() {
        let cases = [
            ("event:Blizzard/Time/TimerElapsed", "Time.TimerElapsed"),
            ("event:Service/Event", "Event"),
            ("Blizzard/Time/TimerElapsed", "Time.TimerElapsed"),
            ("event:Event", "Event"),
            ("", ""),
        ];
        for (destination, want) in cases {
            assert_eq!(event_from_destination(destination), want, "destination {destination:?}");
        }
    }

    fn state() -> AppState {
        AppState {
            config: Arc::new(Config::default()),
            dispatcher: Arc::new(BaseDispatcher::Echo(EchoDispatcher)),
            bus: Arc::new(Bus::new()),
        }
    }

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/webhook/events", post(ingest))
            .with_state(state)
    }

    async fn expect_event(sub: &mut Subscription) -> Event {
        tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .expect("no event published")
            .expect("bus closed")
    }

    #[tokio::test]
    async fn wrp_delivery_extracts_source_and_destination() {
        let state = state();
        let mut sub = state.bus.subscribe(4);

        let msg = Message {
            msg_type: MessageType::SimpleEvent,
            source: "mac:06cbd937c9d2/BlizzardRDK".into(),
            destination: "event:Blizzard/Time/TimerElapsed".into(),
            payload: br#"{"elapsed":true}"#.to_vec(),
            ..Message::default()
        };
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/webhook/events")
            .header(CONTENT_TYPE, "application/msgpack")
            .body(Body::from(wrp::encode(&msg).unwrap()))
            .unwrap();

        let resp = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let event = expect_event(&mut sub).await;
        assert_eq!(event.device, "mac:06cbd937c9d2");
        assert_eq!(event.service, "BlizzardRDK");
        assert_eq!(event.name, "Time.TimerElapsed");
        assert_eq!(event.payload, br#"{"elapsed":true}"#);
    }

    #[tokio::test]
    async fn json_envelope_is_accepted() {
        let state = state();
        let mut sub = state.bus.subscribe(4);

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/webhook/events")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"device":"mac:abc","service":"config","name":"Reboot","payload":{"why":"update"}}"#,
            ))
            .unwrap();

        let resp = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let event = expect_event(&mut sub).await;
        assert_eq!(event.device, "mac:abc");
        assert_eq!(event.service, "config");
        assert_eq!(event.name, "Reboot");
        assert_eq!(event.payload, br#"{"why":"update"}"#);
    }

    #[tokio::test]
    async fn header_fallback_accepts_raw_bodies() {
        let state = state();
        let mut sub = state.bus.subscribe(4);

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/webhook/events")
            .header("X-Device-ID", "devX")
            .header("X-Event-Name", "heartbeat")
            .body(Body::from("not json at all"))
            .unwrap();

        let resp = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let event = expect_event(&mut sub).await;
        assert_eq!(event.device, "devX");
        assert_eq!(event.service, "BlizzardRDK");
        assert_eq!(event.name, "heartbeat");
        assert_eq!(event.payload, b"not json at all");
    }

    #[tokio::test]
    async fn msgpack_label_with_garbage_body_falls_through_to_headers() {
        let state = state();
        let mut sub = state.bus.subscribe(4);

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/webhook/events")
            .header(CONTENT_TYPE, "application/msgpack")
            .header("X-Xmidt-Device", "mac:fallback")
            .body(Body::from("definitely not msgpack"))
            .unwrap();

        let resp = app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let event = expect_event(&mut sub).await;
        assert_eq!(event.device, "mac:fallback");
        assert_eq!(event.name, "Unknown");
    }

    #[tokio::test]
    async fn non_post_is_rejected() {
        let request = HttpRequest::builder()
            .method("GET")
            .uri("/webhook/events")
            .body(Body::empty())
            .unwrap();
        let resp = app(state()).oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
