//! WebSocket transport for JSON-RPC sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws` or `GET /ws/{device}/{service}`. The path
//!    form binds the session to one device+service pair by specializing the
//!    base dispatcher; the bare form uses it unchanged.
//! 2. Each text or binary frame carries exactly one JSON-RPC 2.0 request;
//!    the matching response is written back on the same socket. Device events
//!    arrive as JSON-RPC notifications (`rpc.Event.<service>.<name>`).
//! 3. The session ends when a read or write fails or the peer goes silent
//!    past the pong wait.
//!
//! ## Per-session concurrency
//!
//! Four cooperating activities share the connection:
//!
//! - **reader** (this task) — parse, dispatch, write the response
//! - **ping emitter** — keepalive pings at 90% of the pong wait
//! - **event forwarder** — bus subscription → notification writes
//! - **terminator** — a [`CancellationToken`] cancelled exactly once when the
//!   reader exits, unblocking the other two
//!
//! All writes (responses, notifications, pings) go through one mutex-guarded
//! sink with a fresh per-message deadline, so a single slow write cannot
//! corrupt frame ordering and a stale ping deadline cannot fail a later
//! message.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response as HttpResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::events::{Event, Subscription};
use crate::rpc::dispatch::WrpDispatcher;
use crate::rpc::multi::MultiServiceDispatcher;
use crate::rpc::{self, BaseDispatcher, Dispatcher, Notification, Response, INVALID_REQUEST};
use crate::AppState;

/// `GET /ws` — session against the handler's base dispatcher.
pub async fn upgrade_base(State(state): State<AppState>, ws: WebSocketUpgrade) -> HttpResponse {
    let dispatcher: Arc<dyn Dispatcher> = match state.dispatcher.as_ref() {
        BaseDispatcher::Echo(echo) => Arc::new(*echo),
        BaseDispatcher::Wrp(wrp) => Arc::new(wrp.clone()),
    };
    serve_session(ws, state, dispatcher)
}

/// `GET /ws/{device}/{service}` — session bound to one device+service pair.
pub async fn upgrade_bound(
    State(state): State<AppState>,
    Path((device, service)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> HttpResponse {
    let dispatcher: Arc<dyn Dispatcher> = match state.dispatcher.as_ref() {
        BaseDispatcher::Echo(echo) => Arc::new(*echo),
        BaseDispatcher::Wrp(base) => {
            match bind_dispatcher(&state.config.gateway, base, &device, &service) {
                BoundDispatcher::Single(d) => Arc::new(d),
                BoundDispatcher::Multi(d) => Arc::new(d),
            }
        }
    };
    serve_session(ws, state, dispatcher)
}

fn serve_session(
    ws: WebSocketUpgrade,
    state: AppState,
    dispatcher: Arc<dyn Dispatcher>,
) -> HttpResponse {
    ws.max_message_size(state.config.session.read_limit)
        .on_upgrade(move |socket| run_session(socket, state, dispatcher))
}

/// A WRP base dispatcher specialized for one connection.
enum BoundDispatcher {
    Single(WrpDispatcher),
    Multi(MultiServiceDispatcher),
}

/// Specialize `base` for the path-supplied device and service alias.
///
/// The destination always uses the canonical service the device registered
/// with the fabric; the path-provided name may be an alias. A device segment
/// that already carries the destination prefix has it stripped before
/// re-composition, so `mac:<id>` in the URL cannot become `mac:mac:<id>`.
fn bind_dispatcher(
    gateway: &GatewayConfig,
    base: &WrpDispatcher,
    device: &str,
    path_service: &str,
) -> BoundDispatcher {
    let prefix = gateway.dest_prefix.as_str();
    let device = match device.strip_prefix(prefix) {
        Some(stripped) => {
            debug!(original = device, normalized = stripped, prefix, "normalized device prefix");
            stripped
        }
        None => device,
    };
    let canonical = gateway.canonical_service.as_str();

    if gateway.fallback_services.is_empty() {
        // Shallow copy: fresh destination, shared upstream client.
        let mut bound = base.clone();
        bound.destination = format!("{prefix}{device}/{canonical}");
        bound.service_name = canonical.to_string();
        info!(device, path_service, canonical, dest = %bound.destination, "connection bound");
        return BoundDispatcher::Single(bound);
    }

    // Canonical first, then the path alias (if different), then configured
    // fallbacks with duplicates removed. Order is the try order.
    let mut services = vec![canonical.to_string()];
    if !path_service.is_empty() && path_service != canonical {
        services.push(path_service.to_string());
    }
    for fallback in &gateway.fallback_services {
        if !fallback.is_empty() && !services.iter().any(|s| s == fallback) {
            services.push(fallback.clone());
        }
    }
    info!(device, ?services, canonical, "multi-service fallback enabled");
    BoundDispatcher::Multi(MultiServiceDispatcher::new(
        base.client.clone(),
        base.source.clone(),
        device,
        prefix,
        services,
    ))
}

/// Shared write half. One writer at a time; every frame gets its own
/// deadline so a backlogged queue never inherits a stale timeout from an
/// earlier ping.
struct Session {
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    write_wait: Duration,
}

impl Session {
    async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), axum::Error> {
        let text = serde_json::to_string(value).map_err(axum::Error::new)?;
        self.write_frame(WsMessage::Text(text.into())).await
    }

    async fn ping(&self) -> Result<(), axum::Error> {
        self.write_frame(WsMessage::Ping(Bytes::new())).await
    }

    async fn write_frame(&self, frame: WsMessage) -> Result<(), axum::Error> {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.write_wait, sink.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(axum::Error::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write deadline exceeded",
            ))),
        }
    }
}

async fn run_session(socket: WebSocket, state: AppState, dispatcher: Arc<dyn Dispatcher>) {
    let (sink, stream) = socket.split();
    let session = Arc::new(Session {
        sink: Mutex::new(sink),
        write_wait: state.config.session.write_wait(),
    });
    let done = CancellationToken::new();

    let ping_task = tokio::spawn(ping_loop(
        session.clone(),
        state.config.session.ping_period(),
        done.clone(),
    ));
    let subscription = state.bus.subscribe(state.config.session.event_buffer);
    let forward_task = tokio::spawn(forward_events(session.clone(), subscription, done.clone()));

    read_loop(stream, &state, &session, dispatcher.as_ref()).await;

    // Reader exit is the terminator: wake the ping emitter and the event
    // forwarder, then wait for both so nothing outlives the session. The
    // forwarder drops its subscription on the way out, which closes the bus
    // channel.
    done.cancel();
    let _ = ping_task.await;
    let _ = forward_task.await;
    debug!("session closed");
}

/// Keepalive pings until write failure or termination.
async fn ping_loop(session: Arc<Session>, period: Duration, done: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // interval fires immediately; skip the zeroth tick
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if session.ping().await.is_err() {
                    return;
                }
            }
            () = done.cancelled() => return,
        }
    }
}

/// Forward bus events to the client as notifications until termination.
async fn forward_events(session: Arc<Session>, mut subscription: Subscription, done: CancellationToken) {
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { return };
                if let Err(e) = session.write_json(&event_notification(&event)).await {
                    warn!("event notification write failed: {e}");
                }
            }
            () = done.cancelled() => return,
        }
    }
}

/// Read frames until error, EOF, or the peer goes silent past `pong_wait`.
/// Pong and other control frames count as liveness and are otherwise skipped.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    session: &Session,
    dispatcher: &dyn Dispatcher,
) {
    let pong_wait = state.config.session.pong_wait();
    let synthetic_ack = state.config.gateway.synthetic_ack;
    loop {
        let frame = match tokio::time::timeout(pong_wait, stream.next()).await {
            Err(_) => {
                debug!("read deadline expired");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!("read error: {e}");
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        let data: Bytes = match frame {
            WsMessage::Text(text) => text.into(),
            WsMessage::Binary(bytes) => bytes,
            WsMessage::Close(_) => return,
            _ => continue,
        };

        let req = match rpc::parse_request(&data) {
            Ok(req) => req,
            Err(e) => {
                let resp = Response::error(None, INVALID_REQUEST, e.to_string(), None);
                if session.write_json(&resp).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let resp = dispatcher.handle(&req).await;
        if session.write_json(&resp).await.is_err() {
            return;
        }

        if synthetic_ack {
            let note = Notification::new(
                "Gateway.Ack",
                json!({
                    "correlationId": req.raw_id(),
                    "id": Uuid::new_v4().to_string(),
                }),
            );
            if session.write_json(&note).await.is_err() {
                return;
            }
        }
    }
}

/// JSON-RPC method name for a device event, with defaults applied when the
/// webhook could not determine a field.
fn event_method(event: &Event) -> String {
    let name = if event.name.is_empty() { "Unknown" } else { &event.name };
    let service = if event.service.is_empty() {
        "BlizzardRDK"
    } else {
        &event.service
    };
    format!("rpc.Event.{service}.{name}")
}

fn event_notification(event: &Event) -> Notification {
    Notification::new(
        event_method(event),
        json!({
            "device": event.device,
            "service": event.service,
            "event": event.name,
            "payload": String::from_utf8_lossy(&event.payload),
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::routing::get;
    use axum::Router;
    use futures::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio_tungstenite::tungstenite;

    use super::*;
    use crate::config::Config;
    use crate::events::Bus;
    use crate::rpc::client::WrpClient;
    use crate::rpc::EchoDispatcher;

    fn wrp_base() -> WrpDispatcher {
        WrpDispatcher {
            client: Arc::new(WrpClient::new("http://localhost:6300/api/v2/device", "")),
            source: "blizzard/gateway".into(),
            destination: String::new(),
            service_name: String::new(),
        }
    }

    #[test]
    fn event_method_applies_defaults() {
        let mut event = Event {
            device: "mac:abc".into(),
            service: String::new(),
            name: String::new(),
            payload: Vec::new(),
        };
        assert_eq!(event_method(&event), "rpc.Event.BlizzardRDK.Unknown");

        event.service = "config".into();
        event.name = "Time.TimerElapsed".into();
        assert_eq!(event_method(&event), "rpc.Event.config.Time.TimerElapsed");
    }

    #[test]
    fn binding_strips_duplicated_destination_prefix() {
        let gateway = GatewayConfig::default();
        let bound = bind_dispatcher(&gateway, &wrp_base(), "mac:06cbd937c9d2", "BlizzardRDK");
        let BoundDispatcher::Single(d) = bound else {
            panic!("expected single-service dispatcher");
        };
        assert_eq!(d.destination, "mac:06cbd937c9d2/BlizzardRDK");
        assert_eq!(d.service_name, "BlizzardRDK");
    }

    #[test]
    fn binding_uses_canonical_service_for_aliases() {
        let gateway = GatewayConfig::default();
        let bound = bind_dispatcher(&gateway, &wrp_base(), "06cbd937c9d2", "config");
        let BoundDispatcher::Single(d) = bound else {
            panic!("expected single-service dispatcher");
        };
        // The path alias never reaches the destination.
        assert_eq!(d.destination, "mac:06cbd937c9d2/BlizzardRDK");
        assert_eq!(d.service_name, "BlizzardRDK");
    }

    #[test]
    fn binding_with_fallbacks_builds_ordered_service_list() {
        let gateway = GatewayConfig {
            fallback_services: vec!["config".into(), "BlizzardRDK".into(), "iot".into()],
            ..GatewayConfig::default()
        };
        let bound = bind_dispatcher(&gateway, &wrp_base(), "mac:dev1", "parodus");
        let BoundDispatcher::Multi(d) = bound else {
            panic!("expected multi-service dispatcher");
        };
        assert_eq!(d.device_id, "dev1");
        assert_eq!(d.dest_prefix, "mac:");
        // Canonical, then alias, then fallbacks minus duplicates.
        assert_eq!(d.services, vec!["BlizzardRDK", "parodus", "config", "iot"]);
    }

    #[test]
    fn binding_ignores_alias_equal_to_canonical() {
        let gateway = GatewayConfig {
            fallback_services: vec!["config".into()],
            ..GatewayConfig::default()
        };
        let bound = bind_dispatcher(&gateway, &wrp_base(), "dev1", "BlizzardRDK");
        let BoundDispatcher::Multi(d) = bound else {
            panic!("expected multi-service dispatcher");
        };
        assert_eq!(d.services, vec!["BlizzardRDK", "config"]);
    }

    fn echo_state(synthetic_ack: bool) -> AppState {
        let mut config = Config::default();
        config.gateway.synthetic_ack = synthetic_ack;
        AppState {
            config: Arc::new(config),
            dispatcher: Arc::new(BaseDispatcher::Echo(EchoDispatcher)),
            bus: Arc::new(Bus::new()),
        }
    }

    async fn serve(state: AppState) -> SocketAddr {
        let app = Router::new()
            .route("/ws", get(upgrade_base))
            .route("/ws/{device}/{service}", get(upgrade_bound))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn next_json(
        ws: &mut (impl StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin),
    ) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .expect("read failed");
            if let tungstenite::Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
            // Skip pings and other control frames.
        }
    }

    #[tokio::test]
    async fn echo_session_round_trip_and_event_fanout() {
        let state = echo_state(false);
        let addr = serve(state.clone()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        ws.send(tungstenite::Message::text(
            r#"{"jsonrpc":"2.0","id":"1","method":"Device.Ping","params":{"ts":1}}"#,
        ))
        .await
        .unwrap();

        let resp = next_json(&mut ws).await;
        assert_eq!(resp["id"], Value::String("1".into()));
        assert_eq!(resp["result"]["echo"], Value::Bool(true));
        assert_eq!(resp["result"]["method"], Value::String("Device.Ping".into()));

        // The session is live and subscribed; a published event must arrive
        // as a notification without an id.
        state.bus.publish(&Event {
            device: "mac:06cbd937c9d2".into(),
            service: "BlizzardRDK".into(),
            name: "Time.TimerElapsed".into(),
            payload: br#"{"elapsed":true}"#.to_vec(),
        });

        let note = next_json(&mut ws).await;
        assert_eq!(
            note["method"],
            Value::String("rpc.Event.BlizzardRDK.Time.TimerElapsed".into())
        );
        assert!(note.get("id").is_none());
        assert_eq!(note["params"]["device"], Value::String("mac:06cbd937c9d2".into()));
        assert_eq!(
            note["params"]["payload"],
            Value::String(r#"{"elapsed":true}"#.into())
        );
    }

    #[tokio::test]
    async fn invalid_frame_yields_error_without_id() {
        let addr = serve(echo_state(false)).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        ws.send(tungstenite::Message::text("{not json")).await.unwrap();
        let resp = next_json(&mut ws).await;
        assert_eq!(resp["error"]["code"], Value::from(-32600));
        assert!(resp.get("id").is_none());

        // The session survives a protocol error.
        ws.send(tungstenite::Message::text(
            r#"{"jsonrpc":"2.0","id":2,"method":"m"}"#,
        ))
        .await
        .unwrap();
        let resp = next_json(&mut ws).await;
        assert_eq!(resp["id"], Value::from(2));
    }

    #[tokio::test]
    async fn wrong_version_is_rejected() {
        let addr = serve(echo_state(false)).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        ws.send(tungstenite::Message::text(
            r#"{"jsonrpc":"1.0","id":1,"method":"m"}"#,
        ))
        .await
        .unwrap();
        let resp = next_json(&mut ws).await;
        assert_eq!(resp["error"]["code"], Value::from(-32600));
        assert_eq!(
            resp["error"]["message"],
            Value::String("unsupported jsonrpc version".into())
        );
    }

    #[tokio::test]
    async fn synthetic_ack_follows_each_response() {
        let addr = serve(echo_state(true)).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        ws.send(tungstenite::Message::text(
            r#"{"jsonrpc":"2.0","id":"1","method":"Device.Ping"}"#,
        ))
        .await
        .unwrap();

        let resp = next_json(&mut ws).await;
        assert_eq!(resp["result"]["echo"], Value::Bool(true));

        let ack = next_json(&mut ws).await;
        assert_eq!(ack["method"], Value::String("Gateway.Ack".into()));
        // The correlation id carries the raw request id bytes, quotes included.
        assert_eq!(ack["params"]["correlationId"], Value::String(r#""1""#.into()));
        assert!(ack["params"]["id"].as_str().is_some_and(|s| !s.is_empty()));
    }

    #[tokio::test]
    async fn bound_path_with_echo_base_still_echoes() {
        let addr = serve(echo_state(false)).await;
        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/ws/mac:abc/BlizzardRDK"))
                .await
                .unwrap();

        ws.send(tungstenite::Message::text(
            r#"{"jsonrpc":"2.0","id":"x","method":"Device.Ping"}"#,
        ))
        .await
        .unwrap();
        let resp = next_json(&mut ws).await;
        assert_eq!(resp["result"]["echo"], Value::Bool(true));
        assert_eq!(resp["id"], Value::String("x".into()));
    }
}
