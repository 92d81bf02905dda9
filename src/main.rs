#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # wrpgw
//!
//! JSON-RPC ⇄ WRP protocol-translation gateway.
//!
//! wrpgw terminates client sessions speaking JSON-RPC 2.0 over WebSocket and
//! bridges them to a device fabric speaking WRP (binary envelopes inside
//! msgpack-encoded HTTP POSTs). Requests are tunneled to Scytale, responses
//! correlated by transaction UUID, and asynchronous device events delivered
//! to the webhook endpoint are fanned out to every live session as JSON-RPC
//! notifications.
//!
//! ## API surface
//!
//! | Method | Path                      | Description                         |
//! |--------|---------------------------|-------------------------------------|
//! | GET    | `/ws`                     | WebSocket, base dispatcher          |
//! | GET    | `/ws/{device}/{service}`  | WebSocket bound to a device+service |
//! | POST   | `/webhook/events`         | Device-event ingestion              |
//!
//! TLS termination, origin policy and client authentication are left to the
//! deployment in front of the gateway.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap flags, router setup, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! events.rs        — in-memory event bus (drop-on-full fanout)
//! rpc/
//!   mod.rs         — JSON-RPC model, parsing, Dispatcher trait, echo variant
//!   wrp.rs         — WRP envelope + msgpack wire codec
//!   client.rs      — Scytale HTTP transport, auth normalization
//!   dispatch.rs    — single-service WRP dispatcher
//!   multi.rs       — multi-service fallback dispatcher
//! ws/
//!   mod.rs         — WebSocket upgrade, dispatcher binding, session loop
//! webhook/
//!   mod.rs         — event ingestion (WRP / JSON / header formats)
//!   registrar.rs   — Argus webhook registration
//! ```

mod config;
mod events;
mod rpc;
mod webhook;
mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use config::Config;
use events::Bus;
use rpc::client::WrpClient;
use rpc::dispatch::WrpDispatcher;
use rpc::{BaseDispatcher, EchoDispatcher};
use webhook::registrar::{ArgusRegistrar, Registrar};

/// Source address stamped on every outgoing WRP message.
const WRP_SOURCE: &str = "blizzard/gateway";

/// JSON-RPC ⇄ WRP protocol-translation gateway.
#[derive(Parser)]
#[command(name = "wrpgw", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Listen address override (e.g. `0.0.0.0:8920`).
    #[arg(long)]
    listen: Option<String>,
}

/// Shared application state passed to every handler via Axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Base dispatcher; WRP-bridging sessions specialize it per connection.
    pub dispatcher: Arc<BaseDispatcher>,
    /// Fanout bus carrying webhook-ingested device events to live sessions.
    pub bus: Arc<Bus>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref());
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("wrpgw v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let dispatcher = if config.upstream.url.trim().is_empty() {
        warn!("no upstream configured — echo dispatcher active");
        BaseDispatcher::Echo(EchoDispatcher)
    } else {
        info!("wrp bridging enabled -> {}", config.upstream.url);
        BaseDispatcher::Wrp(WrpDispatcher {
            client: Arc::new(WrpClient::new(
                config.upstream.url.clone(),
                &config.upstream.authorization,
            )),
            source: WRP_SOURCE.to_string(),
            destination: String::new(),
            service_name: String::new(),
        })
    };

    let state = AppState {
        dispatcher: Arc::new(dispatcher),
        bus: Arc::new(Bus::new()),
        config: Arc::new(config),
    };

    // Register the event callback with the fabric's directory in the
    // background; startup never blocks on it.
    if state.config.webhook.enable {
        let registrar = ArgusRegistrar::new(state.config.webhook.clone());
        tokio::spawn(async move {
            registrar.register().await;
        });
    }

    let app = Router::new()
        .route("/ws", get(ws::upgrade_base))
        .route("/ws/{device}/{service}", get(ws::upgrade_bound))
        .route("/webhook/events", post(webhook::ingest))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Goodbye");
}
