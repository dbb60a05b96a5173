use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use axum_prometheus::PrometheusMetricLayer;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{Encoding, Frame, PeerCommand};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::RelayConfig;
use crate::relay::RoomRelay;

/// Missed heartbeats tolerated before a silent socket is closed.
const MISSED_HEARTBEATS: u32 = 3;

pub mod state {
    use super::*;

    #[derive(Clone)]
    pub struct AppState {
        pub relay: Arc<RoomRelay>,
        pub heartbeat: Duration,
    }

    impl AppState {
        pub fn new(config: &RelayConfig) -> Self {
            Self {
                relay: Arc::new(RoomRelay::new(config.send_queue)),
                heartbeat: config.heartbeat,
            }
        }
    }
}

use state::AppState;

#[derive(Deserialize)]
struct WsQuery {
    #[serde(default)]
    encoding: Encoding,
}

async fn health(State(app): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": app.relay.room_count(),
        "peers": app.relay.peer_count(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(app): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app, query.encoding))
}

/// Pump one connection: relay events out, peer commands in. Whichever side
/// stops first tears the other down and releases every room membership.
async fn handle_socket(socket: WebSocket, app: AppState, encoding: Encoding) {
    let (peer_id, mut rx) = app.relay.connect();
    tracing::info!(peer_id = %peer_id, %encoding, "peer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let heartbeat = app.heartbeat;

    let writer_peer = peer_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat);
        ping.tick().await;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let message = match shared::encode(&event, encoding) {
                        Ok(Frame::Text(text)) => Message::Text(text.into()),
                        Ok(Frame::Binary(bytes)) => Message::Binary(bytes.into()),
                        Err(err) => {
                            tracing::warn!(peer_id = %writer_peer, %err, "failed to encode event");
                            continue;
                        }
                    };
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(peer_id = %writer_peer, "sent ping");
                }
            }
        }
    });

    let reader_relay = Arc::clone(&app.relay);
    let reader_peer = peer_id.clone();
    let idle_limit = heartbeat * MISSED_HEARTBEATS;
    let mut reader = tokio::spawn(async move {
        loop {
            let message = match tokio::time::timeout(idle_limit, ws_rx.next()).await {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(err))) => {
                    tracing::debug!(peer_id = %reader_peer, %err, "socket error");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::info!(peer_id = %reader_peer, "peer went silent, closing");
                    break;
                }
            };

            let decoded = match message {
                Message::Text(text) => shared::decode_text::<PeerCommand>(text.as_str()),
                Message::Binary(bytes) => shared::decode_binary::<PeerCommand>(&bytes),
                Message::Close(_) => break,
                // pongs only count as liveness
                Message::Ping(_) | Message::Pong(_) => continue,
            };

            match decoded {
                Ok(command) => reader_relay.handle(&reader_peer, command),
                Err(err) => {
                    tracing::debug!(peer_id = %reader_peer, %err, "dropping malformed frame");
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    app.relay.leave(&peer_id);
}

pub fn build_router(app: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

/// Serve the relay on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, build_router(app))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env()?;
    let app = AppState::new(&config);

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
    let router = build_router(app)
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(prometheus_layer);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    tracing::info!(
        addr = %config.addr,
        send_queue = config.send_queue,
        heartbeat_secs = config.heartbeat.as_secs(),
        "relay server started"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
