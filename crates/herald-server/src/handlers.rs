//! HTTP handlers for Herald server.
//!
//! This module wires the WebSocket and long-poll transports into an axum
//! router and runs the server.

use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use herald_core::{ChannelRouter, PubSub, TransportHandle};
use herald_protocol::{Codec, Version, PROTOCOL_VERSION};
use herald_transport::{
    websocket, ChannelMux, CheckOrigin, ConnectionId, LongPoll, LongPollError, PollParams,
    PollReply, TokenSigner, WebSocketConnection,
};
use rand::RngCore;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Topic route table.
    pub router: Arc<ChannelRouter>,
    /// Broadcast dispatcher.
    pub pubsub: Arc<PubSub>,
    /// Long-poll sessions.
    pub longpoll: LongPoll,
    check_origin: CheckOrigin,
}

impl AppState {
    /// Create app state with a local-only dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the token signer cannot be created.
    pub fn new(config: Config, router: ChannelRouter) -> Result<Self> {
        Self::with_pubsub(config, router, Arc::new(PubSub::new("herald")))
    }

    /// Create app state around an existing dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the token signer cannot be created.
    pub fn with_pubsub(config: Config, router: ChannelRouter, pubsub: Arc<PubSub>) -> Result<Self> {
        let secret = if config.security.secret_key_base.is_empty() {
            warn!("No secret_key_base configured; long-poll tokens will not survive a restart");
            generate_secret()
        } else {
            config.security.secret_key_base.clone()
        };
        let signer = TokenSigner::new(secret.as_bytes()).context("Failed to create token signer")?;

        let router = Arc::new(router);
        let check_origin = config.check_origin();
        let longpoll = LongPoll::new(
            signer,
            Arc::clone(&router),
            Arc::clone(&pubsub),
            check_origin.clone(),
            config.longpoll_config(),
        );

        Ok(Self {
            config,
            router,
            pubsub,
            longpoll,
            check_origin,
        })
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let transport = &state.config.transport;
    let mut app = Router::new().route("/health", get(health_handler));

    if transport.websocket {
        app = app.route(&transport.websocket_path, get(ws_handler));
    }
    if transport.longpoll {
        app = app.route(
            &transport.longpoll_path,
            get(longpoll_poll)
                .post(longpoll_publish)
                .delete(longpoll_close),
        );
    }

    app.with_state(state)
}

/// Run the HTTP server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, router: ChannelRouter) -> Result<()> {
    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => metrics::init_metrics(),
            Err(e) => error!("Failed to start metrics server: {:#}", e),
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config, router)?);
    let transport = state.config.transport.clone();
    let app = build_app(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Herald server listening on {}", addr);
    if transport.websocket {
        info!("WebSocket endpoint: ws://{}{}", addr, transport.websocket_path);
    }
    if transport.longpoll {
        info!("Long-poll endpoint: http://{}{}", addr, transport.longpoll_path);
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket connect parameters.
#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    vsn: Option<String>,
    serializer: Option<String>,
}

fn origin(headers: &HeaderMap) -> Option<&str> {
    headers.get(ORIGIN).and_then(|v| v.to_str().ok())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    if !state.check_origin.is_allowed(origin(&headers)) {
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Some(vsn) = params.vsn.as_deref() {
        let compatible =
            Version::parse(vsn).is_some_and(|v| v.is_compatible_with(&PROTOCOL_VERSION));
        if !compatible {
            warn!(vsn = %vsn, "Refusing incompatible protocol version");
            return (StatusCode::BAD_REQUEST, "unsupported protocol version").into_response();
        }
    }

    let codec = match params.serializer.as_deref().map(Codec::from_name).transpose() {
        Ok(codec) => codec.unwrap_or_default(),
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let remote = connect_info.map(|ConnectInfo(addr)| addr);
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, codec, remote, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    codec: Codec,
    remote: Option<SocketAddr>,
    state: Arc<AppState>,
) {
    let id = ConnectionId::generate();
    debug!(connection = %id, codec = ?codec, "WebSocket connected");

    let (transport, outbound) = TransportHandle::channel(id.as_str());
    let mux = ChannelMux::new(
        transport,
        Arc::clone(&state.router),
        Arc::clone(&state.pubsub),
        state.config.mux_config(),
    );

    let mut conn =
        WebSocketConnection::new(id, socket, codec, state.config.limits.max_message_size);
    if let Some(addr) = remote {
        conn = conn.with_remote_addr(addr);
    }

    websocket::serve(conn, mux, outbound).await;
}

fn longpoll_response(result: Result<PollReply, LongPollError>) -> Response {
    match result {
        Ok(reply) => Json(reply).into_response(),
        Err(LongPollError::Forbidden) => (
            StatusCode::FORBIDDEN,
            Json(PollReply::from(LongPollError::Forbidden)),
        )
            .into_response(),
        Err(e) => {
            debug!(error = %e, "Long-poll request refused");
            Json(PollReply::from(e)).into_response()
        }
    }
}

/// Long-poll GET: open a session or wait for messages.
async fn longpoll_poll(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PollParams>,
    headers: HeaderMap,
) -> Response {
    longpoll_response(state.longpoll.poll(origin(&headers), &params).await)
}

/// Long-poll POST: publish one envelope.
async fn longpoll_publish(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PollParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    longpoll_response(
        state
            .longpoll
            .publish(origin(&headers), &params, &body)
            .await,
    )
}

/// Long-poll DELETE: end the session.
async fn longpoll_close(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PollParams>,
    headers: HeaderMap,
) -> Response {
    longpoll_response(state.longpoll.close(origin(&headers), &params))
}
