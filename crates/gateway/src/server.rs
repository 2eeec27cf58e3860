use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::{Path, Query, State, rejection::JsonRejection},
        http::StatusCode,
        response::{
            IntoResponse, Json,
            sse::{Event, Sse},
        },
        routing::{get, post},
    },
    chatrelay_config::ChatRelayConfig,
    futures::{Stream, StreamExt},
    serde::Deserialize,
    tower_http::{
        catch_panic::CatchPanicLayer,
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{debug, info},
};

use crate::{
    error::RelayError,
    producer::{ChatRequest, submit},
    relay::{RelayEvent, RelayRegistry, RelayStream, unix_now},
    state::GatewayState,
};

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/api/health", get(health_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/stream/{session_id}", get(stream_handler))
        .route("/api/history/{session_id}", get(history_handler))
        .route(
            "/api/clear/{session_id}",
            get(clear_handler).post(clear_handler),
        )
        .route("/api/cancel/{session_id}", post(cancel_handler))
        .fallback(not_found_handler)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Start the relay HTTP server and run until Ctrl-C.
pub async fn start_gateway(config: ChatRelayConfig) -> anyhow::Result<()> {
    let provider = chatrelay_agents::build_provider(&config.provider)?;
    let state = GatewayState::new(config, provider);
    let app = build_gateway_app(Arc::clone(&state));

    let server = &state.config.server;
    let addr: SocketAddr = format!("{}:{}", server.bind, server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let relay = &state.config.relay;
    let lines = [
        format!("chatrelay v{}", state.version),
        format!("listening on {addr}"),
        format!(
            "llm: {} ({})",
            state.provider.name(),
            state.provider.id()
        ),
        format!(
            "heartbeat {}s, idle ttl {}s",
            relay.heartbeat_interval().as_secs(),
            relay.idle_ttl().as_secs()
        ),
        format!(
            "capabilities: {}",
            state
                .config
                .capabilities
                .names()
                .collect::<Vec<_>>()
                .join(", ")
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let sweeper = spawn_eviction_sweeper(
        Arc::clone(&state.relay),
        relay.sweep_interval(),
        relay.idle_ttl(),
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    state.relay.cancel_all();
    info!("gateway stopped");
    Ok(())
}

/// Periodically remove channels that no consumer has attached to in `ttl`.
pub fn spawn_eviction_sweeper(
    relay: Arc<RelayRegistry>,
    every: Duration,
    ttl: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let evicted = relay.evict_idle(ttl);
            if evicted > 0 {
                info!(evicted, open = relay.len(), "idle channel sweep");
            }
        }
    })
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn root_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "chatrelay",
        "version": state.version,
        "endpoints": {
            "health": "GET /api/health",
            "chat": "POST /api/chat",
            "stream": "GET /api/stream/{session_id}?incremental=true",
            "history": "GET /api/history/{session_id}",
            "clear": "POST /api/clear/{session_id}",
            "cancel": "POST /api/cancel/{session_id}",
        },
    }))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "chatrelay",
        "version": state.version,
        "timestamp": unix_now(),
        "uptime_secs": state.uptime_secs(),
        "open_channels": state.relay.len(),
    }))
}

async fn chat_handler(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<impl IntoResponse, RelayError> {
    let Json(request) = body.map_err(|e| RelayError::Validation(e.body_text()))?;
    let accepted = submit(&state, request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    incremental: Option<bool>,
}

async fn stream_handler(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let incremental = query.incremental.unwrap_or(true);
    debug!(session_id = %session_id, incremental, "stream attached");

    let events = state.relay.drain(&session_id);
    let events = if incremental {
        events
    } else {
        accumulate(events)
    };
    Sse::new(events.map(|event| Ok(to_sse_frame(&event))))
}

/// Rewrite `stream` events so each carries all text received so far.
fn accumulate(events: RelayStream) -> RelayStream {
    let mut text = String::new();
    Box::pin(events.map(move |event| match event {
        RelayEvent::Stream { content, timestamp } => {
            text.push_str(&content);
            RelayEvent::Stream {
                content: text.clone(),
                timestamp,
            }
        },
        other => other,
    }))
}

fn to_sse_frame(event: &RelayEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| {
        serde_json::json!({ "type": "error", "content": "unserializable event" }).to_string()
    });
    Event::default().data(data)
}

async fn history_handler(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let history = state.sessions.history(&session_id).await;
    Json(serde_json::json!({
        "session_id": session_id,
        "history": history,
    }))
}

async fn clear_handler(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let existed = state.sessions.clear(&session_id).await;
    debug!(session_id = %session_id, existed, "history cleared");
    Json(serde_json::json!({ "message": "History cleared" }))
}

async fn cancel_handler(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let cancelled = state.relay.cancel(&session_id);
    Json(serde_json::json!({
        "session_id": session_id,
        "cancelled": cancelled,
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not found" })),
    )
}
