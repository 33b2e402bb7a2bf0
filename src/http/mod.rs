//! HTTP front end: MCP over Server-Sent Events.
//!
//! A client opens `GET /sse`, learns its session id from the first event, and
//! POSTs JSON-RPC messages to `/message` with the id in `X-Session-ID` (or the
//! `sessionId` query parameter). Responses come back on the event stream.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures::{future, stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::mcp::connection::{ConnectionManager, Outbound};
use crate::mcp::protocol::{JsonRpcError, JsonRpcResponse, RequestId};
use crate::mcp::server::McpServer;
use crate::mcp::transport::sse::{events, SESSION_HEADER};

/// Upper bound on POSTed messages being accepted at once.
const MAX_CONCURRENT_POSTS: usize = 256;

/// HTTP server state.
#[derive(Clone)]
pub struct HttpState {
    server: Arc<McpServer>,
    manager: Arc<ConnectionManager>,
    /// Ordered intake per session, started on the first POST.
    inboxes: Arc<DashMap<String, mpsc::UnboundedSender<Value>>>,
    started_at: Instant,
}

impl HttpState {
    pub fn new(server: Arc<McpServer>) -> Self {
        let inboxes: Arc<DashMap<String, mpsc::UnboundedSender<Value>>> = Arc::new(DashMap::new());
        let hook_server = server.clone();
        let hook_inboxes = inboxes.clone();
        let manager = ConnectionManager::new(server.metrics().clone()).with_close_hook(Arc::new(move |id: &str| {
            hook_inboxes.remove(id);
            hook_server.connection_closed(id);
        }));
        Self {
            server,
            manager: Arc::new(manager),
            inboxes,
            started_at: Instant::now(),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}

/// Build the router.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/sse", get(open_stream))
        .route(
            "/message",
            post(post_message).layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_POSTS)),
        )
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and run until ctrl-c.
pub async fn start_server(config: &Config, server: Arc<McpServer>) -> Result<()> {
    let state = HttpState::new(server);
    let manager = state.manager.clone();
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown requested, closing {} connection(s)", manager.len());
            manager.close_all();
        })
        .await
        .map_err(|e| Error::HttpServer(e.to_string()))?;

    info!("HTTP server stopped");
    Ok(())
}

/// Health check endpoint.
async fn health_check(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "name": state.server.info().name,
        "version": crate::VERSION,
        "connections": state.manager.len(),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Prometheus text exposition.
async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.server.metrics().to_prometheus(),
    )
}

/// Open an event stream for a new connection.
async fn open_stream(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (conn, frames) = state.manager.create();
    let session_id = conn.id().to_string();
    debug!(session_id = %session_id, "SSE stream requested");

    let announce = stream::iter(vec![
        Ok::<_, Infallible>(Event::default()
            .event(events::SESSION)
            .data(json!({ "sessionId": session_id }).to_string())),
        Ok::<_, Infallible>(Event::default()
            .event(events::ENDPOINT)
            .data(format!("/message?sessionId={}", session_id))),
    ]);

    let body = frames.filter_map(|frame| future::ready(frame_to_event(frame).map(Ok::<_, Infallible>)));

    Sse::new(announce.chain(body)).keep_alive(KeepAlive::default())
}

fn frame_to_event(frame: Outbound) -> Option<Event> {
    match frame {
        Outbound::Message(message) => match serde_json::to_string(&message) {
            Ok(data) => Some(Event::default().event(events::MESSAGE).data(data)),
            Err(e) => {
                warn!("Failed to encode outbound message: {}", e);
                None
            }
        },
        Outbound::Event { event, data } => Some(Event::default().event(event).data(data)),
        Outbound::Close => Some(Event::default().event(events::CLOSE).data("")),
    }
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Accept one JSON-RPC message for an open connection.
async fn post_message(
    State(state): State<HttpState>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.session_id);

    let Some(session_id) = session_id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing session id" })),
        )
            .into_response();
    };

    let Some(conn) = state.manager.get(&session_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown session: {}", session_id) })),
        )
            .into_response();
    };

    let raw: Value = match serde_json::from_str(&body) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(session_id = %session_id, "Unparseable POST body: {}", e);
            let failure = JsonRpcResponse::failure(RequestId::Null, JsonRpcError::parse_error(e));
            return (StatusCode::BAD_REQUEST, Json(failure)).into_response();
        }
    };

    let inbox = state
        .inboxes
        .entry(session_id.clone())
        .or_insert_with(|| state.server.spawn_inbox(conn.clone()))
        .clone();
    if inbox.send(raw).is_err() {
        state.inboxes.remove(&session_id);
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("session closed: {}", session_id) })),
        )
            .into_response();
    }

    StatusCode::ACCEPTED.into_response()
}
