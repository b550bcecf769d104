//! HTTP ingestion, query routes and the WebSocket stream

use super::hub::{ViewerHandle, ViewerSubscription};
use super::ingest::split_payload;
use super::ring_buffer::HistoryQuery;
use super::rpc_bridge::RpcCallError;
use super::ServerContext;
use crate::types::{
    BatchResponse, ClientControl, ErrorCode, HistorySource, RpcDescriptor,
    ServerMessage, SessionInfo, Severity, ViewerCommand,
};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, info, warn};

/// Header selecting the WebSocket role
pub const ROLE_HEADER: &str = "x-logger-role";

/// Header naming a client connection's session
pub const SESSION_HEADER: &str = "x-session-id";

/// Replies buffered per client connection
const CLIENT_CHANNEL_CAPACITY: usize = 256;

type Shared = State<Arc<ServerContext>>;

/// Build the router serving every HTTP and WebSocket route
pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/health", get(health_detail))
        .route("/api/v1/sessions", get(sessions))
        .route("/api/v1/log", post(ingest_one))
        .route("/api/v1/logs", post(ingest_many))
        .route("/api/v1/history", get(history))
        .route("/api/v1/stream", get(stream))
        .with_state(ctx)
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
}

/// Server internals reported by `/api/v1/health`
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthDetail {
    /// Always `ok` when the server answers
    pub status: String,
    /// Seconds since the server started
    pub uptime_secs: u64,
    /// Entries held in the ring buffer
    pub buffer_entries: usize,
    /// Estimated bytes held in the ring buffer
    pub buffer_bytes: usize,
    /// Ring buffer capacity
    pub buffer_capacity: usize,
    /// Known sessions
    pub sessions: usize,
    /// Connected viewers
    pub viewers: usize,
    /// Tokens left in the global bucket
    pub global_tokens: f64,
    /// RPC calls awaiting a client answer
    pub pending_rpc: usize,
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn health_detail(State(ctx): Shared) -> Json<HealthDetail> {
    let ingest = &ctx.ingest;
    Json(HealthDetail {
        status: "ok".to_string(),
        uptime_secs: ctx.started.elapsed().as_secs(),
        buffer_entries: ingest.buffer().len(),
        buffer_bytes: ingest.buffer().byte_estimate(),
        buffer_capacity: ingest.buffer().capacity(),
        sessions: ingest.sessions().len(),
        viewers: ingest.hub().viewer_count(),
        global_tokens: ingest.limiter().stats().global_tokens,
        pending_rpc: ingest.rpc().pending_count(),
    })
}

async fn sessions(State(ctx): Shared) -> Json<Vec<SessionInfo>> {
    Json(ctx.ingest.sessions().sessions())
}

async fn ingest_one(State(ctx): Shared, body: String) -> Response {
    match ctx.ingest.decode_one(&body) {
        Ok(entry) => reply(ctx.ingest.ingest_batch(vec![entry])),
        Err(e) => reply(ServerMessage::error(ErrorCode::ValidationFailed, e.to_string(), None)),
    }
}

/// Answers 200 with one result per entry; only a payload that is not a
/// batch at all, or an oversized one, is refused with an error status.
async fn ingest_many(State(ctx): Shared, body: String) -> Response {
    let items = match split_payload(&body) {
        Ok(items) => items,
        Err(e) => {
            return reply(ServerMessage::error(ErrorCode::ValidationFailed, e.to_string(), None))
        }
    };
    if items.is_empty() {
        return reply(ServerMessage::error(ErrorCode::ValidationFailed, "Empty batch", None));
    }
    match ctx.ingest.ingest_items(items) {
        Ok(results) => Json(BatchResponse { ok: true, results }).into_response(),
        Err(message) => reply(message),
    }
}

/// Query string of `GET /api/v1/history`
#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    /// Restrict to one session
    pub session_id: Option<String>,
    /// Restrict to one severity
    pub severity: Option<Severity>,
    /// Page size
    pub limit: Option<usize>,
    /// Cursor from a previous page
    pub cursor: Option<String>,
    /// Preferred backend
    pub source: Option<HistorySource>,
}

async fn history(State(ctx): Shared, Query(params): Query<HistoryParams>) -> Response {
    let query = match history_query(params.session_id, params.severity, params.limit, params.cursor) {
        Ok(query) => query,
        Err(message) => return reply(message),
    };
    reply(ctx.ingest.history("http", &query, params.source).await)
}

fn history_query(
    session_id: Option<String>,
    severity: Option<Severity>,
    limit: Option<usize>,
    cursor: Option<String>,
) -> Result<HistoryQuery, ServerMessage> {
    let cursor = match cursor {
        Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
            ServerMessage::error(
                ErrorCode::ValidationFailed,
                format!("Invalid cursor: {}", raw),
                None,
            )
        })?),
        None => None,
    };
    Ok(HistoryQuery {
        session_id,
        severity,
        limit,
        cursor,
        ..Default::default()
    })
}

fn status_of(message: &ServerMessage) -> StatusCode {
    match message {
        ServerMessage::Error { error_code, .. } => match error_code {
            ErrorCode::ValidationFailed => StatusCode::BAD_REQUEST,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::SessionNotFound | ErrorCode::RpcTargetNotFound => StatusCode::NOT_FOUND,
            ErrorCode::RpcTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::MaxConnections => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::OK,
    }
}

fn reply(message: ServerMessage) -> Response {
    (status_of(&message), Json(message)).into_response()
}

async fn stream(ws: WebSocketUpgrade, headers: HeaderMap, State(ctx): Shared) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let role = header(ROLE_HEADER).unwrap_or_else(|| "viewer".to_string());
    let session_id = header(SESSION_HEADER);

    if role != "client" && role != "viewer" {
        return reply(ServerMessage::error(
            ErrorCode::ValidationFailed,
            format!("Unknown role: {}", role),
            None,
        ));
    }

    let Ok(permit) = ctx.connections.clone().try_acquire_owned() else {
        ctx.self_log.warn("Rejected WebSocket connection: connection limit reached");
        return reply(ServerMessage::error(
            ErrorCode::MaxConnections,
            "Too many connections",
            None,
        ));
    };

    if role == "client" {
        ws.on_upgrade(move |socket| handle_client(socket, ctx, session_id, permit))
    } else {
        ws.on_upgrade(move |socket| handle_viewer(socket, ctx, permit))
    }
}

async fn handle_client(
    socket: WebSocket,
    ctx: Arc<ServerContext>,
    header_session: Option<String>,
    _permit: OwnedSemaphorePermit,
) {
    let (mut sink, mut incoming) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(CLIENT_CHANNEL_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize client message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let rpc = ctx.ingest.rpc().clone();
    let mut owned_session = header_session;
    if let Some(session_id) = &owned_session {
        rpc.register_client(session_id.clone(), tx.clone());
    }
    debug!("Client connected: {:?}", owned_session);

    let mut shutdown_rx = ctx.shutdown.subscribe();
    loop {
        let frame = tokio::select! {
            frame = incoming.next() => frame,
            _ = shutdown_rx.recv() => break,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };

        if let Some(ClientControl::RegisterTools { session_id, tools }) =
            ClientControl::from_frame(text.as_str())
        {
            let Some(session_id) = owned_session.clone().or(session_id) else {
                let _ = tx
                    .send(ServerMessage::error(
                        ErrorCode::ValidationFailed,
                        "register_tools without a session",
                        None,
                    ))
                    .await;
                continue;
            };
            if owned_session.is_none() {
                rpc.register_client(session_id.clone(), tx.clone());
                owned_session = Some(session_id.clone());
            }
            publish_tools(&ctx, session_id, tools);
            continue;
        }

        let reply = match ctx.ingest.decode(text.as_str()) {
            Ok(entries) => {
                if owned_session.is_none() {
                    if let Some(first) = entries.first() {
                        rpc.register_client(first.session_id.clone(), tx.clone());
                        owned_session = Some(first.session_id.clone());
                    }
                }
                ctx.ingest.ingest_batch(entries)
            }
            Err(e) => ServerMessage::error(ErrorCode::ValidationFailed, e.to_string(), None),
        };
        if tx.send(reply).await.is_err() {
            break;
        }
    }

    if let Some(session_id) = &owned_session {
        rpc.release_client(session_id, &tx);
    }
    drop(tx);
    let _ = writer.await;
    debug!("Client disconnected: {:?}", owned_session);
}

fn publish_tools(ctx: &ServerContext, session_id: String, tools: Vec<RpcDescriptor>) {
    debug!("Session {} published {} RPC tools", session_id, tools.len());
    ctx.ingest.rpc().register_tools(session_id.clone(), tools.clone());
    ctx.ingest.hub().broadcast(&ServerMessage::RpcTools {
        tools: BTreeMap::from([(session_id, tools)]),
    });
}

async fn handle_viewer(socket: WebSocket, ctx: Arc<ServerContext>, _permit: OwnedSemaphorePermit) {
    let hub = ctx.ingest.hub().clone();
    let ViewerHandle { id, mut receiver } = hub.subscribe();
    hub.send_to(id, &ctx.ingest.session_list());
    info!("Viewer {} connected", id);

    let (mut sink, mut incoming) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = receiver.recv().await {
            if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut shutdown_rx = ctx.shutdown.subscribe();
    loop {
        let frame = tokio::select! {
            frame = incoming.next() => frame,
            _ = shutdown_rx.recv() => break,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        };
        match serde_json::from_str::<ViewerCommand>(text.as_str()) {
            Ok(command) => handle_command(&ctx, id, command).await,
            Err(e) => {
                hub.send_to(
                    id,
                    &ServerMessage::error(ErrorCode::ValidationFailed, e.to_string(), None),
                );
            }
        }
    }

    hub.unsubscribe(id);
    writer.abort();
    info!("Viewer {} disconnected", id);
}

async fn handle_command(ctx: &Arc<ServerContext>, viewer: u64, command: ViewerCommand) {
    let hub = ctx.ingest.hub();
    match command {
        ViewerCommand::Subscribe {
            session_ids,
            min_severity,
            text_filter,
        } => {
            hub.set_subscription(
                viewer,
                ViewerSubscription {
                    session_ids,
                    min_severity,
                    text_filter,
                },
            );
        }
        ViewerCommand::Unsubscribe => {
            hub.set_subscription(viewer, ViewerSubscription::default());
        }
        ViewerCommand::HistoryQuery {
            query_id,
            session_id,
            severity,
            limit,
            cursor,
            source,
        } => {
            let message = match history_query(session_id, severity, limit, cursor) {
                Ok(query) => ctx.ingest.history(query_id, &query, source).await,
                Err(message) => message,
            };
            hub.send_to(viewer, &message);
        }
        ViewerCommand::RpcRequest {
            rpc_id,
            target_session_id,
            rpc_method,
            rpc_args,
        } => {
            // answered asynchronously so the viewer can keep issuing commands
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let result = ctx
                    .ingest
                    .rpc()
                    .call_with_id(&rpc_id, &target_session_id, &rpc_method, rpc_args)
                    .await;
                let message = match result {
                    Ok(value) => ServerMessage::RpcResponse {
                        rpc_id,
                        rpc_response: Some(value),
                        rpc_error: None,
                    },
                    Err(e) => {
                        if matches!(e, RpcCallError::Timeout(_)) {
                            ctx.self_log
                                .warn(format!("RPC {} to {} timed out", rpc_method, target_session_id));
                        }
                        ServerMessage::RpcResponse {
                            rpc_id,
                            rpc_response: None,
                            rpc_error: Some(e.to_string()),
                        }
                    }
                };
                ctx.ingest.hub().send_to(viewer, &message);
            });
        }
        ViewerCommand::StateQuery { session_id } => {
            hub.send_to(viewer, &ctx.ingest.state_snapshot(&session_id));
        }
        ViewerCommand::ToolsQuery { session_id } => {
            let rpc = ctx.ingest.rpc();
            let tools = match session_id {
                Some(session_id) => {
                    let published = rpc.tools(&session_id).unwrap_or_default();
                    BTreeMap::from([(session_id, published)])
                }
                None => rpc.all_tools(),
            };
            hub.send_to(viewer, &ServerMessage::RpcTools { tools });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_query_cursor_parsing() {
        let query = history_query(Some("s".into()), None, Some(10), Some("42".into())).unwrap();
        assert_eq!(query.cursor, Some(42));
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.session_id.as_deref(), Some("s"));

        match history_query(None, None, None, Some("abc".into())) {
            Err(ServerMessage::Error { error_code, .. }) => {
                assert_eq!(error_code, ErrorCode::ValidationFailed)
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(&ServerMessage::Ack { ack_ids: vec![] }), StatusCode::OK);
        assert_eq!(
            status_of(&ServerMessage::error(ErrorCode::RateLimited, "x", None)),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(&ServerMessage::error(ErrorCode::ValidationFailed, "x", None)),
            StatusCode::BAD_REQUEST
        );
    }
}
