use crate::config::Config;
use crate::pool::{ConnectionPool, Outbound, Transport};
use crate::sessions::SessionTracker;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use bridge_core::BridgeError;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub pool: ConnectionPool,
    pub sessions: SessionTracker,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            pool: ConnectionPool::with_limits(config.command_timeout, config.max_message_bytes),
            sessions: SessionTracker::new(config.session_idle),
            config: Arc::new(config),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub document_id: Option<String>,
    /// Caller session key; enables the concurrent-session warning.
    #[serde(default)]
    pub session_id: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/connections", get(list_connections))
        .route("/commands", post(run_command))
        .route("/sessions/:session_id", delete(end_session))
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// Resolves the target, sends the command, and waits for its outcome.
/// Returns the id of the document that ran it alongside the reply data.
pub async fn execute_command(
    pool: &ConnectionPool,
    request: CommandRequest,
) -> Result<(String, Value), BridgeError> {
    let target = pool.resolve_target(request.document_id.as_deref())?;
    let params = if request.params.is_null() {
        Value::Object(Map::new())
    } else {
        request.params
    };
    let reply = pool.dispatch(&request.action, params, &target);
    let document_id = target.id.clone();
    drop(target);
    reply.await.map(|data| (document_id, data))
}

pub fn status_for(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::NoConnections => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
        BridgeError::NotReady(_) | BridgeError::Ambiguous(_) => StatusCode::CONFLICT,
        BridgeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        BridgeError::CommandFailed(_) | BridgeError::Disconnected => StatusCode::BAD_GATEWAY,
        BridgeError::InvalidCommand(_) => StatusCode::PAYLOAD_TOO_LARGE,
    }
}

fn error_body(code: &str, message: &str) -> Json<Value> {
    Json(json!({
        "ok": false,
        "error": {"code": code, "message": message},
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.max_message_size(state.config.max_message_bytes)
        .on_upgrade(move |socket| async move {
            handle_socket(state, socket, addr).await;
        })
}

async fn list_connections(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    Json(state.pool.connections()).into_response()
}

async fn run_command(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> (StatusCode, Json<Value>) {
    if !addr.ip().is_loopback() {
        return (
            StatusCode::FORBIDDEN,
            error_body("forbidden", "loopback clients only"),
        );
    }
    if request.action.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            error_body("invalid_request", "action is required"),
        );
    }
    let action = request.action.clone();
    let session_id = request.session_id.clone().filter(|value| !value.is_empty());
    if let Some(session_id) = &session_id {
        state.sessions.touch(session_id);
    }
    match execute_command(&state.pool, request).await {
        Ok((document_id, data)) => {
            let mut body = json!({"ok": true, "documentId": document_id, "data": data});
            if let Some(warning) = state
                .sessions
                .concurrent_warning(session_id.as_deref(), &document_id)
            {
                body["warning"] = Value::String(warning.to_string());
            }
            (StatusCode::OK, Json(body))
        }
        Err(err) => {
            warn!(event = "command_error", action = %action, code = err.code(), error = %err);
            (status_for(&err), error_body(err.code(), &err.to_string()))
        }
    }
}

async fn end_session(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> StatusCode {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN;
    }
    if state.sessions.end(&session_id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn handle_socket(state: AppState, socket: WebSocket, remote: SocketAddr) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (transport, rx) = state.pool.new_transport(state.config.queue_capacity);
    let mut write_task = tokio::spawn(writer_loop(
        transport.to_string(),
        ws_sender,
        rx,
        state.config.write_timeout,
    ));
    let ping_task = start_ping(transport.clone(), state.config.ping_interval);

    info!(event = "transport_open", transport = %transport, remote = %remote);

    let mut writer_done = false;
    loop {
        // A finished writer means the socket is closing or wedged; stop reading.
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            _ = &mut write_task => {
                writer_done = true;
                info!(event = "writer_closed", transport = %transport);
                break;
            }
        };
        let Some(result) = next else {
            break;
        };
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", transport = %transport, error = %err);
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "client_close", transport = %transport);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if state.config.debug {
            debug!(
                event = "frame_received",
                transport = %transport,
                raw = %String::from_utf8_lossy(&data)
            );
        }
        state.pool.handle_inbound(&transport, &data);
    }

    if let Some(task) = ping_task {
        task.abort();
    }
    state.pool.handle_disconnect(&transport);
    if !writer_done {
        write_task.abort();
        let _ = write_task.await;
    }
}

async fn writer_loop(
    transport: String,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
) {
    while let Some(outbound) = rx.recv().await {
        let (message, closing) = match outbound {
            Outbound::Frame(text) => (Message::Text(text), false),
            Outbound::Ping => (Message::Ping(Vec::new()), false),
            Outbound::Close(reason) => (
                Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "write_error", transport = %transport, error = %err);
                return;
            }
            Err(_) => {
                warn!(event = "write_timeout", transport = %transport);
                return;
            }
        }
        if closing {
            return;
        }
    }
}

fn start_ping(transport: Transport, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !transport.is_open() {
                return;
            }
            if !transport.ping() {
                debug!(event = "ping_skipped", transport = %transport);
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Connection, ReplyOutcome};
    use bridge_core::wire::OutboundFrame;

    fn request(action: &str, params: Value, document_id: Option<&str>) -> CommandRequest {
        CommandRequest {
            action: action.to_string(),
            params,
            document_id: document_id.map(str::to_string),
            session_id: None,
        }
    }

    fn loopback() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000)))
    }

    /// Answers every command sent to `rx` with `true`.
    fn spawn_host(pool: ConnectionPool, mut rx: mpsc::Receiver<Outbound>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let Outbound::Frame(text) = outbound else {
                    continue;
                };
                let OutboundFrame::Command { id, .. } =
                    serde_json::from_str::<OutboundFrame>(&text).expect("command frame");
                pool.handle_reply(&id, ReplyOutcome::Response(json!(true)));
            }
        })
    }

    async fn run_as(state: &AppState, session_id: Option<&str>) -> Value {
        let mut body = request("executeCode", json!({}), None);
        body.session_id = session_id.map(str::to_string);
        let (status, Json(value)) = run_command(loopback(), State(state.clone()), Json(body)).await;
        assert_eq!(status, StatusCode::OK, "{value}");
        value
    }

    #[test]
    fn request_body_uses_camel_case_and_optional_fields() {
        let parsed: CommandRequest =
            serde_json::from_str(r#"{"action":"executeCode","documentId":"a.pptx"}"#)
                .expect("parse");
        assert_eq!(parsed.action, "executeCode");
        assert_eq!(parsed.document_id.as_deref(), Some("a.pptx"));
        assert!(parsed.params.is_null());
        assert!(parsed.session_id.is_none());

        let parsed: CommandRequest =
            serde_json::from_str(r#"{"action":"executeCode","sessionId":"agent-a"}"#)
                .expect("parse");
        assert_eq!(parsed.session_id.as_deref(), Some("agent-a"));
    }

    #[test]
    fn every_error_kind_maps_to_a_status() {
        assert_eq!(status_for(&BridgeError::NoConnections), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&BridgeError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&BridgeError::NotReady("x".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&BridgeError::Ambiguous(vec![])), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&BridgeError::Timeout { timeout_ms: 1 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(&BridgeError::CommandFailed("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&BridgeError::Disconnected), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&BridgeError::InvalidCommand("x".into())),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[tokio::test]
    async fn execute_command_reports_resolution_errors() {
        let pool = ConnectionPool::new(Duration::from_secs(1));
        let err = execute_command(&pool, request("executeCode", Value::Null, None))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::NoConnections);
    }

    #[tokio::test]
    async fn execute_command_round_trips_through_a_session() {
        let pool = ConnectionPool::new(Duration::from_secs(5));
        let (transport, mut rx) = pool.new_transport(8);
        pool.add_connection(Connection {
            id: "deck.pptx".to_string(),
            transport,
            ready: true,
            source_path: None,
        });

        let host_pool = pool.clone();
        let host = tokio::spawn(async move {
            let Some(Outbound::Frame(text)) = rx.recv().await else {
                panic!("expected command frame");
            };
            let OutboundFrame::Command { id, params, .. } =
                serde_json::from_str::<OutboundFrame>(&text).expect("command frame");
            assert_eq!(params, json!({}));
            host_pool.handle_reply(&id, ReplyOutcome::Response(json!({"slides": 3})));
        });

        let (document_id, data) =
            execute_command(&pool, request("executeCode", Value::Null, Some("deck.pptx")))
                .await
                .expect("command result");
        host.await.expect("host task");
        assert_eq!(document_id, "deck.pptx");
        assert_eq!(data, json!({"slides": 3}));
    }

    #[tokio::test]
    async fn concurrent_sessions_are_warned_once_per_document() {
        let state = AppState::new(Config::default());
        let (transport, rx) = state.pool.new_transport(8);
        state.pool.announce(&transport, Some("deck.pptx"));
        let host = spawn_host(state.pool.clone(), rx);

        let alone = run_as(&state, Some("agent-a")).await;
        assert_eq!(alone["data"], json!(true));
        assert!(alone.get("warning").is_none());

        state.sessions.touch("agent-b");
        let first = run_as(&state, Some("agent-a")).await;
        assert_eq!(first["documentId"], "deck.pptx");
        assert!(first["warning"]
            .as_str()
            .is_some_and(|text| text.contains("last-write-wins")));

        let repeated = run_as(&state, Some("agent-a")).await;
        assert!(repeated.get("warning").is_none());
        let anonymous = run_as(&state, None).await;
        assert!(anonymous.get("warning").is_none());

        host.abort();
    }

    #[tokio::test]
    async fn ending_a_session_drops_it_from_the_active_count() {
        let state = AppState::new(Config::default());
        state.sessions.touch("agent-a");
        state.sessions.touch("agent-b");

        let status = end_session(loopback(), State(state.clone()), Path("agent-b".to_string())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.sessions.active_count(), 1);
        let status = end_session(loopback(), State(state.clone()), Path("agent-b".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
