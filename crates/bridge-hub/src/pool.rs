use bridge_core::wire::{
    decode_frame, encode_frame, InboundFrame, OutboundFrame, DEFAULT_FAILURE_MESSAGE,
    DEFAULT_MAX_FRAME_BYTES,
};
use bridge_core::BridgeError;
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::AbortHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// What a socket writer task is asked to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Ping,
    Close(String),
}

/// Send half of one duplex connection. Identity is the transport id, so two
/// sockets announcing the same document are never confused with each other.
#[derive(Clone, Debug)]
pub struct Transport {
    id: u64,
    sender: mpsc::Sender<Outbound>,
}

impl Transport {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn send_frame(&self, frame: String) -> bool {
        self.sender.try_send(Outbound::Frame(frame)).is_ok()
    }

    pub fn ping(&self) -> bool {
        self.sender.try_send(Outbound::Ping).is_ok()
    }

    pub fn close(&self, reason: &str) {
        if self
            .sender
            .try_send(Outbound::Close(reason.to_string()))
            .is_err()
        {
            warn!(event = "close_not_queued", transport = %self, reason = reason);
        }
    }
}

impl PartialEq for Transport {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transport {}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.id)
    }
}

#[derive(Clone, Debug)]
pub struct Connection {
    pub id: String,
    pub transport: Transport,
    pub ready: bool,
    pub source_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub document_id: String,
    pub file_path: Option<String>,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Response(Value),
    Error(Option<String>),
}

type ReplySender = oneshot::Sender<Result<Value, BridgeError>>;

struct PendingCommand {
    reply: ReplySender,
    deadline: AbortHandle,
    owner: u64,
    action: String,
    dispatched_at: Instant,
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<String, Connection>,
    pending: HashMap<String, PendingCommand>,
    untitled_counter: u64,
}

struct PoolInner {
    command_timeout: Duration,
    max_frame_bytes: usize,
    transport_counter: AtomicU64,
    state: Mutex<PoolState>,
}

impl PoolInner {
    // The lock is never held across an await, so every transition below is
    // atomic with respect to the others.
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn expire(&self, correlation_id: &str) {
        let Some(pending) = self.lock().pending.remove(correlation_id) else {
            return;
        };
        let timeout_ms = duration_ms(self.command_timeout);
        warn!(
            event = "command_timeout",
            correlation_id = correlation_id,
            action = %pending.action,
            transport_id = pending.owner,
            timeout_ms = timeout_ms
        );
        let _ = pending.reply.send(Err(BridgeError::Timeout { timeout_ms }));
    }
}

/// Registry of document sessions plus the table of commands awaiting a reply.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ConnectionPool {
    pub fn new(command_timeout: Duration) -> Self {
        Self::with_limits(command_timeout, DEFAULT_MAX_FRAME_BYTES)
    }

    /// `max_frame_bytes` bounds both encoded commands and decoded replies.
    pub fn with_limits(command_timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                command_timeout,
                max_frame_bytes,
                transport_counter: AtomicU64::new(0),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        self.inner.command_timeout
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.inner.max_frame_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().connections.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn connections(&self) -> Vec<ConnectionSummary> {
        let mut summaries = self
            .inner
            .lock()
            .connections
            .values()
            .map(|conn| ConnectionSummary {
                document_id: conn.id.clone(),
                file_path: conn.source_path.clone(),
                ready: conn.ready,
            })
            .collect::<Vec<_>>();
        summaries.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        summaries
    }

    /// Creates the send half for a freshly accepted socket. The receiver
    /// belongs to that socket's writer task.
    pub fn new_transport(&self, capacity: usize) -> (Transport, mpsc::Receiver<Outbound>) {
        let id = self.inner.transport_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Transport { id, sender }, receiver)
    }

    /// Returns the document path verbatim, or mints the next `untitled-<n>`.
    pub fn generate_id(&self, document_url: Option<&str>) -> String {
        match document_url {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => {
                let mut state = self.inner.lock();
                state.untitled_counter += 1;
                format!("untitled-{}", state.untitled_counter)
            }
        }
    }

    /// Registers a connection. An entry already holding the same id is
    /// replaced: its in-flight commands fail with `Disconnected` right away
    /// and its transport is asked to close. The replaced entry is returned.
    pub fn add_connection(&self, connection: Connection) -> Option<Connection> {
        let id = connection.id.clone();
        let transport = connection.transport.clone();
        let ready = connection.ready;
        let superseded = self.inner.lock().connections.insert(id.clone(), connection);

        if let Some(previous) = &superseded {
            if previous.transport != transport {
                warn!(
                    event = "connection_superseded",
                    document_id = %id,
                    previous = %previous.transport,
                    current = %transport
                );
                self.reject_pending_for_transport(&previous.transport);
                previous.transport.close("superseded");
            }
        }
        info!(
            event = "connection_registered",
            document_id = %id,
            transport = %transport,
            ready = ready
        );
        superseded
    }

    pub fn remove_connection(&self, id: &str) -> Option<Connection> {
        let removed = self.inner.lock().connections.remove(id);
        if removed.is_some() {
            info!(event = "connection_removed", document_id = id);
        }
        removed
    }

    pub fn mark_ready(&self, id: &str) -> bool {
        match self.inner.lock().connections.get_mut(id) {
            Some(conn) => {
                conn.ready = true;
                true
            }
            None => false,
        }
    }

    /// Drops the registry entry owned by `transport`, if any, and returns its id.
    pub fn remove_by_transport(&self, transport: &Transport) -> Option<String> {
        let mut state = self.inner.lock();
        let id = state
            .connections
            .iter()
            .find(|(_, conn)| conn.transport == *transport)
            .map(|(id, _)| id.clone())?;
        state.connections.remove(&id);
        drop(state);
        info!(event = "connection_removed", document_id = %id, transport = %transport);
        Some(id)
    }

    /// Fails every command still waiting on `transport`. Commands sent on
    /// other transports are left alone.
    pub fn reject_pending_for_transport(&self, transport: &Transport) -> usize {
        let reaped = {
            let mut state = self.inner.lock();
            let ids = state
                .pending
                .iter()
                .filter(|(_, pending)| pending.owner == transport.id())
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| state.pending.remove_entry(&id))
                .collect::<Vec<_>>()
        };

        let count = reaped.len();
        for (correlation_id, pending) in reaped {
            pending.deadline.abort();
            warn!(
                event = "command_reaped",
                correlation_id = %correlation_id,
                action = %pending.action,
                transport = %transport
            );
            let _ = pending.reply.send(Err(BridgeError::Disconnected));
        }
        count
    }

    /// Disconnect path for a closed socket: unregister and fail its commands.
    pub fn handle_disconnect(&self, transport: &Transport) -> Option<String> {
        let removed = self.remove_by_transport(transport);
        let reaped = self.reject_pending_for_transport(transport);
        info!(
            event = "transport_closed",
            transport = %transport,
            document_id = removed.as_deref().unwrap_or(""),
            reaped = reaped
        );
        removed
    }

    /// Picks the connection a command should go to.
    ///
    /// Checks run in a fixed order: empty pool, explicit id, single
    /// connection, then ambiguity. With several documents open and no id the
    /// caller always gets an error listing them; one is never chosen for it.
    pub fn resolve_target(&self, id: Option<&str>) -> Result<Connection, BridgeError> {
        let state = self.inner.lock();
        if state.connections.is_empty() {
            return Err(BridgeError::NoConnections);
        }

        if let Some(id) = id.filter(|value| !value.is_empty()) {
            let conn = state
                .connections
                .get(id)
                .ok_or_else(|| BridgeError::NotFound(id.to_string()))?;
            if !conn.ready {
                return Err(BridgeError::NotReady(id.to_string()));
            }
            return Ok(conn.clone());
        }

        let mut values = state.connections.values();
        if let (Some(single), None) = (values.next(), values.next()) {
            if !single.ready {
                return Err(BridgeError::NotReady(single.id.clone()));
            }
            return Ok(single.clone());
        }

        let mut ids = state.connections.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        Err(BridgeError::Ambiguous(ids))
    }

    /// Sends `action` to `target` and returns a future for its reply.
    ///
    /// Must run inside a Tokio runtime (the deadline is a spawned task). The
    /// command is registered before the frame is written, so a reply can
    /// never beat its own registration. A failed write is only logged: the
    /// command then ends by timeout or by the disconnect path.
    pub fn dispatch(&self, action: &str, params: Value, target: &Connection) -> PendingReply {
        let correlation_id = Uuid::new_v4().to_string();
        let (reply, receiver) = oneshot::channel();
        let pending_reply = PendingReply {
            correlation_id: correlation_id.clone(),
            receiver,
        };

        let frame = OutboundFrame::Command {
            id: correlation_id.clone(),
            action: action.to_string(),
            params,
        };
        let encoded = match encode_frame(&frame, self.inner.max_frame_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "command_encode_error", action = action, error = %err);
                let _ = reply.send(Err(BridgeError::InvalidCommand(err.to_string())));
                return pending_reply;
            }
        };

        {
            let mut state = self.inner.lock();
            let deadline = self.spawn_deadline(correlation_id.clone());
            state.pending.insert(
                correlation_id.clone(),
                PendingCommand {
                    reply,
                    deadline,
                    owner: target.transport.id(),
                    action: action.to_string(),
                    dispatched_at: Instant::now(),
                },
            );
        }

        if target.transport.send_frame(encoded) {
            info!(
                event = "command_dispatched",
                correlation_id = %correlation_id,
                action = action,
                document_id = %target.id
            );
        } else {
            warn!(
                event = "command_send_error",
                correlation_id = %correlation_id,
                action = action,
                document_id = %target.id,
                open = target.transport.is_open()
            );
        }
        pending_reply
    }

    // Deadline is fixed now, not when the task is first polled.
    fn spawn_deadline(&self, correlation_id: String) -> AbortHandle {
        let inner = self.inner.clone();
        let deadline = tokio::time::Instant::now() + inner.command_timeout;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            inner.expire(&correlation_id);
        })
        .abort_handle()
    }

    /// Completes the command waiting on `correlation_id`. Returns false when
    /// nothing is waiting (already answered, timed out, reaped, or unknown).
    pub fn handle_reply(&self, correlation_id: &str, outcome: ReplyOutcome) -> bool {
        let Some(pending) = self.inner.lock().pending.remove(correlation_id) else {
            debug!(event = "reply_unmatched", correlation_id = correlation_id);
            return false;
        };
        pending.deadline.abort();

        let elapsed_ms = duration_ms(pending.dispatched_at.elapsed());
        let result = match outcome {
            ReplyOutcome::Response(data) => Ok(data),
            ReplyOutcome::Error(message) => Err(BridgeError::CommandFailed(
                message
                    .filter(|value| !value.is_empty())
                    .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
            )),
        };
        info!(
            event = "command_completed",
            correlation_id = correlation_id,
            action = %pending.action,
            ok = result.is_ok(),
            elapsed_ms = elapsed_ms
        );
        let _ = pending.reply.send(result);
        true
    }

    /// Registers the socket under the document it announced. A transport that
    /// announces twice keeps only its latest identity.
    pub fn announce(&self, transport: &Transport, document_url: Option<&str>) -> String {
        if let Some(previous) = self.remove_by_transport(transport) {
            info!(
                event = "connection_reannounced",
                previous_id = %previous,
                transport = %transport
            );
        }
        let id = self.generate_id(document_url);
        let source_path = document_url
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        self.add_connection(Connection {
            id: id.clone(),
            transport: transport.clone(),
            ready: true,
            source_path,
        });
        id
    }

    /// Entry point for every text or binary message read from a socket.
    pub fn handle_inbound(&self, transport: &Transport, raw: &[u8]) {
        let frame: InboundFrame = match decode_frame(raw, self.inner.max_frame_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "frame_invalid", transport = %transport, error = %err);
                return;
            }
        };
        match frame {
            InboundFrame::Ready { document_url } => {
                self.announce(transport, document_url.as_deref());
            }
            InboundFrame::Response { id, data } => {
                self.handle_reply(&id, ReplyOutcome::Response(data));
            }
            InboundFrame::Error { id, error } => {
                if let Some(body) = &error {
                    if !body.extra.is_empty() {
                        debug!(
                            event = "command_error_detail",
                            correlation_id = %id,
                            detail = ?body.extra
                        );
                    }
                }
                let message = error.map(|body| body.message_or_default().to_string());
                self.handle_reply(&id, ReplyOutcome::Error(message));
            }
        }
    }
}

/// Reply to a dispatched command. Resolves exactly once: with the response
/// data, or with a command failure, timeout, or disconnection error.
#[derive(Debug)]
pub struct PendingReply {
    correlation_id: String,
    receiver: oneshot::Receiver<Result<Value, BridgeError>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for PendingReply {
    type Output = Result<Value, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}
