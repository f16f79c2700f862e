//! EndpointClient: one WebSocket connection to one application instance.
//!
//! Requests are correlated by a per-connection monotonic id. A single I/O
//! task owns the socket: it writes queued request frames and routes inbound
//! frames, resolving pending requests by id and forwarding events to a
//! dispatcher task over a channel. Handlers run on the dispatcher, so a slow
//! handler never delays response correlation.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::message::*;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Pending request waiting for its correlated reply.
type PendingTx = oneshot::Sender<BridgeResult<WireReply>>;

/// Event handler registered with [`EndpointClient::on`].
pub type EventHandler = Arc<dyn Fn(&WireEvent) + Send + Sync>;

/// Handle returned by [`EndpointClient::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Anything that can run a command and return its result payload.
///
/// Implemented by [`EndpointClient`]; the retry policy is written against this
/// trait so it can be exercised without a socket.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        command: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> BridgeResult<Value>;
}

struct Subscription {
    id: u64,
    event_type: String,
    handler: EventHandler,
}

/// State shared between the client handle and its background tasks.
struct Shared {
    endpoint: Endpoint,
    pending: Mutex<HashMap<String, PendingTx>>,
    subscriptions: RwLock<Vec<Subscription>>,
    events: broadcast::Sender<WireEvent>,
    connected: watch::Sender<bool>,
}

impl Shared {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Mark the transport gone and reject every outstanding request.
    fn close(&self, reason: &str) {
        self.connected.send_replace(false);
        let drained: Vec<(String, PendingTx)> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(
                endpoint = %self.endpoint,
                count = drained.len(),
                "Rejecting pending requests: {reason}"
            );
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(BridgeError::Connection(format!(
                "{}: {reason}",
                self.endpoint
            ))));
        }
    }

    fn take_pending(&self, id: &str) -> Option<PendingTx> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(id)
    }

    fn route(&self, text: &str, events_tx: &mpsc::UnboundedSender<WireEvent>) {
        match decode_frame(text) {
            Ok(InboundFrame::Reply(reply)) => match self.take_pending(&reply.id) {
                Some(tx) => {
                    let _ = tx.send(Ok(reply));
                }
                None => {
                    debug!(endpoint = %self.endpoint, id = %reply.id, "Dropping unmatched reply");
                }
            },
            Ok(InboundFrame::Event(event)) => {
                let _ = events_tx.send(event);
            }
            Ok(InboundFrame::Unrecognized(value)) => {
                warn!(endpoint = %self.endpoint, frame = %value, "Dropping unrecognized frame");
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Dropping malformed frame");
            }
        }
    }

    fn dispatch(&self, event: &WireEvent) {
        let _ = self.events.send(event.clone());
        let handlers: Vec<EventHandler> = {
            let subs = self
                .subscriptions
                .read()
                .unwrap_or_else(|e| e.into_inner());
            subs.iter()
                .filter(|s| s.event_type == event.event_type || s.event_type == "*")
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        for handler in handlers {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
            if outcome.is_err() {
                warn!(
                    endpoint = %self.endpoint,
                    event_type = %event.event_type,
                    "Event handler panicked; skipping it for this event"
                );
            }
        }
    }
}

/// A live transport and the tasks serving it.
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: Option<oneshot::Sender<()>>,
    io_task: Option<JoinHandle<()>>,
    dispatch_task: Option<JoinHandle<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
        if let Some(task) = self.dispatch_task.take() {
            task.abort();
        }
    }
}

/// Client for a single application endpoint.
pub struct EndpointClient {
    endpoint: Endpoint,
    connect_timeout: Duration,
    query_timeout: Duration,
    interactive_timeout: Duration,
    next_id: AtomicU64,
    conn: tokio::sync::Mutex<Option<Connection>>,
    shared: Arc<Shared>,
}

impl EndpointClient {
    /// Create an unconnected client with timeouts taken from `config`.
    pub fn new(endpoint: Endpoint, config: &BridgeConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let (connected, _) = watch::channel(false);
        Self {
            endpoint: endpoint.clone(),
            connect_timeout: config.connect_timeout(),
            query_timeout: config.query_timeout(),
            interactive_timeout: config.interactive_timeout(),
            next_id: AtomicU64::new(1),
            conn: tokio::sync::Mutex::new(None),
            shared: Arc::new(Shared {
                endpoint,
                pending: Mutex::new(HashMap::new()),
                subscriptions: RwLock::new(Vec::new()),
                events,
                connected,
            }),
        }
    }

    /// Override the connect timeout (discovery probes use a short one).
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Open the transport. A no-op when already connected.
    pub async fn connect(&self) -> BridgeResult<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() && self.shared.is_connected() {
            return Ok(());
        }
        // Drop any dead connection before replacing it.
        *conn = None;

        let url = self.endpoint.ws_url();
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_FRAME_SIZE);
        ws_config.max_frame_size = Some(MAX_FRAME_SIZE);

        let attempt = tokio::time::timeout(
            self.connect_timeout,
            connect_async_with_config(url.as_str(), Some(ws_config), true),
        )
        .await;

        let ws = match attempt {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return Err(self.classify_connect_error(e)),
            Err(_) => {
                return Err(BridgeError::Connection(format!(
                    "{}: connect timed out after {}ms",
                    self.endpoint,
                    self.connect_timeout.as_millis()
                )))
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<WireEvent>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        self.shared.connected.send_replace(true);
        let io_task = tokio::spawn(io_loop(
            ws,
            Arc::clone(&self.shared),
            outbound_rx,
            events_tx,
            shutdown_rx,
        ));
        let dispatch_task = tokio::spawn(dispatch_loop(Arc::clone(&self.shared), events_rx));

        *conn = Some(Connection {
            outbound: outbound_tx,
            shutdown: Some(shutdown_tx),
            io_task: Some(io_task),
            dispatch_task: Some(dispatch_task),
        });

        info!(endpoint = %self.endpoint, "Connected");
        Ok(())
    }

    fn classify_connect_error(&self, e: tungstenite::Error) -> BridgeError {
        match e {
            tungstenite::Error::Io(io) => {
                BridgeError::Connection(format!("{}: {io}", self.endpoint))
            }
            other => BridgeError::HandshakeFailed {
                endpoint: self.endpoint.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Send a command and wait for its correlated reply, including any
    /// window context the application attached.
    pub async fn execute_reply(
        &self,
        command: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> BridgeResult<WireReply> {
        let outbound = {
            let conn = self.conn.lock().await;
            match conn.as_ref() {
                Some(c) if self.shared.is_connected() => c.outbound.clone(),
                _ => {
                    return Err(BridgeError::Connection(format!(
                        "{}: not connected",
                        self.endpoint
                    )))
                }
            }
        };

        let timeout = timeout.unwrap_or_else(|| {
            CommandClass::of(command).timeout(self.query_timeout, self.interactive_timeout)
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let request = WireRequest::new(id.clone(), command, args);
        let frame = encode_request(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
            let previous = pending.insert(id.clone(), tx);
            debug_assert!(previous.is_none(), "correlation id reused: {id}");
        }
        // The I/O task flips `connected` before draining the table, so a
        // request registered after the drain is caught here.
        if !self.shared.is_connected() {
            self.shared.take_pending(&id);
            return Err(BridgeError::Connection(format!(
                "{}: connection closed",
                self.endpoint
            )));
        }

        debug!(endpoint = %self.endpoint, id = %id, command, "Sending request");
        if outbound.send(Message::Text(frame)).is_err() {
            self.shared.take_pending(&id);
            return Err(BridgeError::Connection(format!(
                "{}: connection closed",
                self.endpoint
            )));
        }

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(BridgeError::Connection(format!(
                    "{}: response channel dropped",
                    self.endpoint
                )))
            }
            Err(_) => {
                // The frame is already on the wire; a late reply is dropped as unmatched.
                self.shared.take_pending(&id);
                return Err(BridgeError::Timeout {
                    command: command.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        if let Some(warning) = reply
            .window_context
            .as_ref()
            .and_then(|ctx| ctx.warning.as_deref())
            .filter(|w| !w.is_empty())
        {
            warn!(endpoint = %self.endpoint, command, "{warning}");
        }

        match &reply.outcome {
            Ok(_) => Ok(reply),
            Err(message) => Err(BridgeError::RemoteCommand {
                command: command.to_string(),
                message: message.clone(),
            }),
        }
    }

    /// Send a command and return its result payload.
    pub async fn execute(
        &self,
        command: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> BridgeResult<Value> {
        let reply = self.execute_reply(command, args, timeout).await?;
        Ok(reply.outcome.unwrap_or(Value::Null))
    }

    /// Ask the application for its identifier.
    ///
    /// Older counterparts that cannot answer yield `Ok(None)`; a transport
    /// failure or timeout is a handshake failure.
    pub async fn identify(&self) -> BridgeResult<Option<String>> {
        let args = json!({ "command": HANDSHAKE_PLUGIN_COMMAND });
        match self
            .execute(HANDSHAKE_COMMAND, args, Some(self.query_timeout))
            .await
        {
            Ok(state) => Ok(extract_identifier(&state)),
            Err(BridgeError::RemoteCommand { message, .. }) => {
                debug!(endpoint = %self.endpoint, "Application did not report an identifier: {message}");
                Ok(None)
            }
            Err(e) => Err(BridgeError::HandshakeFailed {
                endpoint: self.endpoint.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Register a handler for events of `event_type` (`"*"` matches all).
    pub fn on(
        &self,
        event_type: impl Into<String>,
        handler: impl Fn(&WireEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
        let mut subs = self
            .shared
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        subs.push(Subscription {
            id,
            event_type: event_type.into(),
            handler: Arc::new(handler),
        });
        SubscriptionId(id)
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn off(&self, subscription: SubscriptionId) -> bool {
        let mut subs = self
            .shared
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != subscription.0);
        subs.len() != before
    }

    /// Stream of every inbound event.
    pub fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.shared.events.subscribe()
    }

    /// Resolves once the transport is gone (immediately if never connected).
    pub async fn closed(&self) {
        let mut rx = self.shared.connected.subscribe();
        let _ = rx.wait_for(|connected| !*connected).await;
    }

    /// Close the transport and reject outstanding requests. Safe to repeat.
    pub async fn disconnect(&self) {
        let Some(mut conn) = self.conn.lock().await.take() else {
            return;
        };
        self.shared.close("disconnected");
        if let Some(shutdown) = conn.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = conn.io_task.take() {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                debug!(endpoint = %self.endpoint, "I/O task did not stop in time");
            }
        }
        info!(endpoint = %self.endpoint, "Disconnected");
    }
}

#[async_trait]
impl CommandExecutor for EndpointClient {
    async fn execute(
        &self,
        command: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> BridgeResult<Value> {
        EndpointClient::execute(self, command, args, timeout).await
    }
}

impl std::fmt::Debug for EndpointClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointClient")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Pull the application identifier out of a backend-state payload.
fn extract_identifier(state: &Value) -> Option<String> {
    state
        .pointer("/app/identifier")
        .or_else(|| state.get("identifier"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Owns the socket: writes queued frames, routes inbound ones.
async fn io_loop(
    ws: WsStream,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events_tx: mpsc::UnboundedSender<WireEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break "disconnected";
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else { break "client dropped" };
                if let Err(e) = ws_tx.send(msg).await {
                    debug!(endpoint = %shared.endpoint, error = %e, "Write failed");
                    break "write failed";
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => shared.route(&text, &events_tx),
                    Some(Ok(Message::Close(_))) => break "closed by remote",
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(endpoint = %shared.endpoint, error = %e, "Read failed");
                        break "read failed";
                    }
                    None => break "stream ended",
                }
            }
        }
    };

    shared.close(reason);
    info!(endpoint = %shared.endpoint, "Connection ended: {reason}");
}

/// Delivers events in arrival order, one handler call per frame.
async fn dispatch_loop(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<WireEvent>) {
    while let Some(event) = events.recv().await {
        shared.dispatch(&event);
    }
}
