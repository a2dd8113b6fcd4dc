//! The connection to the execution service.
//!
//! [`connect`] spawns one driver task per connection. The driver owns the
//! transport link, re-establishes it with backoff when it drops, and
//! dispatches incoming events to listeners one at a time, in arrival order.
//! The returned [`ConnectionHandle`] shares state with the driver and talks
//! to it through a command channel.

pub mod backoff;
mod listeners;
mod options;

use std::fmt;
use std::sync::{Arc, Weak};

use flowline_proto::{ClientEvent, ServerEvent};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Level;
use url::Url;
use uuid::Uuid;

use crate::config::{normalize_endpoint, ClientConfig};
use crate::error::{ConnectionError, ListenerError, TransportError, WorkflowError};
use crate::feedback::{FeedbackCallback, FeedbackFallback};
use crate::handlers::{invoke_guarded, EventHandler, HandlerKey, HandlerOverrides, ListenerHost};
use crate::session::{self, RunOptions, RunRequest};
use crate::telemetry::{logging, LogRecord, SharedSink};
use crate::transport::{
    DisconnectReason, LinkCommand, LinkSignal, OpenRequest, Transport, TransportLink,
    WebSocketTransport,
};

pub use backoff::Backoff;
use listeners::ListenerTable;
pub use options::{ConnectOptions, ConnectionCallbacks};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    /// No further events will arrive in this state.
    pub fn is_closed(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

enum Command {
    Emit { name: String, payload: Value },
    Close,
}

struct Status {
    state: ConnectionState,
    closing: bool,
    reconnect_attempts: u32,
}

pub(crate) struct Shared {
    id: Uuid,
    endpoint: Url,
    listeners: Mutex<ListenerTable>,
    status: Mutex<Status>,
    state_tx: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
    callbacks: ConnectionCallbacks,
    sink: SharedSink,
    overrides: HandlerOverrides,
    feedback: Option<FeedbackCallback>,
    feedback_fallback: FeedbackFallback,
}

impl Shared {
    fn log(&self, level: Level, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, "connection", message));
    }

    fn state(&self) -> ConnectionState {
        self.status.lock().state
    }

    fn is_closing(&self) -> bool {
        self.status.lock().closing
    }

    /// Move to `state` unless the connection is being torn down.
    fn advance(&self, state: ConnectionState) -> bool {
        let mut status = self.status.lock();
        if status.closing {
            return false;
        }
        status.state = state;
        self.state_tx.send_replace(state);
        true
    }

    fn add_listener(&self, key: HandlerKey, handler: EventHandler) -> Result<(), ListenerError> {
        // Held across the insert so a concurrent teardown cannot miss it.
        let status = self.status.lock();
        if status.closing {
            return Err(ListenerError::Closed(self.id));
        }
        self.listeners.lock().add(key, handler);
        Ok(())
    }

    fn remove_listeners(&self, key: &HandlerKey) -> Result<usize, ListenerError> {
        let status = self.status.lock();
        if status.closing {
            return Err(ListenerError::Closed(self.id));
        }
        Ok(self.listeners.lock().remove(key))
    }

    fn dispatch(&self, event: &ServerEvent) {
        let key = HandlerKey::from_name(event.name());
        let handlers = self.listeners.lock().handlers_for(&key);
        if handlers.is_empty() {
            self.sink.log(
                LogRecord::new(Level::DEBUG, "connection", "no listener for event")
                    .with_event(event.name()),
            );
            return;
        }
        for handler in handlers {
            if self.is_closing() {
                break;
            }
            invoke_guarded(&handler, event, self.sink.as_ref());
        }
    }

    fn emit(&self, name: &str, payload: Value) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.commands
            .send(Command::Emit {
                name: name.to_string(),
                payload,
            })
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Remove every listener, then close the transport. Safe to call any
    /// number of times; only the first call has an effect.
    fn teardown(&self, reason: DisconnectReason) {
        let previous = {
            let mut status = self.status.lock();
            if status.closing {
                return;
            }
            status.closing = true;
            status.state
        };

        let removed = self.listeners.lock().clear();
        let _ = self.commands.send(Command::Close);
        if previous != ConnectionState::Failed {
            self.status.lock().state = ConnectionState::Disconnected;
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }
        self.log(
            Level::INFO,
            format!("connection {} closed ({reason}); removed {removed} listeners", self.id),
        );
        if previous == ConnectionState::Connected {
            self.callbacks.disconnected(reason.as_str(), self.sink.as_ref());
        }
    }

    fn fail(&self, message: String) {
        self.status.lock().closing = true;
        let removed = self.listeners.lock().clear();
        self.status.lock().state = ConnectionState::Failed;
        self.state_tx.send_replace(ConnectionState::Failed);
        self.log(
            Level::ERROR,
            format!("connection {} failed: {message}; removed {removed} listeners", self.id),
        );
    }
}

/// Sends client events without keeping the connection alive.
#[derive(Clone)]
pub struct Emitter {
    shared: Weak<Shared>,
}

impl Emitter {
    pub fn emit(&self, event: &ClientEvent) -> Result<(), TransportError> {
        let shared = self.shared.upgrade().ok_or(TransportError::NotConnected)?;
        let payload = event
            .payload()
            .map_err(|err| TransportError::Encode(err.to_string()))?;
        shared.emit(event.name(), payload)
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

/// Removes all listeners, then closes the transport.
#[derive(Clone)]
pub struct Teardown {
    shared: Weak<Shared>,
}

impl Teardown {
    pub fn execute(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.teardown(DisconnectReason::ClientDisconnect);
        }
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Teardown(..)")
    }
}

/// Exclusive owner of one connection. Dropping it disconnects.
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn endpoint(&self) -> &Url {
        &self.shared.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Consecutive reconnection attempts since the last successful link.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.status.lock().reconnect_attempts
    }

    /// Attach a listener. Listeners for the same key accumulate.
    pub fn on(&self, key: impl Into<HandlerKey>, handler: EventHandler) -> Result<(), ListenerError> {
        self.shared.add_listener(key.into(), handler)
    }

    /// Detach every listener for `key`, returning how many were removed.
    pub fn off(&self, key: impl Into<HandlerKey>) -> Result<usize, ListenerError> {
        self.shared.remove_listeners(&key.into())
    }

    pub fn remove_all_listeners(&self) -> usize {
        self.shared.listeners.lock().clear()
    }

    pub fn listener_count(&self, key: impl Into<HandlerKey>) -> usize {
        self.shared.listeners.lock().count(&key.into())
    }

    pub fn listener_keys(&self) -> Vec<HandlerKey> {
        self.shared.listeners.lock().keys()
    }

    pub fn total_listeners(&self) -> usize {
        self.shared.listeners.lock().total()
    }

    pub fn emit(&self, event: &ClientEvent) -> Result<(), TransportError> {
        self.emitter().emit(event)
    }

    pub fn emit_raw(&self, name: &str, payload: Value) -> Result<(), TransportError> {
        self.shared.emit(name, payload)
    }

    /// Idempotent; never fails.
    pub fn disconnect(&self) {
        self.shared.teardown(DisconnectReason::ClientDisconnect);
    }

    /// Resolves once the connection is disconnected or has failed.
    pub async fn closed(&self) {
        let mut state = self.shared.state_tx.subscribe();
        let _ = state.wait_for(|state| state.is_closed()).await;
    }

    pub fn teardown(&self) -> Teardown {
        Teardown {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn emitter(&self) -> Emitter {
        Emitter {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn logger(&self) -> SharedSink {
        Arc::clone(&self.shared.sink)
    }

    /// Start a workflow run on this connection.
    pub fn run(&self, request: RunRequest, options: RunOptions) -> Result<(), WorkflowError> {
        session::run(Some(self), request, options)
    }

    pub(crate) fn default_overrides(&self) -> &HandlerOverrides {
        &self.shared.overrides
    }

    /// The connect-level feedback callback, else the configured fallback.
    pub(crate) fn default_feedback(&self) -> FeedbackCallback {
        self.shared
            .feedback
            .clone()
            .unwrap_or_else(|| self.shared.feedback_fallback.callback())
    }

    /// Deliver `event` to the local listeners as if it had arrived.
    pub(crate) fn dispatch_local(&self, event: &ServerEvent) {
        self.shared.dispatch(event);
    }
}

impl ListenerHost for ConnectionHandle {
    fn off(&self, key: &HandlerKey) -> Result<usize, ListenerError> {
        self.shared.remove_listeners(key)
    }

    fn on(&self, key: HandlerKey, handler: EventHandler) -> Result<(), ListenerError> {
        self.shared.add_listener(key, handler)
    }

    fn logger(&self) -> SharedSink {
        Arc::clone(&self.shared.sink)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("endpoint", &self.shared.endpoint.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.shared.teardown(DisconnectReason::ClientDisconnect);
    }
}

/// Connect to `endpoint` and wait for the first successful handshake.
pub async fn connect(
    endpoint: &str,
    options: ConnectOptions,
) -> Result<ConnectionHandle, ConnectionError> {
    let url = normalize_endpoint(endpoint)?;
    let ConnectOptions {
        config,
        credential,
        overrides,
        feedback,
        feedback_fallback,
        sink,
        callbacks,
        transport,
    } = options;

    if let Some(log) = &config.log {
        if let Err(err) = logging::init(log) {
            sink.log(LogRecord::new(
                Level::WARN,
                "connection",
                format!("logging not installed: {err}"),
            ));
        }
    }

    let credential = credential.or_else(|| config.credential.clone());
    if credential.is_none() {
        sink.log(LogRecord::new(
            Level::WARN,
            "connection",
            format!("no auth credential for {url}; the service may reject the handshake"),
        ));
    }
    let request = OpenRequest {
        endpoint: url.clone(),
        auth: credential.map(|token| json!({ "token": token })),
        connect_timeout: config.connect_timeout,
    };
    let transport = transport.unwrap_or_else(|| Arc::new(WebSocketTransport::default()));

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
    let shared = Arc::new(Shared {
        id: Uuid::new_v4(),
        endpoint: url,
        listeners: Mutex::new(ListenerTable::default()),
        status: Mutex::new(Status {
            state: ConnectionState::Disconnected,
            closing: false,
            reconnect_attempts: 0,
        }),
        state_tx,
        commands: command_tx,
        callbacks,
        sink,
        overrides,
        feedback,
        feedback_fallback,
    });
    let handle = ConnectionHandle {
        shared: Arc::clone(&shared),
    };

    let (ready_tx, ready_rx) = oneshot::channel();
    let driver = Driver {
        shared,
        transport,
        request,
        backoff: Backoff::from_config(&config),
        config,
        commands: command_rx,
        ready: Some(ready_tx),
    };
    tokio::spawn(driver.run());

    // The driver bounds every attempt by the connect timeout and always
    // answers before it exits.
    match ready_rx.await {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(ConnectionError::HandshakeFailed(TransportError::ChannelClosed)),
    }
}

enum LinkEnd {
    Closed,
    Lost(DisconnectReason),
}

struct Driver {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    request: OpenRequest,
    config: ClientConfig,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<Command>,
    ready: Option<oneshot::Sender<Result<(), ConnectionError>>>,
}

impl Driver {
    async fn run(mut self) {
        let mut retries: u32 = 0;
        loop {
            if !self.shared.advance(ConnectionState::Connecting) {
                break;
            }
            let Some(outcome) = self.open().await else {
                break;
            };

            match outcome {
                Ok(link) => {
                    if !self.shared.advance(ConnectionState::Connected) {
                        let _ = link.send(LinkCommand::Close);
                        break;
                    }
                    self.shared.status.lock().reconnect_attempts = 0;
                    self.shared.log(
                        Level::INFO,
                        format!(
                            "connected to {} (sid {})",
                            self.shared.endpoint,
                            link.sid.as_deref().unwrap_or("-")
                        ),
                    );
                    let sink = self.shared.sink.as_ref();
                    self.shared.callbacks.connected(sink);
                    if retries > 0 {
                        self.shared.callbacks.reconnected(retries, sink);
                    }
                    retries = 0;
                    self.resolve_ready(Ok(()));

                    match self.pump(link).await {
                        LinkEnd::Closed => break,
                        LinkEnd::Lost(reason) => {
                            if reason.is_final() || !self.config.reconnection {
                                self.shared.teardown(reason);
                                break;
                            }
                            if !self.shared.advance(ConnectionState::Connecting) {
                                break;
                            }
                            self.shared
                                .log(Level::WARN, format!("link lost ({reason}); reconnecting"));
                            self.shared
                                .callbacks
                                .disconnected(reason.as_str(), self.shared.sink.as_ref());
                            let cause = TransportError::Io(format!("link lost: {reason}"));
                            if !self.retry(&mut retries, cause).await {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    self.shared
                        .callbacks
                        .connect_error(&err, self.shared.sink.as_ref());
                    self.shared
                        .log(Level::WARN, format!("connection attempt failed: {err}"));
                    if matches!(err, TransportError::Rejected(_)) || !self.config.reconnection {
                        self.shared.fail(err.to_string());
                        self.resolve_ready(Err(ConnectionError::HandshakeFailed(err)));
                        break;
                    }
                    if err == TransportError::Timeout && self.ready.is_some() {
                        let timeout = self.config.connect_timeout;
                        self.shared.fail(format!(
                            "no connection to {} within {timeout:?}",
                            self.shared.endpoint
                        ));
                        self.resolve_ready(Err(ConnectionError::Timeout(timeout)));
                        break;
                    }
                    if !self.retry(&mut retries, err).await {
                        break;
                    }
                }
            }
        }
        // Nobody is left to report to; unblock `connect` if it is still waiting.
        self.resolve_ready(Err(ConnectionError::HandshakeFailed(
            TransportError::ChannelClosed,
        )));
    }

    /// One connection attempt, abandoned early if the handle closes.
    async fn open(&mut self) -> Option<Result<TransportLink, TransportError>> {
        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            self.transport.open(&self.request),
        );
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Emit { name, .. }) => drop_emit(&self.shared, &name),
                    Some(Command::Close) | None => return None,
                },
                result = &mut attempt => {
                    return Some(result.unwrap_or(Err(TransportError::Timeout)));
                }
            }
        }
    }

    /// Relay commands and signals until the link ends.
    async fn pump(&mut self, mut link: TransportLink) -> LinkEnd {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Emit { name, payload }) => {
                        if link.outbound.send(LinkCommand::Emit { name, payload }).is_err() {
                            self.shared.log(Level::WARN, "link closed while emitting");
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = link.outbound.send(LinkCommand::Close);
                        return LinkEnd::Closed;
                    }
                },
                signal = link.inbound.recv() => match signal {
                    Some(LinkSignal::Event { name, payload }) => {
                        let event = ServerEvent::decode(&name, payload);
                        self.shared.dispatch(&event);
                    }
                    Some(LinkSignal::Closed(reason)) => return LinkEnd::Lost(reason),
                    None => return LinkEnd::Lost(DisconnectReason::TransportClose),
                },
            }
        }
    }

    /// Wait out the next backoff delay. Returns false when retrying should stop.
    async fn retry(&mut self, retries: &mut u32, cause: TransportError) -> bool {
        if *retries >= self.config.reconnection_attempts {
            let attempts = *retries;
            self.shared
                .callbacks
                .reconnect_failed(self.shared.sink.as_ref());
            self.shared.fail(format!(
                "gave up after {attempts} reconnection attempts: {cause}"
            ));
            self.resolve_ready(Err(ConnectionError::ReconnectExhausted {
                attempts,
                last_error: cause.to_string(),
            }));
            return false;
        }

        *retries += 1;
        self.shared.status.lock().reconnect_attempts = *retries;
        let delay = self.backoff.delay(*retries);
        self.shared.log(
            Level::DEBUG,
            format!("reconnection attempt {} in {delay:?}", *retries),
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Emit { name, .. }) => drop_emit(&self.shared, &name),
                    Some(Command::Close) | None => return false,
                },
                _ = &mut sleep => break,
            }
        }
        self.shared
            .callbacks
            .reconnect_attempt(*retries, self.shared.sink.as_ref());
        true
    }

    fn resolve_ready(&mut self, result: Result<(), ConnectionError>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
    }
}

fn drop_emit(shared: &Shared, name: &str) {
    shared.sink.log(
        LogRecord::new(Level::WARN, "connection", "dropping emit while not connected")
            .with_event(name),
    );
}
