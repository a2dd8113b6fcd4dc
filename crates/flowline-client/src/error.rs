use std::time::Duration;

use uuid::Uuid;

/// Failures of the underlying event transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid transport url: {0}")]
    InvalidUrl(String),
    #[error("transport i/o failed: {0}")]
    Io(String),
    #[error("transport timed out")]
    Timeout,
    #[error("server rejected the connection handshake ({0}); check the auth credential")]
    Rejected(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("not connected")]
    NotConnected,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("failed to encode event: {0}")]
    Encode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("connection handshake failed: {0}")]
    HandshakeFailed(#[source] TransportError),
    #[error("no connection within {0:?}")]
    Timeout(Duration),
    #[error("gave up after {attempts} connection attempts; last error: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("no connection: call connect() before run()")]
    MissingConnection,
    #[error("workflow id is required")]
    MissingWorkflowId,
    #[error("workflow token is required")]
    MissingToken,
    #[error("failed to emit the run command: {0}")]
    EmitFailed(#[source] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenerError {
    #[error("connection {0} is closed; listeners can no longer change")]
    Closed(Uuid),
}
