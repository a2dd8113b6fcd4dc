pub mod mock;
pub mod websocket;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

pub use crate::error::TransportError;
pub use mock::{MockOpen, MockServer, MockTransport};
pub use websocket::WebSocketTransport;

/// Everything a transport needs to open one link.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub endpoint: Url,
    /// Handshake auth payload, e.g. `{"token": "..."}`.
    pub auth: Option<Value>,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    Emit { name: String, payload: Value },
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkSignal {
    Event { name: String, payload: Value },
    Closed(DisconnectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    ClientDisconnect,
    ServerDisconnect,
    TransportClose,
    TransportError,
    PingTimeout,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::ClientDisconnect => "io client disconnect",
            DisconnectReason::ServerDisconnect => "io server disconnect",
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::PingTimeout => "ping timeout",
        }
    }

    /// Whether the link should stay down instead of being re-established.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            DisconnectReason::ClientDisconnect | DisconnectReason::ServerDisconnect
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One established session with the service.
///
/// The link is only handed out after the handshake completed. Dropping it
/// aborts the background reader; pending outbound commands are still flushed
/// by whoever owns the receiving end of `outbound`.
pub struct TransportLink {
    pub sid: Option<String>,
    pub outbound: mpsc::UnboundedSender<LinkCommand>,
    pub inbound: mpsc::UnboundedReceiver<LinkSignal>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportLink {
    pub fn new(
        sid: Option<String>,
        outbound: mpsc::UnboundedSender<LinkCommand>,
        inbound: mpsc::UnboundedReceiver<LinkSignal>,
    ) -> Self {
        Self {
            sid,
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn send(&self, command: LinkCommand) -> Result<(), TransportError> {
        self.outbound
            .send(command)
            .map_err(|_| TransportError::ChannelClosed)
    }
}

impl fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLink")
            .field("sid", &self.sid)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link and complete the namespace handshake.
    ///
    /// Returns [`TransportError::Rejected`] when the server refuses the
    /// handshake; every other error is considered retryable.
    async fn open(&self, request: &OpenRequest) -> Result<TransportLink, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_strings_match_the_wire_vocabulary() {
        assert_eq!(DisconnectReason::ClientDisconnect.as_str(), "io client disconnect");
        assert_eq!(DisconnectReason::ServerDisconnect.to_string(), "io server disconnect");
        assert_eq!(DisconnectReason::PingTimeout.as_str(), "ping timeout");
        assert!(DisconnectReason::ServerDisconnect.is_final());
        assert!(!DisconnectReason::TransportError.is_final());
    }

    #[tokio::test]
    async fn dropping_a_link_aborts_its_tasks() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        });

        let link = TransportLink::new(None, out_tx, in_rx).with_task(task);
        drop(link);

        let released = tokio::time::timeout(Duration::from_secs(1), alive_rx)
            .await
            .expect("task not aborted");
        assert!(released.is_err());
    }
}
