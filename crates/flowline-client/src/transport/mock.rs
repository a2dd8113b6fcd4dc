//! In-memory transport with a scripted server side, for tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    DisconnectReason, LinkCommand, LinkSignal, OpenRequest, Transport, TransportError,
    TransportLink,
};

/// How the scripted server answers one `open` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOpen {
    Accept,
    /// Refuse the handshake (Socket.IO `CONNECT_ERROR`).
    Reject(String),
    /// Fail the attempt as an I/O error.
    Fail(String),
    /// Never answer.
    Silent,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<MockOpen>,
    opens: u32,
    closes: u32,
    requests: Vec<OpenRequest>,
    live: Option<mpsc::UnboundedSender<LinkSignal>>,
    sent: Option<mpsc::UnboundedSender<(String, Value)>>,
}

#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

pub struct MockServer {
    state: Arc<Mutex<MockState>>,
    sent: mpsc::UnboundedReceiver<(String, Value)>,
}

impl MockTransport {
    pub fn pair() -> (Arc<Self>, MockServer) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MockState {
            sent: Some(sent_tx),
            ..MockState::default()
        }));
        (
            Arc::new(Self {
                state: state.clone(),
            }),
            MockServer {
                state,
                sent: sent_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, request: &OpenRequest) -> Result<TransportLink, TransportError> {
        let (step, attempt) = {
            let mut state = self.state.lock();
            state.opens += 1;
            state.requests.push(request.clone());
            (state.script.pop_front().unwrap_or(MockOpen::Accept), state.opens)
        };

        match step {
            MockOpen::Accept => {}
            MockOpen::Reject(message) => return Err(TransportError::Rejected(message)),
            MockOpen::Fail(message) => return Err(TransportError::Io(message)),
            MockOpen::Silent => std::future::pending::<()>().await,
        }

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<LinkCommand>();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let sent = {
            let mut state = self.state.lock();
            state.live = Some(signal_tx);
            state.sent.clone()
        };

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    LinkCommand::Emit { name, payload } => {
                        if let Some(sent) = &sent {
                            let _ = sent.send((name, payload));
                        }
                    }
                    LinkCommand::Close => {
                        let mut state = state.lock();
                        state.closes += 1;
                        state.live = None;
                        break;
                    }
                }
            }
        });

        Ok(TransportLink::new(
            Some(format!("mock-{attempt}")),
            command_tx,
            signal_rx,
        ))
    }
}

impl MockServer {
    /// Queue the answers for the next `open` calls; unscripted calls accept.
    pub fn script(&self, steps: impl IntoIterator<Item = MockOpen>) {
        self.state.lock().script.extend(steps);
    }

    /// Deliver an event on the live link. Returns false when no link is up.
    pub fn push(&self, name: &str, payload: Value) -> bool {
        let state = self.state.lock();
        match &state.live {
            Some(live) => live
                .send(LinkSignal::Event {
                    name: name.to_string(),
                    payload,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Close the live link from the server side.
    pub fn drop_link(&self, reason: DisconnectReason) -> bool {
        let live = self.state.lock().live.take();
        match live {
            Some(live) => live.send(LinkSignal::Closed(reason)).is_ok(),
            None => false,
        }
    }

    /// Next event the client emitted.
    pub async fn recv(&mut self) -> Option<(String, Value)> {
        self.sent.recv().await
    }

    /// Events emitted so far that have not been received yet.
    pub fn drain(&mut self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        while let Ok(item) = self.sent.try_recv() {
            out.push(item);
        }
        out
    }

    pub fn open_count(&self) -> u32 {
        self.state.lock().opens
    }

    pub fn close_count(&self) -> u32 {
        self.state.lock().closes
    }

    pub fn is_linked(&self) -> bool {
        self.state.lock().live.is_some()
    }

    pub fn last_request(&self) -> Option<OpenRequest> {
        self.state.lock().requests.last().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn request() -> OpenRequest {
        OpenRequest {
            endpoint: url::Url::parse("https://example.com").unwrap(),
            auth: Some(json!({"token": "t"})),
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn scripted_steps_run_in_order() {
        let (transport, server) = MockTransport::pair();
        server.script([MockOpen::Fail("refused".into()), MockOpen::Reject("bad token".into())]);

        assert_eq!(
            transport.open(&request()).await.unwrap_err(),
            TransportError::Io("refused".into())
        );
        assert_eq!(
            transport.open(&request()).await.unwrap_err(),
            TransportError::Rejected("bad token".into())
        );
        let link = transport.open(&request()).await.unwrap();
        assert_eq!(link.sid.as_deref(), Some("mock-3"));
        assert_eq!(server.open_count(), 3);
        assert_eq!(server.last_request().unwrap().auth, Some(json!({"token": "t"})));
    }

    #[tokio::test]
    async fn link_carries_events_both_ways() {
        let (transport, mut server) = MockTransport::pair();
        let mut link = transport.open(&request()).await.unwrap();

        link.send(LinkCommand::Emit {
            name: "run_workflow".into(),
            payload: json!({"flowId": "wf1"}),
        })
        .unwrap();
        let (name, payload) = server.recv().await.unwrap();
        assert_eq!(name, "run_workflow");
        assert_eq!(payload["flowId"], "wf1");

        assert!(server.push("run_start", json!({"message": "go"})));
        assert_eq!(
            link.inbound.recv().await,
            Some(LinkSignal::Event {
                name: "run_start".into(),
                payload: json!({"message": "go"}),
            })
        );

        assert!(server.drop_link(DisconnectReason::TransportClose));
        assert_eq!(
            link.inbound.recv().await,
            Some(LinkSignal::Closed(DisconnectReason::TransportClose))
        );
        assert!(!server.push("run_start", json!({})));
    }

    #[tokio::test]
    async fn close_command_is_counted() {
        let (transport, server) = MockTransport::pair();
        let link = transport.open(&request()).await.unwrap();
        link.send(LinkCommand::Close).unwrap();
        drop(link);

        tokio::time::timeout(Duration::from_secs(1), async {
            while server.close_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!server.is_linked());
    }
}
