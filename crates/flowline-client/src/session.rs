//! A single workflow run over an established connection.

use std::sync::Arc;

use flowline_proto::{ClientEvent, EventKind, RunErrorPayload, RunWorkflowPayload, ServerEvent};
use serde_json::Value;
use tracing::Level;

use crate::connection::{ConnectionHandle, Teardown};
use crate::error::WorkflowError;
use crate::feedback::{self, FeedbackCallback};
use crate::handlers::{
    invoke_guarded, register, resolve, EventHandler, HandlerKey, HandlerOverrides, HandlerProfile,
    ProfileKind,
};
use crate::telemetry::{LogRecord, SharedSink};

#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub workflow_id: String,
    pub token: String,
    pub input: Value,
}

impl RunRequest {
    pub fn new(workflow_id: impl Into<String>, token: impl Into<String>, input: Value) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            token: token.into(),
            input,
        }
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        if self.workflow_id.trim().is_empty() {
            return Err(WorkflowError::MissingWorkflowId);
        }
        if self.token.trim().is_empty() {
            return Err(WorkflowError::MissingToken);
        }
        Ok(())
    }
}

/// Per-run presentation and handler choices.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub pretty: bool,
    pub verbose: bool,
    pub overrides: HandlerOverrides,
    pub feedback: Option<FeedbackCallback>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }

    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    pub fn with_override(mut self, key: impl Into<HandlerKey>, handler: EventHandler) -> Self {
        self.overrides.set(key, handler);
        self
    }

    pub fn with_overrides(mut self, overrides: HandlerOverrides) -> Self {
        self.overrides = self.overrides.merge(&overrides);
        self
    }

    pub fn with_feedback(mut self, callback: FeedbackCallback) -> Self {
        self.feedback = Some(callback);
        self
    }
}

/// Install handlers for a run and send the run command.
///
/// Returns as soon as the command is queued. The run ends when one of the
/// terminal events arrives, at which point the connection is torn down.
pub fn run(
    handle: Option<&ConnectionHandle>,
    request: RunRequest,
    options: RunOptions,
) -> Result<(), WorkflowError> {
    let handle = handle.ok_or(WorkflowError::MissingConnection)?;
    request.validate()?;

    let sink = handle.logger();
    let RunOptions {
        pretty,
        verbose,
        overrides,
        feedback: run_feedback,
    } = options;

    let overrides = handle.default_overrides().merge(&overrides);
    let profile = HandlerProfile::new(ProfileKind::select(pretty, verbose), Arc::clone(&sink));
    let mut table = resolve(&profile, &overrides);

    // Unless the caller took over feedback_request, every request is answered:
    // the profile renders it, then the bridge replies.
    let feedback_key = HandlerKey::Known(EventKind::FeedbackRequest);
    if !overrides.contains(&feedback_key) {
        let callback = run_feedback.unwrap_or_else(|| handle.default_feedback());
        let bridge = feedback::bridge_handler(handle.emitter(), callback, Arc::clone(&sink));
        let render = profile.handler(EventKind::FeedbackRequest);
        table.insert(feedback_key, then(render, bridge, Arc::clone(&sink)));
    }
    for kind in EventKind::TERMINAL {
        let key = HandlerKey::Known(kind);
        if let Some(inner) = table.get(&key).cloned() {
            table.insert(key, closing(inner, handle.teardown(), Arc::clone(&sink)));
        }
    }

    let registration = register(handle, table);
    if !registration.is_complete() {
        sink.log(LogRecord::new(
            Level::WARN,
            "session",
            format!(
                "{} of {} handlers could not be registered",
                registration.failed.len(),
                registration.failed.len() + registration.registered.len()
            ),
        ));
    }

    let workflow_id = request.workflow_id;
    sink.log(LogRecord::new(
        Level::DEBUG,
        "session",
        format!("starting workflow {workflow_id} on connection {}", handle.id()),
    ));
    let command = ClientEvent::RunWorkflow(RunWorkflowPayload {
        flow_id: workflow_id.clone(),
        token: request.token,
        input: request.input,
    });

    match handle.emit(&command) {
        Ok(()) => Ok(()),
        Err(err) if handle.listener_count(EventKind::RunError) > 0 => {
            sink.log(
                LogRecord::new(
                    Level::ERROR,
                    "session",
                    format!("could not start workflow {workflow_id}: {err}"),
                )
                .with_event(ClientEvent::RUN_WORKFLOW),
            );
            handle.dispatch_local(&ServerEvent::RunError(RunErrorPayload {
                message: format!("failed to start workflow {workflow_id}: {err}"),
                stack: None,
            }));
            Ok(())
        }
        Err(err) => Err(WorkflowError::EmitFailed(err)),
    }
}

/// Runs `first` guarded, then `second`.
fn then(first: EventHandler, second: EventHandler, sink: SharedSink) -> EventHandler {
    Arc::new(move |event: &ServerEvent| {
        invoke_guarded(&first, event, sink.as_ref());
        second(event)
    })
}

/// Runs `inner`, then tears the connection down whatever the outcome.
fn closing(inner: EventHandler, teardown: Teardown, sink: SharedSink) -> EventHandler {
    Arc::new(move |event: &ServerEvent| {
        invoke_guarded(&inner, event, sink.as_ref());
        teardown.execute();
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{connect, ConnectOptions, ConnectionState};
    use crate::error::TransportError;
    use crate::handlers::handler;
    use crate::telemetry::MemorySink;
    use crate::transport::{DisconnectReason, MockOpen, MockServer, MockTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn connected(sink: Arc<MemorySink>) -> (ConnectionHandle, MockServer) {
        let (transport, server) = MockTransport::pair();
        let handle = connect(
            "example.com",
            ConnectOptions::new()
                .with_credential("secret")
                .with_transport(transport)
                .with_logger(sink),
        )
        .await
        .unwrap();
        (handle, server)
    }

    #[test]
    fn missing_connection_is_reported_first() {
        let err = run(None, RunRequest::new("", "", Value::Null), RunOptions::new()).unwrap_err();
        assert!(matches!(err, WorkflowError::MissingConnection));
    }

    #[tokio::test]
    async fn blank_ids_are_rejected_before_anything_is_sent() {
        let (handle, mut server) = connected(MemorySink::new()).await;

        let err = handle
            .run(RunRequest::new("  ", "t", json!({})), RunOptions::new())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::MissingWorkflowId));

        let err = handle
            .run(RunRequest::new("wf1", "", json!({})), RunOptions::new())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::MissingToken));

        assert_eq!(handle.total_listeners(), 0);
        tokio::task::yield_now().await;
        assert!(server.drain().is_empty());
    }

    #[tokio::test]
    async fn run_registers_one_handler_per_kind_and_emits() {
        let (handle, mut server) = connected(MemorySink::new()).await;
        handle
            .run(RunRequest::new("wf1", "t", json!({"q": 1})), RunOptions::new())
            .unwrap();

        for kind in EventKind::ALL {
            assert_eq!(handle.listener_count(kind), 1, "{kind}");
        }
        let (name, payload) = server.recv().await.unwrap();
        assert_eq!(name, "run_workflow");
        assert_eq!(payload, json!({"flowId": "wf1", "token": "t", "input": {"q": 1}}));
    }

    #[tokio::test]
    async fn emit_failure_is_routed_to_run_error() {
        let sink = MemorySink::new();
        let (handle, server) = connected(sink.clone()).await;
        server.script([MockOpen::Silent]);
        server.drop_link(DisconnectReason::TransportClose);
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while handle.state() != ConnectionState::Connecting {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let options = RunOptions::new().with_override(
            EventKind::RunError,
            handler(move |event| {
                if let ServerEvent::RunError(payload) = event {
                    assert!(payload.message.contains("not connected"));
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        handle
            .run(RunRequest::new("wf1", "t", json!({})), options)
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(handle.total_listeners(), 0);
    }

    #[tokio::test]
    async fn emit_failure_without_listeners_is_returned() {
        let sink = MemorySink::new();
        let (handle, _server) = connected(sink.clone()).await;
        handle.disconnect();

        let err = handle
            .run(RunRequest::new("wf1", "t", json!({})), RunOptions::new())
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::EmitFailed(TransportError::NotConnected)
        ));
        assert!(sink.contains(Level::WARN, "could not be registered"));
    }
}
