//! Answering `feedback_request` events.
//!
//! The service may pause a run to ask for input. The caller's callback is
//! run on its own task so other events keep flowing while it waits, and its
//! answer (or failure) is sent back as `feedback_response`.

use std::fmt;
use std::future::Future;
use std::io::{self, BufRead, IsTerminal, Write};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use flowline_proto::{ClientEvent, EventKind, FeedbackRequestPayload, FeedbackResponsePayload, ServerEvent};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::Level;

use crate::connection::{ConnectionHandle, Emitter};
use crate::error::ListenerError;
use crate::handlers::{panic_message, EventHandler};
use crate::telemetry::{LogRecord, SharedSink};

pub type FeedbackFuture = BoxFuture<'static, anyhow::Result<Option<Value>>>;

/// Produces the answer to a feedback request. `Ok(None)` means "use the
/// default value".
#[derive(Clone)]
pub struct FeedbackCallback(Arc<dyn Fn(FeedbackRequestPayload) -> FeedbackFuture + Send + Sync>);

impl FeedbackCallback {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&FeedbackRequestPayload) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self(Arc::new(move |request| {
            let f = Arc::clone(&f);
            async move { f(&request) }.boxed()
        }))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(FeedbackRequestPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        Self(Arc::new(move |request| f(request).boxed()))
    }

    /// Ask on the terminal: the prompt goes to stderr, one line is read from stdin.
    pub fn stdin_prompt() -> Self {
        Self::from_async(|request| async move {
            tokio::task::spawn_blocking(move || {
                prompt_line(&request, &mut io::stdin().lock(), &mut io::stderr().lock())
            })
            .await
            .context("prompt task failed")?
        })
    }

    /// Answer every request with its default value (null when it has none).
    pub fn use_default() -> Self {
        Self::from_fn(|_| Ok(None))
    }

    pub fn call(&self, request: FeedbackRequestPayload) -> FeedbackFuture {
        (self.0)(request)
    }
}

impl fmt::Debug for FeedbackCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FeedbackCallback(..)")
    }
}

/// What answers feedback requests when neither the run nor the connection
/// configured a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedbackFallback {
    /// Prompt when stdin is a terminal, otherwise answer with the default.
    #[default]
    Auto,
    Prompt,
    UseDefault,
}

impl FeedbackFallback {
    pub fn callback(self) -> FeedbackCallback {
        match self.resolve(io::stdin().is_terminal()) {
            FeedbackFallback::Prompt => FeedbackCallback::stdin_prompt(),
            FeedbackFallback::Auto | FeedbackFallback::UseDefault => FeedbackCallback::use_default(),
        }
    }

    fn resolve(self, interactive: bool) -> Self {
        match self {
            FeedbackFallback::Auto if interactive => FeedbackFallback::Prompt,
            FeedbackFallback::Auto => FeedbackFallback::UseDefault,
            other => other,
        }
    }
}

fn prompt_line(
    request: &FeedbackRequestPayload,
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> anyhow::Result<Option<Value>> {
    write!(output, "{}", request.prompt)?;
    if let Some(default) = &request.default_value {
        write!(output, " [{default}]")?;
    }
    write!(output, ": ")?;
    output.flush()?;

    let mut line = String::new();
    let read = input.read_line(&mut line)?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(Value::String(
        line.trim_end_matches(['\r', '\n']).to_string(),
    )))
}

/// The value to send back: the answer, or the default when the answer is
/// missing, null, or an empty string.
pub fn resolve_answer(answer: Option<Value>, default: Option<&str>) -> Value {
    match (answer, default) {
        (None | Some(Value::Null), Some(default)) => Value::String(default.to_string()),
        (Some(Value::String(text)), Some(default)) if text.is_empty() => {
            Value::String(default.to_string())
        }
        (None, None) => Value::Null,
        (Some(value), _) => value,
    }
}

/// Listener that answers feedback requests through `emitter`.
pub fn bridge_handler(emitter: Emitter, callback: FeedbackCallback, sink: SharedSink) -> EventHandler {
    Arc::new(move |event: &ServerEvent| {
        let request = match event {
            ServerEvent::FeedbackRequest(request) => request.clone(),
            other => {
                sink.log(
                    LogRecord::new(Level::WARN, "feedback", "malformed feedback request")
                        .with_event(other.name()),
                );
                let response = FeedbackResponsePayload::failed("malformed feedback request");
                emitter.emit(&ClientEvent::FeedbackResponse(response))?;
                return Ok(());
            }
        };
        let runtime = tokio::runtime::Handle::try_current()
            .context("feedback requests need a tokio runtime")?;
        runtime.spawn(answer(emitter.clone(), callback.clone(), request, Arc::clone(&sink)));
        Ok(())
    })
}

async fn answer(
    emitter: Emitter,
    callback: FeedbackCallback,
    request: FeedbackRequestPayload,
    sink: SharedSink,
) {
    let default = request.default_value.clone();
    let outcome = AssertUnwindSafe(async move { callback.call(request).await })
        .catch_unwind()
        .await;

    let response = match outcome {
        Ok(Ok(value)) => FeedbackResponsePayload::answered(resolve_answer(value, default.as_deref())),
        Ok(Err(err)) => {
            sink.log(
                LogRecord::new(Level::ERROR, "feedback", format!("feedback callback failed: {err:#}"))
                    .with_event(EventKind::FeedbackRequest.as_str()),
            );
            FeedbackResponsePayload::failed(format!("{err:#}"))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            sink.log(
                LogRecord::new(
                    Level::ERROR,
                    "feedback",
                    format!("feedback callback panicked: {message}"),
                )
                .with_event(EventKind::FeedbackRequest.as_str()),
            );
            FeedbackResponsePayload::failed(format!("feedback callback panicked: {message}"))
        }
    };

    if let Err(err) = emitter.emit(&ClientEvent::FeedbackResponse(response)) {
        sink.log(
            LogRecord::new(Level::WARN, "feedback", format!("could not send feedback response: {err}"))
                .with_event(ClientEvent::FEEDBACK_RESPONSE),
        );
    }
}

/// Answer every feedback request on `handle` with `callback`, replacing any
/// earlier `feedback_request` listeners.
pub fn on_feedback_request(
    handle: &ConnectionHandle,
    callback: FeedbackCallback,
) -> Result<(), ListenerError> {
    handle.off(EventKind::FeedbackRequest)?;
    handle.on(
        EventKind::FeedbackRequest,
        bridge_handler(handle.emitter(), callback, handle.logger()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{connect, ConnectOptions};
    use crate::telemetry::MemorySink;
    use crate::transport::{MockServer, MockTransport};
    use serde_json::json;
    use std::time::Duration;

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

    async fn next_response(server: &mut MockServer) -> Value {
        let (name, payload) = tokio::time::timeout(Duration::from_secs(1), server.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "feedback_response");
        payload
    }

    #[test]
    fn empty_answers_fall_back_to_the_default() {
        assert_eq!(resolve_answer(None, Some("yes")), json!("yes"));
        assert_eq!(resolve_answer(Some(Value::Null), Some("yes")), json!("yes"));
        assert_eq!(resolve_answer(Some(json!("")), Some("yes")), json!("yes"));
        assert_eq!(resolve_answer(Some(json!("no")), Some("yes")), json!("no"));
        assert_eq!(resolve_answer(Some(json!(0)), Some("yes")), json!(0));
        assert_eq!(resolve_answer(None, None), Value::Null);
        assert_eq!(resolve_answer(Some(json!("")), None), json!(""));
    }

    fn request(prompt: &str, default: Option<&str>) -> FeedbackRequestPayload {
        FeedbackRequestPayload {
            prompt: prompt.to_string(),
            default_value: default.map(str::to_string),
        }
    }

    #[test]
    fn prompt_shows_the_default_and_reads_one_line() {
        let mut input = io::Cursor::new(b"ship it\r\nignored\n".to_vec());
        let mut output = Vec::new();
        let answer = prompt_line(&request("Deploy?", Some("no")), &mut input, &mut output).unwrap();
        assert_eq!(answer, Some(json!("ship it")));
        assert_eq!(String::from_utf8(output).unwrap(), "Deploy? [no]: ");
    }

    #[test]
    fn closed_input_means_no_answer() {
        let mut input = io::Cursor::new(Vec::new());
        let mut output = Vec::new();
        let answer = prompt_line(&request("Deploy?", None), &mut input, &mut output).unwrap();
        assert_eq!(answer, None);
    }

    #[test]
    fn auto_fallback_prompts_only_on_a_terminal() {
        assert_eq!(FeedbackFallback::Auto.resolve(true), FeedbackFallback::Prompt);
        assert_eq!(FeedbackFallback::Auto.resolve(false), FeedbackFallback::UseDefault);
        assert_eq!(FeedbackFallback::UseDefault.resolve(true), FeedbackFallback::UseDefault);
        assert_eq!(FeedbackFallback::Prompt.resolve(false), FeedbackFallback::Prompt);
    }

    #[tokio::test]
    async fn use_default_answers_with_the_default_value() {
        let answer = FeedbackCallback::use_default()
            .call(request("Region?", Some("eu-west-1")))
            .await
            .unwrap();
        assert_eq!(resolve_answer(answer, Some("eu-west-1")), json!("eu-west-1"));
    }

    #[tokio::test]
    async fn sync_answers_are_relayed() {
        let (handle, mut server) = connected(MemorySink::new()).await;
        on_feedback_request(
            &handle,
            FeedbackCallback::from_fn(|request| {
                assert_eq!(request.prompt, "Approve?");
                Ok(Some(json!("approved")))
            }),
        )
        .unwrap();

        server.push("feedback_request", json!({"prompt": "Approve?"}));
        assert_eq!(next_response(&mut server).await, json!({"input": "approved"}));
    }

    #[tokio::test]
    async fn async_none_uses_the_default() {
        let (handle, mut server) = connected(MemorySink::new()).await;
        on_feedback_request(
            &handle,
            FeedbackCallback::from_async(|_| async {
                tokio::task::yield_now().await;
                Ok(None)
            }),
        )
        .unwrap();

        server.push(
            "feedback_request",
            json!({"prompt": "Region?", "defaultValue": "eu-west-1"}),
        );
        assert_eq!(next_response(&mut server).await, json!({"input": "eu-west-1"}));
    }

    #[tokio::test]
    async fn failures_still_answer_with_an_error() {
        let sink = MemorySink::new();
        let (handle, mut server) = connected(sink.clone()).await;
        on_feedback_request(
            &handle,
            FeedbackCallback::from_fn(|_| anyhow::bail!("operator unavailable")),
        )
        .unwrap();

        server.push("feedback_request", json!({"prompt": "Continue?"}));
        assert_eq!(
            next_response(&mut server).await,
            json!({"input": null, "error": "operator unavailable"})
        );
        assert!(sink.contains(Level::ERROR, "operator unavailable"));
    }

    #[tokio::test]
    async fn panics_still_answer_with_an_error() {
        let (handle, mut server) = connected(MemorySink::new()).await;
        on_feedback_request(&handle, FeedbackCallback::from_fn(|_| panic!("no tty"))).unwrap();

        server.push("feedback_request", json!({"prompt": "Continue?"}));
        let response = next_response(&mut server).await;
        assert_eq!(response["input"], Value::Null);
        assert!(response["error"].as_str().unwrap().contains("no tty"));
    }

    #[tokio::test]
    async fn a_pending_answer_does_not_block_other_events() {
        let (handle, mut server) = connected(MemorySink::new()).await;
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(parking_lot::Mutex::new(Some(release_rx)));
        on_feedback_request(
            &handle,
            FeedbackCallback::from_async(move |_| {
                let release = release_rx.lock().take();
                async move {
                    if let Some(release) = release {
                        let _ = release.await;
                    }
                    Ok(Some(json!("late")))
                }
            }),
        )
        .unwrap();

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        handle
            .on(
                EventKind::RunStart,
                crate::handlers::handler(move |_| {
                    let _ = seen_tx.send(());
                    Ok(())
                }),
            )
            .unwrap();

        server.push("feedback_request", json!({"prompt": "Wait?"}));
        server.push("run_start", json!({"message": "still streaming"}));
        tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();

        release_tx.send(()).unwrap();
        assert_eq!(next_response(&mut server).await, json!({"input": "late"}));
    }
}
