use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::Level;

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::feedback::{FeedbackCallback, FeedbackFallback};
use crate::handlers::{panic_message, EventHandler, HandlerKey, HandlerOverrides};
use crate::telemetry::{default_sink, FnSink, LogRecord, LogSink, SharedSink};
use crate::transport::Transport;

type Callback<A> = Option<Arc<dyn Fn(A) + Send + Sync>>;

/// Hooks into the connection lifecycle. A panicking hook is logged and ignored.
#[derive(Clone, Default)]
pub struct ConnectionCallbacks {
    on_connect: Callback<()>,
    on_disconnect: Callback<&'static str>,
    on_connect_error: Option<Arc<dyn Fn(&TransportError) + Send + Sync>>,
    on_reconnect_attempt: Callback<u32>,
    on_reconnect: Callback<u32>,
    on_reconnect_failed: Callback<()>,
}

impl ConnectionCallbacks {
    pub(crate) fn connected(&self, sink: &dyn LogSink) {
        if let Some(callback) = &self.on_connect {
            guarded(sink, "connect", || callback(()));
        }
    }

    pub(crate) fn disconnected(&self, reason: &'static str, sink: &dyn LogSink) {
        if let Some(callback) = &self.on_disconnect {
            guarded(sink, "disconnect", || callback(reason));
        }
    }

    pub(crate) fn connect_error(&self, error: &TransportError, sink: &dyn LogSink) {
        if let Some(callback) = &self.on_connect_error {
            guarded(sink, "connect_error", || callback(error));
        }
    }

    pub(crate) fn reconnect_attempt(&self, attempt: u32, sink: &dyn LogSink) {
        if let Some(callback) = &self.on_reconnect_attempt {
            guarded(sink, "reconnect_attempt", || callback(attempt));
        }
    }

    pub(crate) fn reconnected(&self, attempts: u32, sink: &dyn LogSink) {
        if let Some(callback) = &self.on_reconnect {
            guarded(sink, "reconnect", || callback(attempts));
        }
    }

    pub(crate) fn reconnect_failed(&self, sink: &dyn LogSink) {
        if let Some(callback) = &self.on_reconnect_failed {
            guarded(sink, "reconnect_failed", || callback(()));
        }
    }
}

fn guarded(sink: &dyn LogSink, hook: &'static str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        sink.log(LogRecord::new(
            Level::ERROR,
            "connection",
            format!("{hook} callback panicked: {}", panic_message(panic.as_ref())),
        ));
    }
}

impl fmt::Debug for ConnectionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCallbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_connect_error", &self.on_connect_error.is_some())
            .field("on_reconnect_attempt", &self.on_reconnect_attempt.is_some())
            .field("on_reconnect", &self.on_reconnect.is_some())
            .field("on_reconnect_failed", &self.on_reconnect_failed.is_some())
            .finish()
    }
}

/// Everything `connect` needs besides the endpoint.
#[derive(Clone)]
pub struct ConnectOptions {
    pub(crate) config: ClientConfig,
    pub(crate) credential: Option<String>,
    pub(crate) overrides: HandlerOverrides,
    pub(crate) feedback: Option<FeedbackCallback>,
    pub(crate) feedback_fallback: FeedbackFallback,
    pub(crate) sink: SharedSink,
    pub(crate) callbacks: ConnectionCallbacks,
    pub(crate) transport: Option<Arc<dyn Transport>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            config: ClientConfig::default(),
            credential: None,
            overrides: HandlerOverrides::default(),
            feedback: None,
            feedback_fallback: FeedbackFallback::default(),
            sink: default_sink(),
            callbacks: ConnectionCallbacks::default(),
            transport: None,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options carrying `config`, including its credential.
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            credential: config.credential.clone(),
            config,
            ..Self::default()
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
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

    /// How feedback requests are answered when no callback is configured.
    pub fn with_feedback_fallback(mut self, fallback: FeedbackFallback) -> Self {
        self.feedback_fallback = fallback;
        self
    }

    pub fn with_logger(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_log_fn<F>(self, f: F) -> Self
    where
        F: Fn(&LogRecord) + Send + Sync + 'static,
    {
        self.with_logger(Arc::new(FnSink::new(f)))
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_connect = Some(Arc::new(move |()| f()));
        self
    }

    pub fn on_disconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_disconnect = Some(Arc::new(move |reason: &'static str| f(reason)));
        self
    }

    pub fn on_connect_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.callbacks.on_connect_error = Some(Arc::new(f));
        self
    }

    pub fn on_reconnect_attempt<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.callbacks.on_reconnect_attempt = Some(Arc::new(f));
        self
    }

    pub fn on_reconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.callbacks.on_reconnect = Some(Arc::new(f));
        self
    }

    pub fn on_reconnect_failed<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_reconnect_failed = Some(Arc::new(move |()| f()));
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("config", &self.config)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("overrides", &self.overrides)
            .field("feedback", &self.feedback.is_some())
            .field("feedback_fallback", &self.feedback_fallback)
            .field("callbacks", &self.callbacks)
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn from_config_carries_the_credential() {
        let config = ClientConfig {
            credential: Some("from-env".into()),
            ..ClientConfig::default()
        };
        let options = ConnectOptions::from_config(config);
        assert_eq!(options.credential.as_deref(), Some("from-env"));
        assert!(!format!("{options:?}").contains("from-env"));
    }

    #[test]
    fn panicking_callbacks_are_contained() {
        let sink = MemorySink::new();
        let options = ConnectOptions::new().on_connect(|| panic!("hook blew up"));
        options.callbacks.connected(sink.as_ref());
        assert!(sink.contains(Level::ERROR, "connect callback panicked: hook blew up"));
    }

    #[test]
    fn reconnect_hooks_receive_counts() {
        let seen = Arc::new(AtomicU32::new(0));
        let observed = seen.clone();
        let options = ConnectOptions::new().on_reconnect_attempt(move |n| {
            observed.store(n, Ordering::SeqCst);
        });
        options.callbacks.reconnect_attempt(4, &crate::telemetry::NoopSink);
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }
}
