//! Client for running workflows on a remote flowline execution service.
//!
//! A run goes through four steps:
//!
//! 1. [`connect`] opens a persistent, reconnecting event connection.
//! 2. [`ConnectionHandle::run`] picks a handler profile, layers the caller's
//!    overrides on top, and registers one listener per event kind.
//! 3. The `run_workflow` command is emitted and the service streams events
//!    back, each dispatched to its listener.
//! 4. On `run_complete`, `run_error`, or `workflow_error` the connection is
//!    torn down after the handler returns.
//!
//! ```no_run
//! use flowline_client::{connect, ConnectOptions, RunOptions, RunRequest};
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let handle = connect("runtime.flowline.dev", ConnectOptions::new().with_credential("api-key")).await?;
//! handle.run(RunRequest::new("wf_123", "run-token", json!({"q": 1})), RunOptions::new().pretty())?;
//! handle.closed().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod feedback;
pub mod handlers;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::{normalize_endpoint, ClientConfig, DEFAULT_ENDPOINT};
pub use connection::{
    connect, Backoff, ConnectOptions, ConnectionCallbacks, ConnectionHandle, ConnectionState,
    Emitter, Teardown,
};
pub use error::{ConnectionError, ListenerError, TransportError, WorkflowError};
pub use feedback::{on_feedback_request, FeedbackCallback, FeedbackFallback};
pub use handlers::{
    handler, EventHandler, HandlerKey, HandlerOverrides, HandlerProfile, HandlerTable, ProfileKind,
};
pub use session::{run, RunOptions, RunRequest};
pub use telemetry::logging::{LogConfig, LogLevel};
pub use telemetry::{FnSink, LogRecord, LogSink, MemorySink, NoopSink, SharedSink, TracingSink};

pub use flowline_proto as proto;
pub use flowline_proto::{ClientEvent, EventKind, ServerEvent};
