//! Built-in renderings for every server event.

mod pretty;
mod quiet;
mod verbose;

use std::sync::Arc;

use flowline_proto::{EventKind, ServerEvent};

use super::EventHandler;
use crate::telemetry::{LogSink, SharedSink};

pub type Renderer = fn(&ServerEvent, &dyn LogSink);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfileKind {
    Verbose,
    #[default]
    Quiet,
    Pretty,
}

impl ProfileKind {
    /// `pretty` takes precedence over `verbose`; neither means quiet.
    pub fn select(pretty: bool, verbose: bool) -> Self {
        match (pretty, verbose) {
            (true, _) => ProfileKind::Pretty,
            (false, true) => ProfileKind::Verbose,
            (false, false) => ProfileKind::Quiet,
        }
    }

    pub fn renderer(self, kind: EventKind) -> Renderer {
        match self {
            ProfileKind::Verbose => verbose::renderer(kind),
            ProfileKind::Quiet => quiet::renderer(kind),
            ProfileKind::Pretty => pretty::renderer(kind),
        }
    }
}

/// A profile bound to the sink its renderings are written to.
#[derive(Clone)]
pub struct HandlerProfile {
    kind: ProfileKind,
    sink: SharedSink,
}

impl HandlerProfile {
    pub fn new(kind: ProfileKind, sink: SharedSink) -> Self {
        Self { kind, sink }
    }

    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    pub fn handler(&self, kind: EventKind) -> EventHandler {
        let render = self.kind.renderer(kind);
        let sink = Arc::clone(&self.sink);
        Arc::new(move |event: &ServerEvent| {
            render(event, sink.as_ref());
            Ok(())
        })
    }
}

impl std::fmt::Debug for HandlerProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerProfile").field("kind", &self.kind).finish()
    }
}

pub(crate) fn ignore(_event: &ServerEvent, _sink: &dyn LogSink) {}

/// Compact single-line JSON for log output.
pub(crate) fn compact(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use serde_json::json;
    use tracing::Level;

    #[test]
    fn pretty_beats_verbose() {
        assert_eq!(ProfileKind::select(true, true), ProfileKind::Pretty);
        assert_eq!(ProfileKind::select(false, true), ProfileKind::Verbose);
        assert_eq!(ProfileKind::select(false, false), ProfileKind::Quiet);
    }

    #[test]
    fn every_profile_renders_every_kind_without_failing() {
        let sink = MemorySink::new();
        for profile in [ProfileKind::Verbose, ProfileKind::Quiet, ProfileKind::Pretty] {
            let bound = HandlerProfile::new(profile, sink.clone());
            for kind in EventKind::ALL {
                let event = ServerEvent::decode(kind.as_str(), json!({}));
                assert!(bound.handler(kind)(&event).is_ok());
                let raw = ServerEvent::decode(kind.as_str(), json!("not an object"));
                assert!(bound.handler(kind)(&raw).is_ok());
            }
        }
    }

    #[test]
    fn quiet_suppresses_progress_but_reports_errors() {
        let sink = MemorySink::new();
        let quiet = HandlerProfile::new(ProfileKind::Quiet, sink.clone());

        let progress = ServerEvent::decode(
            "stream_output",
            json!({"type": "log", "node": "fetch", "state": "ok", "isError": false}),
        );
        quiet.handler(EventKind::StreamOutput)(&progress).unwrap();
        quiet.handler(EventKind::RunStart)(&ServerEvent::decode("run_start", json!({"message": "go"})))
            .unwrap();
        assert!(sink.records().is_empty());

        let failed = ServerEvent::decode(
            "stream_output",
            json!({"node": "fetch", "state": "timeout", "isError": true}),
        );
        quiet.handler(EventKind::StreamOutput)(&failed).unwrap();
        assert!(sink.contains(Level::ERROR, "fetch"));
    }

    #[test]
    fn verbose_logs_full_payloads() {
        let sink = MemorySink::new();
        let verbose = HandlerProfile::new(ProfileKind::Verbose, sink.clone());
        let event = ServerEvent::decode("run_start", json!({"message": "starting"}));
        verbose.handler(EventKind::RunStart)(&event).unwrap();
        assert!(sink.contains(Level::INFO, r#""message":"starting""#));
    }

    #[test]
    fn pretty_draws_boxes() {
        let sink = MemorySink::new();
        let pretty = HandlerProfile::new(ProfileKind::Pretty, sink.clone());
        let event = ServerEvent::decode("run_complete", json!({"message": "done", "state": {}}));
        pretty.handler(EventKind::RunComplete)(&event).unwrap();
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].message.starts_with('┌'));
        assert!(records[0].message.contains("done"));
    }
}
