use flowline_proto::{EventKind, ServerEvent};
use tracing::Level;

use super::Renderer;
use crate::telemetry::{LogRecord, LogSink};

pub(super) fn renderer(kind: EventKind) -> Renderer {
    match kind {
        EventKind::RunError | EventKind::NodeError | EventKind::WorkflowError => error,
        EventKind::RunWarning => warning,
        EventKind::StreamOutput => stream,
        EventKind::RunStart
        | EventKind::RunComplete
        | EventKind::FinalOutput
        | EventKind::WorkflowReceived
        | EventKind::WorkflowLog
        | EventKind::FeedbackRequest => info,
    }
}

fn emit(level: Level, event: &ServerEvent, sink: &dyn LogSink) {
    let message = format!("{}: {}", event.name(), event.payload());
    sink.log(LogRecord::new(level, "verbose", message).with_event(event.name()));
}

fn info(event: &ServerEvent, sink: &dyn LogSink) {
    emit(Level::INFO, event, sink);
}

fn warning(event: &ServerEvent, sink: &dyn LogSink) {
    emit(Level::WARN, event, sink);
}

fn error(event: &ServerEvent, sink: &dyn LogSink) {
    emit(Level::ERROR, event, sink);
}

fn stream(event: &ServerEvent, sink: &dyn LogSink) {
    let level = match event {
        ServerEvent::StreamOutput(output) if output.is_error => Level::ERROR,
        _ => Level::INFO,
    };
    emit(level, event, sink);
}
