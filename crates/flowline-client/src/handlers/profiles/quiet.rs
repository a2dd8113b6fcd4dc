use flowline_proto::{EventKind, ServerEvent};
use tracing::Level;

use super::{compact, ignore, Renderer};
use crate::telemetry::{LogRecord, LogSink};

pub(super) fn renderer(kind: EventKind) -> Renderer {
    match kind {
        EventKind::RunWarning => run_warning,
        EventKind::RunComplete => run_complete,
        EventKind::RunError => run_error,
        EventKind::StreamOutput => stream_output,
        EventKind::NodeError => node_error,
        EventKind::WorkflowError => workflow_error,
        EventKind::RunStart
        | EventKind::FinalOutput
        | EventKind::WorkflowReceived
        | EventKind::WorkflowLog
        | EventKind::FeedbackRequest => ignore,
    }
}

fn log(sink: &dyn LogSink, level: Level, event: &ServerEvent, message: String) {
    sink.log(LogRecord::new(level, "quiet", message).with_event(event.name()));
}

fn message_of(event: &ServerEvent) -> String {
    event
        .payload()
        .get("message")
        .map(compact)
        .unwrap_or_default()
}

fn run_warning(event: &ServerEvent, sink: &dyn LogSink) {
    let message = match event {
        ServerEvent::RunWarning(warning) if warning.errors.is_empty() => warning.message.clone(),
        ServerEvent::RunWarning(warning) => format!(
            "{} ({} issue{})",
            warning.message,
            warning.errors.len(),
            if warning.errors.len() == 1 { "" } else { "s" }
        ),
        other => message_of(other),
    };
    log(sink, Level::WARN, event, format!("run warning: {message}"));
}

fn run_complete(event: &ServerEvent, sink: &dyn LogSink) {
    match event {
        ServerEvent::RunComplete(done) if done.warning => log(
            sink,
            Level::WARN,
            event,
            format!("run completed with warnings: {}", done.message),
        ),
        ServerEvent::RunComplete(done) => {
            log(sink, Level::INFO, event, format!("run completed: {}", done.message))
        }
        other => log(sink, Level::INFO, event, format!("run completed: {}", message_of(other))),
    }
}

fn run_error(event: &ServerEvent, sink: &dyn LogSink) {
    let message = match event {
        ServerEvent::RunError(failure) => failure.message.clone(),
        other => message_of(other),
    };
    log(sink, Level::ERROR, event, format!("run failed: {message}"));
}

fn stream_output(event: &ServerEvent, sink: &dyn LogSink) {
    if let ServerEvent::StreamOutput(output) = event {
        if output.is_error {
            log(
                sink,
                Level::ERROR,
                event,
                format!("{} reported an error: {}", output.node, compact(&output.state)),
            );
        }
    }
}

fn node_error(event: &ServerEvent, sink: &dyn LogSink) {
    let message = match event {
        ServerEvent::NodeError(failure) => {
            format!("node {} failed: {}", failure.node, compact(&failure.error))
        }
        other => format!("node failed: {}", other.payload()),
    };
    log(sink, Level::ERROR, event, message);
}

fn workflow_error(event: &ServerEvent, sink: &dyn LogSink) {
    let message = match event {
        ServerEvent::WorkflowError(failure) => failure.message.clone(),
        other => message_of(other),
    };
    log(sink, Level::ERROR, event, format!("workflow rejected: {message}"));
}
