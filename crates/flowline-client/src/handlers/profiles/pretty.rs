use flowline_proto::{EventKind, ServerEvent};
use serde_json::Value;
use tracing::Level;

use super::{compact, Renderer};
use crate::telemetry::{LogRecord, LogSink};

pub(super) fn renderer(kind: EventKind) -> Renderer {
    match kind {
        EventKind::RunStart => run_start,
        EventKind::RunWarning => run_warning,
        EventKind::RunComplete => run_complete,
        EventKind::RunError => run_error,
        EventKind::StreamOutput => stream_output,
        EventKind::NodeError => node_error,
        EventKind::FinalOutput => final_output,
        EventKind::WorkflowReceived => workflow_received,
        EventKind::WorkflowError => workflow_error,
        EventKind::WorkflowLog => workflow_log,
        EventKind::FeedbackRequest => feedback_request,
    }
}

/// Draw `lines` inside a box with `title` in the top border.
pub(super) fn boxed(title: &str, lines: &[String]) -> String {
    let body: Vec<&str> = lines.iter().flat_map(|line| line.lines()).collect();
    let width = body
        .iter()
        .map(|line| line.chars().count())
        .chain(std::iter::once(title.chars().count() + 2))
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    out.push_str("┌─ ");
    out.push_str(title);
    out.push(' ');
    out.push_str(&"─".repeat(width.saturating_sub(title.chars().count() + 1)));
    out.push_str("┐\n");
    for line in body {
        out.push_str("│ ");
        out.push_str(line);
        out.push_str(&" ".repeat(width - line.chars().count()));
        out.push_str(" │\n");
    }
    out.push('└');
    out.push_str(&"─".repeat(width + 2));
    out.push('┘');
    out
}

fn render(sink: &dyn LogSink, level: Level, event: &ServerEvent, title: &str, lines: Vec<String>) {
    sink.log(LogRecord::new(level, "pretty", boxed(title, &lines)).with_event(event.name()));
}

fn pretty_json(value: &Value) -> String {
    match value {
        Value::Null => "(none)".to_string(),
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn fallback(sink: &dyn LogSink, level: Level, event: &ServerEvent, title: &str) {
    render(sink, level, event, title, vec![pretty_json(&event.payload())]);
}

fn run_start(event: &ServerEvent, sink: &dyn LogSink) {
    match event {
        ServerEvent::RunStart(start) => {
            render(sink, Level::INFO, event, "Run started", vec![start.message.clone()])
        }
        other => fallback(sink, Level::INFO, other, "Run started"),
    }
}

fn run_warning(event: &ServerEvent, sink: &dyn LogSink) {
    match event {
        ServerEvent::RunWarning(warning) => {
            let mut lines = vec![warning.message.clone()];
            lines.extend(warning.errors.iter().map(|error| format!("• {}", compact(error))));
            render(sink, Level::WARN, event, "Warning", lines);
        }
        other => fallback(sink, Level::WARN, other, "Warning"),
    }
}

fn run_complete(event: &ServerEvent, sink: &dyn LogSink) {
    match event {
        ServerEvent::RunComplete(done) => {
            let mut lines = vec![done.message.clone()];
            if let Some(output) = &done.output {
                lines.push(format!("output: {}", pretty_json(output)));
            }
            for error in done.errors.iter().flatten() {
                lines.push(format!("• {}", compact(error)));
            }
            let (level, title) = if done.warning {
                (Level::WARN, "Run complete (with warnings)")
            } else {
                (Level::INFO, "Run complete")
            };
            render(sink, level, event, title, lines);
        }
        other => fallback(sink, Level::INFO, other, "Run complete"),
    }
}

fn run_error(event: &ServerEvent, sink: &dyn LogSink) {
    match event {
        ServerEvent::RunError(failure) => {
            let mut lines = vec![failure.message.clone()];
            lines.extend(failure.stack.clone());
            render(sink, Level::ERROR, event, "Run failed", lines);
        }
        other => fallback(sink, Level::ERROR, other, "Run failed"),
    }
}

fn stream_output(event: &ServerEvent, sink: &dyn LogSink) {
    match event {
        ServerEvent::StreamOutput(output) => {
            let title = if output.node.is_empty() {
                "Output".to_string()
            } else {
                format!("{} · {}", output.node, output.action)
            };
            let level = if output.is_error { Level::ERROR } else { Level::INFO };
            render(sink, level, event, title.trim_end_matches(" · "), vec![pretty_json(&output.state)]);
        }
        other => fallback(sink, Level::INFO, other, "Output"),
    }
}

fn node_error(event: &ServerEvent, sink: &dyn LogSink) {
    match event {
        ServerEvent::NodeError(failure) => render(
            sink,
            Level::ERROR,
            event,
            &format!("Node {} failed", failure.node),
            vec![pretty_json(&failure.error)],
        ),
        other => fallback(sink, Level::ERROR, other, "Node failed"),
    }
}

fn final_output(event: &ServerEvent, sink: &dyn LogSink) {
    match event {
        ServerEvent::FinalOutput(output) => render(
            sink,
            Level::INFO,
            event,
            &format!("Final output ({})", output.output_type),
            vec![pretty_json(&output.data)],
        ),
        other => fallback(sink, Level::INFO, other, "Final output"),
    }
}

fn workflow_received(event: &ServerEvent, sink: &dyn LogSink) {
    let message = match event {
        ServerEvent::WorkflowReceived(received) => received
            .message
            .clone()
            .unwrap_or_else(|| "workflow accepted".to_string()),
        other => pretty_json(&other.payload()),
    };
    render(sink, Level::INFO, event, "Workflow received", vec![message]);
}

fn workflow_error(event: &ServerEvent, sink: &dyn LogSink) {
    match event {
        ServerEvent::WorkflowError(failure) => {
            let mut lines = vec![failure.message.clone()];
            lines.extend(failure.stack.clone());
            render(sink, Level::ERROR, event, "Workflow error", lines);
        }
        other => fallback(sink, Level::ERROR, other, "Workflow error"),
    }
}

fn workflow_log(event: &ServerEvent, sink: &dyn LogSink) {
    fallback(sink, Level::INFO, event, "Log");
}

fn feedback_request(event: &ServerEvent, sink: &dyn LogSink) {
    match event {
        ServerEvent::FeedbackRequest(request) => {
            let mut lines = vec![request.prompt.clone()];
            if let Some(default) = &request.default_value {
                lines.push(format!("default: {default}"));
            }
            render(sink, Level::INFO, event, "Feedback requested", lines);
        }
        other => fallback(sink, Level::INFO, other, "Feedback requested"),
    }
}
