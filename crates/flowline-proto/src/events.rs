use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every event kind the execution service emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStart,
    RunWarning,
    RunComplete,
    RunError,
    StreamOutput,
    NodeError,
    FinalOutput,
    WorkflowReceived,
    WorkflowError,
    WorkflowLog,
    FeedbackRequest,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::RunStart,
        EventKind::RunWarning,
        EventKind::RunComplete,
        EventKind::RunError,
        EventKind::StreamOutput,
        EventKind::NodeError,
        EventKind::FinalOutput,
        EventKind::WorkflowReceived,
        EventKind::WorkflowError,
        EventKind::WorkflowLog,
        EventKind::FeedbackRequest,
    ];

    /// Events after which the owning connection is torn down.
    pub const TERMINAL: [EventKind; 3] = [
        EventKind::RunComplete,
        EventKind::RunError,
        EventKind::WorkflowError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::RunStart => "run_start",
            EventKind::RunWarning => "run_warning",
            EventKind::RunComplete => "run_complete",
            EventKind::RunError => "run_error",
            EventKind::StreamOutput => "stream_output",
            EventKind::NodeError => "node_error",
            EventKind::FinalOutput => "final_output",
            EventKind::WorkflowReceived => "workflow_received",
            EventKind::WorkflowError => "workflow_error",
            EventKind::WorkflowLog => "workflow_log",
            EventKind::FeedbackRequest => "feedback_request",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStartPayload {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunWarningPayload {
    pub message: String,
    pub errors: Vec<Value>,
    pub state: Value,
    pub warning: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCompletePayload {
    pub message: String,
    pub state: Value,
    pub warning: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamOutputPayload {
    #[serde(rename = "type")]
    pub output_type: String,
    pub node: String,
    pub state: Value,
    pub action: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeErrorPayload {
    pub node: String,
    pub error: Value,
    pub state: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalOutputPayload {
    #[serde(rename = "type")]
    pub output_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowReceivedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeedbackRequestPayload {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// An event received from the execution service.
///
/// `Raw` carries names this client does not know, and known names whose
/// payload could not be decoded into the expected shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    RunStart(RunStartPayload),
    RunWarning(RunWarningPayload),
    RunComplete(RunCompletePayload),
    RunError(RunErrorPayload),
    StreamOutput(StreamOutputPayload),
    NodeError(NodeErrorPayload),
    FinalOutput(FinalOutputPayload),
    WorkflowReceived(WorkflowReceivedPayload),
    WorkflowError(WorkflowErrorPayload),
    WorkflowLog(Value),
    FeedbackRequest(FeedbackRequestPayload),
    Raw { name: String, payload: Value },
}

impl ServerEvent {
    /// Decodes an event by name. Never fails: anything that does not fit a
    /// typed variant comes back as [`ServerEvent::Raw`].
    pub fn decode(name: &str, payload: Value) -> Self {
        let Some(kind) = EventKind::from_name(name) else {
            return ServerEvent::Raw {
                name: name.to_string(),
                payload,
            };
        };
        let decoded = match kind {
            EventKind::RunStart => typed(&payload).map(ServerEvent::RunStart),
            EventKind::RunWarning => typed(&payload).map(ServerEvent::RunWarning),
            EventKind::RunComplete => typed(&payload).map(ServerEvent::RunComplete),
            EventKind::RunError => typed(&payload).map(ServerEvent::RunError),
            EventKind::StreamOutput => typed(&payload).map(ServerEvent::StreamOutput),
            EventKind::NodeError => typed(&payload).map(ServerEvent::NodeError),
            EventKind::FinalOutput => typed(&payload).map(ServerEvent::FinalOutput),
            EventKind::WorkflowReceived => typed(&payload).map(ServerEvent::WorkflowReceived),
            EventKind::WorkflowError => typed(&payload).map(ServerEvent::WorkflowError),
            EventKind::WorkflowLog => return ServerEvent::WorkflowLog(payload),
            EventKind::FeedbackRequest => typed(&payload).map(ServerEvent::FeedbackRequest),
        };
        decoded.unwrap_or_else(|| ServerEvent::Raw {
            name: name.to_string(),
            payload,
        })
    }

    /// Wire name of the event.
    pub fn name(&self) -> &str {
        match self {
            ServerEvent::Raw { name, .. } => name,
            other => other.kind().map(EventKind::as_str).unwrap_or_default(),
        }
    }

    /// The known kind for this event, also for `Raw` events that carry a known name.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            ServerEvent::RunStart(_) => Some(EventKind::RunStart),
            ServerEvent::RunWarning(_) => Some(EventKind::RunWarning),
            ServerEvent::RunComplete(_) => Some(EventKind::RunComplete),
            ServerEvent::RunError(_) => Some(EventKind::RunError),
            ServerEvent::StreamOutput(_) => Some(EventKind::StreamOutput),
            ServerEvent::NodeError(_) => Some(EventKind::NodeError),
            ServerEvent::FinalOutput(_) => Some(EventKind::FinalOutput),
            ServerEvent::WorkflowReceived(_) => Some(EventKind::WorkflowReceived),
            ServerEvent::WorkflowError(_) => Some(EventKind::WorkflowError),
            ServerEvent::WorkflowLog(_) => Some(EventKind::WorkflowLog),
            ServerEvent::FeedbackRequest(_) => Some(EventKind::FeedbackRequest),
            ServerEvent::Raw { name, .. } => EventKind::from_name(name),
        }
    }

    /// JSON form of the payload as it would appear on the wire.
    pub fn payload(&self) -> Value {
        let encoded = match self {
            ServerEvent::RunStart(p) => serde_json::to_value(p),
            ServerEvent::RunWarning(p) => serde_json::to_value(p),
            ServerEvent::RunComplete(p) => serde_json::to_value(p),
            ServerEvent::RunError(p) => serde_json::to_value(p),
            ServerEvent::StreamOutput(p) => serde_json::to_value(p),
            ServerEvent::NodeError(p) => serde_json::to_value(p),
            ServerEvent::FinalOutput(p) => serde_json::to_value(p),
            ServerEvent::WorkflowReceived(p) => serde_json::to_value(p),
            ServerEvent::WorkflowError(p) => serde_json::to_value(p),
            ServerEvent::FeedbackRequest(p) => serde_json::to_value(p),
            ServerEvent::WorkflowLog(value) | ServerEvent::Raw { payload: value, .. } => {
                return value.clone();
            }
        };
        encoded.unwrap_or(Value::Null)
    }
}

fn typed<T: DeserializeOwned>(payload: &Value) -> Option<T> {
    let source = match payload {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(source).ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWorkflowPayload {
    pub flow_id: String,
    pub token: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackResponsePayload {
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FeedbackResponsePayload {
    pub fn answered(input: Value) -> Self {
        Self { input, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            input: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// An event sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    RunWorkflow(RunWorkflowPayload),
    FeedbackResponse(FeedbackResponsePayload),
}

impl ClientEvent {
    pub const RUN_WORKFLOW: &'static str = "run_workflow";
    pub const FEEDBACK_RESPONSE: &'static str = "feedback_response";

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::RunWorkflow(_) => Self::RUN_WORKFLOW,
            ClientEvent::FeedbackResponse(_) => Self::FEEDBACK_RESPONSE,
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            ClientEvent::RunWorkflow(p) => serde_json::to_value(p),
            ClientEvent::FeedbackResponse(p) => serde_json::to_value(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_kind_round_trips_through_its_name() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_name("run_paused"), None);
    }

    #[test]
    fn only_completion_and_errors_are_terminal() {
        let terminal: Vec<_> = EventKind::ALL
            .into_iter()
            .filter(|kind| kind.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                EventKind::RunComplete,
                EventKind::RunError,
                EventKind::WorkflowError
            ]
        );
    }

    #[test]
    fn decodes_camel_case_stream_output() {
        let event = ServerEvent::decode(
            "stream_output",
            json!({
                "type": "update",
                "node": "summarize",
                "state": {"step": 2},
                "action": "end",
                "isError": true
            }),
        );
        let ServerEvent::StreamOutput(payload) = event else {
            panic!("expected stream_output, got {event:?}");
        };
        assert_eq!(payload.output_type, "update");
        assert_eq!(payload.node, "summarize");
        assert!(payload.is_error);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let event = ServerEvent::decode("run_complete", json!({"message": "done"}));
        let ServerEvent::RunComplete(payload) = event else {
            panic!("expected run_complete, got {event:?}");
        };
        assert_eq!(payload.message, "done");
        assert!(!payload.warning);
        assert_eq!(payload.errors, None);

        let empty = ServerEvent::decode("workflow_received", Value::Null);
        assert_eq!(
            empty,
            ServerEvent::WorkflowReceived(WorkflowReceivedPayload { message: None })
        );
    }

    #[test]
    fn mismatched_payload_keeps_its_kind_as_raw() {
        let event = ServerEvent::decode("run_error", json!("boom"));
        assert_eq!(
            event,
            ServerEvent::Raw {
                name: "run_error".into(),
                payload: json!("boom"),
            }
        );
        assert_eq!(event.kind(), Some(EventKind::RunError));
        assert_eq!(event.name(), "run_error");
    }

    #[test]
    fn unknown_names_are_raw_without_kind() {
        let event = ServerEvent::decode("node_progress", json!({"pct": 40}));
        assert_eq!(event.kind(), None);
        assert_eq!(event.name(), "node_progress");
        assert_eq!(event.payload(), json!({"pct": 40}));
    }

    #[test]
    fn feedback_request_reads_default_value() {
        let event = ServerEvent::decode(
            "feedback_request",
            json!({"prompt": "Approve?", "defaultValue": "yes"}),
        );
        assert_eq!(
            event,
            ServerEvent::FeedbackRequest(FeedbackRequestPayload {
                prompt: "Approve?".into(),
                default_value: Some("yes".into()),
            })
        );
    }

    #[test]
    fn run_workflow_uses_flow_id_on_the_wire() {
        let event = ClientEvent::RunWorkflow(RunWorkflowPayload {
            flow_id: "wf1".into(),
            token: "t".into(),
            input: json!({"q": 1}),
        });
        assert_eq!(event.name(), "run_workflow");
        assert_eq!(
            event.payload().unwrap(),
            json!({"flowId": "wf1", "token": "t", "input": {"q": 1}})
        );
    }

    #[test]
    fn failed_feedback_response_carries_error_and_null_input() {
        let payload = ClientEvent::FeedbackResponse(FeedbackResponsePayload::failed("no tty"))
            .payload()
            .unwrap();
        assert_eq!(payload, json!({"input": null, "error": "no tty"}));

        let answered = ClientEvent::FeedbackResponse(FeedbackResponsePayload::answered(json!("y")))
            .payload()
            .unwrap();
        assert_eq!(answered, json!({"input": "y"}));
    }
}
