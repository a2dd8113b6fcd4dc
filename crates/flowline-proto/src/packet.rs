//! Engine.IO v4 and Socket.IO v4 text packets.
//!
//! Only the text encoding is supported; binary attachments are rejected.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_NAMESPACE: &str = "/";

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet type {0:?}")]
    UnknownType(char),
    #[error("unsupported packet: {0}")]
    Unsupported(&'static str),
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("invalid packet json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Payload of the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(text: &str) -> Result<Self, PacketError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let body = chars.as_str();
        match kind {
            '0' => Ok(EnginePacket::Open(serde_json::from_str(body)?)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(body.to_string())),
            '3' => Ok(EnginePacket::Pong(body.to_string())),
            '4' => Ok(EnginePacket::Message(body.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            'b' => Err(PacketError::Unsupported("base64 binary engine packet")),
            other => Err(PacketError::UnknownType(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(handshake) => {
                format!("0{}", serde_json::to_string(handshake).unwrap_or_default())
            }
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{data}"),
            EnginePacket::Pong(data) => format!("3{data}"),
            EnginePacket::Message(data) => format!("4{data}"),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

impl From<&SocketPacket> for EnginePacket {
    fn from(packet: &SocketPacket) -> Self {
        EnginePacket::Message(packet.encode())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        data: Value,
    },
}

impl SocketPacket {
    pub fn connect(auth: Option<Value>) -> Self {
        SocketPacket::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            data: auth,
        }
    }

    pub fn disconnect() -> Self {
        SocketPacket::Disconnect {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    /// An event on the default namespace with a single payload argument.
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        SocketPacket::Event {
            namespace: DEFAULT_NAMESPACE.to_string(),
            id: None,
            name: name.into(),
            args: vec![payload],
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            SocketPacket::Connect { namespace, .. }
            | SocketPacket::Disconnect { namespace }
            | SocketPacket::Event { namespace, .. }
            | SocketPacket::Ack { namespace, .. }
            | SocketPacket::ConnectError { namespace, .. } => namespace,
        }
    }

    pub fn decode(text: &str) -> Result<Self, PacketError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let mut rest = chars.as_str();

        match kind {
            '0'..='4' => {}
            '5' | '6' => return Err(PacketError::Unsupported("binary socket packet")),
            other => return Err(PacketError::UnknownType(other)),
        }

        let mut namespace = DEFAULT_NAMESPACE;
        if rest.starts_with('/') {
            match rest.find(',') {
                Some(idx) => {
                    namespace = &rest[..idx];
                    rest = &rest[idx + 1..];
                }
                None => {
                    namespace = rest;
                    rest = "";
                }
            }
        }

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let id = if digits > 0 {
            let parsed = rest[..digits]
                .parse::<u64>()
                .map_err(|err| PacketError::Malformed(format!("ack id: {err}")))?;
            rest = &rest[digits..];
            Some(parsed)
        } else {
            None
        };

        let data: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };
        let namespace = namespace.to_string();

        match kind {
            '0' => Ok(SocketPacket::Connect { namespace, data }),
            '1' => Ok(SocketPacket::Disconnect { namespace }),
            '2' => {
                let mut args = match data {
                    Some(Value::Array(args)) => args,
                    _ => return Err(PacketError::Malformed("event data must be an array".into())),
                };
                if args.is_empty() {
                    return Err(PacketError::Malformed("event without a name".into()));
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(PacketError::Malformed(format!(
                            "event name must be a string, got {other}"
                        )));
                    }
                };
                Ok(SocketPacket::Event {
                    namespace,
                    id,
                    name,
                    args,
                })
            }
            '3' => {
                let id = id.ok_or_else(|| PacketError::Malformed("ack without id".into()))?;
                let args = match data {
                    Some(Value::Array(args)) => args,
                    None => Vec::new(),
                    Some(_) => return Err(PacketError::Malformed("ack data must be an array".into())),
                };
                Ok(SocketPacket::Ack {
                    namespace,
                    id,
                    args,
                })
            }
            _ => Ok(SocketPacket::ConnectError {
                namespace,
                data: data.unwrap_or(Value::Null),
            }),
        }
    }

    pub fn encode(&self) -> String {
        let (kind, id, data) = match self {
            SocketPacket::Connect { data, .. } => ('0', None, data.clone()),
            SocketPacket::Disconnect { .. } => ('1', None, None),
            SocketPacket::Event { id, name, args, .. } => {
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                ('2', *id, Some(Value::Array(items)))
            }
            SocketPacket::Ack { id, args, .. } => ('3', Some(*id), Some(Value::Array(args.clone()))),
            SocketPacket::ConnectError { data, .. } => ('4', None, Some(data.clone())),
        };

        let mut out = String::new();
        out.push(kind);
        let namespace = self.namespace();
        if namespace != DEFAULT_NAMESPACE {
            out.push_str(namespace);
            out.push(',');
        }
        if let Some(id) = id {
            let _ = write!(out, "{id}");
        }
        if let Some(data) = data {
            out.push_str(&data.to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_engine_open_handshake() {
        let packet = EnginePacket::decode(
            r#"0{"sid":"lv_VI97HAXpY6yYWAAAC","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .unwrap();
        let EnginePacket::Open(open) = packet else {
            panic!("expected open packet");
        };
        assert_eq!(open.sid, "lv_VI97HAXpY6yYWAAAC");
        assert_eq!(open.ping_interval, 25_000);
        assert_eq!(open.ping_timeout, 20_000);
        assert_eq!(open.max_payload, Some(1_000_000));
    }

    #[test]
    fn ping_is_answered_with_matching_pong_text() {
        assert_eq!(EnginePacket::decode("2").unwrap(), EnginePacket::Ping(String::new()));
        assert_eq!(EnginePacket::Pong(String::new()).encode(), "3");
        assert_eq!(EnginePacket::decode("2hello").unwrap(), EnginePacket::Ping("hello".into()));
    }

    #[test]
    fn rejects_empty_and_unknown_engine_packets() {
        assert!(matches!(EnginePacket::decode(""), Err(PacketError::Empty)));
        assert!(matches!(EnginePacket::decode("9"), Err(PacketError::UnknownType('9'))));
    }

    #[test]
    fn connect_carries_auth_payload() {
        let packet = SocketPacket::connect(Some(json!({"token": "abc"})));
        let wire = EnginePacket::from(&packet).encode();
        assert_eq!(wire, r#"40{"token":"abc"}"#);
        assert_eq!(SocketPacket::connect(None).encode(), "0");
    }

    #[test]
    fn decodes_connect_ack_and_connect_error() {
        assert_eq!(
            SocketPacket::decode(r#"0{"sid":"s1"}"#).unwrap(),
            SocketPacket::Connect {
                namespace: "/".into(),
                data: Some(json!({"sid": "s1"})),
            }
        );
        assert_eq!(
            SocketPacket::decode(r#"4{"message":"Not authorized"}"#).unwrap(),
            SocketPacket::ConnectError {
                namespace: "/".into(),
                data: json!({"message": "Not authorized"}),
            }
        );
    }

    #[test]
    fn event_encodes_name_then_payload() {
        let packet = SocketPacket::event("run_workflow", json!({"flowId": "wf1"}));
        assert_eq!(packet.encode(), r#"2["run_workflow",{"flowId":"wf1"}]"#);
    }

    #[test]
    fn decodes_event_with_namespace_and_ack_id() {
        let packet = SocketPacket::decode(r#"2/admin,13["run_start",{"message":"go"}]"#).unwrap();
        assert_eq!(
            packet,
            SocketPacket::Event {
                namespace: "/admin".into(),
                id: Some(13),
                name: "run_start".into(),
                args: vec![json!({"message": "go"})],
            }
        );
        assert_eq!(packet.encode(), r#"2/admin,13["run_start",{"message":"go"}]"#);
    }

    #[test]
    fn event_without_payload_has_no_args() {
        let packet = SocketPacket::decode(r#"2["workflow_received"]"#).unwrap();
        let SocketPacket::Event { name, args, .. } = packet else {
            panic!("expected event");
        };
        assert_eq!(name, "workflow_received");
        assert!(args.is_empty());
    }

    #[test]
    fn malformed_events_are_errors() {
        assert!(matches!(
            SocketPacket::decode(r#"2{"not":"array"}"#),
            Err(PacketError::Malformed(_))
        ));
        assert!(matches!(SocketPacket::decode("2[]"), Err(PacketError::Malformed(_))));
        assert!(matches!(SocketPacket::decode("2[42]"), Err(PacketError::Malformed(_))));
        assert!(matches!(SocketPacket::decode("2[unterminated"), Err(PacketError::Json(_))));
        assert!(matches!(SocketPacket::decode("51-[\"x\"]"), Err(PacketError::Unsupported(_))));
    }

    #[test]
    fn decodes_server_disconnect_and_ack() {
        assert_eq!(
            SocketPacket::decode("1").unwrap(),
            SocketPacket::Disconnect { namespace: "/".into() }
        );
        assert_eq!(
            SocketPacket::decode(r#"37["ok"]"#).unwrap(),
            SocketPacket::Ack {
                namespace: "/".into(),
                id: 7,
                args: vec![json!("ok")],
            }
        );
        assert!(matches!(SocketPacket::decode("3[]"), Err(PacketError::Malformed(_))));
    }
}
