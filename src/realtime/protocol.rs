//! Engine.IO v4 / Socket.IO v5 text packet codec.
//!
//! Only the text encoding over WebSocket is supported. Binary attachments
//! are rejected as protocol errors.
//!
//! Frame layout:
//! - Engine.IO: `<type digit><data>` (`0` open, `1` close, `2` ping, `3` pong, `4` message)
//! - Socket.IO (inside an Engine.IO message):
//!   `<type digit>[/<namespace>,][<ack id>][<json>]`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::RealtimeError;

pub const DEFAULT_NAMESPACE: &str = "/";

/// Engine.IO OPEN handshake payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenPayload),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(text: &str) -> Result<Self, RealtimeError> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| RealtimeError::protocol("empty engine.io frame"))?;
        let data = chars.as_str();

        match kind {
            '0' => serde_json::from_str(data)
                .map(Self::Open)
                .map_err(|e| RealtimeError::protocol(format!("bad open payload: {e}"))),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(data.to_string())),
            '3' => Ok(Self::Pong(data.to_string())),
            '4' => Ok(Self::Message(data.to_string())),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(RealtimeError::protocol(format!(
                "unknown engine.io packet type '{other}'"
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Open(payload) => format!(
                "0{}",
                serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string())
            ),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(data) => format!("4{data}"),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
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
        message: String,
        data: Option<Value>,
    },
}

impl SocketPacket {
    /// Decode the Socket.IO payload of an Engine.IO message
    pub fn decode(text: &str) -> Result<Self, RealtimeError> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| RealtimeError::protocol("empty socket.io packet"))?;
        let mut rest = chars.as_str();

        if matches!(kind, '5' | '6') {
            return Err(RealtimeError::protocol("binary socket.io packets are not supported"));
        }

        let namespace = if rest.starts_with('/') {
            let (ns, tail) = match rest.find(',') {
                Some(idx) => (&rest[..idx], &rest[idx + 1..]),
                None => (rest, ""),
            };
            rest = tail;
            ns.to_string()
        } else {
            DEFAULT_NAMESPACE.to_string()
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let id = if digits > 0 {
            let parsed = rest[..digits]
                .parse::<u64>()
                .map_err(|e| RealtimeError::protocol(format!("bad ack id: {e}")))?;
            rest = &rest[digits..];
            Some(parsed)
        } else {
            None
        };

        let data: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(rest)
                    .map_err(|e| RealtimeError::protocol(format!("bad packet json: {e}")))?,
            )
        };

        match kind {
            '0' => Ok(Self::Connect { namespace, data }),
            '1' => Ok(Self::Disconnect { namespace }),
            '2' => {
                let mut args = match data {
                    Some(Value::Array(items)) => items,
                    _ => return Err(RealtimeError::protocol("event payload is not an array")),
                };
                if args.is_empty() {
                    return Err(RealtimeError::protocol("event payload has no name"));
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(RealtimeError::protocol(format!(
                            "event name is not a string: {other}"
                        )))
                    }
                };
                Ok(Self::Event {
                    namespace,
                    id,
                    name,
                    args,
                })
            }
            '3' => {
                let id = id.ok_or_else(|| RealtimeError::protocol("ack without id"))?;
                let args = match data {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                Ok(Self::Ack { namespace, id, args })
            }
            '4' => {
                // v5 sends {"message": ..., "data": ...}; v4 sent a bare string
                let (message, extra) = match data {
                    Some(Value::String(s)) => (s, None),
                    Some(Value::Object(mut obj)) => {
                        let message = obj
                            .remove("message")
                            .and_then(|m| m.as_str().map(str::to_string))
                            .unwrap_or_else(|| "connection rejected".to_string());
                        (message, obj.remove("data"))
                    }
                    _ => ("connection rejected".to_string(), None),
                };
                Ok(Self::ConnectError {
                    namespace,
                    message,
                    data: extra,
                })
            }
            other => Err(RealtimeError::protocol(format!(
                "unknown socket.io packet type '{other}'"
            ))),
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        let (kind, namespace) = match self {
            Self::Connect { namespace, .. } => ('0', namespace),
            Self::Disconnect { namespace } => ('1', namespace),
            Self::Event { namespace, .. } => ('2', namespace),
            Self::Ack { namespace, .. } => ('3', namespace),
            Self::ConnectError { namespace, .. } => ('4', namespace),
        };
        out.push(kind);
        if namespace != DEFAULT_NAMESPACE {
            out.push_str(namespace);
            out.push(',');
        }

        match self {
            Self::Connect { data, .. } => {
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
            }
            Self::Disconnect { .. } => {}
            Self::Event { id, name, args, .. } => {
                if let Some(id) = id {
                    out.push_str(&id.to_string());
                }
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                out.push_str(&Value::Array(items).to_string());
            }
            Self::Ack { id, args, .. } => {
                out.push_str(&id.to_string());
                out.push_str(&Value::Array(args.clone()).to_string());
            }
            Self::ConnectError { message, data, .. } => {
                let mut obj = serde_json::Map::new();
                obj.insert("message".into(), Value::String(message.clone()));
                if let Some(data) = data {
                    obj.insert("data".into(), data.clone());
                }
                out.push_str(&Value::Object(obj).to_string());
            }
        }

        out
    }

    /// Wrap in an Engine.IO MESSAGE frame
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

/// Collapse Socket.IO event arguments into one opaque payload:
/// none -> `null`, one -> the argument, several -> an array.
pub fn event_payload(mut args: Vec<Value>) -> Value {
    match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_open() {
        let packet = EnginePacket::decode(
            r#"0{"sid":"lv_VI97HAXpY6yYWAAAC","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .unwrap();
        match packet {
            EnginePacket::Open(open) => {
                assert_eq!(open.sid, "lv_VI97HAXpY6yYWAAAC");
                assert_eq!(open.ping_interval, 25_000);
                assert_eq!(open.ping_timeout, 20_000);
                assert_eq!(open.max_payload, Some(1_000_000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_engine_control_frames() {
        assert_eq!(EnginePacket::decode("2").unwrap(), EnginePacket::Ping(String::new()));
        assert_eq!(EnginePacket::decode("1").unwrap(), EnginePacket::Close);
        assert_eq!(EnginePacket::Pong(String::new()).encode(), "3");
        assert!(EnginePacket::decode("").is_err());
        assert!(EnginePacket::decode("9").is_err());
        assert!(EnginePacket::decode("0{not json").is_err());
    }

    #[test]
    fn test_decode_event_with_namespace_and_ack() {
        let packet = SocketPacket::decode(r#"2/admin,13["ai_progress",{"type":"step"},2]"#).unwrap();
        assert_eq!(
            packet,
            SocketPacket::Event {
                namespace: "/admin".into(),
                id: Some(13),
                name: "ai_progress".into(),
                args: vec![json!({"type": "step"}), json!(2)],
            }
        );
    }

    #[test]
    fn test_decode_connect_ack_and_error() {
        assert_eq!(
            SocketPacket::decode(r#"0{"sid":"socket-1"}"#).unwrap(),
            SocketPacket::Connect {
                namespace: "/".into(),
                data: Some(json!({"sid": "socket-1"})),
            }
        );
        assert_eq!(
            SocketPacket::decode(r#"4{"message":"Not authorized"}"#).unwrap(),
            SocketPacket::ConnectError {
                namespace: "/".into(),
                message: "Not authorized".into(),
                data: None,
            }
        );
        assert_eq!(
            SocketPacket::decode(r#"4"legacy refusal""#).unwrap(),
            SocketPacket::ConnectError {
                namespace: "/".into(),
                message: "legacy refusal".into(),
                data: None,
            }
        );
    }

    #[test]
    fn test_malformed_socket_packets() {
        assert!(SocketPacket::decode("").is_err());
        assert!(SocketPacket::decode(r#"2{"not":"array"}"#).is_err());
        assert!(SocketPacket::decode("2[]").is_err());
        assert!(SocketPacket::decode("2[42]").is_err());
        assert!(SocketPacket::decode(r#"51-["upload",{"_placeholder":true,"num":0}]"#).is_err());
    }

    #[test]
    fn test_encode_client_frames() {
        let connect = SocketPacket::Connect {
            namespace: "/".into(),
            data: Some(json!({"sid": "abc123"})),
        };
        assert_eq!(connect.to_frame(), r#"40{"sid":"abc123"}"#);

        let event = SocketPacket::Event {
            namespace: "/".into(),
            id: None,
            name: "chat".into(),
            args: vec![json!({"text": "hi"})],
        };
        assert_eq!(event.to_frame(), r#"42["chat",{"text":"hi"}]"#);

        let disconnect = SocketPacket::Disconnect {
            namespace: "/chat".into(),
        };
        assert_eq!(disconnect.to_frame(), "41/chat,");
    }

    #[test]
    fn test_event_payload_shapes() {
        assert_eq!(event_payload(vec![]), Value::Null);
        assert_eq!(event_payload(vec![json!(1)]), json!(1));
        assert_eq!(event_payload(vec![json!(1), json!("a")]), json!([1, "a"]));
    }
}
