// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Socket.IO v4 framing over a websocket text channel.
//!
//! Every websocket text message carries one Engine.IO packet, identified by its
//! first character. Engine.IO `message` packets (`4`) wrap a Socket.IO packet
//! whose type is the second character:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,"pingTimeout":20000}   engine open
//! 2 / 3                                                    engine ping / pong
//! 40{"apiKey":".."}                                        socket connect (with auth)
//! 44{"message":"not authorized"}                           socket connect error
//! 42["customMetrics",[...]]                                socket event
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

pub const PONG: &str = "3";
pub const DISCONNECT: &str = "41";

const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;

/// Parameters announced by the server in the Engine.IO open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}

fn default_ping_timeout() -> u64 {
    DEFAULT_PING_TIMEOUT_MS
}

impl Handshake {
    /// Longest silence tolerated before the session is considered dead.
    pub fn liveness_window(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Noop,
    Connected { sid: Option<String> },
    ConnectError(String),
    Disconnect,
    Event { name: String, payload: Value },
    Ack,
}

pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(ProtocolError::Empty)?;
    let rest = chars.as_str();
    match kind {
        '0' => serde_json::from_str(rest)
            .map(Frame::Open)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string())),
        '1' => Ok(Frame::Close),
        '2' => Ok(Frame::Ping),
        '3' => Ok(Frame::Pong),
        '4' => decode_socket_packet(rest),
        '5' | '6' => Ok(Frame::Noop),
        other => Err(ProtocolError::UnknownEnginePacket(other)),
    }
}

fn decode_socket_packet(text: &str) -> Result<Frame, ProtocolError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(ProtocolError::Empty)?;
    let body = strip_ack_id(strip_namespace(chars.as_str()));
    match kind {
        '0' => {
            let sid = if body.is_empty() {
                None
            } else {
                parse_json(body)?
                    .get("sid")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            Ok(Frame::Connected { sid })
        }
        '1' => Ok(Frame::Disconnect),
        '2' | '5' => {
            let value = parse_json(body)?;
            let mut items = match value {
                Value::Array(items) => items.into_iter(),
                _ => {
                    return Err(ProtocolError::InvalidPayload(
                        "event payload is not an array".to_string(),
                    ))
                }
            };
            let name = match items.next() {
                Some(Value::String(name)) => name,
                _ => {
                    return Err(ProtocolError::InvalidPayload(
                        "event name missing".to_string(),
                    ))
                }
            };
            Ok(Frame::Event {
                name,
                payload: items.next().unwrap_or(Value::Null),
            })
        }
        '3' | '6' => Ok(Frame::Ack),
        '4' => {
            let message = match parse_json(body) {
                Ok(Value::Object(map)) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                Ok(Value::String(message)) => message,
                _ => body.to_string(),
            };
            Ok(Frame::ConnectError(message))
        }
        other => Err(ProtocolError::UnknownSocketPacket(other)),
    }
}

// Packets for a non-default namespace look like `2/admin,["event"]`.
fn strip_namespace(text: &str) -> &str {
    if text.starts_with('/') {
        return text.split_once(',').map_or("", |(_, rest)| rest);
    }
    text
}

fn strip_ack_id(text: &str) -> &str {
    text.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn parse_json(text: &str) -> Result<Value, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}

/// Socket.IO CONNECT for the default namespace, carrying the auth payload.
pub fn connect_packet<T: Serialize>(auth: &T) -> Result<String, serde_json::Error> {
    Ok(format!("40{}", serde_json::to_string(auth)?))
}

pub fn event_packet(name: &str, payload: &Value) -> Result<String, serde_json::Error> {
    Ok(format!("42{}", serde_json::to_string(&(name, payload))?))
}

/// Builds the websocket endpoint for a collector base url such as `https://log.example.com:3006`.
pub fn endpoint_url(server: &str) -> String {
    let server = server.trim_end_matches('/');
    let server = if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_string()
    } else {
        format!("ws://{server}")
    };
    format!("{server}/socket.io/?EIO=4&transport=websocket")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_open_packet() {
        let frame =
            decode(r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":5000}"#)
                .unwrap();
        let Frame::Open(handshake) = frame else {
            panic!("expected open frame");
        };
        assert_eq!(handshake.sid, "abc");
        assert_eq!(
            handshake.liveness_window(),
            std::time::Duration::from_millis(30_000)
        );
    }

    #[test]
    fn decodes_connect_ack_and_error() {
        assert_eq!(
            decode(r#"40{"sid":"xyz"}"#).unwrap(),
            Frame::Connected {
                sid: Some("xyz".to_string())
            }
        );
        assert_eq!(decode("40").unwrap(), Frame::Connected { sid: None });
        assert_eq!(
            decode(r#"44{"message":"invalid api key"}"#).unwrap(),
            Frame::ConnectError("invalid api key".to_string())
        );
    }

    #[test]
    fn decodes_events_with_namespace_and_ack_id() {
        assert_eq!(
            decode(r#"42["hello",{"a":1}]"#).unwrap(),
            Frame::Event {
                name: "hello".to_string(),
                payload: json!({"a": 1})
            }
        );
        assert_eq!(
            decode(r#"42/admin,7["hello"]"#).unwrap(),
            Frame::Event {
                name: "hello".to_string(),
                payload: Value::Null
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(decode(""), Err(ProtocolError::Empty));
        assert_eq!(decode("9"), Err(ProtocolError::UnknownEnginePacket('9')));
        assert!(matches!(
            decode("42{}"),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn encodes_outbound_packets() {
        assert_eq!(
            event_packet("customMetrics", &json!([{"metric": "a"}])).unwrap(),
            r#"42["customMetrics",[{"metric":"a"}]]"#
        );
        assert_eq!(
            connect_packet(&json!({"apiKey": "k"})).unwrap(),
            r#"40{"apiKey":"k"}"#
        );
    }

    #[test]
    fn builds_endpoint_url() {
        assert_eq!(
            endpoint_url("https://log.example.com:3006/"),
            "wss://log.example.com:3006/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            endpoint_url("127.0.0.1:9000"),
            "ws://127.0.0.1:9000/socket.io/?EIO=4&transport=websocket"
        );
    }
}
