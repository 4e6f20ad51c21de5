//! SignalR JSON hub protocol: record framing, handshake and message codec.

use lchat_core::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminates every JSON record on the wire.
pub const RECORD_SEPARATOR: char = '\u{1e}';

pub const PROTOCOL_NAME: &str = "json";
pub const PROTOCOL_VERSION: u32 = 1;

const INVOCATION: u8 = 1;
const PING: u8 = 6;
const CLOSE: u8 = 7;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message type {kind} missing field `{field}`")]
    MissingField { kind: u8, field: &'static str },
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("incomplete record")]
    Incomplete,
}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::HandshakeRejected(reason) => TransportError::Handshake(reason),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

/// A decoded hub message. Only the kinds a chat client acts on get their
/// own variant.
#[derive(Clone, Debug, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream items, completions and other kinds this client ignores.
    Other(u8),
}

impl HubMessage {
    /// Fire-and-forget invocation (no invocation id, no completion expected).
    pub fn invocation(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self::Invocation {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

#[derive(Serialize)]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u32,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

/// The framed handshake request the client sends first.
pub fn handshake_request() -> String {
    let body = serde_json::to_string(&HandshakeRequest {
        protocol: PROTOCOL_NAME,
        version: PROTOCOL_VERSION,
    })
    .unwrap_or_default();
    frame(body)
}

/// Parse the handshake response at the start of `text`. Returns whatever
/// follows it, since the server may batch messages after the response.
pub fn parse_handshake_response(text: &str) -> Result<&str, ProtocolError> {
    let (record, rest) = text.split_once(RECORD_SEPARATOR).ok_or(ProtocolError::Incomplete)?;
    let response: HandshakeResponse = serde_json::from_str(record)?;
    match response.error {
        Some(error) => Err(ProtocolError::HandshakeRejected(error)),
        None => Ok(rest),
    }
}

/// Encode one message as a framed record.
pub fn encode(message: &HubMessage) -> Result<String, ProtocolError> {
    let raw = match message {
        HubMessage::Invocation {
            invocation_id,
            target,
            arguments,
        } => RawMessage {
            kind: INVOCATION,
            invocation_id: invocation_id.clone(),
            target: Some(target.clone()),
            arguments: Some(arguments.clone()),
            ..Default::default()
        },
        HubMessage::Ping => RawMessage {
            kind: PING,
            ..Default::default()
        },
        HubMessage::Close {
            error,
            allow_reconnect,
        } => RawMessage {
            kind: CLOSE,
            error: error.clone(),
            allow_reconnect: allow_reconnect.then_some(true),
            ..Default::default()
        },
        HubMessage::Other(kind) => RawMessage {
            kind: *kind,
            ..Default::default()
        },
    };
    Ok(frame(serde_json::to_string(&raw)?))
}

/// Decode every complete record in a text frame.
pub fn decode(text: &str) -> impl Iterator<Item = Result<HubMessage, ProtocolError>> + '_ {
    text.split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
        .map(decode_record)
}

fn decode_record(record: &str) -> Result<HubMessage, ProtocolError> {
    let raw: RawMessage = serde_json::from_str(record)?;
    match raw.kind {
        INVOCATION => Ok(HubMessage::Invocation {
            invocation_id: raw.invocation_id,
            target: raw.target.ok_or(ProtocolError::MissingField {
                kind: INVOCATION,
                field: "target",
            })?,
            arguments: raw.arguments.unwrap_or_default(),
        }),
        PING => Ok(HubMessage::Ping),
        CLOSE => Ok(HubMessage::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect.unwrap_or(false),
        }),
        other => Ok(HubMessage::Other(other)),
    }
}

fn frame(mut body: String) -> String {
    body.push(RECORD_SEPARATOR);
    body
}
