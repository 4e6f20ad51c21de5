use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Origin/category of a chat message.
///
/// Serialized as the integer ordinal the hub uses on the wire
/// (`none=0 … log=5`). Deserialization also accepts the lowercase name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MessageKind {
    #[default]
    None,
    Llm,
    /// Originated locally and sent to the hub.
    Client,
    Meta,
    /// Synthesized locally to report a connection or send failure.
    Error,
    Log,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        Self::None,
        Self::Llm,
        Self::Client,
        Self::Meta,
        Self::Error,
        Self::Log,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Llm => 1,
            Self::Client => 2,
            Self::Meta => 3,
            Self::Error => 4,
            Self::Log => 5,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Llm => "llm",
            Self::Client => "client",
            Self::Meta => "meta",
            Self::Error => "error",
            Self::Log => "log",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KindVisitor;

        impl Visitor<'_> for KindVisitor {
            type Value = MessageKind;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a message kind ordinal (0-5) or name")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                u8::try_from(v)
                    .ok()
                    .and_then(MessageKind::from_u8)
                    .ok_or_else(|| E::custom(format!("unknown message kind {v}")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom(format!("unknown message kind {v}")))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                MessageKind::from_name(v)
                    .ok_or_else(|| E::custom(format!("unknown message kind {v:?}")))
            }
        }

        deserializer.deserialize_any(KindVisitor)
    }
}

/// A chat message, either delivered by the hub or constructed locally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(with = "wire_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Outbound message typed by the local user.
    pub fn client(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Client, content)
    }

    /// Locally synthesized failure notice. Never originates from the hub.
    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, content)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }
}

/// ISO-8601 timestamps. Offset-less values (as emitted for unspecified
/// .NET `DateTime`s) are read as UTC.
mod wire_timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        raw.parse::<NaiveDateTime>()
            .map(|naive| naive.and_utc())
            .map_err(|e| de::Error::custom(format!("invalid timestamp {raw:?}: {e}")))
    }
}
