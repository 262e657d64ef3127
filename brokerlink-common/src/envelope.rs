use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

use crate::error::Error;

/// Broker protocol spoken by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    /// Topic-exchange broker protocol (AMQP 0-9-1).
    Exchange,
    /// Lightweight publish/subscribe protocol (MQTT 3.1.1).
    PubSub,
}

impl Protocol {
    /// All supported protocols.
    pub const ALL: [Protocol; 2] = [Protocol::Exchange, Protocol::PubSub];

    /// Get the tag used on the wire and in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Exchange => "amqp",
            Protocol::PubSub => "mqtt",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amqp" | "exchange" => Ok(Protocol::Exchange),
            "mqtt" | "pubsub" => Ok(Protocol::PubSub),
            _ => Err(Error::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl Serialize for Protocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Side of a protocol connection.
///
/// Anything that is not recognisably `client` normalises to `Host`, including
/// an absent value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// Publishing side.
    #[default]
    Host,
    /// Subscribing side.
    Client,
}

impl Role {
    /// Both roles, host first.
    pub const ALL: [Role; 2] = [Role::Host, Role::Client];

    /// Normalise free-form role input.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw {
            Some(s) if s.trim().eq_ignore_ascii_case("client") => Role::Client,
            _ => Role::Host,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Client => "client",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        Role::normalize(Some(s))
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(Role::normalize(raw.as_deref()))
    }
}

/// Structured message record carried as JSON by publishers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(default)]
    pub id: i64,

    #[serde(default)]
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageRecord {
    /// Create a record stamped with the current time.
    pub fn new(id: i64, content: impl Into<String>) -> Self {
        Self {
            id,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }

    /// Parse a record from JSON text.
    ///
    /// Only a JSON object is a record. Arrays, scalars and `null` are rejected
    /// even though the derived deserializer would map some of them onto the
    /// fields.
    pub fn from_json(text: &str) -> crate::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(Error::Json(<serde_json::Error as serde::de::Error>::custom(
                "expected a JSON object",
            )));
        }
        serde_json::from_value(value).map_err(Error::from)
    }
}

/// A received message waiting to be drained by the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    protocol: Protocol,
    content: String,
    timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Create an envelope stamped with the current time.
    pub fn new(protocol: Protocol, content: impl Into<String>) -> Self {
        Self::with_timestamp(protocol, content, Utc::now())
    }

    pub fn with_timestamp(
        protocol: Protocol,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            protocol,
            content: content.into(),
            timestamp,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Arrival time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Decode the content as a structured [`MessageRecord`].
    pub fn decode_record(&self) -> crate::Result<MessageRecord> {
        MessageRecord::from_json(&self.content)
    }
}
