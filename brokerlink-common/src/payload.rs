//! Payload encoding for outbound messages and decoding of inbound deliveries.

use crate::envelope::MessageRecord;
use crate::error::{Error, Result};

/// MIME type advertised on published payloads.
pub const CONTENT_TYPE: &str = "application/json";

/// How an outbound message string was interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// The message parsed as a [`MessageRecord`] and was re-serialised.
    Record(MessageRecord),
    /// The message is sent verbatim.
    Text(String),
}

impl Payload {
    /// Interpret a message string.
    ///
    /// JSON objects that parse as a [`MessageRecord`] are kept as typed
    /// records so the published bytes are canonical. Anything else, including
    /// JSON arrays and `null`, is opaque text.
    pub fn parse(message: &str) -> Self {
        match MessageRecord::from_json(message) {
            Ok(record) => Payload::Record(record),
            Err(_) => Payload::Text(message.to_string()),
        }
    }

    /// Encode to the bytes put on the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Payload::Record(record) => serde_json::to_vec(record).map_err(Error::from),
            Payload::Text(text) => Ok(text.as_bytes().to_vec()),
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self, Payload::Record(_))
    }
}

/// Encode a message string following the publish payload policy.
pub fn encode_message(message: &str) -> Result<Vec<u8>> {
    Payload::parse(message).encode()
}

/// Decode an inbound delivery body as text.
///
/// Returns `None` for bodies that are not valid UTF-8.
pub fn decode_text(body: &[u8]) -> Option<String> {
    std::str::from_utf8(body).ok().map(str::to_string)
}
