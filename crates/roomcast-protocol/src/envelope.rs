//! The cross-instance envelope and its broker topics.
//!
//! A gateway wraps every client message in a [`MessageEnvelope`] and
//! publishes it on the room's topic. Peer gateways receive it through a
//! single pattern subscription, validate it, and deliver it locally unless
//! they are the origin.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::room::validate_room_name;
use crate::version::PROTOCOL_VERSION;

/// Default prefix for room topics (`room:<name>`).
pub const DEFAULT_TOPIC_PREFIX: &str = "room:";

/// Errors raised while encoding or validating an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The payload is not a JSON envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The envelope parsed but breaks a rule.
    #[error("Invalid envelope: {0}")]
    Invalid(String),

    /// The envelope was produced by an incompatible protocol version.
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    /// Serialization failed.
    #[error("Envelope encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
}

impl EnvelopeError {
    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopeError::Malformed(_) => "malformed",
            EnvelopeError::Invalid(_) => "invalid",
            EnvelopeError::UnsupportedVersion(_) => "version",
            EnvelopeError::Encode(_) => "encode",
        }
    }
}

fn default_version() -> u8 {
    PROTOCOL_VERSION.major
}

/// The unit exchanged between gateway instances.
///
/// Serialized as `{"v":1,"message":"...","room":"...","originId":"...."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Protocol major version. Absent on the wire means the current one.
    #[serde(default = "default_version")]
    pub v: u8,
    /// Message text.
    pub message: String,
    /// Room the message was sent to.
    pub room: String,
    /// Identity of the publishing gateway instance.
    pub origin_id: String,
}

impl MessageEnvelope {
    /// Create an envelope for the current protocol version.
    #[must_use]
    pub fn new(
        message: impl Into<String>,
        room: impl Into<String>,
        origin_id: impl Into<String>,
    ) -> Self {
        Self {
            v: PROTOCOL_VERSION.major,
            message: message.into(),
            room: room.into(),
            origin_id: origin_id.into(),
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(EnvelopeError::Encode)
    }

    /// Parse and validate an envelope received from the broker.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] for unparsable payloads and
    /// [`EnvelopeError::Invalid`] or [`EnvelopeError::UnsupportedVersion`]
    /// for envelopes that parse but must not be delivered.
    pub fn decode(payload: &[u8], max_message_size: usize) -> Result<Self, EnvelopeError> {
        let envelope: MessageEnvelope =
            serde_json::from_slice(payload).map_err(EnvelopeError::Malformed)?;
        envelope.validate(max_message_size)?;
        Ok(envelope)
    }

    /// Check the envelope's fields.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first rule the envelope breaks.
    pub fn validate(&self, max_message_size: usize) -> Result<(), EnvelopeError> {
        if !PROTOCOL_VERSION.accepts_major(self.v) {
            return Err(EnvelopeError::UnsupportedVersion(self.v));
        }
        validate_room_name(&self.room).map_err(|e| EnvelopeError::Invalid(e.to_string()))?;
        if self.origin_id.is_empty() {
            return Err(EnvelopeError::Invalid("originId cannot be empty".to_string()));
        }
        if self.message.len() > max_message_size {
            return Err(EnvelopeError::Invalid(format!(
                "message of {} bytes exceeds {max_message_size}",
                self.message.len()
            )));
        }
        Ok(())
    }

    /// Check that the envelope arrived on its own room's topic.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Invalid`] when the topic is outside the
    /// scheme or names a different room.
    pub fn check_topic(&self, scheme: &TopicScheme, topic: &str) -> Result<(), EnvelopeError> {
        match scheme.room_from_topic(topic) {
            Some(room) if room == self.room => Ok(()),
            Some(room) => Err(EnvelopeError::Invalid(format!(
                "envelope for room '{}' arrived on room '{room}'",
                self.room
            ))),
            None => Err(EnvelopeError::Invalid(format!(
                "topic '{topic}' is not a room topic"
            ))),
        }
    }
}

/// Maps room names to broker topics and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    prefix: String,
}

impl TopicScheme {
    /// Create a scheme with a custom prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The topic prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Topic a room's messages are published on.
    #[must_use]
    pub fn topic_for(&self, room: &str) -> String {
        format!("{}{}", self.prefix, room)
    }

    /// Pattern matching every room topic.
    ///
    /// Glob metacharacters in the prefix are escaped so they match
    /// literally.
    #[must_use]
    pub fn pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.prefix.len() + 1);
        for c in self.prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }

    /// Extract the room name from a topic.
    #[must_use]
    pub fn room_from_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.prefix.as_str())
            .filter(|room| !room.is_empty())
    }
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 64 * 1024;

    #[test]
    fn test_wire_field_names() {
        let envelope = MessageEnvelope::new("hi", "lobby", "1234-5678");
        let json: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(json["message"], "hi");
        assert_eq!(json["room"], "lobby");
        assert_eq!(json["originId"], "1234-5678");
        assert_eq!(json["v"], 1);
    }

    #[test]
    fn test_decode_without_version() {
        let payload = br#"{"message":"hi","room":"lobby","originId":"42"}"#;
        let envelope = MessageEnvelope::decode(payload, MAX).unwrap();
        assert_eq!(envelope.v, 1);
        assert_eq!(envelope.origin_id, "42");
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            MessageEnvelope::decode(b"{not json", MAX),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            MessageEnvelope::decode(br#"{"message":1,"room":"lobby","originId":"x"}"#, MAX),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            MessageEnvelope::decode(br#"{"room":"lobby","originId":"x"}"#, MAX),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_invalid() {
        let err = MessageEnvelope::decode(br#"{"message":"m","room":"","originId":"x"}"#, MAX)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");

        let err = MessageEnvelope::decode(br#"{"message":"m","room":"a","originId":""}"#, MAX)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");

        let err = MessageEnvelope::decode(br#"{"message":"toolong","room":"a","originId":"x"}"#, 3)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");

        let err =
            MessageEnvelope::decode(br#"{"v":2,"message":"m","room":"a","originId":"x"}"#, MAX)
                .unwrap_err();
        assert!(matches!(err, EnvelopeError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_topic_scheme() {
        let scheme = TopicScheme::default();
        assert_eq!(scheme.topic_for("lobby"), "room:lobby");
        assert_eq!(scheme.pattern(), "room:*");
        assert_eq!(scheme.room_from_topic("room:lobby"), Some("lobby"));
        assert_eq!(scheme.room_from_topic("room:"), None);
        assert_eq!(scheme.room_from_topic("notifications"), None);
    }

    #[test]
    fn test_pattern_escapes_prefix() {
        assert_eq!(TopicScheme::new("chat[1]:").pattern(), r"chat\[1\]:*");
        assert_eq!(TopicScheme::new("a*b?").pattern(), r"a\*b\?*");
        assert_eq!(TopicScheme::new(r"x\y").pattern(), r"x\\y*");
    }

    #[test]
    fn test_check_topic() {
        let scheme = TopicScheme::default();
        let envelope = MessageEnvelope::new("hi", "lobby", "1");
        assert!(envelope.check_topic(&scheme, "room:lobby").is_ok());
        assert!(envelope.check_topic(&scheme, "room:other").is_err());
        assert!(envelope.check_topic(&scheme, "lobby").is_err());
    }
}
