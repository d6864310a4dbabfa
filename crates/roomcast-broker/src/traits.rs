//! Broker abstraction traits for Roomcast.
//!
//! A broker hands out two independent connections: a [`Publisher`] and a
//! subscription pair ([`SubscriptionSink`] + [`MessageStream`]). The bridge
//! never issues publish commands on the subscription connection.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// A message received through a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    /// Raw payload.
    pub payload: Bytes,
}

impl BrokerMessage {
    /// Create a message delivered through an exact subscription.
    #[must_use]
    pub fn exact(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            pattern: None,
            payload: payload.into(),
        }
    }

    /// Create a message delivered through a pattern subscription.
    #[must_use]
    pub fn matched(
        pattern: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            pattern: Some(pattern.into()),
            payload: payload.into(),
        }
    }
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker cannot be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A connect or publish took longer than allowed.
    #[error("Broker operation timed out")]
    Timeout,

    /// A subscription pattern could not be compiled.
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// The broker URL is not supported.
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    /// Redis error.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Stream of messages from a subscription connection.
///
/// The stream ending (or yielding an error) means the connection is gone.
pub type MessageStream = BoxStream<'static, Result<BrokerMessage, BrokerError>>;

/// A message broker that can open publish and subscribe connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Broker name (e.g., "redis", "memory").
    fn name(&self) -> &'static str;

    /// Open a connection used only for publishing.
    async fn connect_publisher(&self) -> Result<Box<dyn Publisher>, BrokerError>;

    /// Open a connection used only for subscriptions.
    async fn connect_subscriber(
        &self,
    ) -> Result<(Box<dyn SubscriptionSink>, MessageStream), BrokerError>;
}

/// The publishing half.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a payload on a topic.
    ///
    /// Returns the number of subscriptions the broker delivered it to. This
    /// acknowledges broker receipt only, not subscriber processing.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BrokerError>;
}

/// The control side of a subscription connection.
#[async_trait]
pub trait SubscriptionSink: Send {
    /// Subscribe to an exact topic.
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Subscribe to a glob pattern.
    async fn psubscribe(&mut self, pattern: &str) -> Result<(), BrokerError>;

    /// Drop an exact subscription.
    async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Drop a pattern subscription.
    async fn punsubscribe(&mut self, pattern: &str) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = BrokerMessage::exact("room:lobby", &b"hi"[..]);
        assert!(msg.pattern.is_none());

        let msg = BrokerMessage::matched("room:*", "room:lobby", &b"hi"[..]);
        assert_eq!(msg.pattern.as_deref(), Some("room:*"));
        assert_eq!(msg.topic, "room:lobby");
    }
}
