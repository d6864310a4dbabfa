//! Redis broker.
//!
//! Publishing goes through a multiplexed connection; subscriptions use a
//! dedicated pub/sub connection split into its command sink and message
//! stream, since Redis refuses `PUBLISH` on a connection in subscribe mode.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink};
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::traits::{
    Broker, BrokerError, BrokerMessage, MessageStream, Publisher, SubscriptionSink,
};

/// Broker backed by a Redis server.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
}

impl RedisBroker {
    /// Create a broker for a `redis://` or `rediss://` URL.
    ///
    /// No connection is made until a publisher or subscriber is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed.
    pub fn open(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect_publisher(&self) -> Result<Box<dyn Publisher>, BrokerError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        info!("Redis publish connection established");
        Ok(Box::new(RedisPublisher { conn }))
    }

    async fn connect_subscriber(
        &self,
    ) -> Result<(Box<dyn SubscriptionSink>, MessageStream), BrokerError> {
        let pubsub = self.client.get_async_pubsub().await?;
        let (sink, stream) = pubsub.split();
        info!("Redis subscribe connection established");

        let stream: MessageStream = stream
            .map(|msg| {
                let pattern = if msg.from_pattern() {
                    msg.get_pattern::<String>().ok()
                } else {
                    None
                };
                Ok::<_, BrokerError>(BrokerMessage {
                    topic: msg.get_channel_name().to_string(),
                    pattern,
                    payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
                })
            })
            .boxed();

        let sink: Box<dyn SubscriptionSink> = Box::new(RedisSink { sink });
        Ok((sink, stream))
    }
}

struct RedisPublisher {
    conn: MultiplexedConnection,
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BrokerError> {
        // Multiplexed connections are cheap handles onto one socket.
        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(topic, &payload[..]).await?;
        Ok(receivers)
    }
}

struct RedisSink {
    sink: PubSubSink,
}

#[async_trait]
impl SubscriptionSink for RedisSink {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.sink.subscribe(topic).await?;
        debug!(topic = %topic, "SUBSCRIBE");
        Ok(())
    }

    async fn psubscribe(&mut self, pattern: &str) -> Result<(), BrokerError> {
        self.sink.psubscribe(pattern).await?;
        debug!(pattern = %pattern, "PSUBSCRIBE");
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.sink.unsubscribe(topic).await?;
        debug!(topic = %topic, "UNSUBSCRIBE");
        Ok(())
    }

    async fn punsubscribe(&mut self, pattern: &str) -> Result<(), BrokerError> {
        self.sink.punsubscribe(pattern).await?;
        debug!(pattern = %pattern, "PUNSUBSCRIBE");
        Ok(())
    }
}
