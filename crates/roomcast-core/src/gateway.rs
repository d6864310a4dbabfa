//! The connection gateway.
//!
//! Handles client events for one instance: membership changes go to the
//! [`RoomRegistry`], a send is broadcast locally and then published as a
//! [`MessageEnvelope`] so peer instances can deliver it to their own
//! members. Envelopes from peers arrive through one pattern subscription
//! and are broadcast locally unless this instance published them.

use async_trait::async_trait;
use roomcast_broker::{BridgeError, BrokerMessage, HandlerError, MessageHandler, PubSubBridge};
use roomcast_protocol::{
    validate_room_name, EnvelopeError, ErrorCode, MessageEnvelope, TopicScheme,
    DEFAULT_TOPIC_PREFIX,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::identity::InstanceIdentity;
use crate::message::{ConnectionId, Delivery};
use crate::registry::{RegistryConfig, RegistryError, RegistryStats, RoomRegistry};

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The connection is not registered (never was, or disconnected).
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Invalid room name.
    #[error("Invalid room name '{room}': {reason}")]
    InvalidRoom { room: String, reason: &'static str },

    /// Send on a room the connection has not joined.
    #[error("Not joined to room: {0}")]
    NotJoined(String),

    /// Message over the size limit.
    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// The connection already joined the maximum number of rooms.
    #[error("Room limit of {0} reached")]
    RoomLimitReached(usize),

    /// The pub/sub bridge failed.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl GatewayError {
    /// Client-facing error code, for errors a client request can cause.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            GatewayError::UnknownConnection(_) => Some(ErrorCode::UnknownConnection),
            GatewayError::InvalidRoom { .. } => Some(ErrorCode::InvalidRoom),
            GatewayError::NotJoined(_) => Some(ErrorCode::NotJoined),
            GatewayError::MessageTooLarge { .. } => Some(ErrorCode::MessageTooLarge),
            GatewayError::RoomLimitReached(_) => Some(ErrorCode::RoomLimitReached),
            GatewayError::Bridge(_) => None,
        }
    }

    fn from_registry(room: &str, error: RegistryError) -> Self {
        match error {
            RegistryError::UnknownConnection(id) => GatewayError::UnknownConnection(id),
            RegistryError::InvalidRoom(reason) => GatewayError::InvalidRoom {
                room: room.to_string(),
                reason,
            },
            RegistryError::RoomLimitReached(limit) => GatewayError::RoomLimitReached(limit),
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Prefix of room topics; the fanout pattern is `<prefix>*`.
    pub topic_prefix: String,
    /// Largest accepted message, in bytes. Applies to sends and envelopes.
    pub max_message_size: usize,
    /// Registry limits.
    pub registry: RegistryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            max_message_size: 64 * 1024,
            registry: RegistryConfig::default(),
        }
    }
}

/// A connected client's handle.
#[derive(Debug)]
pub struct ClientSession {
    /// Connection id for subsequent calls.
    pub id: ConnectionId,
    /// Deliveries for this client, from local broadcast and fanout alike.
    pub deliveries: mpsc::Receiver<Delivery>,
}

/// Outcome of the publish half of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    /// The broker accepted the envelope.
    Published {
        /// Subscriptions the broker delivered it to.
        receivers: usize,
    },
    /// The publish failed. Local delivery already happened.
    Failed {
        /// Why.
        reason: String,
    },
}

impl PublishStatus {
    /// Whether the broker accepted the envelope.
    #[must_use]
    pub fn is_published(&self) -> bool {
        matches!(self, PublishStatus::Published { .. })
    }
}

/// What a send did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Local members the message was queued for.
    pub local_recipients: usize,
    /// Local members whose queue was full.
    pub dropped: usize,
    /// The publish half.
    pub publish: PublishStatus,
}

/// What happened to an envelope received from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutOutcome {
    /// Published by this instance; its members already have it.
    SelfOriginated,
    /// Broadcast to local members.
    Delivered {
        /// Local members the message was queued for.
        recipients: usize,
    },
}

/// Envelopes dropped on receive, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejectedEnvelopes {
    /// Not a JSON envelope.
    pub malformed: u64,
    /// Parsed but broke a rule.
    pub invalid: u64,
    /// Incompatible protocol version.
    pub version: u64,
}

/// Gateway statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    /// Membership counts.
    pub registry: RegistryStats,
    /// Accepted sends.
    pub messages_sent: u64,
    /// Deliveries queued by local broadcast.
    pub local_deliveries: u64,
    /// Deliveries queued from peer envelopes.
    pub fanout_deliveries: u64,
    /// Deliveries dropped on full queues.
    pub dropped_deliveries: u64,
    /// Envelopes the broker accepted.
    pub published: u64,
    /// Envelopes that failed to publish.
    pub publish_failures: u64,
    /// Own envelopes discarded on receive.
    pub self_filtered: u64,
    /// Envelopes dropped on receive.
    pub rejected: RejectedEnvelopes,
}

#[derive(Debug, Default)]
struct Counters {
    messages_sent: AtomicU64,
    local_deliveries: AtomicU64,
    fanout_deliveries: AtomicU64,
    dropped_deliveries: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    self_filtered: AtomicU64,
    rejected_malformed: AtomicU64,
    rejected_invalid: AtomicU64,
    rejected_version: AtomicU64,
}

fn bump(counter: &AtomicU64, by: usize) {
    counter.fetch_add(by as u64, Ordering::Relaxed);
}

/// Inbound half: turns peer envelopes into local deliveries.
///
/// Holds the registry rather than the gateway, so the bridge's handler map
/// does not keep the gateway alive.
struct Fanout {
    identity: InstanceIdentity,
    registry: Arc<RoomRegistry>,
    topics: TopicScheme,
    max_message_size: usize,
    counters: Arc<Counters>,
}

impl Fanout {
    fn deliver(&self, envelope: &MessageEnvelope) -> FanoutOutcome {
        if self.identity.is_origin_of(&envelope.origin_id) {
            bump(&self.counters.self_filtered, 1);
            trace!(room = %envelope.room, "Discarding own envelope");
            return FanoutOutcome::SelfOriginated;
        }

        let delivery = Delivery::new(&envelope.room, &envelope.message);
        let result = self.registry.broadcast(&delivery, None);
        bump(&self.counters.fanout_deliveries, result.delivered);
        bump(&self.counters.dropped_deliveries, result.dropped);

        trace!(
            room = %envelope.room,
            origin = %envelope.origin_id,
            recipients = result.delivered,
            "Fanout delivered"
        );
        FanoutOutcome::Delivered {
            recipients: result.delivered,
        }
    }

    fn reject(&self, topic: &str, error: &EnvelopeError) {
        let counter = match error {
            EnvelopeError::Malformed(_) | EnvelopeError::Encode(_) => {
                &self.counters.rejected_malformed
            }
            EnvelopeError::Invalid(_) => &self.counters.rejected_invalid,
            EnvelopeError::UnsupportedVersion(_) => &self.counters.rejected_version,
        };
        bump(counter, 1);
        warn!(topic = %topic, reason = error.kind(), error = %error, "Dropping envelope");
    }
}

#[async_trait]
impl MessageHandler for Fanout {
    async fn handle(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let envelope = MessageEnvelope::decode(&message.payload, self.max_message_size)
            .and_then(|envelope| {
                envelope.check_topic(&self.topics, &message.topic)?;
                Ok(envelope)
            });

        match envelope {
            Ok(envelope) => {
                self.deliver(&envelope);
            }
            // Recoverable: drop it and keep consuming.
            Err(e) => self.reject(&message.topic, &e),
        }
        Ok(())
    }
}

/// Client-facing gateway for one instance.
pub struct ConnectionGateway {
    identity: InstanceIdentity,
    registry: Arc<RoomRegistry>,
    bridge: Arc<PubSubBridge>,
    topics: TopicScheme,
    config: GatewayConfig,
    fanout: Arc<Fanout>,
    counters: Arc<Counters>,
}

impl ConnectionGateway {
    /// Create a gateway publishing through `bridge` under `identity`.
    #[must_use]
    pub fn new(bridge: Arc<PubSubBridge>, identity: InstanceIdentity, config: GatewayConfig) -> Self {
        let registry = Arc::new(RoomRegistry::with_config(config.registry.clone()));
        let topics = TopicScheme::new(config.topic_prefix.clone());
        let counters = Arc::new(Counters::default());
        let fanout = Arc::new(Fanout {
            identity: identity.clone(),
            registry: Arc::clone(&registry),
            topics: topics.clone(),
            max_message_size: config.max_message_size,
            counters: Arc::clone(&counters),
        });

        Self {
            identity,
            registry,
            bridge,
            topics,
            config,
            fanout,
            counters,
        }
    }

    /// This instance's identity.
    #[must_use]
    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    /// The local room registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// The pub/sub bridge.
    #[must_use]
    pub fn bridge(&self) -> &Arc<PubSubBridge> {
        &self.bridge
    }

    /// Topic naming in use.
    #[must_use]
    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Start the bridge and register the fanout pattern subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker stays unreachable through the
    /// bridge's startup attempts.
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.bridge.start().await?;

        let pattern = self.topics.pattern();
        let handler: Arc<dyn MessageHandler> = self.fanout.clone();
        self.bridge.subscribe_pattern(pattern.as_str(), handler).await?;

        info!(
            instance = %self.identity,
            pattern = %pattern,
            broker = self.bridge.broker_name(),
            "Gateway started"
        );
        Ok(())
    }

    /// Register a new client connection.
    pub fn connect(&self) -> ClientSession {
        let (id, deliveries) = self.registry.register();
        ClientSession { id, deliveries }
    }

    /// Join a room. Returns `false` if already joined.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown, the room name is
    /// invalid, or the room limit is reached.
    pub fn join(&self, id: ConnectionId, room: &str) -> Result<bool, GatewayError> {
        self.registry
            .join(id, room)
            .map_err(|e| GatewayError::from_registry(room, e))
    }

    /// Leave a room. Returns `false` if not joined.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub fn leave(&self, id: ConnectionId, room: &str) -> Result<bool, GatewayError> {
        self.registry
            .leave(id, room)
            .map_err(|e| GatewayError::from_registry(room, e))
    }

    /// Send a message to a joined room.
    ///
    /// The message is queued for every other local member first, then
    /// published for peer instances. A publish failure is reported in the
    /// [`SendReport`] and does not undo the local delivery.
    ///
    /// # Errors
    ///
    /// Rejects the send, delivering nothing, if the connection is unknown,
    /// the room name is invalid, the message is too large, or the
    /// connection has not joined the room.
    pub async fn send(
        &self,
        id: ConnectionId,
        room: &str,
        message: &str,
    ) -> Result<SendReport, GatewayError> {
        if !self.registry.is_registered(id) {
            return Err(GatewayError::UnknownConnection(id));
        }
        validate_room_name(room).map_err(|reason| GatewayError::InvalidRoom {
            room: room.to_string(),
            reason,
        })?;
        if message.len() > self.config.max_message_size {
            return Err(GatewayError::MessageTooLarge {
                size: message.len(),
                limit: self.config.max_message_size,
            });
        }
        if !self.registry.is_member(id, room) {
            return Err(GatewayError::NotJoined(room.to_string()));
        }

        bump(&self.counters.messages_sent, 1);

        let local = self.registry.broadcast(&Delivery::new(room, message), Some(id));
        bump(&self.counters.local_deliveries, local.delivered);
        bump(&self.counters.dropped_deliveries, local.dropped);

        let publish = self.publish(room, message).await;

        debug!(
            connection = %id,
            room = %room,
            local = local.delivered,
            published = publish.is_published(),
            "Message sent"
        );
        Ok(SendReport {
            local_recipients: local.delivered,
            dropped: local.dropped,
            publish,
        })
    }

    /// Drop a connection and all its memberships.
    ///
    /// Returns `false` if it was not connected.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.registry.unregister(id)
    }

    /// Deliver a validated envelope from the broker to local members.
    pub fn deliver_fanout(&self, envelope: &MessageEnvelope) -> FanoutOutcome {
        self.fanout.deliver(envelope)
    }

    /// Get gateway statistics.
    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let counters = &self.counters;
        GatewayStats {
            registry: self.registry.stats(),
            messages_sent: load(&counters.messages_sent),
            local_deliveries: load(&counters.local_deliveries),
            fanout_deliveries: load(&counters.fanout_deliveries),
            dropped_deliveries: load(&counters.dropped_deliveries),
            published: load(&counters.published),
            publish_failures: load(&counters.publish_failures),
            self_filtered: load(&counters.self_filtered),
            rejected: RejectedEnvelopes {
                malformed: load(&counters.rejected_malformed),
                invalid: load(&counters.rejected_invalid),
                version: load(&counters.rejected_version),
            },
        }
    }

    /// Shut the bridge down. Connected clients stay registered.
    pub async fn shutdown(&self) {
        self.bridge.shutdown().await;
        info!(instance = %self.identity, "Gateway stopped");
    }

    async fn publish(&self, room: &str, message: &str) -> PublishStatus {
        let envelope = MessageEnvelope::new(message, room, self.identity.as_str());
        let topic = self.topics.topic_for(room);

        let result = match envelope.encode() {
            Ok(payload) => self
                .bridge
                .publish(&topic, payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(receivers) => {
                bump(&self.counters.published, 1);
                PublishStatus::Published { receivers }
            }
            Err(reason) => {
                bump(&self.counters.publish_failures, 1);
                warn!(room = %room, topic = %topic, error = %reason, "Publish failed, delivered locally only");
                PublishStatus::Failed { reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use roomcast_broker::{BridgeConfig, MemoryBroker};
    use std::time::Duration;

    fn gateway(broker: &MemoryBroker, identity: &str) -> ConnectionGateway {
        let bridge = Arc::new(PubSubBridge::new(
            Arc::new(broker.clone()),
            BridgeConfig {
                startup_attempts: 1,
                reconnect_delay: Duration::from_millis(5),
                ..BridgeConfig::default()
            },
        ));
        ConnectionGateway::new(
            bridge,
            InstanceIdentity::from_string(identity),
            GatewayConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_send_requires_join() {
        let broker = MemoryBroker::new();
        let gateway = gateway(&broker, "1111-1111");
        let a = gateway.connect();
        let mut b = gateway.connect();
        gateway.join(b.id, "lobby").unwrap();

        let err = gateway.send(a.id, "lobby", "hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotJoined(ref room) if room == "lobby"));
        assert_eq!(err.error_code(), Some(ErrorCode::NotJoined));
        assert!(b.deliveries.try_recv().is_err());
        assert_eq!(gateway.stats().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_send_validation() {
        let broker = MemoryBroker::new();
        let gateway = gateway(&broker, "1111-1111");
        let a = gateway.connect();
        gateway.join(a.id, "lobby").unwrap();

        assert!(matches!(
            gateway.send(a.id, "", "hi").await,
            Err(GatewayError::InvalidRoom { .. })
        ));
        let big = "x".repeat(64 * 1024 + 1);
        assert!(matches!(
            gateway.send(a.id, "lobby", &big).await,
            Err(GatewayError::MessageTooLarge { limit: 65536, .. })
        ));
        assert!(matches!(
            gateway.send(ConnectionId::new(999), "lobby", "hi").await,
            Err(GatewayError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_send_publishes_envelope() {
        let broker = MemoryBroker::new();
        let gateway = gateway(&broker, "1111-1111");
        gateway.start().await.unwrap();

        let a = gateway.connect();
        gateway.join(a.id, "lobby").unwrap();

        let report = gateway.send(a.id, "lobby", "hi").await.unwrap();
        assert_eq!(report.local_recipients, 0);
        // Our own pattern subscription is the one receiver.
        assert_eq!(report.publish, PublishStatus::Published { receivers: 1 });
        assert_eq!(gateway.stats().published, 1);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_local_delivery() {
        let broker = MemoryBroker::new();
        let gateway = gateway(&broker, "1111-1111");
        let a = gateway.connect();
        let mut c = gateway.connect();
        gateway.join(a.id, "lobby").unwrap();
        gateway.join(c.id, "lobby").unwrap();

        broker.set_available(false);
        let report = gateway.send(a.id, "lobby", "hi").await.unwrap();

        assert_eq!(report.local_recipients, 1);
        assert!(matches!(report.publish, PublishStatus::Failed { .. }));
        assert_eq!(&*c.deliveries.try_recv().unwrap().message, "hi");
        assert_eq!(gateway.stats().publish_failures, 1);
    }

    #[test]
    fn test_deliver_fanout_self_filter() {
        let broker = MemoryBroker::new();
        let gateway = gateway(&broker, "1111-1111");
        let mut a = gateway.connect();
        gateway.join(a.id, "lobby").unwrap();

        let own = MessageEnvelope::new("echo", "lobby", "1111-1111");
        assert_eq!(gateway.deliver_fanout(&own), FanoutOutcome::SelfOriginated);
        assert!(a.deliveries.try_recv().is_err());

        let peer = MessageEnvelope::new("hello", "lobby", "2222-2222");
        assert_eq!(
            gateway.deliver_fanout(&peer),
            FanoutOutcome::Delivered { recipients: 1 }
        );
        assert_eq!(a.deliveries.try_recv().unwrap(), Delivery::new("lobby", "hello"));
        assert_eq!(gateway.stats().self_filtered, 1);
    }

    #[tokio::test]
    async fn test_bad_envelopes_are_dropped() {
        let broker = MemoryBroker::new();
        let gateway = gateway(&broker, "1111-1111");
        let mut a = gateway.connect();
        gateway.join(a.id, "lobby").unwrap();

        let handler = Arc::clone(&gateway.fanout);
        let bad = [
            BrokerMessage::matched("room:*", "room:lobby", Bytes::from_static(b"not json")),
            BrokerMessage::matched(
                "room:*",
                "room:lobby",
                Bytes::from_static(br#"{"message":"x","room":"other","originId":"2"}"#),
            ),
            BrokerMessage::matched(
                "room:*",
                "room:lobby",
                Bytes::from_static(br#"{"v":9,"message":"x","room":"lobby","originId":"2"}"#),
            ),
        ];
        for message in &bad {
            handler.handle(message).await.unwrap();
        }

        let good = BrokerMessage::matched(
            "room:*",
            "room:lobby",
            Bytes::from_static(br#"{"message":"ok","room":"lobby","originId":"2"}"#),
        );
        handler.handle(&good).await.unwrap();

        assert_eq!(&*a.deliveries.try_recv().unwrap().message, "ok");
        assert!(a.deliveries.try_recv().is_err());
        assert_eq!(
            gateway.stats().rejected,
            RejectedEnvelopes {
                malformed: 1,
                invalid: 1,
                version: 1
            }
        );
    }

    #[test]
    fn test_disconnect() {
        let broker = MemoryBroker::new();
        let gateway = gateway(&broker, "1111-1111");
        let a = gateway.connect();
        gateway.join(a.id, "lobby").unwrap();

        assert!(gateway.disconnect(a.id));
        assert!(!gateway.disconnect(a.id));
        assert_eq!(gateway.stats().registry.memberships, 0);
        assert!(matches!(
            gateway.join(a.id, "lobby"),
            Err(GatewayError::UnknownConnection(_))
        ));
    }
}
