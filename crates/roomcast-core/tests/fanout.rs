//! Multi-instance fanout over a shared in-memory broker.

use roomcast_broker::{BridgeConfig, BridgeStatus, MemoryBroker, PubSubBridge};
use roomcast_core::{
    ClientSession, ConnectionGateway, Delivery, GatewayConfig, GatewayError, InstanceIdentity,
    PublishStatus,
};
use std::sync::Arc;
use std::time::Duration;

async fn instance(broker: &MemoryBroker, identity: &str) -> ConnectionGateway {
    instance_with(broker, identity, GatewayConfig::default()).await
}

async fn instance_with(
    broker: &MemoryBroker,
    identity: &str,
    config: GatewayConfig,
) -> ConnectionGateway {
    let bridge = Arc::new(PubSubBridge::new(
        Arc::new(broker.clone()),
        BridgeConfig {
            startup_attempts: 3,
            reconnect_delay: Duration::from_millis(5),
            max_reconnect_delay: Duration::from_millis(20),
            ..BridgeConfig::default()
        },
    ));
    let gateway = ConnectionGateway::new(
        bridge,
        InstanceIdentity::from_string(identity),
        config,
    );
    gateway.start().await.unwrap();
    gateway
}

async fn receive(session: &mut ClientSession) -> Delivery {
    tokio::time::timeout(Duration::from_secs(2), session.deliveries.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("delivery queue closed")
}

/// Give in-flight fanout time to land, then check nothing else arrived.
async fn assert_quiet(session: &mut ClientSession) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.deliveries.try_recv().is_err());
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_cross_instance_delivery() {
    let broker = MemoryBroker::new();
    let one = instance(&broker, "1111-1111").await;
    let two = instance(&broker, "2222-2222").await;

    let mut a = one.connect();
    let mut b = two.connect();
    one.join(a.id, "lobby").unwrap();
    two.join(b.id, "lobby").unwrap();

    let report = one.send(a.id, "lobby", "hi").await.unwrap();
    assert!(report.publish.is_published());

    assert_eq!(receive(&mut b).await, Delivery::new("lobby", "hi"));
    assert_quiet(&mut b).await;
    assert_quiet(&mut a).await;
}

#[tokio::test]
async fn test_local_delivery_survives_broker_outage() {
    let broker = MemoryBroker::new();
    let one = instance(&broker, "1111-1111").await;

    let mut a = one.connect();
    let mut c = one.connect();
    one.join(a.id, "lobby").unwrap();
    one.join(c.id, "lobby").unwrap();

    broker.set_available(false);
    let report = one.send(a.id, "lobby", "hi").await.unwrap();

    assert_eq!(report.local_recipients, 1);
    assert!(matches!(report.publish, PublishStatus::Failed { .. }));
    assert_eq!(receive(&mut c).await, Delivery::new("lobby", "hi"));
    assert_quiet(&mut c).await;
    assert_quiet(&mut a).await;
}

#[tokio::test]
async fn test_send_without_join_is_rejected() {
    let broker = MemoryBroker::new();
    let one = instance(&broker, "1111-1111").await;
    let two = instance(&broker, "2222-2222").await;

    let a = one.connect();
    let mut b = two.connect();
    two.join(b.id, "lobby").unwrap();

    let result = one.send(a.id, "lobby", "hi").await;
    assert!(matches!(result, Err(GatewayError::NotJoined(_))));
    assert_quiet(&mut b).await;
    assert_eq!(one.stats().published, 0);
}

#[tokio::test]
async fn test_own_envelopes_are_not_redelivered() {
    let broker = MemoryBroker::new();
    let one = instance(&broker, "1111-1111").await;

    let a = one.connect();
    let mut c = one.connect();
    one.join(a.id, "lobby").unwrap();
    one.join(c.id, "lobby").unwrap();

    one.send(a.id, "lobby", "hi").await.unwrap();
    assert_eq!(receive(&mut c).await, Delivery::new("lobby", "hi"));

    eventually(|| one.stats().self_filtered == 1).await;
    assert_quiet(&mut c).await;
}

#[tokio::test]
async fn test_every_instance_delivers_once() {
    let broker = MemoryBroker::new();
    let one = instance(&broker, "1111-1111").await;
    let two = instance(&broker, "2222-2222").await;
    let three = instance(&broker, "3333-3333").await;

    let a = one.connect();
    let mut a2 = one.connect();
    let mut b = two.connect();
    let mut c = three.connect();
    let mut outsider = three.connect();
    one.join(a.id, "lobby").unwrap();
    one.join(a2.id, "lobby").unwrap();
    two.join(b.id, "lobby").unwrap();
    three.join(c.id, "lobby").unwrap();
    three.join(outsider.id, "kitchen").unwrap();

    let report = one.send(a.id, "lobby", "hi").await.unwrap();
    assert_eq!(report.local_recipients, 1);
    // One pattern subscription per instance.
    assert_eq!(report.publish, PublishStatus::Published { receivers: 3 });

    for session in [&mut a2, &mut b, &mut c] {
        assert_eq!(receive(session).await, Delivery::new("lobby", "hi"));
        assert_quiet(session).await;
    }
    assert_quiet(&mut outsider).await;
}

#[tokio::test]
async fn test_room_order_is_kept_per_sender() {
    let broker = MemoryBroker::new();
    let one = instance(&broker, "1111-1111").await;
    let two = instance(&broker, "2222-2222").await;

    let a = one.connect();
    let mut b = two.connect();
    one.join(a.id, "lobby").unwrap();
    two.join(b.id, "lobby").unwrap();

    for i in 0..20 {
        one.send(a.id, "lobby", &i.to_string()).await.unwrap();
    }
    for i in 0..20 {
        assert_eq!(&*receive(&mut b).await.message, i.to_string());
    }
}

#[tokio::test]
async fn test_disconnected_client_gets_nothing() {
    let broker = MemoryBroker::new();
    let one = instance(&broker, "1111-1111").await;
    let two = instance(&broker, "2222-2222").await;

    let a = one.connect();
    let mut b = two.connect();
    one.join(a.id, "lobby").unwrap();
    two.join(b.id, "lobby").unwrap();

    assert!(two.disconnect(b.id));
    assert!(two.registry().rooms_of(b.id).is_empty());

    one.send(a.id, "lobby", "anyone?").await.unwrap();
    eventually(|| two.bridge().stats().dispatched >= 1).await;

    // The queue's sender went away with the connection.
    assert!(b.deliveries.recv().await.is_none());
    assert_eq!(two.stats().fanout_deliveries, 0);
}

#[tokio::test]
async fn test_fanout_resumes_after_broker_outage() {
    let broker = MemoryBroker::new();
    let one = instance(&broker, "1111-1111").await;
    let two = instance(&broker, "2222-2222").await;

    let a = one.connect();
    let mut b = two.connect();
    one.join(a.id, "lobby").unwrap();
    two.join(b.id, "lobby").unwrap();

    broker.set_available(false);
    eventually(|| two.bridge().status() == BridgeStatus::Reconnecting).await;

    broker.set_available(true);
    eventually(|| two.bridge().status() == BridgeStatus::Connected).await;

    one.send(a.id, "lobby", "back").await.unwrap();
    assert_eq!(receive(&mut b).await, Delivery::new("lobby", "back"));
}

#[tokio::test]
async fn test_unicode_room_crosses_instances() {
    let broker = MemoryBroker::new();
    let one = instance(&broker, "1111-1111").await;
    let two = instance(&broker, "2222-2222").await;

    let a = one.connect();
    let mut b = two.connect();
    assert!(one.join(a.id, "café").unwrap());
    assert!(two.join(b.id, "café").unwrap());

    one.send(a.id, "café", "bonjour").await.unwrap();
    assert_eq!(receive(&mut b).await, Delivery::new("café", "bonjour"));
}

#[tokio::test]
async fn test_prefix_with_glob_characters() {
    let broker = MemoryBroker::new();
    let config = || GatewayConfig {
        topic_prefix: "chat[1]:".to_string(),
        ..GatewayConfig::default()
    };
    let one = instance_with(&broker, "1111-1111", config()).await;
    let two = instance_with(&broker, "2222-2222", config()).await;

    let a = one.connect();
    let mut b = two.connect();
    one.join(a.id, "lobby").unwrap();
    two.join(b.id, "lobby").unwrap();

    let report = one.send(a.id, "lobby", "hi").await.unwrap();
    assert!(report.publish.is_published());
    assert_eq!(receive(&mut b).await, Delivery::new("lobby", "hi"));
}
