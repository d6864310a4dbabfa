//! Shared setup for Roomcast benchmarks.

use roomcast_broker::{BridgeConfig, MemoryBroker, PubSubBridge};
use roomcast_core::{ClientSession, ConnectionGateway, GatewayConfig, InstanceIdentity};
use std::sync::Arc;

/// Start a gateway instance on a shared in-memory broker.
///
/// # Panics
///
/// Panics if the gateway cannot subscribe.
pub async fn start_instance(broker: &MemoryBroker, identity: &str) -> Arc<ConnectionGateway> {
    let bridge = Arc::new(PubSubBridge::new(
        Arc::new(broker.clone()),
        BridgeConfig::default(),
    ));
    let gateway = ConnectionGateway::new(
        bridge,
        InstanceIdentity::from_string(identity),
        GatewayConfig::default(),
    );
    gateway
        .start()
        .await
        .unwrap_or_else(|e| panic!("gateway {identity} failed to start: {e}"));
    Arc::new(gateway)
}

/// Connect `count` clients to `room`.
///
/// # Panics
///
/// Panics if a join is rejected.
pub fn join_clients(gateway: &ConnectionGateway, room: &str, count: usize) -> Vec<ClientSession> {
    (0..count)
        .map(|_| {
            let session = gateway.connect();
            gateway
                .join(session.id, room)
                .unwrap_or_else(|e| panic!("join {room} failed: {e}"));
            session
        })
        .collect()
}

/// Drain every queued delivery, returning how many there were.
pub fn drain(sessions: &mut [ClientSession]) -> usize {
    let mut received = 0;
    for session in sessions {
        while session.deliveries.try_recv().is_ok() {
            received += 1;
        }
    }
    received
}
