//! # roomcast-broker
//!
//! Publish/subscribe plumbing between Roomcast gateway instances.
//!
//! - **Broker** - the seam to a message broker: a publisher half and a
//!   subscription half, kept on separate connections because a connection
//!   in subscribe mode cannot issue other commands
//! - **RedisBroker** - Redis `PUBLISH` / `SUBSCRIBE` / `PSUBSCRIBE`
//! - **MemoryBroker** - in-process broker with the same semantics
//! - **PubSubBridge** - owns both halves for one instance, runs the
//!   dispatcher task and reconnects after broker outages
//!
//! ```rust,ignore
//! use roomcast_broker::{open, BridgeConfig, PubSubBridge};
//!
//! let bridge = PubSubBridge::new(open("redis://127.0.0.1:6379")?, BridgeConfig::default());
//! bridge.start().await?;
//! bridge.publish("room:lobby", payload).await?;
//! ```

pub mod bridge;
pub mod memory;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;

pub use bridge::{
    BridgeConfig, BridgeError, BridgeStats, BridgeStatus, HandlerError, MessageHandler,
    PubSubBridge, Subscription,
};
pub use memory::MemoryBroker;
pub use traits::{Broker, BrokerError, BrokerMessage, MessageStream, Publisher, SubscriptionSink};

#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// Open a broker from a URL.
///
/// `memory://` gives a process-local broker (single-node mode);
/// `redis://` and `rediss://` give a Redis broker.
///
/// # Errors
///
/// Returns an error if the scheme is unsupported or the URL is invalid.
pub fn open(url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme);
    match scheme {
        Some("memory") => Ok(Arc::new(MemoryBroker::new())),
        #[cfg(feature = "redis")]
        Some("redis" | "rediss") => Ok(Arc::new(RedisBroker::open(url)?)),
        _ => Err(BrokerError::InvalidUrl(url.to_string())),
    }
}
