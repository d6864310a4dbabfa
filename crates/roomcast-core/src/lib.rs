//! # roomcast-core
//!
//! Room messaging for one Roomcast gateway instance.
//!
//! - **InstanceIdentity** - per-process token that breaks fanout loops
//! - **RoomRegistry** - instance-local room membership and local broadcast
//! - **ConnectionGateway** - client events, publish to peers, and delivery
//!   of peer envelopes
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐   ┌───────────────────┐   publish    ┌──────────────┐
//! │ Client │──▶│ ConnectionGateway │─────────────▶│ PubSubBridge │──▶ broker
//! └────────┘   └───────────────────┘              └──────────────┘
//!                  │          ▲      room:* fanout        │
//!                  ▼          └───────────────────────────┘
//!            ┌──────────────┐
//!            │ RoomRegistry │──▶ local members
//!            └──────────────┘
//! ```

pub mod gateway;
pub mod identity;
pub mod message;
pub mod registry;

pub use gateway::{
    ClientSession, ConnectionGateway, FanoutOutcome, GatewayConfig, GatewayError, GatewayStats,
    PublishStatus, RejectedEnvelopes, SendReport,
};
pub use identity::InstanceIdentity;
pub use message::{ConnectionId, Delivery};
pub use registry::{
    BroadcastResult, RegistryConfig, RegistryError, RegistryStats, RoomRegistry,
};
