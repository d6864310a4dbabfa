//! # roomcast-protocol
//!
//! Wire formats for the Roomcast room-messaging gateway.
//!
//! Two formats live here:
//!
//! - **Frames** - what clients and a gateway exchange over a WebSocket
//!   (`join-room`, `leave-room`, `message`, `delivery`, ...)
//! - **Envelopes** - what gateway instances exchange through the broker so
//!   that a message sent on one instance reaches room members on all others
//!
//! ## Example
//!
//! ```rust
//! use roomcast_protocol::{codec, Frame};
//!
//! let frame = Frame::message("lobby", "hi");
//! let text = codec::encode_text(&frame).unwrap();
//! assert_eq!(codec::decode_text(&text).unwrap(), frame);
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;
pub mod room;
pub mod version;

pub use codec::{decode, encode, ProtocolError, WireFormat};
pub use envelope::{EnvelopeError, MessageEnvelope, TopicScheme, DEFAULT_TOPIC_PREFIX};
pub use frames::{ErrorCode, Frame, FrameType};
pub use room::{validate_room_name, MAX_ROOM_NAME_LENGTH};
pub use version::{Version, PROTOCOL_VERSION};
