//! Frame types for the Roomcast client protocol.
//!
//! A frame is one event exchanged between a client and the gateway it is
//! attached to. Frames are internally tagged by `type` so the same enum
//! serializes to JSON for text messages and to MessagePack for binary ones.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame type identifiers, used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    JoinRoom,
    LeaveRoom,
    Message,
    Delivery,
    Ack,
    Error,
    Ping,
    Pong,
    Connected,
}

impl FrameType {
    /// The wire name of this frame type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::JoinRoom => "join-room",
            FrameType::LeaveRoom => "leave-room",
            FrameType::Message => "message",
            FrameType::Delivery => "delivery",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
            FrameType::Connected => "connected",
        }
    }

    /// Whether a client is allowed to send this frame type.
    #[must_use]
    pub fn is_client_request(&self) -> bool {
        matches!(
            self,
            FrameType::JoinRoom
                | FrameType::LeaveRoom
                | FrameType::Message
                | FrameType::Ping
                | FrameType::Pong
        )
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried by [`Frame::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// The frame could not be decoded or is not a client request.
    MalformedFrame = 1001,
    /// The room name failed validation.
    InvalidRoom = 1002,
    /// `message` on a room the connection has not joined.
    NotJoined = 1003,
    /// The message exceeds the configured size limit.
    MessageTooLarge = 1004,
    /// The connection already joined the maximum number of rooms.
    RoomLimitReached = 1005,
    /// The connection is unknown to the gateway or already closed.
    UnknownConnection = 1006,
}

impl ErrorCode {
    /// Numeric wire value.
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1001 => Ok(ErrorCode::MalformedFrame),
            1002 => Ok(ErrorCode::InvalidRoom),
            1003 => Ok(ErrorCode::NotJoined),
            1004 => Ok(ErrorCode::MessageTooLarge),
            1005 => Ok(ErrorCode::RoomLimitReached),
            1006 => Ok(ErrorCode::UnknownConnection),
            _ => Err("Invalid error code"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Join a room.
    #[serde(rename = "join-room")]
    JoinRoom {
        /// Optional request ID; an `ack` is sent when present.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Room to join.
        room: String,
    },

    /// Leave a room.
    #[serde(rename = "leave-room")]
    LeaveRoom {
        /// Optional request ID; an `ack` is sent when present.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Room to leave.
        room: String,
    },

    /// Send a message to every other member of a joined room.
    #[serde(rename = "message")]
    Message {
        /// Optional request ID; an `ack` is sent when present.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Target room.
        room: String,
        /// Message text.
        message: String,
    },

    /// A message delivered to a room member, from a local or remote sender.
    #[serde(rename = "delivery")]
    Delivery {
        /// Room the message was sent to.
        room: String,
        /// Message text.
        message: String,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// First frame sent after the WebSocket upgrade.
    #[serde(rename = "connected")]
    Connected {
        /// Connection identifier assigned by the gateway.
        connection_id: String,
        /// Identity of the gateway instance the client is attached to.
        instance: String,
        /// Protocol major version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::JoinRoom { .. } => FrameType::JoinRoom,
            Frame::LeaveRoom { .. } => FrameType::LeaveRoom,
            Frame::Message { .. } => FrameType::Message,
            Frame::Delivery { .. } => FrameType::Delivery,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
        }
    }

    /// Request ID carried by a client request, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::JoinRoom { id, .. } | Frame::LeaveRoom { id, .. } | Frame::Message { id, .. } => {
                *id
            }
            _ => None,
        }
    }

    /// Create a `join-room` frame.
    #[must_use]
    pub fn join(room: impl Into<String>) -> Self {
        Frame::JoinRoom {
            id: None,
            room: room.into(),
        }
    }

    /// Create a `leave-room` frame.
    #[must_use]
    pub fn leave(room: impl Into<String>) -> Self {
        Frame::LeaveRoom {
            id: None,
            room: room.into(),
        }
    }

    /// Create a `message` frame.
    #[must_use]
    pub fn message(room: impl Into<String>, message: impl Into<String>) -> Self {
        Frame::Message {
            id: None,
            room: room.into(),
            message: message.into(),
        }
    }

    /// Create a `message` frame that asks for an acknowledgment.
    #[must_use]
    pub fn message_with_ack(id: u64, room: impl Into<String>, message: impl Into<String>) -> Self {
        Frame::Message {
            id: Some(id),
            room: room.into(),
            message: message.into(),
        }
    }

    /// Create a `delivery` frame.
    #[must_use]
    pub fn delivery(room: impl Into<String>, message: impl Into<String>) -> Self {
        Frame::Delivery {
            room: room.into(),
            message: message.into(),
        }
    }

    /// Create an Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code: code.code(),
            message: message.into(),
        }
    }

    /// Create a Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        instance: impl Into<String>,
        version: u8,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            instance: instance.into(),
            version,
            heartbeat,
        }
    }
}
