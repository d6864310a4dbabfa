//! Messages handed to client connections.

use std::sync::Arc;

/// Connection identifier, unique within one gateway instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A message queued for one client: the room is the event name.
///
/// Room and text are shared so a broadcast to N members copies two
/// pointers per member, not the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Room the message was sent to.
    pub room: Arc<str>,
    /// Message text.
    pub message: Arc<str>,
}

impl Delivery {
    /// Create a delivery.
    #[must_use]
    pub fn new(room: &str, message: &str) -> Self {
        Self {
            room: Arc::from(room),
            message: Arc::from(message),
        }
    }

    /// Size of the message text in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.message.len()
    }

    /// Whether the message text is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
    }
}
