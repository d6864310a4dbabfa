//! Instance-local room membership.
//!
//! The registry maps room names to the connections on this instance that
//! joined them, and each connection to its rooms and outbound queue. It
//! never sees connections on other instances.

use dashmap::DashMap;
use roomcast_protocol::validate_room_name;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace, warn};

use crate::message::{ConnectionId, Delivery};

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The connection is not registered (never was, or disconnected).
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The connection already joined the maximum number of rooms.
    #[error("Room limit of {0} reached")]
    RoomLimitReached(usize),
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum rooms one connection may join.
    pub max_rooms_per_connection: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: 100,
            outbound_buffer: 256,
        }
    }
}

/// A live client session on this instance.
struct ClientConnection {
    rooms: HashSet<String>,
    outbox: mpsc::Sender<Delivery>,
}

/// Result of a local broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Deliveries queued.
    pub delivered: usize,
    /// Deliveries dropped because a member's queue was full or closed.
    pub dropped: usize,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Registered connections.
    pub connections: usize,
    /// Rooms with at least one member.
    pub rooms: usize,
    /// Sum of all room memberships.
    pub memberships: usize,
}

/// Room membership for one gateway instance.
///
/// Lock order is `connections` then `rooms`. Broadcast copies a room's
/// member list and releases it before touching `connections`, so no path
/// holds a `rooms` guard while acquiring a `connections` guard.
pub struct RoomRegistry {
    /// Room name -> members. A room exists only while it has members.
    rooms: DashMap<String, HashSet<ConnectionId>>,
    /// Connection -> its rooms and outbound queue.
    connections: DashMap<ConnectionId, ClientConnection>,
    next_id: AtomicU64,
    config: RegistryConfig,
}

impl RoomRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!(
            max_rooms_per_connection = config.max_rooms_per_connection,
            outbound_buffer = config.outbound_buffer,
            "Creating room registry"
        );
        Self {
            rooms: DashMap::new(),
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Register a new connection with an empty room set.
    ///
    /// Returns its id and the receiving end of its outbound queue.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<Delivery>) {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbox, deliveries) = mpsc::channel(self.config.outbound_buffer.max(1));
        self.connections.insert(
            id,
            ClientConnection {
                rooms: HashSet::new(),
                outbox,
            },
        );
        debug!(connection = %id, "Connection registered");
        (id, deliveries)
    }

    /// Remove a connection, leaving every room it joined.
    ///
    /// Returns `false` if it was not registered. No delivery reaches the
    /// connection afterwards.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let Some((_, connection)) = self.connections.remove(&id) else {
            return false;
        };
        for room in &connection.rooms {
            self.remove_member(room, id);
        }
        debug!(connection = %id, rooms = connection.rooms.len(), "Connection unregistered");
        true
    }

    /// Whether the connection is registered.
    #[must_use]
    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Add the connection to a room.
    ///
    /// Returns `true` if it was not already a member. Joining twice leaves
    /// state unchanged and never counts against the room limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown, the room name is
    /// invalid, or the connection is at its room limit.
    pub fn join(&self, id: ConnectionId, room: &str) -> Result<bool, RegistryError> {
        validate_room_name(room).map_err(RegistryError::InvalidRoom)?;

        let mut connection = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        if connection.rooms.contains(room) {
            return Ok(false);
        }
        if connection.rooms.len() >= self.config.max_rooms_per_connection {
            return Err(RegistryError::RoomLimitReached(
                self.config.max_rooms_per_connection,
            ));
        }

        connection.rooms.insert(room.to_string());
        let members = {
            let mut members = self.rooms.entry(room.to_string()).or_default();
            members.insert(id);
            members.len()
        };

        debug!(connection = %id, room = %room, members, "Joined room");
        Ok(true)
    }

    /// Remove the connection from a room.
    ///
    /// Returns `true` if it was a member. Leaving a room not joined is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub fn leave(&self, id: ConnectionId, room: &str) -> Result<bool, RegistryError> {
        let mut connection = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        if !connection.rooms.remove(room) {
            return Ok(false);
        }
        self.remove_member(room, id);

        debug!(connection = %id, room = %room, "Left room");
        Ok(true)
    }

    /// Remove the connection from every room, keeping it registered.
    ///
    /// Returns the rooms it left.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub fn leave_all(&self, id: ConnectionId) -> Result<Vec<String>, RegistryError> {
        let mut connection = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        let rooms: Vec<String> = connection.rooms.drain().collect();
        for room in &rooms {
            self.remove_member(room, id);
        }

        debug!(connection = %id, rooms = rooms.len(), "Left all rooms");
        Ok(rooms)
    }

    /// Whether the connection is a member of the room.
    #[must_use]
    pub fn is_member(&self, id: ConnectionId, room: &str) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|connection| connection.rooms.contains(room))
    }

    /// Local members of a room.
    #[must_use]
    pub fn members_of(&self, room: &str) -> HashSet<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.value().clone())
            .unwrap_or_default()
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn rooms_of(&self, id: ConnectionId) -> Vec<String> {
        self.connections
            .get(&id)
            .map(|connection| connection.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of local members in a room.
    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, |members| members.len())
    }

    /// Queue a delivery for every local member of its room, except
    /// `exclude`.
    ///
    /// Never waits: a member whose queue is full misses this delivery and
    /// the rest are unaffected.
    pub fn broadcast(&self, delivery: &Delivery, exclude: Option<ConnectionId>) -> BroadcastResult {
        let members: Vec<ConnectionId> = match self.rooms.get(&*delivery.room) {
            Some(members) => members
                .iter()
                .copied()
                .filter(|id| Some(*id) != exclude)
                .collect(),
            None => return BroadcastResult::default(),
        };

        let mut result = BroadcastResult::default();
        for id in members {
            let Some(connection) = self.connections.get(&id) else {
                continue;
            };
            match connection.outbox.try_send(delivery.clone()) {
                Ok(()) => result.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    result.dropped += 1;
                    warn!(connection = %id, room = %delivery.room, "Outbound queue full, delivery dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    result.dropped += 1;
                    debug!(connection = %id, room = %delivery.room, "Outbound queue closed");
                }
            }
        }

        trace!(
            room = %delivery.room,
            delivered = result.delivered,
            dropped = result.dropped,
            "Local broadcast"
        );
        result
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.connections.len(),
            rooms: self.rooms.len(),
            memberships: self.rooms.iter().map(|members| members.len()).sum(),
        }
    }

    fn remove_member(&self, room: &str, id: ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&id);
        }
        if self
            .rooms
            .remove_if(room, |_, members| members.is_empty())
            .is_some()
        {
            debug!(room = %room, "Room emptied");
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
