//! Live client connections
//!
//! The publish engine never touches sockets. It writes packets through the
//! [`ClientConnection`] handle registered for each connected client and asks
//! the [`SessionDirectory`] whether a subscriber is currently reachable.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::protocol::{EncodeError, Packet};

/// Error when writing to a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Connection is closed
    Closed,
    /// Encoded packet exceeds the connection's maximum packet size
    PacketTooLarge(usize),
    /// Encoding error
    Encode(EncodeError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::PacketTooLarge(len) => write!(f, "packet of {} bytes exceeds limit", len),
            Self::Encode(e) => write!(f, "encode error: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

impl From<EncodeError> for SendError {
    fn from(e: EncodeError) -> Self {
        SendError::Encode(e)
    }
}

/// Outbound half of a client connection
///
/// `write` queues the packet for the connection task and returns without
/// waiting for the socket. Failures reported here are connection-layer events.
pub trait ClientConnection: Send + Sync {
    fn client_id(&self) -> &str;

    fn write(&self, packet: Packet) -> Result<(), SendError>;

    fn is_alive(&self) -> bool;

    /// Ask the connection task to shut down
    fn close(&self);
}

/// Resolves a client identifier to its live connection
///
/// `get` after a positive `is_connected` may still race with a disconnect.
pub trait SessionDirectory: Send + Sync {
    fn is_connected(&self, client_id: &str) -> bool;

    fn get(&self, client_id: &str) -> Option<Arc<dyn ClientConnection>>;
}

struct SessionEntry {
    /// Distinguishes a connection from the one that took over its client id
    connection_id: u64,
    connection: Arc<dyn ClientConnection>,
}

/// Registry of connected clients
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<Arc<str>, SessionEntry>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the connection it replaces
    pub fn register(
        &self,
        client_id: Arc<str>,
        connection_id: u64,
        connection: Arc<dyn ClientConnection>,
    ) -> Option<Arc<dyn ClientConnection>> {
        self.sessions
            .insert(
                client_id,
                SessionEntry {
                    connection_id,
                    connection,
                },
            )
            .map(|previous| previous.connection)
    }

    /// Remove a client, unless another connection has taken over its id
    pub fn unregister(&self, client_id: &str, connection_id: u64) -> bool {
        self.sessions
            .remove_if(client_id, |_, entry| entry.connection_id == connection_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionDirectory for SessionStore {
    fn is_connected(&self, client_id: &str) -> bool {
        self.sessions
            .get(client_id)
            .is_some_and(|entry| entry.connection.is_alive())
    }

    fn get(&self, client_id: &str) -> Option<Arc<dyn ClientConnection>> {
        self.sessions
            .get(client_id)
            .map(|entry| entry.connection.clone())
    }
}
