//! Retained-message and in-flight stores
//!
//! Both stores are keyed maps with per-key atomic updates and no cross-key
//! transactions. The in-memory implementations can write through to a
//! [`PersistenceManager`](crate::persistence::PersistenceManager).

mod inflight;
mod retained;

pub use inflight::InflightMessages;
pub use retained::RetainedMessages;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::persistence::PersistenceError;
use crate::protocol::QoS;

/// Last retained publish for a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub qos: QoS,
    pub payload: Bytes,
}

/// Most recent unacknowledged QoS 1/2 delivery to a client
///
/// Presence means the PUBLISH was handed to the connection but no PUBACK or
/// PUBCOMP has been seen for `packet_id` yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightRecord {
    pub client_id: Arc<str>,
    pub topic: Arc<str>,
    pub qos: QoS,
    pub payload: Bytes,
    pub packet_id: u16,
}

/// Error from a store operation
#[derive(Debug)]
pub enum StoreError {
    /// Write-through to durable storage failed
    Persistence(PersistenceError),
    /// Store cannot serve requests
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persistence(e) => write!(f, "persistence error: {}", e),
            Self::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Persistence(e) => Some(e),
            Self::Unavailable(_) => None,
        }
    }
}

impl From<PersistenceError> for StoreError {
    fn from(e: PersistenceError) -> Self {
        StoreError::Persistence(e)
    }
}

/// Topic -> last retained message
pub trait RetainedStore: Send + Sync {
    /// Unconditional overwrite
    fn put(&self, topic: &str, message: RetainedMessage) -> Result<(), StoreError>;

    /// Idempotent delete; removing an absent topic is not an error
    fn remove(&self, topic: &str) -> Result<(), StoreError>;

    fn get(&self, topic: &str) -> Result<Option<RetainedMessage>, StoreError>;

    /// Every retained message whose topic matches `filter`
    fn matching(&self, filter: &str) -> Result<Vec<RetainedMessage>, StoreError>;
}

/// Client id -> single in-flight record
pub trait InflightStore: Send + Sync {
    /// Upsert; replaces any previous record for the client
    fn put(&self, client_id: &str, record: InflightRecord) -> Result<(), StoreError>;

    fn get(&self, client_id: &str) -> Result<Option<InflightRecord>, StoreError>;

    /// Remove the client's record if it was sent with `packet_id`
    fn acknowledge(&self, client_id: &str, packet_id: u16) -> Result<bool, StoreError>;

    /// Remove the client's record regardless of packet id
    fn remove(&self, client_id: &str) -> Result<(), StoreError>;
}
