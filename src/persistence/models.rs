//! Serializable data models for persistence.
//!
//! Storage-friendly mirrors of the retained and in-flight records, encoded
//! with bincode.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use super::error::PersistenceError;
use crate::protocol::QoS;
use crate::store::{InflightRecord, RetainedMessage};

/// Stored retained message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    /// Unix timestamp in seconds when the message was stored
    pub timestamp_secs: u64,
}

/// Stored in-flight delivery
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredInflightRecord {
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub packet_id: u16,
    /// Unix timestamp in seconds when the delivery was attempted
    pub sent_at_secs: u64,
}

/// Everything restored at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub retained: Vec<(String, StoredRetainedMessage)>,
    pub inflight: Vec<(String, StoredInflightRecord)>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn qos_from_stored(qos: u8) -> Result<QoS, PersistenceError> {
    QoS::from_u8(qos).ok_or_else(|| PersistenceError::Corrupt(format!("invalid qos {}", qos)))
}

impl From<&RetainedMessage> for StoredRetainedMessage {
    fn from(msg: &RetainedMessage) -> Self {
        Self {
            topic: msg.topic.to_string(),
            payload: msg.payload.to_vec(),
            qos: msg.qos as u8,
            timestamp_secs: now_secs(),
        }
    }
}

impl TryFrom<StoredRetainedMessage> for RetainedMessage {
    type Error = PersistenceError;

    fn try_from(stored: StoredRetainedMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            topic: Arc::from(stored.topic),
            qos: qos_from_stored(stored.qos)?,
            payload: Bytes::from(stored.payload),
        })
    }
}

impl From<&InflightRecord> for StoredInflightRecord {
    fn from(record: &InflightRecord) -> Self {
        Self {
            client_id: record.client_id.to_string(),
            topic: record.topic.to_string(),
            payload: record.payload.to_vec(),
            qos: record.qos as u8,
            packet_id: record.packet_id,
            sent_at_secs: now_secs(),
        }
    }
}

impl TryFrom<StoredInflightRecord> for InflightRecord {
    type Error = PersistenceError;

    fn try_from(stored: StoredInflightRecord) -> Result<Self, Self::Error> {
        let qos = qos_from_stored(stored.qos)?;
        if qos == QoS::AtMostOnce || stored.packet_id == 0 {
            return Err(PersistenceError::Corrupt(format!(
                "in-flight record for {} has qos {} and packet id {}",
                stored.client_id, stored.qos, stored.packet_id
            )));
        }

        Ok(Self {
            client_id: Arc::from(stored.client_id),
            topic: Arc::from(stored.topic),
            qos,
            payload: Bytes::from(stored.payload),
            packet_id: stored.packet_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_retained_conversion() {
        let msg = RetainedMessage {
            topic: "sensors/temp".into(),
            qos: QoS::AtLeastOnce,
            payload: Bytes::from_static(b"21C"),
        };

        let stored = StoredRetainedMessage::from(&msg);
        assert_eq!(stored.qos, 1);
        assert_eq!(RetainedMessage::try_from(stored).unwrap(), msg);
    }

    #[test]
    fn test_corrupt_inflight_rejected() {
        let stored = StoredInflightRecord {
            client_id: "dev-A".into(),
            topic: "t".into(),
            payload: vec![],
            qos: 0,
            packet_id: 4,
            sent_at_secs: 0,
        };
        assert!(matches!(
            InflightRecord::try_from(stored),
            Err(PersistenceError::Corrupt(_))
        ));
    }
}
