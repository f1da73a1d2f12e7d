//! Fjall-based storage backend implementation.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence.

use std::path::Path;

use ahash::AHashSet;
use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::backend::{PersistenceOp, StorageBackend};
use super::error::{PersistenceError, Result};
use super::models::{StoredInflightRecord, StoredRetainedMessage};

/// Fjall-based storage backend
pub struct FjallBackend {
    keyspace: Keyspace,
    retained: PartitionHandle,
    inflight: PartitionHandle,
}

impl FjallBackend {
    /// Open a fjall backend at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;

        let retained = keyspace.open_partition("retained", PartitionCreateOptions::default())?;
        let inflight = keyspace.open_partition("inflight", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            retained,
            inflight,
        })
    }

    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
    }

    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(PersistenceError::from)
    }

    fn get_value<T: bincode::Decode<()>>(partition: &PartitionHandle, key: &str) -> Result<Option<T>> {
        match partition.get(key)? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_values<T: bincode::Decode<()>>(partition: &PartitionHandle) -> Result<Vec<(String, T)>> {
        let mut result = Vec::new();
        for item in partition.iter() {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
            result.push((key, Self::deserialize(&value)?));
        }
        Ok(result)
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>> {
        Self::get_value(&self.retained, topic)
    }

    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()> {
        self.retained.insert(topic, Self::serialize(message)?)?;
        Ok(())
    }

    async fn delete_retained(&self, topic: &str) -> Result<()> {
        self.retained.remove(topic)?;
        Ok(())
    }

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>> {
        Self::list_values(&self.retained)
    }

    async fn get_inflight(&self, client_id: &str) -> Result<Option<StoredInflightRecord>> {
        Self::get_value(&self.inflight, client_id)
    }

    async fn set_inflight(&self, client_id: &str, record: &StoredInflightRecord) -> Result<()> {
        self.inflight.insert(client_id, Self::serialize(record)?)?;
        Ok(())
    }

    async fn delete_inflight(&self, client_id: &str) -> Result<()> {
        self.inflight.remove(client_id)?;
        Ok(())
    }

    async fn list_inflight(&self) -> Result<Vec<(String, StoredInflightRecord)>> {
        Self::list_values(&self.inflight)
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        // Items of one batch share a seqno, so only the last op per key is kept
        let mut seen = AHashSet::with_capacity(ops.len());
        let mut latest: Vec<PersistenceOp> = Vec::with_capacity(ops.len());
        for op in ops.into_iter().rev() {
            let (partition, key) = op.key();
            if seen.insert((partition, key.to_string())) {
                latest.push(op);
            }
        }

        let mut batch = self.keyspace.batch();
        for op in latest {
            match op {
                PersistenceOp::SetRetained { topic, message } => {
                    batch.insert(&self.retained, topic, Self::serialize(&message)?);
                }
                PersistenceOp::DeleteRetained { topic } => {
                    batch.remove(&self.retained, topic);
                }
                PersistenceOp::SetInflight { client_id, record } => {
                    batch.insert(&self.inflight, client_id, Self::serialize(&record)?);
                }
                PersistenceOp::DeleteInflight { client_id } => {
                    batch.remove(&self.inflight, client_id);
                }
            }
        }

        batch.commit()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // fjall releases its resources on drop
        self.flush().await
    }
}
