//! Storage backend trait for persistence.

use async_trait::async_trait;

use super::error::Result;
use super::models::{LoadedData, StoredInflightRecord, StoredRetainedMessage};

/// Persistence operation for batch writes
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    /// Set a retained message
    SetRetained {
        topic: String,
        message: StoredRetainedMessage,
    },
    /// Delete a retained message
    DeleteRetained { topic: String },
    /// Set a client's in-flight record
    SetInflight {
        client_id: String,
        record: StoredInflightRecord,
    },
    /// Delete a client's in-flight record
    DeleteInflight { client_id: String },
}

impl PersistenceOp {
    /// Partition and key the operation writes to
    pub fn key(&self) -> (&'static str, &str) {
        match self {
            Self::SetRetained { topic, .. } | Self::DeleteRetained { topic } => ("retained", topic),
            Self::SetInflight { client_id, .. } | Self::DeleteInflight { client_id } => {
                ("inflight", client_id)
            }
        }
    }
}

/// Storage backend trait for persistence
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Retained messages
    // ========================================================================

    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetainedMessage>>;

    async fn set_retained(&self, topic: &str, message: &StoredRetainedMessage) -> Result<()>;

    async fn delete_retained(&self, topic: &str) -> Result<()>;

    async fn list_retained(&self) -> Result<Vec<(String, StoredRetainedMessage)>>;

    // ========================================================================
    // In-flight records
    // ========================================================================

    async fn get_inflight(&self, client_id: &str) -> Result<Option<StoredInflightRecord>>;

    async fn set_inflight(&self, client_id: &str, record: &StoredInflightRecord) -> Result<()>;

    async fn delete_inflight(&self, client_id: &str) -> Result<()>;

    async fn list_inflight(&self) -> Result<Vec<(String, StoredInflightRecord)>>;

    // ========================================================================
    // Batch operations
    // ========================================================================

    /// Execute a batch of operations atomically
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flush all pending writes to disk
    async fn flush(&self) -> Result<()>;

    /// Close the backend (flush and release resources)
    async fn close(&self) -> Result<()>;

    /// Load all data at startup
    async fn load_all(&self) -> Result<LoadedData> {
        Ok(LoadedData {
            retained: self.list_retained().await?,
            inflight: self.list_inflight().await?,
        })
    }
}
