//! Durable storage for retained messages and in-flight deliveries.
//!
//! The in-memory stores stay authoritative at runtime. Every mutation is also
//! handed to a [`PersistenceManager`], whose background task batches the
//! operations into a [`StorageBackend`]. At startup the stores are rebuilt
//! from [`StorageBackend::load_all`].

mod backend;
mod error;
mod fjall;
mod models;

pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use models::{LoadedData, StoredInflightRecord, StoredRetainedMessage};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 10_000;

/// Persistence manager that handles background writes
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    shutdown_tx: mpsc::Sender<()>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    /// Create a new persistence manager with the given backend
    ///
    /// This spawns a background task that batches and commits writes.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let writer = tokio::spawn(Self::writer_loop(
            backend.clone(),
            rx,
            shutdown_rx,
            flush_interval,
            max_batch_size.max(1),
        ));

        Self {
            backend,
            tx,
            shutdown_tx,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Fire-and-forget write operation (non-blocking for hot path)
    ///
    /// A full channel drops the operation with a warning. A stopped writer is
    /// reported as [`PersistenceError::WriterClosed`].
    pub fn write(&self, op: PersistenceOp) -> Result<()> {
        match self.tx.try_send(op) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(op)) => {
                warn!("Persistence channel full, dropping operation: {:?}", op);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(PersistenceError::WriterClosed),
        }
    }

    /// Load all data at startup
    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    /// Gracefully shutdown the persistence manager
    ///
    /// Waits for the writer to commit what it has queued, then flushes and
    /// closes the backend.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down persistence manager");

        let _ = self.shutdown_tx.send(()).await;

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("Persistence writer task failed: {}", e);
            }
        }

        self.backend.close().await?;

        info!("Persistence manager shutdown complete");
        Ok(())
    }

    async fn flush_batch(backend: &Arc<dyn StorageBackend>, batch: &mut Vec<PersistenceOp>, why: &str) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        match backend.batch_write(std::mem::take(batch)).await {
            Ok(()) => debug!("Flushed {} operations ({})", count, why),
            Err(e) => error!("Failed to write batch of {} ({}): {}", count, why, e),
        }
    }

    /// Background writer loop that batches and commits writes
    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<PersistenceOp>,
        mut shutdown_rx: mpsc::Receiver<()>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut batch = Vec::with_capacity(max_batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                op = rx.recv() => {
                    match op {
                        Some(op) => {
                            batch.push(op);
                            if batch.len() >= max_batch_size {
                                Self::flush_batch(&backend, &mut batch, "max batch").await;
                            }
                        }
                        None => {
                            Self::flush_batch(&backend, &mut batch, "channel closed").await;
                            break;
                        }
                    }
                }

                _ = interval.tick() => {
                    Self::flush_batch(&backend, &mut batch, "interval").await;
                }

                _ = shutdown_rx.recv() => {
                    info!("Persistence writer received shutdown signal");
                    // Drain whatever was queued before the signal
                    while let Ok(op) = rx.try_recv() {
                        batch.push(op);
                    }
                    Self::flush_batch(&backend, &mut batch, "shutdown").await;
                    break;
                }
            }
        }

        info!("Persistence writer loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn retained(topic: &str, payload: &[u8]) -> StoredRetainedMessage {
        StoredRetainedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: 1,
            timestamp_secs: 0,
        }
    }

    fn inflight(client_id: &str, packet_id: u16) -> StoredInflightRecord {
        StoredInflightRecord {
            client_id: client_id.to_string(),
            topic: "sensors/temp".to_string(),
            payload: b"21C".to_vec(),
            qos: 1,
            packet_id,
            sent_at_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_fjall_retained_operations() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();

        backend
            .set_retained("test/topic", &retained("test/topic", &[1, 2, 3]))
            .await
            .unwrap();

        let found = backend.get_retained("test/topic").await.unwrap().unwrap();
        assert_eq!(found.payload, vec![1, 2, 3]);

        backend.delete_retained("test/topic").await.unwrap();
        assert!(backend.get_retained("test/topic").await.unwrap().is_none());

        // Deleting again is a no-op
        backend.delete_retained("test/topic").await.unwrap();
    }

    #[tokio::test]
    async fn test_fjall_inflight_overwrite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();

        backend.set_inflight("dev-A", &inflight("dev-A", 1)).await.unwrap();
        backend.set_inflight("dev-A", &inflight("dev-A", 2)).await.unwrap();

        let all = backend.list_inflight().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1.packet_id, 2);
    }

    #[tokio::test]
    async fn test_fjall_batch_last_op_per_key_wins() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();

        backend
            .batch_write(vec![
                PersistenceOp::SetRetained {
                    topic: "t".to_string(),
                    message: retained("t", b"P1"),
                },
                PersistenceOp::DeleteRetained {
                    topic: "t".to_string(),
                },
                PersistenceOp::SetRetained {
                    topic: "t".to_string(),
                    message: retained("t", b"P2"),
                },
                PersistenceOp::SetInflight {
                    client_id: "dev-A".to_string(),
                    record: inflight("dev-A", 1),
                },
                PersistenceOp::DeleteInflight {
                    client_id: "dev-A".to_string(),
                },
            ])
            .await
            .unwrap();

        let found = backend.get_retained("t").await.unwrap().unwrap();
        assert_eq!(found.payload, b"P2".to_vec());
        assert!(backend.list_inflight().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fjall_batch_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(temp_dir.path()).unwrap();

        backend
            .batch_write(vec![
                PersistenceOp::SetRetained {
                    topic: "topic1".to_string(),
                    message: retained("topic1", b"a"),
                },
                PersistenceOp::SetRetained {
                    topic: "topic2".to_string(),
                    message: retained("topic2", b"b"),
                },
                PersistenceOp::DeleteRetained {
                    topic: "topic1".to_string(),
                },
                PersistenceOp::SetInflight {
                    client_id: "dev-A".to_string(),
                    record: inflight("dev-A", 9),
                },
            ])
            .await
            .unwrap();

        let loaded = backend.load_all().await.unwrap();
        assert_eq!(loaded.retained.len(), 1);
        assert_eq!(loaded.retained[0].0, "topic2");
        assert_eq!(loaded.inflight.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_flushes_on_shutdown() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FjallBackend::open(temp_dir.path()).unwrap());
        let manager = PersistenceManager::new(backend.clone(), Duration::from_secs(3600), 1000);

        manager
            .write(PersistenceOp::SetRetained {
                topic: "cmd".to_string(),
                message: retained("cmd", b"on"),
            })
            .unwrap();
        manager.shutdown().await.unwrap();

        assert!(backend.get_retained("cmd").await.unwrap().is_some());
        assert!(matches!(
            manager.write(PersistenceOp::DeleteRetained {
                topic: "cmd".to_string()
            }),
            Err(PersistenceError::WriterClosed)
        ));
    }
}
