use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::warn;

use super::{InflightRecord, InflightStore, StoreError};
use crate::persistence::{PersistenceManager, PersistenceOp, StoredInflightRecord};

/// In-memory in-flight store with optional write-through
///
/// Holds a single record per client: a newer QoS 1/2 delivery replaces the
/// resend state of the previous one.
#[derive(Default)]
pub struct InflightMessages {
    records: DashMap<Arc<str>, InflightRecord>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl InflightMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persistence(persistence: Arc<PersistenceManager>) -> Self {
        Self {
            records: DashMap::new(),
            persistence: Some(persistence),
        }
    }

    /// Load records read back from storage, skipping unreadable ones
    pub fn restore(&self, stored: Vec<(String, StoredInflightRecord)>) -> usize {
        let mut restored = 0;
        for (client_id, record) in stored {
            match InflightRecord::try_from(record) {
                Ok(record) => {
                    self.records.insert(Arc::from(client_id), record);
                    restored += 1;
                }
                Err(e) => warn!("Skipping in-flight record for {}: {}", client_id, e),
            }
        }
        restored
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn persist(&self, op: PersistenceOp) -> Result<(), StoreError> {
        match self.persistence {
            Some(ref persistence) => persistence.write(op).map_err(StoreError::from),
            None => Ok(()),
        }
    }
}

impl InflightStore for InflightMessages {
    // Each mutation queues its op under the entry guard so that disk order
    // follows memory order per client.
    fn put(&self, client_id: &str, record: InflightRecord) -> Result<(), StoreError> {
        let op = PersistenceOp::SetInflight {
            client_id: client_id.to_string(),
            record: StoredInflightRecord::from(&record),
        };
        match self.records.entry(Arc::from(client_id)) {
            Entry::Occupied(mut entry) => {
                self.persist(op)?;
                entry.insert(record);
            }
            Entry::Vacant(entry) => {
                self.persist(op)?;
                entry.insert(record);
            }
        }
        Ok(())
    }

    fn get(&self, client_id: &str) -> Result<Option<InflightRecord>, StoreError> {
        Ok(self.records.get(client_id).map(|r| r.value().clone()))
    }

    fn acknowledge(&self, client_id: &str, packet_id: u16) -> Result<bool, StoreError> {
        match self.records.entry(Arc::from(client_id)) {
            Entry::Occupied(entry) if entry.get().packet_id == packet_id => {
                self.persist(PersistenceOp::DeleteInflight {
                    client_id: client_id.to_string(),
                })?;
                entry.remove();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove(&self, client_id: &str) -> Result<(), StoreError> {
        if let Entry::Occupied(entry) = self.records.entry(Arc::from(client_id)) {
            self.persist(PersistenceOp::DeleteInflight {
                client_id: client_id.to_string(),
            })?;
            entry.remove();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    fn record(client_id: &str, packet_id: u16) -> InflightRecord {
        InflightRecord {
            client_id: client_id.into(),
            topic: "sensors/temp".into(),
            qos: QoS::AtLeastOnce,
            payload: Bytes::from_static(b"21C"),
            packet_id,
        }
    }

    #[test]
    fn test_single_slot_per_client() {
        let store = InflightMessages::new();
        store.put("dev-A", record("dev-A", 1)).unwrap();
        store.put("dev-A", record("dev-A", 2)).unwrap();
        store.put("dev-B", record("dev-B", 3)).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("dev-A").unwrap().unwrap().packet_id, 2);
    }

    #[test]
    fn test_acknowledge_requires_matching_packet_id() {
        let store = InflightMessages::new();
        store.put("dev-A", record("dev-A", 2)).unwrap();

        // Ack for a record that was already replaced
        assert!(!store.acknowledge("dev-A", 1).unwrap());
        assert!(store.get("dev-A").unwrap().is_some());

        assert!(store.acknowledge("dev-A", 2).unwrap());
        assert!(store.get("dev-A").unwrap().is_none());
        assert!(!store.acknowledge("dev-A", 2).unwrap());
    }

    #[test]
    fn test_remove() {
        let store = InflightMessages::new();
        store.remove("nobody").unwrap();
        store.put("dev-A", record("dev-A", 5)).unwrap();
        store.remove("dev-A").unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_updates_keep_disk_in_step() {
        use crate::persistence::{FjallBackend, StorageBackend};
        use std::time::Duration;

        let temp_dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FjallBackend::open(temp_dir.path()).unwrap());
        let manager = Arc::new(PersistenceManager::new(
            backend.clone(),
            Duration::from_millis(5),
            16,
        ));
        let store = Arc::new(InflightMessages::with_persistence(manager.clone()));

        let workers: Vec<_> = (0..4u16)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 1..=200u16 {
                        let packet_id = worker * 1000 + i;
                        store.put("dev-A", record("dev-A", packet_id)).unwrap();
                        if i % 2 == 0 {
                            store.acknowledge("dev-A", packet_id).unwrap();
                        }
                        if i % 7 == 0 {
                            store.remove("dev-A").unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        manager.shutdown().await.unwrap();

        let in_memory = store.get("dev-A").unwrap().map(|r| r.packet_id);
        let on_disk = backend
            .list_inflight()
            .await
            .unwrap()
            .into_iter()
            .find(|(client_id, _)| client_id == "dev-A")
            .map(|(_, r)| r.packet_id);
        assert_eq!(in_memory, on_disk);
    }
}
