use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::warn;

use super::{RetainedMessage, RetainedStore, StoreError};
use crate::persistence::{PersistenceManager, PersistenceOp, StoredRetainedMessage};
use crate::topic::topic_matches_filter;

/// In-memory retained store with optional write-through
#[derive(Default)]
pub struct RetainedMessages {
    messages: DashMap<Arc<str>, RetainedMessage>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl RetainedMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persistence(persistence: Arc<PersistenceManager>) -> Self {
        Self {
            messages: DashMap::new(),
            persistence: Some(persistence),
        }
    }

    /// Load records read back from storage, skipping unreadable ones
    pub fn restore(&self, stored: Vec<(String, StoredRetainedMessage)>) -> usize {
        let mut restored = 0;
        for (topic, record) in stored {
            match RetainedMessage::try_from(record) {
                Ok(message) => {
                    self.messages.insert(Arc::from(topic), message);
                    restored += 1;
                }
                Err(e) => warn!("Skipping retained message for {}: {}", topic, e),
            }
        }
        restored
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn persist(&self, op: PersistenceOp) -> Result<(), StoreError> {
        match self.persistence {
            Some(ref persistence) => persistence.write(op).map_err(StoreError::from),
            None => Ok(()),
        }
    }
}

impl RetainedStore for RetainedMessages {
    // The entry guard is held while the op is queued so that disk order
    // follows memory order for each topic.
    fn put(&self, topic: &str, message: RetainedMessage) -> Result<(), StoreError> {
        let op = PersistenceOp::SetRetained {
            topic: topic.to_string(),
            message: StoredRetainedMessage::from(&message),
        };
        match self.messages.entry(Arc::from(topic)) {
            Entry::Occupied(mut entry) => {
                self.persist(op)?;
                entry.insert(message);
            }
            Entry::Vacant(entry) => {
                self.persist(op)?;
                entry.insert(message);
            }
        }
        Ok(())
    }

    fn remove(&self, topic: &str) -> Result<(), StoreError> {
        if let Entry::Occupied(entry) = self.messages.entry(Arc::from(topic)) {
            self.persist(PersistenceOp::DeleteRetained {
                topic: topic.to_string(),
            })?;
            entry.remove();
        }
        Ok(())
    }

    fn get(&self, topic: &str) -> Result<Option<RetainedMessage>, StoreError> {
        Ok(self.messages.get(topic).map(|m| m.value().clone()))
    }

    fn matching(&self, filter: &str) -> Result<Vec<RetainedMessage>, StoreError> {
        Ok(self
            .messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    fn message(topic: &str, payload: &'static [u8]) -> RetainedMessage {
        RetainedMessage {
            topic: topic.into(),
            qos: QoS::AtLeastOnce,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_put_overwrites() {
        let store = RetainedMessages::new();
        store.put("t", message("t", b"P1")).unwrap();
        store.put("t", message("t", b"P2")).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("t").unwrap().unwrap().payload, Bytes::from_static(b"P2"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = RetainedMessages::new();
        store.remove("absent").unwrap();

        store.put("t", message("t", b"P1")).unwrap();
        store.remove("t").unwrap();
        store.remove("t").unwrap();
        assert!(store.get("t").unwrap().is_none());
    }

    #[test]
    fn test_matching_filter() {
        let store = RetainedMessages::new();
        store.put("sensors/temp", message("sensors/temp", b"21C")).unwrap();
        store.put("sensors/hum", message("sensors/hum", b"40%")).unwrap();
        store.put("cmd", message("cmd", b"on")).unwrap();
        store.put("$SYS/up", message("$SYS/up", b"1")).unwrap();

        let mut topics: Vec<_> = store
            .matching("sensors/+")
            .unwrap()
            .into_iter()
            .map(|m| m.topic.to_string())
            .collect();
        topics.sort();
        assert_eq!(topics, vec!["sensors/hum", "sensors/temp"]);

        assert_eq!(store.matching("#").unwrap().len(), 3);
    }

    #[test]
    fn test_restore_skips_corrupt_records() {
        let store = RetainedMessages::new();
        let restored = store.restore(vec![
            (
                "a".to_string(),
                StoredRetainedMessage {
                    topic: "a".to_string(),
                    payload: b"x".to_vec(),
                    qos: 0,
                    timestamp_secs: 0,
                },
            ),
            (
                "b".to_string(),
                StoredRetainedMessage {
                    topic: "b".to_string(),
                    payload: b"y".to_vec(),
                    qos: 7,
                    timestamp_secs: 0,
                },
            ),
        ]);

        assert_eq!(restored, 1);
        assert!(store.get("a").unwrap().is_some());
        assert!(store.get("b").unwrap().is_none());
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
        let store = Arc::new(RetainedMessages::with_persistence(manager.clone()));

        let workers: Vec<_> = (0..4u8)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..200u16 {
                        if (i + u16::from(worker)) % 3 == 0 {
                            store.remove("t").unwrap();
                        } else {
                            let payload = Bytes::from(format!("{}-{}", worker, i));
                            store
                                .put(
                                    "t",
                                    RetainedMessage {
                                        topic: "t".into(),
                                        qos: QoS::AtMostOnce,
                                        payload,
                                    },
                                )
                                .unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        manager.shutdown().await.unwrap();

        let in_memory = store.get("t").unwrap().map(|m| m.payload.to_vec());
        let on_disk = backend.get_retained("t").await.unwrap().map(|m| m.payload);
        assert_eq!(in_memory, on_disk);
    }
}
