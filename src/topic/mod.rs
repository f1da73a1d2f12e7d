//! Topic matching and subscription management
//!
//! Topic name/filter validation, a topic trie, and the subscription store the
//! publish engine resolves fan-out sets from.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    topic_matches_filter, validate_topic_filter, validate_topic_filter_with_max_levels,
    validate_topic_name, validate_topic_name_with_max_levels,
};

use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::QoS;

/// A subscription matched for a published topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    /// Subscriber client identifier
    pub client_id: Arc<str>,
    /// QoS granted at SUBSCRIBE time
    pub qos: QoS,
    /// Filter the subscription was made with
    pub filter: Arc<str>,
}

/// Resolves a topic name to the subscriptions whose filters match it.
///
/// A client with several overlapping filters appears once per filter.
/// Order is not significant.
pub trait SubscriptionDirectory: Send + Sync {
    fn search(&self, topic: &str) -> Vec<SubscriptionRecord>;
}

/// Thread-safe subscription store using topic trie
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<SmallVec<[SubscriptionRecord; 4]>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Add or replace a client's subscription to a filter
    ///
    /// Returns true if an existing subscription was replaced.
    pub fn subscribe(&self, client_id: &Arc<str>, filter: &str, qos: QoS) -> bool {
        let record = SubscriptionRecord {
            client_id: client_id.clone(),
            qos,
            filter: Arc::from(filter),
        };

        let mut trie = self.trie.write();
        let subs = trie.get_or_insert_with(filter, SmallVec::new);
        match subs.iter_mut().find(|s| s.client_id == record.client_id) {
            Some(existing) => {
                *existing = record;
                true
            }
            None => {
                subs.push(record);
                false
            }
        }
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let mut trie = self.trie.write();
        let Some(subs) = trie.get_mut(filter) else {
            return false;
        };

        let len_before = subs.len();
        subs.retain(|s| s.client_id.as_ref() != client_id);
        let removed = subs.len() != len_before;
        if subs.is_empty() {
            trie.remove(filter);
        }
        removed
    }

    /// Remove all subscriptions for a client
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.remove_by_predicate(|subs| {
            subs.retain(|s| s.client_id.as_ref() != client_id);
            subs.is_empty()
        });
    }

    /// Whether the client holds any subscription
    pub fn has_subscriptions(&self, client_id: &str) -> bool {
        let mut found = false;
        self.trie.read().for_each(|subs| {
            found = found || subs.iter().any(|s| s.client_id.as_ref() == client_id);
        });
        found
    }

    /// Total number of subscriptions
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.trie.read().for_each(|subs| count += subs.len());
        count
    }

    pub fn is_empty(&self) -> bool {
        self.trie.read().is_empty()
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionDirectory for SubscriptionStore {
    fn search(&self, topic: &str) -> Vec<SubscriptionRecord> {
        let trie = self.trie.read();
        let mut result = Vec::new();
        trie.matches(topic, |subs| result.extend(subs.iter().cloned()));
        result
    }
}
