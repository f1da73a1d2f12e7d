//! Topic trie for subscription matching
//!
//! Filters are stored level by level. `+` and `#` get dedicated slots on each
//! node so matching a topic name never has to scan sibling levels.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct TrieNode<V> {
    /// Value for a filter ending exactly at this node
    value: Option<V>,
    /// Literal children
    children: AHashMap<CompactString, TrieNode<V>>,
    /// `+` child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value for `<prefix>/#`
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::with_capacity(4),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic trie keyed by topic filter
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Slot for `filter`, created on demand
    fn slot_mut(&mut self, filter: &str) -> &mut Option<V> {
        let mut node = &mut self.root;

        for level in filter.split('/') {
            node = match level {
                "#" => return &mut node.multi_wildcard,
                "+" => node
                    .single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::new())),
                _ => node.children.entry(CompactString::new(level)).or_default(),
            };
        }

        &mut node.value
    }

    /// Insert or replace the value stored for a filter
    pub fn insert(&mut self, filter: &str, value: V) -> Option<V> {
        self.slot_mut(filter).replace(value)
    }

    /// Value for a filter, inserting `default()` first if absent
    pub fn get_or_insert_with<F>(&mut self, filter: &str, default: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        self.slot_mut(filter).get_or_insert_with(default)
    }

    /// Mutable reference to the value at a filter
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            node = match level {
                "#" => return node.multi_wildcard.as_mut(),
                "+" => node.single_wildcard.as_mut()?,
                _ => node.children.get_mut(level)?,
            };

            if levels.peek().is_none() {
                return node.value.as_mut();
            }
        }

        None
    }

    /// Remove a filter, pruning branches left empty
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_recursive(&mut self.root, &levels)
    }

    fn remove_recursive(node: &mut TrieNode<V>, levels: &[&str]) -> Option<V> {
        let Some((&level, rest)) = levels.split_first() else {
            return node.value.take();
        };

        match level {
            "#" => node.multi_wildcard.take(),
            "+" => {
                let child = node.single_wildcard.as_mut()?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(level)?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.children.remove(level);
                }
                removed
            }
        }
    }

    /// Remove every value for which `pred` returns true
    ///
    /// The predicate may also mutate values it keeps.
    pub fn remove_by_predicate<F>(&mut self, mut pred: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        Self::remove_by_predicate_recursive(&mut self.root, &mut pred);
    }

    fn remove_by_predicate_recursive<F>(node: &mut TrieNode<V>, pred: &mut F)
    where
        F: FnMut(&mut V) -> bool,
    {
        if node.value.as_mut().is_some_and(|v| pred(v)) {
            node.value = None;
        }

        if node.multi_wildcard.as_mut().is_some_and(|v| pred(v)) {
            node.multi_wildcard = None;
        }

        if let Some(child) = node.single_wildcard.as_mut() {
            Self::remove_by_predicate_recursive(child, pred);
            if child.is_empty() {
                node.single_wildcard = None;
            }
        }

        node.children.retain(|_, child| {
            Self::remove_by_predicate_recursive(child, pred);
            !child.is_empty()
        });
    }

    /// Visit every stored value
    pub fn for_each<F>(&self, mut callback: F)
    where
        F: FnMut(&V),
    {
        Self::for_each_recursive(&self.root, &mut callback);
    }

    fn for_each_recursive<F>(node: &TrieNode<V>, callback: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(v) = node.value.as_ref() {
            callback(v);
        }
        if let Some(v) = node.multi_wildcard.as_ref() {
            callback(v);
        }
        if let Some(child) = node.single_wildcard.as_ref() {
            Self::for_each_recursive(child, callback);
        }
        for child in node.children.values() {
            Self::for_each_recursive(child, callback);
        }
    }

    /// Visit the value of every filter matching a topic name
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        // [MQTT-4.7.2-1] $-topics don't match filters starting with + or #
        let is_system_topic = topic.starts_with('$');

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        guard_root: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        // `#` also matches the parent level, so check before consuming one
        if !guard_root {
            if let Some(v) = node.multi_wildcard.as_ref() {
                callback(v);
            }
        }

        let Some((&level, rest)) = levels.split_first() else {
            if let Some(v) = node.value.as_ref() {
                callback(v);
            }
            return;
        };

        if !guard_root {
            if let Some(child) = node.single_wildcard.as_ref() {
                Self::matches_recursive(child, rest, false, callback);
            }
        }

        if let Some(child) = node.children.get(level) {
            Self::matches_recursive(child, rest, false, callback);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn matching(trie: &TopicTrie<u32>, topic: &str) -> Vec<u32> {
        let mut found = Vec::new();
        trie.matches(topic, |v| found.push(*v));
        found.sort();
        found
    }

    #[test]
    fn test_exact_and_wildcards() {
        let mut trie = TopicTrie::new();
        trie.insert("sensors/temp", 1);
        trie.insert("sensors/+", 2);
        trie.insert("sensors/#", 3);
        trie.insert("#", 4);
        trie.insert("+/humidity", 5);

        assert_eq!(matching(&trie, "sensors/temp"), vec![1, 2, 3, 4]);
        assert_eq!(matching(&trie, "sensors/humidity"), vec![2, 3, 4, 5]);
        assert_eq!(matching(&trie, "sensors/temp/kitchen"), vec![3, 4]);
    }

    #[test]
    fn test_multi_wildcard_matches_parent() {
        let mut trie = TopicTrie::new();
        trie.insert("sensors/#", 1);

        assert_eq!(matching(&trie, "sensors"), vec![1]);
        assert!(matching(&trie, "sensorsX").is_empty());
    }

    #[test]
    fn test_empty_levels() {
        let mut trie = TopicTrie::new();
        trie.insert("/a", 1);
        trie.insert("+/a", 2);

        assert_eq!(matching(&trie, "/a"), vec![1, 2]);
    }

    #[test]
    fn test_system_topics_skip_root_wildcards() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("+/uptime", 2);
        trie.insert("$SYS/#", 3);
        trie.insert("$SYS/+", 4);

        assert_eq!(matching(&trie, "$SYS/uptime"), vec![3, 4]);
    }

    #[test]
    fn test_insert_replaces() {
        let mut trie = TopicTrie::new();
        assert_eq!(trie.insert("a/b", 1), None);
        assert_eq!(trie.insert("a/b", 2), Some(1));
        assert_eq!(matching(&trie, "a/b"), vec![2]);
    }

    #[test]
    fn test_remove_prunes_branches() {
        let mut trie = TopicTrie::new();
        trie.insert("a/+/c", 1);
        trie.insert("a/#", 2);

        assert_eq!(trie.remove("a/+/c"), Some(1));
        assert_eq!(trie.remove("a/+/c"), None);
        assert_eq!(trie.remove("a/#"), Some(2));
        assert!(trie.is_empty());
    }

    #[test]
    fn test_remove_by_predicate() {
        let mut trie = TopicTrie::new();
        trie.insert("a", vec![1, 2]);
        trie.insert("b/#", vec![1]);
        trie.insert("+/c", vec![3]);

        trie.remove_by_predicate(|v| {
            v.retain(|id| *id != 1);
            v.is_empty()
        });

        let mut remaining = Vec::new();
        trie.for_each(|v| remaining.extend(v.iter().copied()));
        remaining.sort();
        assert_eq!(remaining, vec![2, 3]);
        assert!(trie.get_mut("b/#").is_none());
    }

    #[test]
    fn test_get_or_insert_with() {
        let mut trie: TopicTrie<Vec<u32>> = TopicTrie::new();
        trie.get_or_insert_with("x/+", Vec::new).push(1);
        trie.get_or_insert_with("x/+", Vec::new).push(2);

        assert_eq!(trie.get_mut("x/+"), Some(&mut vec![1, 2]));
    }
}
