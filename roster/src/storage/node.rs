use std::sync::Arc;
use dashmap::DashMap;
use parking_lot::RwLock;
use shared::kv::{Value, KV};

/// One path segment of a storage tree.
///
/// `values` holds the entries whose key ends exactly at this node. A node can
/// hold values and children at the same time.
#[derive(Debug)]
pub(crate) struct StorageNode {
    name: String,
    children: DashMap<String, Arc<StorageNode>>,
    values: RwLock<Vec<KV>>,
}

impl StorageNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: DashMap::new(),
            values: RwLock::new(Vec::new()),
        }
    }

    pub fn child(&self, segment: &str) -> Option<Arc<StorageNode>> {
        self.children.get(segment).map(|child| child.value().clone())
    }

    pub fn child_or_insert(&self, segment: &str) -> Arc<StorageNode> {
        let child = self
            .children
            .entry(segment.to_string())
            .or_insert_with(|| Arc::new(StorageNode::new(segment)));
        Arc::clone(&child)
    }

    /// Follow `segments` from this node without creating anything
    pub fn walk<'a>(self: &Arc<Self>, segments: impl IntoIterator<Item = &'a str>) -> Option<Arc<StorageNode>> {
        let mut node = Arc::clone(self);
        for segment in segments {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Follow `segments` from this node, creating missing nodes
    pub fn walk_or_create<'a>(self: &Arc<Self>, segments: impl IntoIterator<Item = &'a str>) -> Arc<StorageNode> {
        let mut node = Arc::clone(self);
        for segment in segments {
            node = node.child_or_insert(segment);
        }
        node
    }

    pub fn append_value(&self, kv: KV) {
        self.values.write().push(kv);
    }

    /// Replace the value stored under `key` in place, or append it
    pub fn upsert_value(&self, key: &str, value: Value) {
        let mut values = self.values.write();
        match values.iter_mut().find(|kv| kv.key == key) {
            Some(kv) => kv.value = value,
            None => values.push(KV::new(key, value)),
        }
    }

    pub fn remove_value(&self, key: &str) -> bool {
        let mut values = self.values.write();
        let before = values.len();
        values.retain(|kv| kv.key != key);
        values.len() != before
    }

    /// Drop every value at or below this node whose key starts with `prefix`,
    /// then the children left empty. Keys are matched as literal strings, so
    /// entries that only share this node's path segments survive.
    pub fn remove_prefixed(&self, prefix: &str) {
        self.values.write().retain(|kv| !kv.key.starts_with(prefix));

        let children: Vec<(String, Arc<StorageNode>)> = self
            .children
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (segment, child) in children {
            child.remove_prefixed(prefix);
            self.prune_child(&segment);
        }
    }

    /// Remove the named child if it holds nothing any more
    pub fn prune_child(&self, segment: &str) -> bool {
        self.children
            .remove_if(segment, |_, child| child.is_empty())
            .is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.values.read().is_empty()
    }

    /// Depth-first copy of every value at or below this node.
    ///
    /// A node's lock is held only while its own values are copied, and the
    /// children are snapshotted before descending.
    pub fn collect(&self, out: &mut Vec<KV>) {
        out.extend(self.values.read().iter().cloned());

        let mut children: Vec<Arc<StorageNode>> = self
            .children
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));

        for child in children {
            child.collect(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flatten(node: &StorageNode) -> Vec<String> {
        let mut out = Vec::new();
        node.collect(&mut out);
        out.into_iter().map(|kv| kv.key).collect()
    }

    #[test]
    fn test_node_can_be_leaf_and_prefix() {
        let root = Arc::new(StorageNode::new("root"));
        root.walk_or_create(["a"]).upsert_value("a", "leaf".into());
        root.walk_or_create(["a", "1"]).upsert_value("a/1", "one".into());
        root.walk_or_create(["a", "2"]).upsert_value("a/2", "two".into());

        assert_eq!(flatten(&root), vec!["a", "a/1", "a/2"]);
        assert_eq!(flatten(&root.walk(["a", "2"]).unwrap()), vec!["a/2"]);
        assert!(root.walk(["a", "3"]).is_none());
    }

    #[test]
    fn test_upsert_replaces_by_exact_key() {
        let node = StorageNode::new("n");
        node.upsert_value("k", "v1".into());
        node.upsert_value("k", "v2".into());
        node.upsert_value("k2", "x".into());

        let mut out = Vec::new();
        node.collect(&mut out);
        assert_eq!(out, vec![KV::new("k", "v2"), KV::new("k2", "x")]);
    }

    #[test]
    fn test_remove_prefixed_keeps_sibling_leaf() {
        let root = Arc::new(StorageNode::new("root"));
        let a = root.walk_or_create(["a"]);
        a.upsert_value("a", "leaf".into());
        a.upsert_value("a/", "dir marker".into());
        root.walk_or_create(["a", "1"]).upsert_value("a/1", "one".into());

        a.remove_prefixed("a/");
        assert_eq!(flatten(&root), vec!["a"]);

        assert!(!root.prune_child("a"));
        a.remove_value("a");
        assert!(root.prune_child("a"));
        assert!(root.is_empty());
    }

    #[test]
    fn test_remove_prefixed_matches_literal_keys() {
        let root = Arc::new(StorageNode::new("root"));
        root.walk_or_create(["a", "b", "c"]).upsert_value("a/b/c", "single".into());
        root.walk_or_create(["a", "b", "d"]).upsert_value("a//b/d", "double".into());

        let b = root.walk(["a", "b"]).unwrap();
        b.remove_prefixed("a//b/");
        assert_eq!(flatten(&root), vec!["a/b/c"]);

        b.remove_prefixed("a/b/");
        assert!(b.is_empty());
        assert!(root.walk(["a", "b", "c"]).is_none());
    }
}
