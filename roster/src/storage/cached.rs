use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use shared::kv::{Event, EventType, Value, KV};
use crate::error::{Error, Result};
use crate::events::EventBus;
use super::node::StorageNode;
use super::remote::RemoteStorage;
use super::{Storage, StorageEvent};

/// A named storage mirrored into a prefix tree.
///
/// Reads are served from the tree. Writes go to the database first and are
/// applied locally only once the database accepted them; the watch then
/// confirms them.
pub struct CachedStorage {
    remote: RemoteStorage,
    root: RwLock<Arc<StorageNode>>,
    // Some while a rebuild is scanning; changes are parked here and replayed on the new tree
    pending: Mutex<Option<Vec<Change>>>,
    ready: OnceCell<()>,
    rebuilding: tokio::sync::Mutex<()>,
    events: EventBus<StorageEvent>,
}

#[derive(Debug, Clone)]
enum Change {
    Set(String, Value),
    Remove(String),
    RemoveSubtree(String),
}

impl CachedStorage {
    /// The tree starts empty; [`CachedStorage::ensure_built`] fills it
    pub(crate) fn new(remote: RemoteStorage, cancel: CancellationToken) -> Self {
        Self {
            root: RwLock::new(Arc::new(StorageNode::new(remote.name()))),
            remote,
            pending: Mutex::new(None),
            ready: OnceCell::new(),
            rebuilding: tokio::sync::Mutex::new(()),
            events: EventBus::new(cancel),
        }
    }

    pub fn name(&self) -> &str {
        self.remote.name()
    }

    /// Number of cached values
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handlers receive every watch change after it has been applied to the tree
    pub fn register_event_handler<F>(&self, handler: F)
    where
        F: FnMut(StorageEvent) + Send + 'static,
    {
        self.events.subscribe(handler);
    }

    /// Run the initial build once. Concurrent callers wait for the same build;
    /// a failed build is retried by the next caller.
    pub(crate) async fn ensure_built(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async { self.rebuild().await.map(|_| ()) })
            .await?;
        Ok(())
    }

    /// Replace the tree with a fresh scan of the database.
    ///
    /// Changes observed while the scan is in flight are replayed onto the new
    /// tree before it is swapped in, so no watch update is lost.
    pub async fn rebuild(&self) -> Result<usize> {
        let _guard = self.rebuilding.lock().await;

        *self.pending.lock() = Some(Vec::new());
        let kvs = match self.remote.scan().await {
            Ok(kvs) => kvs,
            Err(e) => {
                // Keep the old tree and catch it up with what was parked
                let mut pending = self.pending.lock();
                let root = self.root.read().clone();
                for change in pending.take().unwrap_or_default() {
                    self.apply_to(&root, change);
                }
                tracing::error!("Storage {} failed to build cache: {}", self.name(), e);
                return Err(e);
            }
        };

        let root = Arc::new(StorageNode::new(self.name()));
        let size = kvs.len();
        for kv in kvs {
            let Some(relative) = kv.key.strip_prefix(self.remote.base()) else {
                continue;
            };
            root.walk_or_create(split(relative, self.remote.separator()))
                .append_value(kv);
        }

        let mut pending = self.pending.lock();
        let replayed = pending.as_ref().map_or(0, Vec::len);
        for change in pending.take().unwrap_or_default() {
            self.apply_to(&root, change);
        }
        *self.root.write() = root;
        drop(pending);

        tracing::info!(
            "Storage {} cache built, size={}, replayed={}",
            self.name(),
            size,
            replayed
        );
        Ok(size)
    }

    /// Apply a watch event for this storage and notify handlers
    pub(crate) fn handle_event(&self, event: Event) {
        let Some(relative) = event.key.strip_prefix(self.remote.base()) else {
            return;
        };
        let relative = relative.to_string();
        tracing::debug!("Storage {} {} event: {}", self.name(), event.kind, relative);

        let change = match event.kind {
            EventType::Create | EventType::Update => Change::Set(event.key, event.value.clone()),
            // The store reports every removed key on its own, even for prefix deletes
            EventType::Delete => Change::Remove(event.key),
        };
        self.apply(change);

        self.events.publish(StorageEvent {
            kind: event.kind,
            key: relative,
            value: event.value,
        });
    }

    fn snapshot(&self) -> Vec<KV> {
        let root = self.root.read().clone();
        let mut out = Vec::new();
        root.collect(&mut out);
        out
    }

    fn apply(&self, change: Change) {
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(queue) => queue.push(change),
            None => {
                let root = self.root.read().clone();
                self.apply_to(&root, change);
            }
        }
    }

    fn apply_to(&self, root: &Arc<StorageNode>, change: Change) {
        let separator = self.remote.separator();
        match change {
            Change::Set(key, value) => {
                let relative = key.strip_prefix(self.remote.base()).unwrap_or(&key);
                root.walk_or_create(split(relative, separator))
                    .upsert_value(&key, value);
            }
            Change::Remove(key) => {
                let relative = key.strip_prefix(self.remote.base()).unwrap_or(&key);
                let path: Vec<&str> = split(relative, separator).collect();
                if let Some(node) = root.walk(path.iter().copied()) {
                    node.remove_value(&key);
                    prune(root, &path);
                }
            }
            Change::RemoveSubtree(prefix) => {
                let relative = prefix.strip_prefix(self.remote.base()).unwrap_or(&prefix);
                let path: Vec<&str> = split(relative, separator).collect();
                if let Some(node) = root.walk(path.iter().copied()) {
                    node.remove_prefixed(&prefix);
                    prune(root, &path);
                }
            }
        }
    }
}

#[async_trait]
impl Storage for CachedStorage {
    async fn get(&self, key: Option<&str>) -> Result<Vec<KV>> {
        let key = key.unwrap_or_default();
        let root = self.root.read().clone();

        let node = root
            .walk(split(key, self.remote.separator()))
            .ok_or_else(|| Error::StorageKeyNotFound(key.to_string()))?;

        let mut out = Vec::new();
        node.collect(&mut out);
        Ok(out)
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.remote.set(key, value.clone()).await?;
        self.apply(Change::Set(self.remote.key(key), value));
        Ok(())
    }

    async fn set_ttl(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
        keepalive: Option<CancellationToken>,
    ) -> Result<()> {
        self.remote.set_ttl(key, value.clone(), ttl, keepalive).await?;
        self.apply(Change::Set(self.remote.key(key), value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.remote.delete(key).await?;

        let full = self.remote.key(key);
        if key.ends_with(self.remote.separator()) {
            self.apply(Change::RemoveSubtree(full));
        } else {
            self.apply(Change::Remove(full));
        }
        Ok(())
    }
}

/// Path segments of a relative key; empty segments are skipped
fn split<'a>(key: &'a str, separator: &'a str) -> impl Iterator<Item = &'a str> {
    key.split(separator).filter(|segment| !segment.is_empty())
}

/// Drop nodes along `path` that were left empty, deepest first
fn prune(root: &Arc<StorageNode>, path: &[&str]) {
    let mut nodes = vec![Arc::clone(root)];
    for segment in path {
        match nodes.last().and_then(|node| node.child(segment)) {
            Some(child) => nodes.push(child),
            None => break,
        }
    }

    for (depth, segment) in path.iter().enumerate().take(nodes.len().saturating_sub(1)).rev() {
        if !nodes[depth].prune_child(segment) {
            break;
        }
    }
}
