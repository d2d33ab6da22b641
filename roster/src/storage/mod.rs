pub mod cached;
mod node;
pub mod remote;

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use shared::kv::{Event, EventType, Value, KV};
use crate::config::Config;
use crate::db::{Database, WatchStream};
use crate::error::Result;

pub use cached::CachedStorage;
pub use remote::RemoteStorage;

/// Hierarchical access to one named storage. Keys are relative to the storage
/// and split into path segments on the configured separator.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Every entry at or below `key`; `None` or `""` returns the whole storage
    async fn get(&self, key: Option<&str>) -> Result<Vec<KV>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Store a value that expires after `ttl` unless `keepalive` keeps renewing it
    async fn set_ttl(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
        keepalive: Option<CancellationToken>,
    ) -> Result<()>;

    /// A key ending in the separator deletes the whole subtree below it
    async fn delete(&self, key: &str) -> Result<()>;
}

/// A storage change observed through the watch
#[derive(Debug, Clone)]
pub struct StorageEvent {
    pub kind: EventType,
    /// Key relative to the storage
    pub key: String,
    /// Empty for deletes
    pub value: Value,
}

/// Directory of named storages sharing one watch
#[derive(Clone)]
pub struct Storages {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<dyn Database>,
    root: String,
    separator: String,
    caches: DashMap<String, Arc<CachedStorage>>,
    cancel: CancellationToken,
}

impl Storages {
    /// Start watching the storage namespace. Caches are created on demand by
    /// [`Storages::get`]; until then events for their names are dropped.
    pub async fn new(db: Arc<dyn Database>, config: &Config, cancel: CancellationToken) -> Result<Self> {
        let inner = Arc::new(Inner {
            db,
            root: config.storage_prefix(),
            separator: config.separator().to_string(),
            caches: DashMap::new(),
            cancel: cancel.clone(),
        });

        let stream = inner.db.watch(&inner.root, cancel.clone()).await?;
        tokio::spawn(run_watch(inner.clone(), stream, cancel));

        Ok(Self { inner })
    }

    /// Cached storage for `name`, built from a full scan on first use.
    /// The separator is stripped from the name.
    pub async fn get(&self, name: &str) -> Result<Arc<CachedStorage>> {
        let name = name.replace(&self.inner.separator, "");

        // Registered before the build so events racing the scan are parked for replay
        let storage = self
            .inner
            .caches
            .entry(name.clone())
            .or_insert_with(|| {
                tracing::debug!("Storage {} cache created", name);
                Arc::new(CachedStorage::new(
                    self.inner.remote(&name),
                    self.inner.cancel.clone(),
                ))
            })
            .clone();

        storage.ensure_built().await?;
        Ok(storage)
    }

    /// Storage for `name` that reads and writes the database directly
    pub fn uncached(&self, name: &str) -> RemoteStorage {
        self.inner.remote(name)
    }

    /// Names of the storages cached so far
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .caches
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl Inner {
    fn remote(&self, name: &str) -> RemoteStorage {
        RemoteStorage::new(self.db.clone(), &self.root, name, &self.separator)
    }

    fn route(&self, event: Event) {
        let Some(name) = event
            .key
            .strip_prefix(&self.root)
            .and_then(|rest| rest.split_once(self.separator.as_str()))
            .map(|(name, _)| name)
        else {
            tracing::debug!("Storage ignored event outside any storage: {}", event.key);
            return;
        };

        let storage = self.caches.get(name).map(|entry| entry.value().clone());
        match storage {
            Some(storage) => storage.handle_event(event),
            None => tracing::trace!("Storage {} not cached, dropped event", name),
        }
    }
}

/// Route watch events until cancelled
async fn run_watch(inner: Arc<Inner>, mut stream: WatchStream, cancel: CancellationToken) {
    tracing::info!("Storage watching {}", inner.root);
    loop {
        tokio::select! {
            event = stream.recv() => {
                match event {
                    Some(event) => inner.route(event),
                    None => {
                        tracing::warn!("Storage watch stream closed");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Storage watch shutting down");
                break;
            }
        }
    }
}
