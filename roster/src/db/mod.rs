pub mod memory;

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use shared::kv::{Event, Value, KV};

pub use memory::MemoryDatabase;

/// Ordered change events for one watched prefix. Ends when the watch is cancelled.
pub type WatchStream = mpsc::UnboundedReceiver<Event>;

#[derive(Debug, Clone, Error)]
pub enum DatabaseError {
    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("database closed")]
    Closed,
}

/// The store caches are built from: a prefix scan, then the watch stream
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Value stored under exactly `key`, if any
    async fn get(&self, key: &str) -> Result<Vec<KV>, DatabaseError>;

    /// Every entry whose key starts with `prefix`, in key order
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KV>, DatabaseError>;

    /// Store a value. With a non-zero `ttl` the key is attached to a lease that
    /// expires unless renewed; `keepalive` renews it until the token is cancelled.
    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        keepalive: Option<CancellationToken>,
    ) -> Result<(), DatabaseError>;

    async fn delete(&self, key: &str) -> Result<(), DatabaseError>;

    /// Delete every key starting with `prefix`. One delete event is emitted per key.
    async fn delete_prefix(&self, prefix: &str) -> Result<(), DatabaseError>;

    /// Subscribe to changes under `prefix`. Events arrive in the order the
    /// store applied them. Nothing that happens after this returns is missed.
    async fn watch(&self, prefix: &str, cancel: CancellationToken)
        -> Result<WatchStream, DatabaseError>;
}

#[async_trait]
impl<T: Database + ?Sized> Database for Arc<T> {
    async fn get(&self, key: &str) -> Result<Vec<KV>, DatabaseError> {
        (**self).get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KV>, DatabaseError> {
        (**self).get_prefix(prefix).await
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        keepalive: Option<CancellationToken>,
    ) -> Result<(), DatabaseError> {
        (**self).set(key, value, ttl, keepalive).await
    }

    async fn delete(&self, key: &str) -> Result<(), DatabaseError> {
        (**self).delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), DatabaseError> {
        (**self).delete_prefix(prefix).await
    }

    async fn watch(&self, prefix: &str, cancel: CancellationToken)
        -> Result<WatchStream, DatabaseError> {
        (**self).watch(prefix, cancel).await
    }
}
