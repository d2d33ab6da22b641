use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use shared::kv::{Value, KV};
use crate::db::{Database, DatabaseError, MemoryDatabase, WatchStream};

/// Poll until `condition` holds; watch-driven updates land asynchronously
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Memory backend whose writes can be switched to fail
#[derive(Clone, Default)]
pub struct FailingDatabase {
    db: MemoryDatabase,
    failing: Arc<AtomicBool>,
}

impl FailingDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryDatabase {
        &self.db
    }

    fn check(&self) -> Result<(), DatabaseError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DatabaseError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for FailingDatabase {
    async fn get(&self, key: &str) -> Result<Vec<KV>, DatabaseError> {
        self.check()?;
        self.db.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KV>, DatabaseError> {
        self.check()?;
        self.db.get_prefix(prefix).await
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        keepalive: Option<CancellationToken>,
    ) -> Result<(), DatabaseError> {
        self.check()?;
        self.db.set(key, value, ttl, keepalive).await
    }

    async fn delete(&self, key: &str) -> Result<(), DatabaseError> {
        self.check()?;
        self.db.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), DatabaseError> {
        self.check()?;
        self.db.delete_prefix(prefix).await
    }

    async fn watch(&self, prefix: &str, cancel: CancellationToken)
        -> Result<WatchStream, DatabaseError> {
        self.db.watch(prefix, cancel).await
    }
}
