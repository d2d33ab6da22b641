use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use shared::kv::{Value, KV};
use crate::db::Database;
use crate::error::Result;
use super::Storage;

/// A named storage read and written directly against the database
#[derive(Clone)]
pub struct RemoteStorage {
    db: Arc<dyn Database>,
    name: String,
    base: String,
    separator: String,
}

impl RemoteStorage {
    /// `root` is the storage namespace, `<prefix>storage/`
    pub(crate) fn new(db: Arc<dyn Database>, root: &str, name: &str, separator: &str) -> Self {
        let name = name.replace(separator, "");
        Self {
            db,
            base: format!("{}{}{}", root, name, separator),
            name,
            separator: separator.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Full database key for a key relative to this storage
    pub fn key(&self, key: &str) -> String {
        format!("{}{}", self.base, key)
    }

    /// Namespace every key of this storage starts with
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Every entry of this storage, in key order
    pub(crate) async fn scan(&self) -> Result<Vec<KV>> {
        Ok(self.db.get_prefix(&self.base).await?)
    }
}

#[async_trait]
impl Storage for RemoteStorage {
    async fn get(&self, key: Option<&str>) -> Result<Vec<KV>> {
        Ok(self.db.get_prefix(&self.key(key.unwrap_or_default())).await?)
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        Ok(self.db.set(&self.key(key), value, None, None).await?)
    }

    async fn set_ttl(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
        keepalive: Option<CancellationToken>,
    ) -> Result<()> {
        Ok(self.db.set(&self.key(key), value, Some(ttl), keepalive).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full = self.key(key);
        if key.ends_with(&self.separator) {
            self.db.delete_prefix(&full).await?;
        } else {
            self.db.delete(&full).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;

    fn storage(db: &MemoryDatabase) -> RemoteStorage {
        RemoteStorage::new(Arc::new(db.clone()), "/t/storage/", "conf/ig", "/")
    }

    #[tokio::test]
    async fn test_name_is_stripped_of_separator() {
        let storage = storage(&MemoryDatabase::new());
        assert_eq!(storage.name(), "config");
        assert_eq!(storage.key("a/b"), "/t/storage/config/a/b");
    }

    #[tokio::test]
    async fn test_reads_are_raw_prefix_scans() {
        let db = MemoryDatabase::new();
        let storage = storage(&db);

        storage.set("db/host", "10.0.0.1".into()).await.unwrap();
        storage.set("db/port", 5432i64.into()).await.unwrap();
        storage.set("dbx", "x".into()).await.unwrap();

        let keys: Vec<String> = storage.get(Some("db/")).await.unwrap().into_iter().map(|kv| kv.key).collect();
        assert_eq!(keys, vec!["/t/storage/config/db/host", "/t/storage/config/db/port"]);

        // Without the separator the scan is a plain string prefix
        assert_eq!(storage.get(Some("db")).await.unwrap().len(), 3);
        assert_eq!(storage.get(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_trailing_separator_deletes_subtree() {
        let db = MemoryDatabase::new();
        let storage = storage(&db);

        storage.set("db", "leaf".into()).await.unwrap();
        storage.set("db/host", "h".into()).await.unwrap();
        storage.set("db/port", "p".into()).await.unwrap();

        storage.delete("db/").await.unwrap();
        let left = storage.get(None).await.unwrap();
        assert_eq!(left, vec![KV::new("/t/storage/config/db", "leaf")]);

        storage.delete("db").await.unwrap();
        assert!(db.is_empty());
    }
}
