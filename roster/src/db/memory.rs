use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use shared::kv::{Event, EventType, Value, KV};
use super::{Database, DatabaseError, WatchStream};

/// Shortest lease renewal period
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(1);

type LeaseId = u64;
type WatcherId = u64;

/// In-process key-value store with leases and prefix watches.
///
/// Mirrors what the registry needs from a coordination service: a key written
/// with a TTL disappears unless its lease is renewed, and the removal is
/// reported to watchers as an ordinary delete event.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

struct Inner {
    entries: Mutex<BTreeMap<String, Entry>>,
    leases: Mutex<HashMap<LeaseId, Instant>>,
    next_lease: AtomicU64,
    watchers: Mutex<Vec<Watcher>>,
    next_watcher: AtomicU64,
}

/// Unbounded per-watcher queue, so a slow consumer delays but never loses events
struct Watcher {
    id: WatcherId,
    prefix: String,
    tx: mpsc::UnboundedSender<Event>,
}

struct Entry {
    value: Value,
    lease: Option<LeaseId>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            leases: Mutex::new(HashMap::new()),
            next_lease: AtomicU64::new(1),
            watchers: Mutex::new(Vec::new()),
            next_watcher: AtomicU64::new(1),
        }
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of leases that have not expired yet
    pub fn lease_count(&self) -> usize {
        self.inner.leases.lock().len()
    }

    /// Number of open watches
    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.lock().len()
    }
}

impl Inner {
    /// Insert or replace a key. The event is sent while the entry lock is
    /// held so watchers see changes in the order they were applied.
    fn put(&self, key: &str, value: Value, lease: Option<LeaseId>) {
        let mut entries = self.entries.lock();
        let kind = if entries.contains_key(key) {
            EventType::Update
        } else {
            EventType::Create
        };
        entries.insert(key.to_string(), Entry { value: value.clone(), lease });
        self.notify(Event::new(kind, key, value));
    }

    fn remove_where(&self, matches: impl Fn(&str, &Entry) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| matches(key, entry))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            entries.remove(key);
            self.notify(Event::deleted(key.as_str()));
        }
        keys.len()
    }

    /// Hand an event to every watcher of a matching prefix. Callers hold the
    /// entries lock so every watcher sees changes in apply order.
    fn notify(&self, event: Event) {
        self.watchers.lock().retain(|watcher| {
            !event.key.starts_with(&watcher.prefix) || watcher.tx.send(event.clone()).is_ok()
        });
    }

    fn unwatch(&self, id: WatcherId) {
        self.watchers.lock().retain(|watcher| watcher.id != id);
    }

    fn grant(&self, ttl: Duration) -> LeaseId {
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        self.leases.lock().insert(id, Instant::now() + ttl);
        id
    }

    /// Push the lease deadline out by `ttl`. False once the lease is gone.
    fn renew(&self, id: LeaseId, ttl: Duration) -> bool {
        match self.leases.lock().get_mut(&id) {
            Some(deadline) => {
                *deadline = Instant::now() + ttl;
                true
            }
            None => false,
        }
    }

    fn deadline(&self, id: LeaseId) -> Option<Instant> {
        self.leases.lock().get(&id).copied()
    }

    fn revoke(&self, id: LeaseId) {
        self.leases.lock().remove(&id);
        let removed = self.remove_where(|_, entry| entry.lease == Some(id));
        tracing::debug!("Lease {} expired, {} keys removed", id, removed);
    }
}

/// Sleep until the lease deadline, re-checking after every renewal
async fn expire_lease(inner: Weak<Inner>, id: LeaseId) {
    loop {
        let Some(deadline) = inner.upgrade().and_then(|inner| inner.deadline(id)) else {
            return;
        };

        if deadline <= Instant::now() {
            if let Some(inner) = inner.upgrade() {
                inner.revoke(id);
            }
            return;
        }

        tokio::time::sleep_until(deadline).await;
    }
}

/// Renew the lease every third of its TTL until cancelled
async fn keep_alive(inner: Weak<Inner>, id: LeaseId, ttl: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval((ttl / 3).max(MIN_RENEW_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let renewed = inner.upgrade().is_some_and(|inner| inner.renew(id, ttl));
                if !renewed {
                    return;
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("Keepalive for lease {} stopped", id);
                return;
            }
        }
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get(&self, key: &str) -> Result<Vec<KV>, DatabaseError> {
        let entries = self.inner.entries.lock();
        Ok(entries
            .get(key)
            .map(|entry| KV::new(key, entry.value.clone()))
            .into_iter()
            .collect())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KV>, DatabaseError> {
        let entries = self.inner.entries.lock();
        Ok(entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KV::new(key.as_str(), entry.value.clone()))
            .collect())
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        keepalive: Option<CancellationToken>,
    ) -> Result<(), DatabaseError> {
        let lease = match ttl.filter(|ttl| !ttl.is_zero()) {
            Some(ttl) => {
                let id = self.inner.grant(ttl);
                tokio::spawn(expire_lease(Arc::downgrade(&self.inner), id));
                if let Some(cancel) = keepalive {
                    tokio::spawn(keep_alive(Arc::downgrade(&self.inner), id, ttl, cancel));
                }
                Some(id)
            }
            None => None,
        };

        self.inner.put(key, value, lease);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DatabaseError> {
        self.inner.remove_where(|k, _| k == key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), DatabaseError> {
        self.inner.remove_where(|k, _| k.starts_with(prefix));
        Ok(())
    }

    async fn watch(&self, prefix: &str, cancel: CancellationToken)
        -> Result<WatchStream, DatabaseError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_watcher.fetch_add(1, Ordering::Relaxed);

        // Registered before returning so no change after this call is missed
        self.inner.watchers.lock().push(Watcher {
            id,
            prefix: prefix.to_string(),
            tx: tx.clone(),
        });
        tracing::info!("Watching {}", prefix);

        let inner = Arc::downgrade(&self.inner);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tx.closed() => {}
            }
            if let Some(inner) = inner.upgrade() {
                inner.unwatch(id);
            }
            tracing::info!("Stopped watching {}", prefix);
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_and_prefix_scan() {
        let db = MemoryDatabase::new();
        db.set("/a/1", "one".into(), None, None).await.unwrap();
        db.set("/a/2", "two".into(), None, None).await.unwrap();
        db.set("/b/1", "other".into(), None, None).await.unwrap();

        let exact = db.get("/a/1").await.unwrap();
        assert_eq!(exact, vec![KV::new("/a/1", "one")]);
        assert!(db.get("/a").await.unwrap().is_empty());

        let scanned = db.get_prefix("/a/").await.unwrap();
        let keys: Vec<&str> = scanned.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/a/1", "/a/2"]);
    }

    #[tokio::test]
    async fn test_delete_prefix_leaves_siblings() {
        let db = MemoryDatabase::new();
        db.set("/a", "leaf".into(), None, None).await.unwrap();
        db.set("/a/1", "one".into(), None, None).await.unwrap();
        db.set("/a/2", "two".into(), None, None).await.unwrap();

        db.delete_prefix("/a/").await.unwrap();

        assert_eq!(db.len(), 1);
        assert_eq!(db.get("/a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_reports_changes_in_order() {
        let db = MemoryDatabase::new();
        let cancel = CancellationToken::new();
        let mut stream = db.watch("/w/", cancel.clone()).await.unwrap();

        db.set("/w/k", "v1".into(), None, None).await.unwrap();
        db.set("/other", "ignored".into(), None, None).await.unwrap();
        db.set("/w/k", "v2".into(), None, None).await.unwrap();
        db.delete("/w/k").await.unwrap();

        assert_eq!(stream.recv().await.unwrap(), Event::new(EventType::Create, "/w/k", "v1"));
        assert_eq!(stream.recv().await.unwrap(), Event::new(EventType::Update, "/w/k", "v2"));
        assert_eq!(stream.recv().await.unwrap(), Event::deleted("/w/k"));

        cancel.cancel();
        assert!(stream.recv().await.is_none(), "stream should end after cancel");
    }

    #[tokio::test]
    async fn test_watch_keeps_burst_larger_than_any_buffer() {
        let db = MemoryDatabase::new();
        let mut stream = db.watch("/burst/", CancellationToken::new()).await.unwrap();

        // Nothing reads the stream while the writes happen
        for n in 0..10_000u32 {
            db.set(&format!("/burst/{:05}", n), n.into(), None, None).await.unwrap();
        }

        for n in 0..10_000u32 {
            let event = stream.recv().await.unwrap();
            assert_eq!(event.key, format!("/burst/{:05}", n));
            assert_eq!(event.kind, EventType::Create);
        }
        assert!(stream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watcher_released_on_cancel_or_drop() {
        let db = MemoryDatabase::new();
        let cancel = CancellationToken::new();
        let _kept = db.watch("/a/", cancel.clone()).await.unwrap();
        let dropped = db.watch("/b/", CancellationToken::new()).await.unwrap();
        assert_eq!(db.watcher_count(), 2);

        drop(dropped);
        cancel.cancel();
        for _ in 0..100 {
            if db.watcher_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(db.watcher_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_keepalive() {
        let db = MemoryDatabase::new();
        let mut stream = db.watch("/", CancellationToken::new()).await.unwrap();

        db.set("/ttl", "v".into(), Some(Duration::from_secs(10)), None).await.unwrap();
        assert_eq!(db.get("/ttl").await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(db.get("/ttl").await.unwrap().is_empty());
        assert_eq!(db.lease_count(), 0);
        assert_eq!(stream.recv().await.unwrap().kind, EventType::Create);
        assert_eq!(stream.recv().await.unwrap(), Event::deleted("/ttl"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_renews_until_cancelled() {
        let db = MemoryDatabase::new();
        let cancel = CancellationToken::new();

        db.set("/hb", "v".into(), Some(Duration::from_secs(3)), Some(cancel.clone()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(db.get("/hb").await.unwrap().len(), 1, "renewed key must survive");

        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(db.get("/hb").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_detaches_lease() {
        let db = MemoryDatabase::new();
        db.set("/k", "short".into(), Some(Duration::from_secs(1)), None).await.unwrap();
        db.set("/k", "forever".into(), None, None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(db.get("/k").await.unwrap(), vec![KV::new("/k", "forever")]);
    }
}
