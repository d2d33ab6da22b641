pub mod hash;
pub mod service;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use shared::kv::{Event, EventType, Value};
use shared::protocol::registry_key;
use shared::types::Instance;
use crate::config::Config;
use crate::db::{Database, WatchStream};
use crate::error::{Error, Result};
use crate::events::EventBus;

pub use service::Service;

/// An instance lifecycle change observed through the watch
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    pub kind: EventType,
    /// Registry key the event was reported for
    pub key: String,
    /// Decoded instance for create/update; the removed instance for delete, if it was cached
    pub instance: Option<Instance>,
}

/// Mirror of every instance under `<prefix>registry/`. The local instance is
/// written with a lease of one heartbeat interval.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<dyn Database>,
    prefix: String,
    root_prefix: String,
    heartbeat: Duration,
    services: DashMap<String, Arc<Service>>,
    current: RwLock<Option<Instance>>,
    lease: Mutex<Option<CancellationToken>>,
    // Serializes register/deregister across their remote calls
    registering: tokio::sync::Mutex<()>,
    events: EventBus<InstanceEvent>,
    cancel: CancellationToken,
}

impl Registry {
    /// Build the cache and start following the registry namespace.
    /// The watch runs until `cancel` fires.
    pub async fn new(db: Arc<dyn Database>, config: &Config, cancel: CancellationToken) -> Result<Self> {
        let inner = Arc::new(Inner {
            db,
            prefix: config.registry_prefix(),
            root_prefix: config.prefix.clone(),
            heartbeat: config.heartbeat(),
            services: DashMap::new(),
            current: RwLock::new(None),
            lease: Mutex::new(None),
            registering: tokio::sync::Mutex::new(()),
            events: EventBus::new(cancel.clone()),
            cancel: cancel.clone(),
        });

        // Watch first: events racing the scan are replayed on top of it
        let stream = inner.db.watch(&inner.prefix, cancel.clone()).await?;
        if let Err(e) = inner.build_cache().await {
            tracing::error!("Registry failed to build cache: {}", e);
        }
        tokio::spawn(run_watch(inner.clone(), stream, cancel));

        Ok(Self { inner })
    }

    /// Register the local instance with a renewing lease.
    ///
    /// Fails with [`Error::AlreadyRegistered`] if this registry already owns an
    /// instance or the identity is already present in its service.
    pub async fn register(&self, mut instance: Instance) -> Result<Instance> {
        let _guard = self.inner.registering.lock().await;

        if self.inner.current.read().is_some() {
            return Err(Error::AlreadyRegistered);
        }

        instance.fill_defaults();
        let identity = instance.identity();
        let taken = self
            .inner
            .services
            .get(&instance.service_name)
            .is_some_and(|service| service.contains(&identity));
        if taken {
            return Err(Error::AlreadyRegistered);
        }

        // Outlives the caller's request; only deregister or shutdown stops it
        let lease = self.inner.cancel.child_token();
        let value = Value::from_json(&instance)?;
        self.inner
            .db
            .set(
                &self.key(&identity),
                value,
                Some(self.inner.heartbeat),
                Some(lease.clone()),
            )
            .await?;

        *self.inner.lease.lock() = Some(lease);
        *self.inner.current.write() = Some(instance.clone());
        tracing::info!("Registered {} with {:?} heartbeat", identity, self.inner.heartbeat);

        if let Err(e) = self.inner.build_cache().await {
            tracing::error!("Registry failed to rebuild cache after register: {}", e);
        }
        Ok(instance)
    }

    /// Remove the local instance from the store. No-op if nothing is registered.
    /// The cache catches up through the resulting delete event.
    pub async fn deregister(&self) -> Result<()> {
        let _guard = self.inner.registering.lock().await;

        let Some(identity) = self.inner.current.read().as_ref().map(Instance::identity) else {
            return Ok(());
        };

        self.inner.db.delete(&self.key(&identity)).await?;

        if let Some(lease) = self.inner.lease.lock().take() {
            lease.cancel();
        }
        *self.inner.current.write() = None;
        tracing::info!("Deregistered {}", identity);
        Ok(())
    }

    pub fn get_service(&self, name: &str) -> Result<Arc<Service>> {
        self.inner
            .services
            .get(name)
            .map(|service| service.value().clone())
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    /// Point-in-time snapshot of every cached service
    pub fn get_services(&self) -> HashMap<String, Arc<Service>> {
        self.inner
            .services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Copy of the instance this registry owns, as last seen through the watch
    pub fn current_instance(&self) -> Option<Instance> {
        self.inner.current.read().clone()
    }

    /// Handlers are invoked for every instance change applied from the watch
    pub fn register_event_handler<F>(&self, handler: F)
    where
        F: FnMut(InstanceEvent) + Send + 'static,
    {
        self.inner.events.subscribe(handler);
    }

    /// Merge a fresh prefix scan into the cache
    pub async fn rebuild(&self) -> Result<usize> {
        self.inner.build_cache().await
    }

    /// Fingerprint of every cached instance; changes whenever membership or metadata does
    pub fn services_hash(&self) -> Result<String> {
        let instances: Vec<Instance> = self
            .get_services()
            .values()
            .flat_map(|service| service.instances())
            .collect();
        Ok(hash::compute_hash(&instances)?)
    }

    fn key(&self, identity: &str) -> String {
        registry_key(&self.inner.root_prefix, identity)
    }
}

impl Inner {
    /// Merge every registered instance into the cache. Existing entries are
    /// upserted, never cleared, so instances learned from the watch during the
    /// scan are kept.
    async fn build_cache(&self) -> Result<usize> {
        let kvs = self.db.get_prefix(&self.prefix).await?;

        let mut size = 0;
        for kv in kvs {
            match kv.value.json::<Instance>() {
                Ok(instance) => {
                    self.upsert(instance);
                    size += 1;
                }
                Err(e) => tracing::error!("Registry skipped malformed entry {}: {}", kv.key, e),
            }
        }

        tracing::info!("Registry cache built, size={}", size);
        Ok(size)
    }

    fn upsert(&self, instance: Instance) {
        // Holding the map entry keeps a concurrent prune from orphaning the service
        let service = self
            .services
            .entry(instance.service_name.clone())
            .or_insert_with(|| Arc::new(Service::new(instance.service_name.clone())));
        service.upsert(instance);
    }

    fn remove(&self, identity: &str) -> Option<Instance> {
        let services: Vec<Arc<Service>> = self
            .services
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for service in services {
            if let Some(instance) = service.remove(identity) {
                self.services.remove_if(service.name(), |_, s| s.is_empty());
                return Some(instance);
            }
        }
        None
    }

    fn apply(&self, event: Event) {
        let instance = match event.kind {
            EventType::Delete => {
                let identity = event.key.strip_prefix(&self.prefix).unwrap_or(&event.key);
                tracing::debug!("Registry delete event: {}", event.key);
                self.remove(identity)
            }
            EventType::Create | EventType::Update => {
                tracing::debug!("Registry {} event: {}", event.kind, event.key);
                let instance = match event.value.json::<Instance>() {
                    Ok(instance) => instance,
                    Err(e) => {
                        tracing::error!("Registry dropped {} event for {}: {}", event.kind, event.key, e);
                        return;
                    }
                };

                self.upsert(instance.clone());

                let identity = instance.identity();
                let mut current = self.current.write();
                if current.as_ref().is_some_and(|c| c.identity() == identity) {
                    *current = Some(instance.clone());
                }
                Some(instance)
            }
        };

        self.events.publish(InstanceEvent {
            kind: event.kind,
            key: event.key,
            instance,
        });
    }
}

/// Apply watch events until cancelled
async fn run_watch(inner: Arc<Inner>, mut stream: WatchStream, cancel: CancellationToken) {
    tracing::info!("Registry watching {}", inner.prefix);
    loop {
        tokio::select! {
            event = stream.recv() => {
                match event {
                    Some(event) => inner.apply(event),
                    None => {
                        tracing::warn!("Registry watch stream closed");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Registry watch shutting down");
                break;
            }
        }
    }
}
