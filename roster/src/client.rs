use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use shared::types::Instance;
use crate::config::{Config, BACKEND_MEMORY};
use crate::db::{Database, MemoryDatabase};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::storage::Storages;

/// Registry and storages over one database connection.
///
/// Everything the client starts (watches, lease renewal, handler delivery)
/// stops when the `cancel` token given at construction fires.
#[derive(Clone)]
pub struct Client {
    config: Config,
    registry: Registry,
    storages: Storages,
}

impl Client {
    /// Open the configured backend, then build the client on top of it.
    /// If `instance` is given it is registered before this returns.
    pub async fn init(config: Config, cancel: CancellationToken, instance: Option<Instance>) -> Result<Self> {
        let config = config.normalize();
        let db: Arc<dyn Database> = match config.backend.as_str() {
            BACKEND_MEMORY => Arc::new(MemoryDatabase::new()),
            other => return Err(Error::BackendUnsupported(other.to_string())),
        };
        Self::with_database(db, config, cancel, instance).await
    }

    pub async fn with_database(
        db: Arc<dyn Database>,
        config: Config,
        cancel: CancellationToken,
        instance: Option<Instance>,
    ) -> Result<Self> {
        let config = config.normalize();
        tracing::info!(
            "Client starting: backend={}, prefix={}, heartbeat={:?}",
            config.backend,
            config.prefix,
            config.heartbeat()
        );

        let registry = Registry::new(db.clone(), &config, cancel.clone()).await?;
        if let Some(instance) = instance {
            registry.register(instance).await?;
        }
        let storages = Storages::new(db, &config, cancel).await?;

        Ok(Self { config, registry, storages })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn storages(&self) -> &Storages {
        &self.storages
    }

    /// The normalized configuration in effect
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Holds at most one [`Client`] for the lifetime of the process
#[derive(Default)]
pub struct ClientCell {
    cell: OnceCell<Client>,
}

impl ClientCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct the client on the first call. Later calls return the
    /// existing client and ignore their arguments.
    pub async fn init(
        &self,
        config: Config,
        cancel: CancellationToken,
        instance: Option<Instance>,
    ) -> Result<&Client> {
        self.cell
            .get_or_try_init(|| Client::init(config, cancel, instance))
            .await
    }

    /// The client, if it has been initialized
    pub fn get(&self) -> Option<&Client> {
        self.cell.get()
    }
}
