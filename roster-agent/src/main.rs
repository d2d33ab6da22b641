mod config;

use std::time::Duration;
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use roster::{Client, EventType, InstanceEvent, Storage, Value};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("roster=info,roster_agent=info"))
        )
        .init();

    tracing::info!("Starting roster-agent");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/roster/agent.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let cancel = CancellationToken::new();

    let client = Client::init(config.registry.clone(), cancel.clone(), Some(config.instance.clone()))
        .await
        .context("Failed to start registry client")?;

    if client.config().backend == roster::config::BACKEND_MEMORY {
        tracing::warn!("Memory backend is process-local; other agents will not see this one");
    }

    let Some(me) = client.registry().current_instance() else {
        anyhow::bail!("Registration did not take effect");
    };
    tracing::info!("Registered as {} on {}:{}", me.identity(), me.host, me.port);

    client.registry().register_event_handler(log_membership);

    // Status entry lives exactly as long as this process keeps renewing it
    let status = client
        .storages()
        .get(&config.agent.status_storage)
        .await
        .context("Failed to open status storage")?;
    let status_value = Value::from_json(&me).context("Failed to encode status")?;
    status
        .set_ttl(&me.identity(), status_value, client.config().heartbeat(), Some(cancel.child_token()))
        .await
        .context("Failed to publish status")?;

    // Periodic membership summary
    let report_cancel = cancel.clone();
    let report_client = client.clone();
    let report_interval = Duration::from_secs(config.agent.report_interval_secs.max(1));
    let report_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(report_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => report(&report_client),
                _ = report_cancel.cancelled() => break,
            }
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    if let Err(e) = client.registry().deregister().await {
        tracing::error!("Failed to deregister: {}", e);
    }
    if let Err(e) = status.delete(&me.identity()).await {
        tracing::error!("Failed to remove status entry: {}", e);
    }

    // Stops watches, lease renewal and handler delivery
    cancel.cancel();
    let _ = report_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn log_membership(event: InstanceEvent) {
    match (event.kind, event.instance) {
        (EventType::Create, Some(instance)) => {
            tracing::info!("Instance joined: {} at {}:{}", instance.identity(), instance.host, instance.port)
        }
        (EventType::Update, Some(instance)) => {
            tracing::info!("Instance updated: {}", instance.identity())
        }
        (EventType::Delete, Some(instance)) => {
            tracing::info!("Instance left: {}", instance.identity())
        }
        (kind, None) => tracing::debug!("Unresolved {} event for {}", kind, event.key),
    }
}

fn report(client: &Client) {
    let services = client.registry().get_services();
    let total: usize = services.values().map(|service| service.len()).sum();
    match client.registry().services_hash() {
        Ok(hash) => tracing::info!(
            "Membership: {} services, {} instances, hash={}",
            services.len(),
            total,
            hash
        ),
        Err(e) => tracing::error!("Failed to hash membership: {}", e),
    }
}
