//! Entity sync daemon
//!
//! Connects to the remote source, mirrors the standard variables into a
//! [`StateStore`], keeps the derived occupancy states current, and resyncs
//! after every reconnect.

use std::sync::Arc;

use anyhow::{Context, Result};
use ha_client::Client;
use ha_config::SyncConfig;
use ha_core::RemoteSource;
use ha_state_store::{default_variables, derived, ComputedEngine, StateStore};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// The running sync layer
struct SyncLayer {
    client: Client,
    store: Arc<StateStore>,
    engine: ComputedEngine,
}

impl SyncLayer {
    async fn start(config: SyncConfig) -> Result<Self> {
        let read_only = config.read_only;
        let client = Client::new(config);
        client
            .connect_with_retry()
            .await
            .context("failed to connect to remote source")?;

        let remote: Arc<dyn RemoteSource> = Arc::new(client.clone());
        let store = StateStore::with_options(remote, default_variables(), read_only);
        let summary = store.sync_from_source().await.context("initial sync failed")?;
        info!(
            synced = summary.synced,
            defaulted = summary.defaulted,
            local = summary.local,
            "Initial sync complete"
        );

        let engine = ComputedEngine::new(store.clone());
        derived::register_standard(&engine).context("failed to register derived states")?;

        Ok(Self { client, store, engine })
    }

    /// Resync every time the session comes back up
    async fn watch_reconnects(&self, mut status: watch::Receiver<bool>) {
        let mut generation = self.client.session_generation();
        while status.changed().await.is_ok() {
            let connected = *status.borrow_and_update();
            if !connected {
                warn!("Lost connection to remote source");
                continue;
            }
            let current = self.client.session_generation();
            if current == generation {
                continue;
            }
            generation = current;

            match self.store.sync_from_source().await {
                Ok(summary) => {
                    info!(generation, changed = summary.changed, "Resynced after reconnect");
                    self.engine.recompute_all();
                }
                Err(e) => error!(generation, error = %e, "Resync failed"),
            }
        }
    }

    async fn shutdown(&self) {
        self.store.flush().await;
        self.client.disconnect().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = SyncConfig::from_env()?;
    config.validate()?;
    info!(url = %config.ws_url(), read_only = config.read_only, "Starting entity sync");

    let layer = SyncLayer::start(config).await?;
    info!(variables = layer.store.keys().len(), "Entity sync is running");

    let status = layer.client.connection_status();
    tokio::select! {
        _ = layer.watch_reconnects(status) => {}
        result = tokio::signal::ctrl_c() => result?,
    }

    info!("Shutting down...");
    layer.shutdown().await;
    Ok(())
}
