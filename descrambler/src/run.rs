use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use descrambler_core::manager::{JsonFileStore, SettingsStore};
use descrambler_core::{logging, ClientManager, Config};

#[derive(Args, Debug)]
pub struct Run {
    /// Configuration file
    #[arg(long, env = "DESCRAMBLER_CONFIG")]
    config: Option<String>,

    /// JSON file the client list is kept in. Seeded from the configuration
    /// when it does not exist yet.
    #[arg(long, env = "DESCRAMBLER_STATE")]
    state: Option<String>,
}

impl Run {
    pub async fn execute(self) -> Result<()> {
        let config = Config::load(self.config.as_deref()).context("loading configuration")?;
        if let Err(errors) = config.validate() {
            for e in &errors {
                eprintln!("Config validation error: {e}");
            }
            anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
        }

        logging::init_logging(&config.logging)?;
        info!("descrambler starting...");

        let manager = match &self.state {
            Some(path) => {
                let store = Arc::new(JsonFileStore::new(path));
                if store.load()?.is_empty() && !config.clients.is_empty() {
                    info!(path = %path, clients = config.clients.len(), "seeding client settings");
                    store.save(&config.clients)?;
                }
                ClientManager::with_store(store)?
            }
            None => ClientManager::from_config(&config)?,
        };
        manager.start();
        for client in manager.clients() {
            info!(client = %client.name, kind = client.kind, enabled = client.enabled, "client configured");
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "waiting for Ctrl-C failed, shutting down");
        }
        info!("shutting down...");
        manager.stop().await;
        info!("descrambler stopped");
        Ok(())
    }
}
