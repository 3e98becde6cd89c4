//! Settings manager - current config snapshot plus change notifications

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

pub struct SettingsManager {
    current: RwLock<Arc<Config>>,
    tx: broadcast::Sender<Arc<Config>>,
}

impl SettingsManager {
    pub fn new(config: Config) -> Self {
        let (tx, _) = broadcast::channel(8);
        Self {
            current: RwLock::new(Arc::new(config)),
            tx,
        }
    }

    pub async fn current(&self) -> Arc<Config> {
        self.current.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }

    /// Validate and publish a new snapshot. Invalid configs leave the current one in place.
    pub async fn update(&self, config: Config) -> Result<()> {
        config.validate()?;
        let config = Arc::new(config);
        *self.current.write().await = config.clone();
        let receivers = self.tx.send(config).unwrap_or(0);
        info!("[Settings] Published new config to {} subscribers", receivers);
        Ok(())
    }

    /// Re-read the environment (and `.env`) and publish the result
    pub async fn reload_from_env(&self) -> Result<()> {
        let config = Config::from_env()?;
        self.update(config).await
    }
}
