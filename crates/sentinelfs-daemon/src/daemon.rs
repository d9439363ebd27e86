//! Daemon orchestrator.
//!
//! Owns a `ConfigManager` and a single `sentinelfs_system::Core`, and
//! drives the poll/print loop until a shutdown signal arrives.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentinelfs_system::Core;
use tokio::signal;
use tracing::info;

use crate::config::ConfigManager;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Foreground daemon: watches `config.watch.root`, prints every
/// released event as a JSON line, respecting include/exclude patterns.
pub struct Daemon {
    config_manager: ConfigManager,
    core: Core,
}

impl Daemon {
    pub async fn new(config_manager: ConfigManager) -> Result<Self> {
        let config = config_manager.get_config().await;
        let core = Core::new(config.watch.root.clone(), config.tunables.to_core_config());
        Ok(Self {
            config_manager,
            core,
        })
    }

    /// Runs until Ctrl-C or SIGTERM, then shuts the core down cleanly.
    pub async fn run(mut self) -> Result<()> {
        info!(root = %self.core.root().display(), "sentinelfs daemon starting");

        self.core
            .start()
            .await
            .with_context(|| "failed to start the watcher core")?;
        let patterns = self.config_manager.get_patterns().await;

        info!("sentinelfs daemon started successfully");

        let mut poll_interval = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    for event in self.core.poll().await {
                        let ref_path = event.to_path.as_deref().unwrap_or(&event.path);
                        if patterns.should_watch(Path::new(ref_path)) {
                            match serde_json::to_string(&event) {
                                Ok(line) => println!("{line}"),
                                Err(e) => tracing::warn!("failed to serialize event: {}", e),
                            }
                        }
                    }
                }
                _ = shutdown_signal() => {
                    info!("received shutdown signal");
                    break;
                }
            }
        }

        self.core.stop();
        info!("sentinelfs daemon stopped");
        Ok(())
    }
}
