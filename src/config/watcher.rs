//! Configuration file watcher for hot reload.
//!
//! Only the `inspection` section is applied live; see [`apply_reload`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::{InspectionConfig, ProxyConfig};
use crate::lifecycle::ShutdownSignal;

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file in a background thread.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!("Config file change detected, reloading...");
                        match load_config(&path) {
                            Ok(new_config) => {
                                let _ = tx.send(new_config);
                            }
                            Err(e) => {
                                tracing::error!(
                                    "Failed to reload config: {}. Keeping current configuration.",
                                    e
                                );
                            }
                        }
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Apply a reloaded configuration to the running proxy.
///
/// Inspection settings are swapped in place; listeners and the handler
/// registry are fixed for the process lifetime, so any difference there is
/// only reported.
pub fn apply_reload(
    current: &ProxyConfig,
    reloaded: &ProxyConfig,
    inspection: &ArcSwap<InspectionConfig>,
) {
    inspection.store(Arc::new(reloaded.inspection.clone()));
    tracing::info!(
        pause_by_default = reloaded.inspection.pause_by_default,
        pause_timeout_ms = reloaded.inspection.pause_timeout_ms,
        "Inspection settings reloaded"
    );

    let listeners_changed = current.server.host != reloaded.server.host
        || current.server.max_connections != reloaded.server.max_connections
        || current
            .protocols
            .enabled()
            .map(|(kind, c)| (kind, c.port))
            .ne(reloaded.protocols.enabled().map(|(kind, c)| (kind, c.port)));
    if listeners_changed {
        tracing::warn!("Listener or protocol changes detected; they take effect after a restart");
    }
}

/// Consume reloaded configurations until shutdown.
pub async fn run_reload_loop(
    mut current: ProxyConfig,
    mut updates: mpsc::UnboundedReceiver<ProxyConfig>,
    inspection: Arc<ArcSwap<InspectionConfig>>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(reloaded) => {
                    apply_reload(&current, &reloaded, &inspection);
                    current = reloaded;
                }
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }
}
