//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ProxyConfig;

/// Watches the configuration file and publishes every valid revision.
///
/// Invalid revisions are logged and dropped; the gateway keeps serving the
/// last configuration that validated.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Create a watcher for `path` and the receiver the server drains.
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

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self { path, update_tx } = self;
        let reload_path = path.clone();

        let handler = move |res: notify::Result<Event>| match res {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                match load_config(&reload_path) {
                    Ok(config) => {
                        tracing::info!(path = %reload_path.display(), routes = config.routes.len(), "Configuration change detected");
                        if update_tx.send(config).is_err() {
                            tracing::debug!("Config receiver dropped, ignoring change");
                        }
                    }
                    Err(e) => {
                        tracing::error!(path = %reload_path.display(), error = %e, "Rejected configuration change, keeping current routes");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Config watch error"),
        };

        let mut watcher = RecommendedWatcher::new(
            handler,
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %path.display(), "Config watcher started");
        Ok(watcher)
    }
}
