//! Config file watcher for hot reload.
//!
//! Only the selector section is applied live (see `RpcClient::apply_tuning`);
//! the rest of a reloaded config is ignored until restart.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::AccessConfig;

/// Reloaded configs waiting to be applied.
const UPDATE_BUFFER: usize = 4;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct ConfigWatcher {
    path: PathBuf,
    updates: mpsc::Sender<AccessConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiving end of validated reloads.
    pub fn new(path: &Path) -> (Self, mpsc::Receiver<AccessConfig>) {
        let (updates, rx) = mpsc::channel(UPDATE_BUFFER);
        (
            Self {
                path: path.to_path_buf(),
                updates,
            },
            rx,
        )
    }

    /// Start watching. Dropping the returned handle stops the watch.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self { path, updates } = self;
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = %e, "Config watch error");
                        return;
                    }
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                reload(&path, &updates);
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;

        watcher.watch(&watched, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %watched.display(), "Config watcher started");
        Ok(watcher)
    }
}

fn reload(path: &Path, updates: &mpsc::Sender<AccessConfig>) {
    match load_config(path) {
        Ok(config) => match updates.try_send(config) {
            Ok(()) => tracing::info!(path = %path.display(), "Config reloaded"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Config update queue full, dropping reload")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Config update receiver gone")
            }
        },
        Err(e) => tracing::error!(
            error = %e,
            "Config reload rejected, keeping current configuration"
        ),
    }
}
