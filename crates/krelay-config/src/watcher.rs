//! `ConfigWatcher` (SPEC_FULL §6): debounces filesystem events on the
//! resolved config path and republishes a validated snapshot through an
//! `ArcSwap`, so readers never observe a torn config.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::loader::ConfigLoader;
use crate::validate::Config;

/// Settle window applied after a filesystem event before reloading, and the
/// single retry granted to a `Rename` event that briefly races the target
/// path not existing (spec §9's open question resolves this as "one retry,
/// no further robustness guaranteed").
const DEBOUNCE: Duration = Duration::from_millis(100);

pub struct ConfigWatcher {
    current: Arc<ArcSwap<Config>>,
    _watcher: RecommendedWatcher,
    _task: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Starts watching `path`. `initial` is the already-validated config
    /// loaded at startup; reloads only ever replace it with another
    /// validated config, never with a partially-parsed one.
    pub fn spawn(path: PathBuf, initial: Config) -> notify::Result<Self> {
        let current = Arc::new(ArcSwap::from_pointee(initial));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        let snapshot = Arc::clone(&current);
        let watch_path = path.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)) {
                    continue;
                }
                tokio::time::sleep(DEBOUNCE).await;
                reload_once(&watch_path, &snapshot).await;
            }
        });

        Ok(Self {
            current,
            _watcher: watcher,
            _task: task,
        })
    }

    pub fn current(&self) -> Arc<Config> {
        self.current.load_full()
    }
}

async fn reload_once(path: &Path, snapshot: &Arc<ArcSwap<Config>>) {
    let mut attempt = ConfigLoader::load(path);
    if attempt.is_err() {
        // A `Rename` can land us here transiently while the replacement
        // file is still being written; settle once more before giving up.
        tokio::time::sleep(DEBOUNCE).await;
        attempt = ConfigLoader::load(path);
    }

    match attempt {
        Ok(config) => {
            info!(path = %path.display(), "config reloaded");
            snapshot.store(Arc::new(config));
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "config reload failed, keeping prior configuration");
        }
    }
    debug!(path = %path.display(), "config watcher settled");
}
