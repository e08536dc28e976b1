//! Filesystem watcher feeding partial updates.
//!
//! Watches the base directories of registered pools and emits one
//! [`WatchEvent`] per changed item file after debouncing. The watcher only
//! reports; callers pass the paths to [`crate::Updater::update_file`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::registry::PoolRegistry;

const ITEM_EXTENSION: &str = "json";
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Events emitted by the pool watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// An item file was created, modified or removed. The debouncer does not
    /// tell these apart; the updater checks whether the file still exists.
    FileModified(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::FileModified(path) => path,
        }
    }
}

/// Watcher over the base directories of a set of pools
pub struct PoolWatcher {
    debouncer: Option<Debouncer<RecommendedWatcher>>,
    event_tx: broadcast::Sender<WatchEvent>,
    watched: Vec<PathBuf>,
    debounce: Duration,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl PoolWatcher {
    pub fn new() -> Self {
        Self::with_debounce(DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(debounce: Duration) -> Self {
        let (tx, _) = broadcast::channel(100);
        Self {
            debouncer: None,
            event_tx: tx,
            watched: Vec::new(),
            debounce,
            handle: None,
        }
    }

    /// Watch every pool of `registry`.
    pub async fn watch_registry(&mut self, registry: &PoolRegistry) -> Result<()> {
        let roots = registry.pools().iter().map(|p| p.base_path.clone()).collect();
        self.watch(roots).await
    }

    /// Start watching `roots` recursively, replacing any previous session.
    pub async fn watch(&mut self, roots: Vec<PathBuf>) -> Result<()> {
        self.unwatch().await?;
        if roots.is_empty() {
            anyhow::bail!("No pool directories to watch");
        }

        let (debounce_tx, debounce_rx) = std::sync::mpsc::channel();
        let mut debouncer =
            new_debouncer(self.debounce, debounce_tx).context("Failed to create file watcher debouncer")?;

        let mut watched = Vec::with_capacity(roots.len());
        for root in roots {
            let root = root
                .canonicalize()
                .with_context(|| format!("Failed to canonicalize pool path: {:?}", root))?;
            if !root.is_dir() {
                anyhow::bail!("Pool path is not a directory: {:?}", root);
            }
            debouncer
                .watcher()
                .watch(&root, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to start watching: {:?}", root))?;
            info!("Watching pool directory {:?}", root);
            watched.push(root);
        }

        let (tx, _) = broadcast::channel(100);
        self.event_tx = tx;
        let event_tx = self.event_tx.clone();
        let roots = watched.clone();

        // Ends once the debouncer, and with it the sender, is dropped.
        let handle = tokio::task::spawn_blocking(move || loop {
            match debounce_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(events)) => {
                    for event in Self::process_debounced_events(&roots, &events) {
                        debug!("Emitting watch event: {:?}", event);
                        if let Err(e) = event_tx.send(event) {
                            warn!("No subscriber for watch event: {}", e);
                        }
                    }
                }
                Ok(Err(e)) => error!("Watcher error: {:?}", e),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    info!("Watcher channel disconnected");
                    break;
                }
            }
        });

        self.debouncer = Some(debouncer);
        self.watched = watched;
        self.handle = Some(handle);
        Ok(())
    }

    pub async fn unwatch(&mut self) -> Result<()> {
        if let Some(mut debouncer) = self.debouncer.take() {
            for root in &self.watched {
                if let Err(e) = debouncer.watcher().unwatch(root) {
                    debug!("Failed to unwatch {:?}: {}", root, e);
                }
            }
        }
        if let Some(handle) = self.handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Err(e)) => warn!("Watcher task ended abnormally: {}", e),
                Err(_) => warn!("Watcher task did not stop in time"),
                Ok(Ok(())) => {}
            }
        }
        if !self.watched.is_empty() {
            info!("Stopped watching {} pool directories", self.watched.len());
        }
        self.watched.clear();
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.event_tx.subscribe()
    }

    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watched
    }

    pub fn is_watching(&self) -> bool {
        self.debouncer.is_some() && !self.watched.is_empty()
    }

    /// JSON file below one of `roots`, not inside a hidden directory.
    fn is_item_file(roots: &[PathBuf], path: &Path) -> bool {
        let Some(rel) = roots.iter().find_map(|root| path.strip_prefix(root).ok()) else {
            return false;
        };
        let hidden = rel
            .components()
            .any(|c| c.as_os_str().to_str().map(|s| s.starts_with('.')).unwrap_or(false));
        !hidden && path.extension().and_then(|ext| ext.to_str()) == Some(ITEM_EXTENSION)
    }

    /// Item file events, one per path, in the order first seen.
    fn process_debounced_events(roots: &[PathBuf], events: &[DebouncedEvent]) -> Vec<WatchEvent> {
        let mut out: Vec<WatchEvent> = Vec::new();
        for event in events {
            if !Self::is_item_file(roots, &event.path) {
                continue;
            }
            let watch_event = WatchEvent::FileModified(event.path.clone());
            if !out.contains(&watch_event) {
                out.push(watch_event);
            }
        }
        out
    }
}

impl Default for PoolWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PoolWatcher {
    fn drop(&mut self) {
        // Dropping the debouncer disconnects the channel and ends the task.
        self.debouncer.take();
        self.handle.take();
    }
}
