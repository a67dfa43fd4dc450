//! Filesystem notifications.
//!
//! One watcher covers the configured log roots (recursively, plus each
//! root's parent so a root created later becomes visible); a second, smaller
//! watcher follows the configuration file for hot reload. Notifications are
//! best-effort on every platform, so the periodic rescan remains the
//! backstop: a dropped event delays a file, it never loses one.

use crate::config::{Config, SharedConfig};
use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const WATCHER_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub enum FileEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

/// Watches the log roots and forwards file-level changes until cancelled.
pub async fn watch_directories(
    roots: Vec<PathBuf>,
    event_tx: mpsc::Sender<FileEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |result| {
            let _ = raw_tx.send(result);
        },
        NotifyConfig::default(),
    )
    .context("failed to create filesystem watcher")?;

    let mut watched: HashSet<PathBuf> = HashSet::new();
    for root in &roots {
        subscribe_root(&mut watcher, root, &mut watched);
        if let Some(parent) = root.parent() {
            if watched.insert(parent.to_path_buf()) {
                if let Err(err) = watcher.watch(parent, RecursiveMode::NonRecursive) {
                    debug!(error = %err, path = %parent.display(), "cannot watch root parent");
                }
            }
        }
    }

    info!(count = roots.len(), "directory watcher started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = raw_rx.recv() => match maybe {
                Some(Ok(event)) => {
                    handle_event(&mut watcher, &roots, &mut watched, event, &event_tx);
                }
                Some(Err(err)) => error!(error = %err, "filesystem watcher error"),
                None => break,
            }
        }
    }

    Ok(())
}

fn subscribe_root(watcher: &mut RecommendedWatcher, root: &Path, watched: &mut HashSet<PathBuf>) {
    if !watched.insert(root.to_path_buf()) {
        return;
    }
    match watcher.watch(root, RecursiveMode::Recursive) {
        Ok(()) => info!(path = %root.display(), "watching log root"),
        Err(err) => {
            // The root may simply not exist yet; the parent watch plus the
            // periodic rescan will pick it up later.
            debug!(error = %err, path = %root.display(), "cannot watch log root yet");
            watched.remove(root);
        }
    }
}

fn handle_event(
    watcher: &mut RecommendedWatcher,
    roots: &[PathBuf],
    watched: &mut HashSet<PathBuf>,
    event: Event,
    event_tx: &mpsc::Sender<FileEvent>,
) {
    match event.kind {
        EventKind::Create(_) => {
            for path in event.paths {
                if path.is_dir() {
                    if roots.contains(&path) {
                        subscribe_root(watcher, &path, watched);
                    }
                    continue;
                }
                forward(event_tx, FileEvent::Created(path));
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Renames arrive as name-modifications; a path that still exists
            // was renamed in, one that is gone was renamed away.
            for path in event.paths {
                if path.is_dir() {
                    if roots.contains(&path) {
                        subscribe_root(watcher, &path, watched);
                    }
                    continue;
                }
                if path.exists() {
                    forward(event_tx, FileEvent::Created(path));
                } else {
                    forward(event_tx, FileEvent::Removed(path));
                }
            }
        }
        EventKind::Modify(_) => {
            for path in event.paths {
                if path.is_file() {
                    forward(event_tx, FileEvent::Modified(path));
                }
            }
        }
        EventKind::Remove(_) => {
            for path in event.paths {
                forward(event_tx, FileEvent::Removed(path));
            }
        }
        _ => {}
    }
}

fn forward(event_tx: &mpsc::Sender<FileEvent>, event: FileEvent) {
    use tokio::sync::mpsc::error::TrySendError;
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            warn!(?event, "watcher channel full; dropping file event");
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

/// Follows the configuration file and swaps validated reloads into `shared`.
/// An unreadable or invalid file keeps the previous configuration.
pub async fn watch_config(
    config_path: PathBuf,
    shared: SharedConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |result| {
            let _ = raw_tx.send(result);
        },
        NotifyConfig::default(),
    )
    .context("failed to create config watcher")?;
    watcher
        .watch(&config_path, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch config {}", config_path.display()))?;

    info!(path = %config_path.display(), "watching configuration file");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = raw_rx.recv() => match maybe {
                Some(Ok(event)) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        reload_config(&config_path, &shared);
                    }
                }
                Some(Err(err)) => error!(error = %err, "config watcher error"),
                None => break,
            }
        }
    }

    Ok(())
}

fn reload_config(config_path: &Path, shared: &SharedConfig) {
    info!(path = %config_path.display(), "configuration changed; reloading");
    let reloaded = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to reload configuration; keeping previous");
            return;
        }
    };

    let previous = shared.snapshot();
    if reloaded.clickhouse != previous.clickhouse
        || reloaded.processed_storage != previous.processed_storage
        || reloaded.redis != previous.redis
        || reloaded.logging != previous.logging
    {
        warn!("sink, storage and logging changes take effect after restart");
    }
    shared.replace(reloaded);
    info!("configuration reloaded");
}
