//! Service lifecycle.
//!
//! Owns the wiring: checkpoint store, sink, bounded queue, batcher, tailer
//! registry, directory watcher, config watcher, periodic rescan, and the
//! shutdown sequence. Shutdown order matters: the watcher stops first so no
//! new tailers appear, tailers drain their buffers into the queue, the queue
//! closes, the batcher performs its final flush, and only then is the
//! checkpoint map persisted one last time.

use crate::batcher::Batcher;
use crate::checkpoint::{self, CheckpointMap};
use crate::config::{Config, SharedConfig};
use crate::model::SourcedEntry;
use crate::registry::TailerRegistry;
use crate::scanner;
use crate::sink;
use crate::tailer;
use crate::watcher::{self, FileEvent, WATCHER_CHANNEL_CAPACITY};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub async fn run(config_path: &Path, config: Config) -> Result<()> {
    let shared = SharedConfig::new(config.clone());
    let cancel = CancellationToken::new();

    let store = checkpoint::build_store(&config).await?;
    let initial = match store.load().await {
        Ok(map) => map,
        Err(err) => {
            warn!(error = %err, "failed to load checkpoints; starting from scratch");
            Default::default()
        }
    };
    info!(entries = initial.len(), "loaded checkpoints");
    let checkpoints = CheckpointMap::new(initial);

    let sink = sink::build_sink(&config.clickhouse)?;
    sink.ping().await.context("destination store unreachable")?;
    info!(address = %config.clickhouse.address, "destination store reachable");

    let queue_capacity = config.batch_size.saturating_mul(2).max(2);
    let (records_tx, records_rx) = mpsc::channel::<SourcedEntry>(queue_capacity);

    let registry = Arc::new(TailerRegistry::new(
        records_tx.clone(),
        checkpoints.clone(),
        store.clone(),
        tailer::DEFAULT_POLL_INTERVAL,
        cancel.clone(),
    ));

    let batcher_handle = tokio::spawn(
        Batcher::new(records_rx, sink, shared.clone(), checkpoints.clone()).run(),
    );
    let flush_handle = tokio::spawn(checkpoint::flush_loop(
        checkpoints.clone(),
        store.clone(),
        cancel.clone(),
    ));
    let config_watch_handle = tokio::spawn({
        let config_path = config_path.to_path_buf();
        let shared = shared.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(err) = watcher::watch_config(config_path, shared, cancel).await {
                error!(error = %err, "config watcher exited");
            }
        }
    });

    let (event_tx, mut event_rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
    let mut dir_watcher = DirWatcherTask::spawn(&shared, event_tx.clone(), &cancel);

    run_scan(&shared, &registry);

    let mut rescan_secs = shared.snapshot().rescan_interval;
    let mut rescan = new_rescan_ticker(rescan_secs);
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    info!("service started; awaiting file events");

    loop {
        tokio::select! {
            maybe = event_rx.recv() => match maybe {
                Some(event) => {
                    handle_file_event(event, &shared, &checkpoints, &registry).await;
                }
                None => {
                    warn!("watcher event channel closed; shutting down");
                    break;
                }
            },
            _ = rescan.tick() => {
                let current = shared.snapshot().rescan_interval;
                if current != rescan_secs {
                    rescan_secs = current;
                    rescan = new_rescan_ticker(rescan_secs);
                }
                debug!("periodic rescan");
                run_scan(&shared, &registry);
                dir_watcher = dir_watcher
                    .respawn_if_roots_changed(&shared, event_tx.clone(), &cancel)
                    .await;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(error = %err, "failed while waiting for interrupt");
                }
                info!("interrupt received");
                break;
            }
            _ = sigterm.recv() => {
                info!("termination signal received");
                break;
            }
        }
    }

    info!("shutting down");
    dir_watcher.stop().await;
    registry.shutdown_all().await;
    drop(registry);
    drop(event_tx);
    drop(records_tx);

    // All producers are gone; the batcher drains the queue and performs its
    // final flush before exiting.
    if let Err(err) = batcher_handle.await {
        warn!(error = %err, "batcher exited abnormally");
    }

    cancel.cancel();
    let _ = flush_handle.await;
    let _ = config_watch_handle.await;

    info!("service stopped");
    Ok(())
}

/// Walks the configured roots and ensures a tailer per matching file. Runs at
/// startup and on every rescan tick; `start_tail` de-duplicates, so repeated
/// scans are cheap.
fn run_scan(shared: &SharedConfig, registry: &TailerRegistry) {
    let snapshot = shared.snapshot();
    let pattern = match snapshot.file_regex() {
        Ok(pattern) => pattern,
        Err(err) => {
            error!(error = %err, "file pattern invalid; skipping scan");
            return;
        }
    };
    let roots = snapshot.log_directories();
    let files = scanner::discover_files(&roots, &pattern);
    debug!(file_count = files.len(), "scan complete; ensuring tailers");
    for path in files {
        registry.start_tail(path);
    }
}

async fn handle_file_event(
    event: FileEvent,
    shared: &SharedConfig,
    checkpoints: &CheckpointMap,
    registry: &TailerRegistry,
) {
    let pattern = match shared.snapshot().file_regex() {
        Ok(pattern) => pattern,
        Err(err) => {
            error!(error = %err, "file pattern invalid; ignoring event");
            return;
        }
    };

    match event {
        FileEvent::Created(path) => {
            if scanner::matches_basename(&path, &pattern) {
                registry.start_tail(path);
            }
        }
        FileEvent::Modified(path) => {
            if !scanner::matches_basename(&path, &pattern) {
                return;
            }
            let known = checkpoints.get(&path).unwrap_or(0);
            match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.len() > known => registry.start_tail(path),
                Ok(_) => {}
                Err(err) => {
                    debug!(error = %err, path = %path.display(), "modified file vanished");
                }
            }
        }
        FileEvent::Removed(path) => {
            if scanner::matches_basename(&path, &pattern) {
                registry.stop_tail(&path).await;
            }
        }
    }
}

fn new_rescan_ticker(seconds: u64) -> Interval {
    let mut ticker = interval(Duration::from_secs(seconds.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();
    ticker
}

/// The directory watcher with the root set it was started for; a config
/// reload that changes `LogDirectoryMap` replaces it on the next rescan.
struct DirWatcherTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    roots: Vec<PathBuf>,
}

impl DirWatcherTask {
    fn spawn(
        shared: &SharedConfig,
        event_tx: mpsc::Sender<FileEvent>,
        parent_cancel: &CancellationToken,
    ) -> Self {
        let roots = shared.snapshot().log_directories();
        let cancel = parent_cancel.child_token();
        let handle = tokio::spawn({
            let roots = roots.clone();
            let cancel = cancel.clone();
            async move {
                if let Err(err) = watcher::watch_directories(roots, event_tx, cancel).await {
                    error!(error = %err, "directory watcher exited unexpectedly");
                }
            }
        });
        Self {
            cancel,
            handle,
            roots,
        }
    }

    async fn respawn_if_roots_changed(
        self,
        shared: &SharedConfig,
        event_tx: mpsc::Sender<FileEvent>,
        parent_cancel: &CancellationToken,
    ) -> Self {
        let roots = shared.snapshot().log_directories();
        if roots == self.roots {
            return self;
        }
        info!("log directory roots changed; restarting directory watcher");
        self.stop().await;
        Self::spawn(shared, event_tx, parent_cancel)
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
