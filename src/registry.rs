//! Registry of active tailers.
//!
//! Several code paths call `start_tail` for the same path concurrently (the
//! initial scan, file-create events, write-above-offset events, the periodic
//! rescan), so the registry de-duplicates under its lock and guarantees
//! exactly one tailer per path.

use crate::checkpoint::{CheckpointMap, CheckpointStore};
use crate::model::SourcedEntry;
use crate::tailer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct TailerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    current_offset: Arc<AtomicU64>,
}

pub struct TailerRegistry {
    tailers: Mutex<HashMap<PathBuf, TailerHandle>>,
    records_tx: mpsc::Sender<SourcedEntry>,
    checkpoints: CheckpointMap,
    store: Arc<dyn CheckpointStore>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl TailerRegistry {
    pub fn new(
        records_tx: mpsc::Sender<SourcedEntry>,
        checkpoints: CheckpointMap,
        store: Arc<dyn CheckpointStore>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tailers: Mutex::new(HashMap::new()),
            records_tx,
            checkpoints,
            store,
            poll_interval,
            cancel,
        }
    }

    /// Ensures a tailer is running for `path`, resuming from the committed
    /// offset. A second call for a live path is a no-op.
    pub fn start_tail(&self, path: PathBuf) {
        let mut tailers = self.tailers.lock();
        if let Some(existing) = tailers.get(&path) {
            if existing.handle.is_finished() {
                tailers.remove(&path);
            } else {
                return;
            }
        }

        let from_offset = self.checkpoints.get(&path).unwrap_or(0);
        let child_cancel = self.cancel.child_token();
        let current_offset = Arc::new(AtomicU64::new(from_offset));
        debug!(path = %path.display(), offset = from_offset, "spawning tailer");

        let handle = tokio::spawn({
            let path = path.clone();
            let records_tx = self.records_tx.clone();
            let checkpoints = self.checkpoints.clone();
            let store = self.store.clone();
            let poll_interval = self.poll_interval;
            let current_offset = current_offset.clone();
            let cancel = child_cancel.clone();
            async move {
                if let Err(err) = tailer::tail_file(
                    path.clone(),
                    from_offset,
                    records_tx,
                    checkpoints,
                    store,
                    poll_interval,
                    current_offset,
                    cancel,
                )
                .await
                {
                    error!(error = %err, path = %path.display(), "tailer terminated with error");
                }
            }
        });

        tailers.insert(
            path,
            TailerHandle {
                cancel: child_cancel,
                handle,
                current_offset,
            },
        );
    }

    /// Byte position the tailer for `path` has read up to, if one is running.
    pub fn current_offset(&self, path: &Path) -> Option<u64> {
        self.tailers
            .lock()
            .get(path)
            .map(|tailer| tailer.current_offset.load(Ordering::Relaxed))
    }

    /// Stops the tailer for `path`; it flushes its pending record and
    /// persists offsets on the way out. Idempotent.
    pub async fn stop_tail(&self, path: &Path) {
        let removed = self.tailers.lock().remove(path);
        if let Some(tailer) = removed {
            info!(path = %path.display(), "stopping tailer");
            stop_handle(path, tailer).await;
        }
    }

    pub async fn shutdown_all(&self) {
        let drained: Vec<(PathBuf, TailerHandle)> = {
            let mut tailers = self.tailers.lock();
            tailers.drain().collect()
        };
        for (path, tailer) in drained {
            stop_handle(&path, tailer).await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.tailers.lock().len()
    }
}

async fn stop_handle(path: &Path, tailer: TailerHandle) {
    tailer.cancel.cancel();
    let mut handle = tailer.handle;
    tokio::select! {
        result = &mut handle => match result {
            Ok(()) => info!(path = %path.display(), "tailer stopped"),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "tailer exited abnormally during stop");
            }
        },
        _ = sleep(STOP_TIMEOUT) => {
            warn!(path = %path.display(), "tailer did not stop within timeout; aborting");
            handle.abort();
        }
    }
}
