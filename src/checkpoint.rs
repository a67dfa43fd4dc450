//! Durable FilePath → Offset checkpoints.
//!
//! The in-memory [`CheckpointMap`] is the live copy: tailers read their
//! resume position from it, the batcher advances entries when the sink
//! acknowledges a batch, and a background task snapshots it to the configured
//! store every thirty seconds (plus on every tailer stop and at shutdown).
//!
//! Two store backends share one interface. The file backend writes a JSON
//! object of `absolute path → offset` through a temp file and rename; the
//! rename is the commit point. The redis backend keeps only the set of seen
//! paths and is informational: offsets load back as zero.

use crate::config::{Config, ProcessedStorage, RedisConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type OffsetMap = HashMap<PathBuf, u64>;

pub const SAVE_INTERVAL: Duration = Duration::from_secs(30);
const REDIS_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const REDIS_SET_KEY: &str = "processed_files";

/// Shared offset map. Lock holds are short bookkeeping only and never span an
/// await point.
#[derive(Clone, Default)]
pub struct CheckpointMap {
    inner: Arc<RwLock<OffsetMap>>,
}

impl CheckpointMap {
    pub fn new(initial: OffsetMap) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn get(&self, path: &Path) -> Option<u64> {
        self.inner.read().get(path).copied()
    }

    /// Overwrites the entry; used by a tailer resetting a rotated file to 0.
    pub fn set(&self, path: &Path, offset: u64) {
        self.inner.write().insert(path.to_path_buf(), offset);
    }

    /// Monotonic merge: the entry only moves forward. Callers must only feed
    /// offsets whose earlier records in the same file have been acked (the
    /// batcher holds a flush's offsets behind its first failed record); the
    /// committed offset never regresses outside the explicit `set` path.
    pub fn advance(&self, path: &Path, offset: u64) {
        let mut map = self.inner.write();
        let entry = map.entry(path.to_path_buf()).or_insert(0);
        if offset > *entry {
            *entry = offset;
        }
    }

    pub fn snapshot(&self) -> OffsetMap {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<OffsetMap>;
    async fn save(&self, map: &OffsetMap) -> Result<()>;
}

pub async fn build_store(config: &Config) -> Result<Arc<dyn CheckpointStore>> {
    match config.processed_storage {
        ProcessedStorage::File => Ok(Arc::new(FileStore::new("temp/processed_files.json"))),
        ProcessedStorage::Redis => {
            let store = RedisStore::connect(&config.redis, REDIS_SET_KEY)
                .await
                .context("failed to connect to redis checkpoint store")?;
            Ok(Arc::new(store))
        }
    }
}

/// Periodically snapshots the map into the store until cancelled, then saves
/// once more on the way out.
pub async fn flush_loop(
    checkpoints: CheckpointMap,
    store: Arc<dyn CheckpointStore>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SAVE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = store.save(&checkpoints.snapshot()).await {
                    warn!(error = %err, "failed to persist checkpoints; will retry");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    if let Err(err) = store.save(&checkpoints.snapshot()).await {
        warn!(error = %err, "failed to persist checkpoints at shutdown");
    }
}

pub struct FileStore {
    path: PathBuf,
    lock: AsyncMutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: AsyncMutex::new(()),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn load(&self) -> Result<OffsetMap> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(OffsetMap::new());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        let parsed: HashMap<String, u64> = serde_json::from_slice(&raw)
            .with_context(|| format!("corrupt checkpoint file {}", self.path.display()))?;
        Ok(parsed
            .into_iter()
            .map(|(path, offset)| (PathBuf::from(path), offset))
            .collect())
    }

    async fn save(&self, map: &OffsetMap) -> Result<()> {
        let _guard = self.lock.lock().await;

        // Stable key order keeps repeated saves of an unchanged map
        // byte-identical on disk.
        let ordered: BTreeMap<String, u64> = map
            .iter()
            .map(|(path, offset)| (path.to_string_lossy().into_owned(), *offset))
            .collect();
        let encoded = serde_json::to_vec(&ordered).context("failed to encode checkpoints")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create checkpoint directory {}", parent.display())
                })?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &encoded)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        // Some host filesystems refuse rename-over-existing; a crash between
        // the unlink and the rename is tolerated because a missing file loads
        // as an empty map.
        let _ = fs::remove_file(&self.path).await;
        fs::rename(&tmp, &self.path).await.with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp.display(),
                self.path.display()
            )
        })?;

        debug!(path = %self.path.display(), entries = ordered.len(), "persisted checkpoints");
        Ok(())
    }
}

/// Remote set backend: remembers which paths were seen under one key. Offsets
/// are not stored, so every load resumes from zero (at-least-once re-ingest).
pub struct RedisStore {
    conn: AsyncMutex<ConnectionManager>,
    key: String,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig, key: &str) -> Result<Self> {
        let url = if config.password.is_empty() {
            format!("redis://{}:{}/{}", config.host, config.port, config.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                config.password, config.host, config.port, config.db
            )
        };
        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("failed to create redis client for {}:{}", config.host, config.port))?;
        let conn = tokio::time::timeout(REDIS_DIAL_TIMEOUT, client.get_connection_manager())
            .await
            .context("redis connection timed out")?
            .context("failed to establish redis connection")?;
        Ok(Self {
            conn: AsyncMutex::new(conn),
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl CheckpointStore for RedisStore {
    async fn load(&self) -> Result<OffsetMap> {
        let mut conn = self.conn.lock().await;
        let members: Vec<String> = conn
            .smembers(&self.key)
            .await
            .context("failed to read processed set from redis")?;
        Ok(members
            .into_iter()
            .map(|path| (PathBuf::from(path), 0))
            .collect())
    }

    async fn save(&self, map: &OffsetMap) -> Result<()> {
        if map.is_empty() {
            return Ok(());
        }
        let members: Vec<String> = map
            .keys()
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
        let mut conn = self.conn.lock().await;
        let _: () = conn
            .sadd(&self.key, members)
            .await
            .context("failed to add processed paths to redis")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, u64)]) -> OffsetMap {
        entries
            .iter()
            .map(|(path, offset)| (PathBuf::from(path), *offset))
            .collect()
    }

    #[test]
    fn advance_is_monotonic_per_path() {
        let checkpoints = CheckpointMap::default();
        let path = Path::new("/var/log/a.log");
        checkpoints.advance(path, 100);
        checkpoints.advance(path, 40);
        assert_eq!(checkpoints.get(path), Some(100));
        checkpoints.advance(path, 150);
        assert_eq!(checkpoints.get(path), Some(150));

        checkpoints.set(path, 0);
        assert_eq!(checkpoints.get(path), Some(0));
    }

    #[tokio::test]
    async fn file_store_load_missing_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("processed_files.json"));
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn file_store_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("processed_files.json"));
        let offsets = map(&[("/var/log/a.log", 120), ("/var/log/b.log", 0)]);

        store.save(&offsets).await.expect("save");
        let restored = store.load().await.expect("load");
        assert_eq!(restored, offsets);
    }

    #[tokio::test]
    async fn file_store_repeated_saves_are_byte_identical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("processed_files.json");
        let store = FileStore::new(&path);
        let offsets = map(&[("/b.log", 2), ("/a.log", 1), ("/c.log", 3)]);

        store.save(&offsets).await.expect("first save");
        let first = std::fs::read(&path).expect("read first");
        store.save(&offsets).await.expect("second save");
        let second = std::fs::read(&path).expect("read second");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn file_store_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("processed_files.json");
        let store = FileStore::new(&path);
        store.save(&map(&[("/a.log", 1)])).await.expect("save");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("processed_files.json")]);
    }

    #[tokio::test]
    async fn file_store_stores_json_object_of_offsets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("processed_files.json");
        let store = FileStore::new(&path);
        store
            .save(&map(&[("/var/log/25052607.log", 73)]))
            .await
            .expect("save");

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(value["/var/log/25052607.log"], 73);
    }
}
