//! Batching and at-least-once flushing.
//!
//! Records drain from the bounded pipeline queue into per-table buckets.
//! Any bucket reaching `BatchSize`, the `BatchInterval` timer, or shutdown
//! flushes every non-empty bucket in stable table order. Offsets advance in
//! the checkpoint map only after the sink accepts the containing batch; a
//! failed batch is dropped from memory and its byte range replays from the
//! persisted offset on the next start.

use crate::checkpoint::CheckpointMap;
use crate::config::{ClickHouseConfig, SharedConfig};
use crate::model::SourcedEntry;
use crate::sink::Sink;
use crate::transform;
use anyhow::anyhow;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Writes run under their own deadline, detached from the shutdown signal,
/// so a graceful stop never aborts an in-flight insert.
pub const SINK_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

type Buckets = BTreeMap<String, Vec<SourcedEntry>>;

pub struct Batcher {
    records_rx: mpsc::Receiver<SourcedEntry>,
    sink: Arc<dyn Sink>,
    shared: SharedConfig,
    checkpoints: CheckpointMap,
    routing: ClickHouseConfig,
}

impl Batcher {
    pub fn new(
        records_rx: mpsc::Receiver<SourcedEntry>,
        sink: Arc<dyn Sink>,
        shared: SharedConfig,
        checkpoints: CheckpointMap,
    ) -> Self {
        let routing = shared.snapshot().clickhouse;
        Self {
            records_rx,
            sink,
            shared,
            checkpoints,
            routing,
        }
    }

    pub async fn run(mut self) {
        let mut buckets = Buckets::new();
        let (_, mut interval_secs) = self.shared.batch_limits();
        let mut ticker = new_ticker(interval_secs);

        loop {
            let (batch_size, current_secs) = self.shared.batch_limits();
            if current_secs != interval_secs {
                interval_secs = current_secs;
                ticker = new_ticker(interval_secs);
            }

            tokio::select! {
                maybe = self.records_rx.recv() => match maybe {
                    Some(record) => {
                        let table = route_table(&self.routing, &record.entry.component);
                        let bucket = buckets.entry(table.to_string()).or_default();
                        bucket.push(record);
                        if bucket.len() >= batch_size {
                            self.flush_all(&mut buckets, "batch size reached").await;
                            ticker.reset();
                        }
                    }
                    // Queue closed: every producer is gone, drain is complete.
                    None => break,
                },
                _ = ticker.tick() => {
                    self.flush_all(&mut buckets, "interval").await;
                }
            }
        }

        self.flush_all(&mut buckets, "graceful shutdown").await;
    }

    /// Flushes every non-empty bucket sequentially, in stable table order.
    /// Buckets fail independently; one sink error never blocks the others.
    ///
    /// One file's records routinely split across tables, so offsets commit
    /// only after every bucket of the flush is decided: a path advances to an
    /// acked offset only when no earlier record of the same path failed this
    /// flush. Anything past the first failure replays with it on the next
    /// start.
    async fn flush_all(&self, buckets: &mut Buckets, reason: &str) {
        let mut acked: Vec<(PathBuf, u64)> = Vec::new();
        let mut first_failed: HashMap<PathBuf, u64> = HashMap::new();

        for (table, entries) in std::mem::take(buckets) {
            if entries.is_empty() {
                continue;
            }

            let mut rows = Vec::with_capacity(entries.len());
            for sourced in &entries {
                match transform::transform_entry(&sourced.entry) {
                    Ok(row) => rows.push(row),
                    Err(err) => {
                        warn!(
                            error = %err,
                            path = %sourced.path.display(),
                            "dropping row that failed transform"
                        );
                    }
                }
            }

            let result = if rows.is_empty() {
                Ok(())
            } else {
                match tokio::time::timeout(SINK_WRITE_TIMEOUT, self.sink.write(&table, &rows))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("sink write timed out after {SINK_WRITE_TIMEOUT:?}")),
                }
            };

            match result {
                Ok(()) => {
                    for sourced in &entries {
                        acked.push((sourced.path.clone(), sourced.offset));
                    }
                    info!(table = %table, rows = rows.len(), reason, "batch flushed");
                }
                Err(err) => {
                    for sourced in &entries {
                        let slot = first_failed
                            .entry(sourced.path.clone())
                            .or_insert(sourced.offset);
                        if sourced.offset < *slot {
                            *slot = sourced.offset;
                        }
                    }
                    warn!(
                        error = %err,
                        table = %table,
                        rows = entries.len(),
                        "batch write failed; offsets held back for replay"
                    );
                }
            }
        }

        for (path, offset) in acked {
            match first_failed.get(&path) {
                Some(&failed) if offset >= failed => {
                    debug!(
                        path = %path.display(),
                        offset,
                        failed,
                        "holding offset behind a failed record of the same file"
                    );
                }
                _ => self.checkpoints.advance(&path, offset),
            }
        }
    }
}

/// Pure table routing: `TableMap[component]` with `DefaultTable` fallback.
pub fn route_table<'a>(config: &'a ClickHouseConfig, component: &str) -> &'a str {
    config
        .table_map
        .get(component)
        .unwrap_or(&config.default_table)
}

fn new_ticker(seconds: u64) -> Interval {
    let mut ticker = interval(Duration::from_secs(seconds.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a fresh interval completes immediately; consume it so
    // the timer measures a full period from now.
    ticker.reset();
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{LogEntry, TableRow};
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::path::Path;

    #[derive(Default)]
    struct MockSink {
        writes: Mutex<Vec<(String, Vec<TableRow>)>>,
        fail_tables: Mutex<HashSet<String>>,
    }

    impl MockSink {
        fn fail_table(&self, table: &str) {
            self.fail_tables.lock().insert(table.to_string());
        }
    }

    #[async_trait]
    impl Sink for MockSink {
        async fn write(&self, table: &str, rows: &[TableRow]) -> Result<()> {
            if self.fail_tables.lock().contains(table) {
                bail!("sink unavailable");
            }
            self.writes.lock().push((table.to_string(), rows.to_vec()));
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(batch_size: usize) -> Config {
        let yaml = format!(
            r#"
LogDirectoryMap:
  main: /var/log/onec
FilePattern: "*.log"
BatchSize: {batch_size}
BatchInterval: 60
ClickHouse:
  Address: localhost:8123
  Database: techlog
  DefaultTable: t_other
  TableMap:
    DBMSSQL: t_sql
    EXCP: t_err
"#
        );
        serde_yaml::from_str(&yaml).expect("test config")
    }

    fn record(component: &str, path: &str, offset: u64) -> SourcedEntry {
        SourcedEntry {
            entry: LogEntry {
                source_file: "25052607.log".to_string(),
                time: "00:03.310025-10".to_string(),
                component: component.to_string(),
                ..LogEntry::default()
            },
            path: PathBuf::from(path),
            offset,
        }
    }

    #[test]
    fn routes_by_component_with_default_fallback() {
        let config = test_config(10);
        assert_eq!(route_table(&config.clickhouse, "DBMSSQL"), "t_sql");
        assert_eq!(route_table(&config.clickhouse, "EXCP"), "t_err");
        assert_eq!(route_table(&config.clickhouse, "CALL"), "t_other");
    }

    #[tokio::test]
    async fn two_components_become_two_single_row_writes() {
        let sink = Arc::new(MockSink::default());
        let (tx, rx) = mpsc::channel(8);
        let checkpoints = CheckpointMap::default();
        let batcher = Batcher::new(
            rx,
            sink.clone(),
            SharedConfig::new(test_config(1)),
            checkpoints.clone(),
        );
        let handle = tokio::spawn(batcher.run());

        tx.send(record("DBMSSQL", "/var/log/a.log", 70))
            .await
            .expect("send");
        tx.send(record("EXCP", "/var/log/a.log", 120))
            .await
            .expect("send");
        drop(tx);
        handle.await.expect("batcher join");

        let writes = sink.writes.lock();
        assert_eq!(writes.len(), 2);
        assert!(writes
            .iter()
            .any(|(table, rows)| table == "t_sql" && rows.len() == 1));
        assert!(writes
            .iter()
            .any(|(table, rows)| table == "t_err" && rows.len() == 1));
        assert_eq!(checkpoints.get(Path::new("/var/log/a.log")), Some(120));
    }

    #[tokio::test]
    async fn rows_in_one_batch_share_a_table_and_keep_order() {
        let sink = Arc::new(MockSink::default());
        let (tx, rx) = mpsc::channel(8);
        let batcher = Batcher::new(
            rx,
            sink.clone(),
            SharedConfig::new(test_config(100)),
            CheckpointMap::default(),
        );
        let handle = tokio::spawn(batcher.run());

        for offset in [10u64, 20, 30] {
            let mut rec = record("DBMSSQL", "/var/log/a.log", offset);
            rec.entry.user = format!("user-{offset}");
            tx.send(rec).await.expect("send");
        }
        drop(tx);
        handle.await.expect("batcher join");

        let writes = sink.writes.lock();
        assert_eq!(writes.len(), 1);
        let (table, rows) = &writes[0];
        assert_eq!(table, "t_sql");
        let users: Vec<&str> = rows.iter().map(|row| row.user.as_str()).collect();
        assert_eq!(users, vec!["user-10", "user-20", "user-30"]);
    }

    #[tokio::test]
    async fn failed_write_holds_offsets_back() {
        let sink = Arc::new(MockSink::default());
        sink.fail_table("t_sql");
        let (tx, rx) = mpsc::channel(8);
        let checkpoints = CheckpointMap::default();
        let batcher = Batcher::new(
            rx,
            sink.clone(),
            SharedConfig::new(test_config(1)),
            checkpoints.clone(),
        );
        let handle = tokio::spawn(batcher.run());

        tx.send(record("DBMSSQL", "/var/log/a.log", 70))
            .await
            .expect("send");
        drop(tx);
        handle.await.expect("batcher join");

        assert!(sink.writes.lock().is_empty());
        assert_eq!(checkpoints.get(Path::new("/var/log/a.log")), None);
    }

    #[tokio::test]
    async fn failed_bucket_holds_back_later_offsets_of_the_same_file() {
        let sink = Arc::new(MockSink::default());
        sink.fail_table("t_sql");
        let (tx, rx) = mpsc::channel(8);
        let checkpoints = CheckpointMap::default();
        let batcher = Batcher::new(
            rx,
            sink.clone(),
            SharedConfig::new(test_config(100)),
            checkpoints.clone(),
        );
        let handle = tokio::spawn(batcher.run());

        // Same file, two tables: the earlier record's table fails, the later
        // record's table succeeds in the same flush.
        tx.send(record("DBMSSQL", "/var/log/a.log", 40))
            .await
            .expect("send");
        tx.send(record("EXCP", "/var/log/a.log", 80))
            .await
            .expect("send");
        drop(tx);
        handle.await.expect("batcher join");

        let writes = sink.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "t_err");
        // The acked offset 80 must not leapfrog the failed record at 40; the
        // whole range replays on the next start.
        assert_eq!(checkpoints.get(Path::new("/var/log/a.log")), None);
    }

    #[tokio::test]
    async fn earlier_acked_offsets_commit_when_a_later_record_fails() {
        let sink = Arc::new(MockSink::default());
        sink.fail_table("t_err");
        let (tx, rx) = mpsc::channel(8);
        let checkpoints = CheckpointMap::default();
        let batcher = Batcher::new(
            rx,
            sink.clone(),
            SharedConfig::new(test_config(100)),
            checkpoints.clone(),
        );
        let handle = tokio::spawn(batcher.run());

        tx.send(record("DBMSSQL", "/var/log/a.log", 40))
            .await
            .expect("send");
        tx.send(record("EXCP", "/var/log/a.log", 80))
            .await
            .expect("send");
        drop(tx);
        handle.await.expect("batcher join");

        let writes = sink.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "t_sql");
        // Everything before the first failed record is safely committed.
        assert_eq!(checkpoints.get(Path::new("/var/log/a.log")), Some(40));
    }

    #[tokio::test]
    async fn transform_failure_skips_the_row_but_commits_the_batch() {
        let sink = Arc::new(MockSink::default());
        let (tx, rx) = mpsc::channel(8);
        let checkpoints = CheckpointMap::default();
        let batcher = Batcher::new(
            rx,
            sink.clone(),
            SharedConfig::new(test_config(2)),
            checkpoints.clone(),
        );
        let handle = tokio::spawn(batcher.run());

        let mut bad = record("DBMSSQL", "/var/log/a.log", 40);
        bad.entry.source_file = "bad".to_string();
        tx.send(bad).await.expect("send");
        tx.send(record("DBMSSQL", "/var/log/a.log", 80))
            .await
            .expect("send");
        drop(tx);
        handle.await.expect("batcher join");

        let writes = sink.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1.len(), 1);
        // The skipped row's bytes are still covered by the acked batch.
        assert_eq!(checkpoints.get(Path::new("/var/log/a.log")), Some(80));
    }
}
