//! Per-file follow loop.
//!
//! A tailer owns one path: it polls for appended bytes from the committed
//! offset, splits them into physical lines, reassembles logical records and
//! publishes them onto the bounded pipeline queue. The file does not have to
//! exist yet; rotation and truncation are absorbed by restarting from zero on
//! the same path. Offsets reported with each record point just past the
//! record's last line, so the batcher can commit them once the sink accepts
//! the batch.

use crate::assembler::{PendingRecord, RecordAssembler, QUIET_FLUSH};
use crate::checkpoint::{CheckpointMap, CheckpointStore};
use crate::model::SourcedEntry;
use crate::parser;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const MAX_READ_CHUNK_BYTES: usize = 8 * 1024 * 1024;

#[allow(clippy::too_many_arguments)]
pub async fn tail_file(
    path: PathBuf,
    start_offset: u64,
    records_tx: mpsc::Sender<SourcedEntry>,
    checkpoints: CheckpointMap,
    store: Arc<dyn CheckpointStore>,
    poll_interval: Duration,
    current_offset: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let poll_interval = if poll_interval.is_zero() {
        DEFAULT_POLL_INTERVAL
    } else {
        poll_interval
    };

    info!(path = %path.display(), offset = start_offset, "starting tailer");

    // `base` is the file offset of the first byte still held in `line_buffer`.
    let mut base = start_offset;
    let mut line_buffer: Vec<u8> = Vec::new();
    let mut assembler = RecordAssembler::new();
    let mut last_read: Option<Instant> = None;
    current_offset.store(start_offset, Ordering::Relaxed);

    'follow: loop {
        if cancel.is_cancelled() {
            break;
        }

        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(
                    error = %err,
                    path = %path.display(),
                    "file not present yet; awaiting creation"
                );
                if idle_wait(&cancel, poll_interval).await {
                    break;
                }
                continue;
            }
        };

        let size = metadata.len();
        let read_position = base + line_buffer.len() as u64;

        if size < read_position {
            warn!(
                path = %path.display(),
                previous_offset = read_position,
                current_size = size,
                "file truncated or rotated; restarting from zero"
            );
            base = 0;
            line_buffer.clear();
            assembler.reset();
            last_read = None;
            checkpoints.set(&path, 0);
            current_offset.store(0, Ordering::Relaxed);
            if idle_wait(&cancel, poll_interval).await {
                break;
            }
            continue;
        }

        if size > read_position {
            let to_read = (size - read_position).min(MAX_READ_CHUNK_BYTES as u64) as usize;
            match read_chunk(&path, read_position, to_read).await {
                Ok(chunk) if chunk.is_empty() => {}
                Ok(chunk) => {
                    line_buffer.extend_from_slice(&chunk);
                    last_read = Some(Instant::now());
                    for (raw_line, end_offset) in drain_lines(&mut line_buffer, &mut base) {
                        let line = clean_line(raw_line, &path);
                        if let Some(record) = assembler.push_line(line, end_offset) {
                            if !publish(record, &file_name, &path, &records_tx).await {
                                break 'follow;
                            }
                        }
                    }
                    current_offset.store(base + line_buffer.len() as u64, Ordering::Relaxed);
                    // More data may already be waiting; skip the idle sleep.
                    continue;
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %path.display(),
                        "failed to read appended bytes"
                    );
                }
            }
        } else if line_buffer.is_empty() {
            if assembler.quiet_elapsed() {
                if let Some(record) = assembler.flush() {
                    if !publish(record, &file_name, &path, &records_tx).await {
                        break;
                    }
                }
            }
        } else if last_read.is_some_and(|at| at.elapsed() >= QUIET_FLUSH) {
            // The file ended without a trailing newline. After the quiet
            // period the unterminated bytes are taken as the record's final
            // line and the pending record is closed.
            let end_offset = base + line_buffer.len() as u64;
            let line = clean_line(std::mem::take(&mut line_buffer), &path);
            base = end_offset;
            if let Some(record) = assembler.push_line(line, end_offset) {
                if !publish(record, &file_name, &path, &records_tx).await {
                    break;
                }
            }
            if let Some(record) = assembler.flush() {
                if !publish(record, &file_name, &path, &records_tx).await {
                    break;
                }
            }
        }

        if idle_wait(&cancel, poll_interval).await {
            break;
        }
    }

    // Draining: an unterminated trailing line joins the pending record, then
    // whatever is buffered goes out as the final record of this tailer's
    // life and its offsets are made durable.
    if !line_buffer.is_empty() {
        let end_offset = base + line_buffer.len() as u64;
        let line = clean_line(std::mem::take(&mut line_buffer), &path);
        if let Some(record) = assembler.push_line(line, end_offset) {
            publish(record, &file_name, &path, &records_tx).await;
        }
    }
    if let Some(record) = assembler.flush() {
        publish(record, &file_name, &path, &records_tx).await;
    }
    if let Err(err) = store.save(&checkpoints.snapshot()).await {
        warn!(error = %err, path = %path.display(), "failed to persist checkpoints on stop");
    }
    info!(path = %path.display(), "tailer stopped");
    Ok(())
}

/// Parses and forwards one reassembled record. Returns false when the
/// pipeline queue has closed and the tailer should stop.
async fn publish(
    record: PendingRecord,
    file_name: &str,
    path: &Path,
    records_tx: &mpsc::Sender<SourcedEntry>,
) -> bool {
    let entry = match parser::parse_record(&record.lines, file_name) {
        Ok(entry) => entry,
        Err(err) => {
            warn!(
                error = %err,
                path = %path.display(),
                lines = record.lines.len(),
                "discarding unparseable record"
            );
            return true;
        }
    };

    let sourced = SourcedEntry {
        entry,
        path: path.to_path_buf(),
        offset: record.end_offset,
    };
    if records_tx.send(sourced).await.is_err() {
        warn!(path = %path.display(), "pipeline queue closed; stopping tailer");
        return false;
    }
    true
}

async fn read_chunk(path: &Path, offset: u64, max_bytes: usize) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(tokio::io::SeekFrom::Start(offset))
        .await
        .with_context(|| format!("failed to seek {} to offset {offset}", path.display()))?;

    let mut buffer = vec![0u8; max_bytes];
    let mut total_read = 0usize;
    while total_read < max_bytes {
        let bytes_read = file
            .read(&mut buffer[total_read..])
            .await
            .with_context(|| format!("failed to read from {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        total_read += bytes_read;
    }
    buffer.truncate(total_read);
    Ok(buffer)
}

/// Splits complete lines out of `buffer`, returning each with the file offset
/// just past its newline. Consumed bytes are dropped and `base` advanced;
/// an incomplete trailing line stays buffered for the next chunk.
fn drain_lines(buffer: &mut Vec<u8>, base: &mut u64) -> Vec<(Vec<u8>, u64)> {
    let mut lines = Vec::new();
    let mut start = 0usize;

    for idx in 0..buffer.len() {
        if buffer[idx] == b'\n' {
            lines.push((buffer[start..idx].to_vec(), *base + idx as u64 + 1));
            start = idx + 1;
        }
    }

    if start > 0 {
        buffer.drain(0..start);
        *base += start as u64;
    }

    lines
}

/// RawLine cleanup: trailing carriage return, NUL bytes, and a UTF-8 BOM.
fn clean_line(mut raw: Vec<u8>, path: &Path) -> String {
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    if raw.contains(&0) {
        warn!(path = %path.display(), "line contains NUL bytes; scrubbing");
        raw.retain(|&byte| byte != 0);
    }
    let text = String::from_utf8_lossy(&raw);
    text.strip_prefix('\u{FEFF}')
        .map(str::to_owned)
        .unwrap_or_else(|| text.into_owned())
}

async fn idle_wait(cancel: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(interval) => false,
    }
}
