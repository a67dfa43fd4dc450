//! Reassembly of physical lines into logical records.
//!
//! Lines accumulate in a buffer owned by one tailer. A line matching the
//! record-start pattern closes the previous record; a two-second quiet period
//! or shutdown closes whatever is pending, which covers files that end
//! mid-record without a trailing record-start.

use crate::parser;
use std::time::{Duration, Instant};

/// Quiet period after which a pending record is considered complete.
pub const QUIET_FLUSH: Duration = Duration::from_secs(2);

/// The lines of one complete logical record and the byte offset just past its
/// final line in the source file.
#[derive(Debug, PartialEq)]
pub struct PendingRecord {
    pub lines: Vec<String>,
    pub end_offset: u64,
}

#[derive(Debug, Default)]
pub struct RecordAssembler {
    lines: Vec<String>,
    end_offset: u64,
    last_append: Option<Instant>,
}

impl RecordAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one cleaned line ending at `end_offset`. When the line opens a
    /// new record and the buffer is non-empty, the buffered record is
    /// returned complete.
    pub fn push_line(&mut self, line: String, end_offset: u64) -> Option<PendingRecord> {
        let completed = if parser::is_record_start(&line) {
            self.flush()
        } else {
            None
        };
        self.lines.push(line);
        self.end_offset = end_offset;
        self.last_append = Some(Instant::now());
        completed
    }

    /// Drains the buffer as one record, if anything is pending.
    pub fn flush(&mut self) -> Option<PendingRecord> {
        if self.lines.is_empty() {
            return None;
        }
        self.last_append = None;
        Some(PendingRecord {
            lines: std::mem::take(&mut self.lines),
            end_offset: self.end_offset,
        })
    }

    /// Whether the pending buffer has sat quiet long enough to flush.
    pub fn quiet_elapsed(&self) -> bool {
        match self.last_append {
            Some(at) if !self.lines.is_empty() => at.elapsed() >= QUIET_FLUSH,
            _ => false,
        }
    }

    /// Drops any partial state; used when the file rotates under the tailer.
    pub fn reset(&mut self) {
        self.lines.clear();
        self.end_offset = 0;
        self.last_append = None;
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_lines_until_next_record_start() {
        let mut assembler = RecordAssembler::new();
        assert_eq!(
            assembler.push_line("00:03.310025-1,DBMSSQL,3,Sql='SELECT *".to_string(), 40),
            None
        );
        assert_eq!(assembler.push_line("FROM t'".to_string(), 48), None);

        let record = assembler
            .push_line("00:04.000001-2,CALL,1".to_string(), 70)
            .expect("second start closes the first record");
        assert_eq!(record.lines.len(), 2);
        assert_eq!(record.end_offset, 48);
        assert!(!assembler.is_empty());
    }

    #[test]
    fn explicit_flush_drains_the_tail_record() {
        let mut assembler = RecordAssembler::new();
        assembler.push_line("00:03.310025-1,DBMSSQL,3".to_string(), 25);
        let record = assembler.flush().expect("pending record");
        assert_eq!(record.end_offset, 25);
        assert!(assembler.is_empty());
        assert_eq!(assembler.flush(), None);
    }

    #[test]
    fn continuation_before_any_start_is_buffered() {
        // A tailer resuming mid-record sees continuation lines first; they are
        // flushed as one (unparseable) record at the next boundary.
        let mut assembler = RecordAssembler::new();
        assert_eq!(assembler.push_line("FROM t WHERE x'".to_string(), 15), None);
        let record = assembler
            .push_line("00:04.000001-2,CALL,1".to_string(), 37)
            .expect("boundary flushes the orphan lines");
        assert_eq!(record.lines, vec!["FROM t WHERE x'".to_string()]);
    }

    #[test]
    fn quiet_timer_arms_only_with_pending_lines() {
        let mut assembler = RecordAssembler::new();
        assert!(!assembler.quiet_elapsed());
        assembler.push_line("00:03.310025-1,DBMSSQL,3".to_string(), 25);
        // Freshly appended: the quiet period has not elapsed yet.
        assert!(!assembler.quiet_elapsed());
        assembler.flush();
        assert!(!assembler.quiet_elapsed());
    }

    #[test]
    fn reset_discards_partial_state() {
        let mut assembler = RecordAssembler::new();
        assembler.push_line("00:03.310025-1,DBMSSQL,3".to_string(), 25);
        assembler.reset();
        assert!(assembler.is_empty());
        assert_eq!(assembler.flush(), None);
    }
}
