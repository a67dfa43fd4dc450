//! Data model for the ingestion pipeline.
//!
//! `LogEntry` is the parsed form of one logical technology-log record;
//! `TableRow` is its destination-shaped projection with the fixed ClickHouse
//! column list.

use chrono::{NaiveDate, NaiveDateTime};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::path::PathBuf;

/// One parsed technology-log record.
///
/// `time` keeps the raw intra-hour token from the record head
/// (`MM:SS.ffffff-DURATION`); the calendar date and hour are recovered from
/// `source_file` during transformation. Numeric fields are parsed leniently
/// and default to zero, so a single bad field never fails the whole record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogEntry {
    /// Basename of the originating file, e.g. `25052607.log`.
    pub source_file: String,
    /// Raw record-head token, e.g. `00:03.310025-1327862`.
    pub time: String,
    pub component: String,
    pub severity: u8,
    pub process: String,
    pub process_name: String,
    pub os_thread: u32,
    pub client_id: u32,
    pub application_name: String,
    pub computer_name: String,
    pub connect_id: u32,
    pub session_id: u64,
    pub user: String,
    pub dbms: String,
    pub database: String,
    pub trans: u32,
    pub db_pid: u32,
    pub sql: String,
    pub rows: i32,
    pub rows_affected: i32,
    pub context: String,
    pub exception: String,
    pub error_text: String,
    pub event: String,
    pub file: String,
}

/// A `LogEntry` together with its origin: the tailed path and the byte offset
/// just past the record's last line. The offset becomes the committed
/// checkpoint for the path once the containing batch is acknowledged by the
/// sink.
#[derive(Debug, Clone)]
pub struct SourcedEntry {
    pub entry: LogEntry,
    pub path: PathBuf,
    pub offset: u64,
}

/// Destination row with the fixed column list shared by every routed table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub event_date: NaiveDate,
    pub event_time: NaiveDateTime,
    pub event_type: String,
    pub duration: u32,
    pub user: String,
    pub infobase: String,
    pub session_id: u32,
    pub client_id: u32,
    pub connection_id: u32,
    pub exception_type: Option<String>,
    pub error_text: Option<String>,
    pub sql_text: Option<String>,
    pub rows: Option<i32>,
    pub rows_affected: Option<i32>,
    pub context: Option<String>,
    pub process_name: String,
}

impl TableRow {
    pub fn event_date_string(&self) -> String {
        self.event_date.format("%Y-%m-%d").to_string()
    }

    pub fn event_time_string(&self) -> String {
        self.event_time.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
    }
}

// JSONEachRow serialization: column names match the destination DDL, dates
// and times are rendered the way ClickHouse parses them by default.
impl Serialize for TableRow {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut row = serializer.serialize_struct("TableRow", 16)?;
        row.serialize_field("EventDate", &self.event_date_string())?;
        row.serialize_field("EventTime", &self.event_time_string())?;
        row.serialize_field("EventType", &self.event_type)?;
        row.serialize_field("Duration", &self.duration)?;
        row.serialize_field("User", &self.user)?;
        row.serialize_field("InfoBase", &self.infobase)?;
        row.serialize_field("SessionID", &self.session_id)?;
        row.serialize_field("ClientID", &self.client_id)?;
        row.serialize_field("ConnectionID", &self.connection_id)?;
        row.serialize_field("ExceptionType", &self.exception_type)?;
        row.serialize_field("ErrorText", &self.error_text)?;
        row.serialize_field("SQLText", &self.sql_text)?;
        row.serialize_field("Rows", &self.rows)?;
        row.serialize_field("RowsAffected", &self.rows_affected)?;
        row.serialize_field("Context", &self.context)?;
        row.serialize_field("ProcessName", &self.process_name)?;
        row.end()
    }
}
