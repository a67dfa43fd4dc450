//! Technology-log record parsing.
//!
//! A logical record is one or more physical lines. The first line carries the
//! head `MM:SS.ffffff-DURATION`, the component tag, the severity and a run of
//! comma-separated `key=value` pairs; the `Sql=` and `Context=` fields may
//! span the remaining lines. Numeric fields parse leniently: a missing or
//! malformed value becomes zero rather than failing the record.

pub mod context;
pub mod sql;

use crate::model::LogEntry;
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::str::FromStr;

/// Whether a physical line opens a new logical record.
///
/// The head must look like `MM:SS.ff…` (two-digit minute, two-digit second,
/// at least two fractional digits) followed by a `-` further along the line.
pub fn is_record_start(line: &str) -> bool {
    let bytes = line.as_bytes();
    if bytes.len() < 10 {
        return false;
    }
    bytes[0].is_ascii_digit()
        && bytes[1].is_ascii_digit()
        && bytes[2] == b':'
        && bytes[3].is_ascii_digit()
        && bytes[4].is_ascii_digit()
        && bytes[5] == b'.'
        && bytes[6].is_ascii_digit()
        && bytes[7].is_ascii_digit()
        && bytes[8..].contains(&b'-')
}

/// Parses the lines of one logical record into a [`LogEntry`].
///
/// `source_file` is the basename of the originating log file; the calendar
/// date and hour are recovered from it later, during transformation.
pub fn parse_record(lines: &[String], source_file: &str) -> Result<LogEntry> {
    let raw = lines.join("\n");
    let (header_raw, sql_text, context) = split_record(&raw);
    let header = parse_header(header_raw);

    if header.time.is_empty() {
        bail!("record head has no intra-hour timestamp");
    }
    if header.component.is_empty() {
        bail!("record head has no component tag");
    }

    let field = |key: &str| header.fields.get(key).cloned().unwrap_or_default();

    Ok(LogEntry {
        source_file: source_file.to_string(),
        severity: lenient(&header.severity),
        process: field("process"),
        process_name: field("p:processName"),
        os_thread: lenient(&field("OSThread")),
        client_id: lenient(&field("t:clientID")),
        application_name: field("t:applicationName"),
        computer_name: field("t:computerName"),
        connect_id: lenient(&field("t:connectID")),
        session_id: lenient(&field("SessionID")),
        user: field("Usr"),
        dbms: field("DBMS"),
        database: field("DataBase"),
        trans: lenient(&field("Trans")),
        db_pid: lenient(&field("dbpid")),
        rows: lenient(&field("Rows")),
        rows_affected: lenient(&field("RowsAffected")),
        exception: field("Exception"),
        error_text: field("Descr"),
        event: field("Event"),
        file: field("File"),
        time: header.time,
        component: header.component,
        sql: sql_text,
        context,
    })
}

/// Splits raw record text into the header part, the SQL text and the Context
/// value. Everything before `Sql=` is header; the SQL runs from the opening
/// quote to the matching unescaped close; Context is searched in whatever
/// follows the SQL (or in the whole record when there is no SQL).
fn split_record(raw: &str) -> (&str, String, String) {
    let Some(sql_idx) = raw.find("Sql=") else {
        return (raw, String::new(), context::extract_context(raw));
    };

    let header_part = &raw[..sql_idx];
    let rest = &raw[sql_idx + 4..];
    let Some(quote) = rest.chars().next().filter(char::is_ascii) else {
        return (header_part, String::new(), String::new());
    };

    let (sql_text, after_sql) = sql::extract_sql(&rest[1..], quote as u8);
    let context = context::extract_context(after_sql);
    (header_part, sql_text, context)
}

struct Header {
    time: String,
    component: String,
    severity: String,
    fields: HashMap<String, String>,
}

/// The header is comma-separated: three positional fields (time, component,
/// severity) followed by `key=value` pairs. Values may be wrapped in single
/// quotes.
fn parse_header(raw: &str) -> Header {
    let mut parts = raw.split(',');
    let time = parts.next().unwrap_or_default().trim().to_string();
    let component = parts.next().unwrap_or_default().trim().to_string();
    let severity = parts.next().unwrap_or_default().trim().to_string();

    let mut fields = HashMap::new();
    for part in parts {
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim_matches(|c| c == ' ' || c == '\'');
            fields.insert(key.to_string(), value.to_string());
        }
    }

    Header {
        time,
        component,
        severity,
        fields,
    }
}

fn lenient<T: FromStr + Default>(value: &str) -> T {
    value.trim().parse().unwrap_or_default()
}
