//! Projection of parsed records onto the destination column list.
//!
//! The calendar date and the hour live in the source filename
//! (`YYMMDDHH.log`); the minute, second and microseconds come from the record
//! head. A record whose date or time cannot be recovered is dropped by the
//! caller with a warning; it never aborts the batch it travelled with.

use crate::model::{LogEntry, TableRow};
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::sync::LazyLock;

static INTRA_HOUR_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{2}:\d{2}\.\d{1,6}").expect("intra-hour time regex"));

pub fn transform_entry(entry: &LogEntry) -> Result<TableRow> {
    let (event_date, hour) = parse_filename_stamp(&entry.source_file)?;

    let time_token = entry.time.trim_start_matches('\u{FEFF}');
    let intra_hour = INTRA_HOUR_TIME
        .find(time_token)
        .ok_or_else(|| anyhow!("record head {:?} has no MM:SS time", entry.time))?
        .as_str();

    let stamp = format!("{} {:02}:{}", event_date.format("%Y-%m-%d"), hour, intra_hour);
    let event_time = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S%.f")
        .with_context(|| format!("event time {stamp:?} is out of range"))?;

    Ok(TableRow {
        event_date,
        event_time,
        event_type: entry.component.clone(),
        duration: parse_duration(time_token),
        user: entry.user.clone(),
        infobase: entry.database.clone(),
        session_id: entry.session_id as u32,
        client_id: entry.client_id,
        connection_id: entry.connect_id,
        exception_type: non_empty(&entry.exception),
        error_text: non_empty(&entry.error_text),
        sql_text: Some(entry.sql.clone()),
        rows: Some(entry.rows),
        rows_affected: Some(entry.rows_affected),
        context: Some(entry.context.clone()),
        process_name: entry.process_name.clone(),
    })
}

/// Decodes `YYMMDDHH` from the filename. `YY` counts years since 2000; an
/// hour past 23 is clamped, which tolerates clock skew in rotated filenames.
fn parse_filename_stamp(file_name: &str) -> Result<(NaiveDate, u32)> {
    let digits = file_name.as_bytes();
    if digits.len() < 8 || !digits[..8].iter().all(u8::is_ascii_digit) {
        return Err(anyhow!("file name {file_name:?} lacks a YYMMDDHH prefix"));
    }

    let field = |range: std::ops::Range<usize>| -> u32 {
        file_name[range].parse().unwrap_or(0)
    };

    let year = 2000 + field(0..2) as i32;
    let month = field(2..4);
    let day = field(4..6);
    let hour = field(6..8).min(23);

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| anyhow!("file name {file_name:?} encodes an invalid date"))?;
    Ok((date, hour))
}

/// Duration is whatever follows the first `-` of the record head, parsed
/// leniently.
fn parse_duration(time_token: &str) -> u32 {
    time_token
        .split_once('-')
        .and_then(|(_, rest)| rest.trim().parse().ok())
        .unwrap_or(0)
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
