//! RowBinary encoding for the fixed destination column list.
//!
//! Column order and types are pinned by the table DDL:
//! `Date, DateTime64(6), String, UInt32, String ×2, UInt32 ×3,
//! Nullable(String) ×3, Nullable(Int32) ×2, Nullable(String), String`.
//! Strings are varuint-length-prefixed UTF-8; Nullable columns carry a
//! one-byte flag (0x01 for NULL) before the value.

use crate::model::TableRow;
use chrono::{NaiveDate, NaiveDateTime};

pub fn encode_rows(rows: &[TableRow]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(rows.len() * 128);
    for row in rows {
        encode_row(&mut buf, row);
    }
    buf
}

fn encode_row(buf: &mut Vec<u8>, row: &TableRow) {
    buf.extend_from_slice(&date_days(row.event_date).to_le_bytes());
    buf.extend_from_slice(&time_micros(row.event_time).to_le_bytes());
    put_string(buf, &row.event_type);
    buf.extend_from_slice(&row.duration.to_le_bytes());
    put_string(buf, &row.user);
    put_string(buf, &row.infobase);
    buf.extend_from_slice(&row.session_id.to_le_bytes());
    buf.extend_from_slice(&row.client_id.to_le_bytes());
    buf.extend_from_slice(&row.connection_id.to_le_bytes());
    put_nullable_string(buf, row.exception_type.as_deref());
    put_nullable_string(buf, row.error_text.as_deref());
    put_nullable_string(buf, row.sql_text.as_deref());
    put_nullable_i32(buf, row.rows);
    put_nullable_i32(buf, row.rows_affected);
    put_nullable_string(buf, row.context.as_deref());
    put_string(buf, &row.process_name);
}

/// `Date` is the day count since the Unix epoch, saturating at the column's
/// u16 range.
fn date_days(date: NaiveDate) -> u16 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("unix epoch date");
    date.signed_duration_since(epoch)
        .num_days()
        .clamp(0, u16::MAX as i64) as u16
}

/// `DateTime64(6)` is microseconds since the Unix epoch.
fn time_micros(time: NaiveDateTime) -> i64 {
    time.and_utc().timestamp_micros()
}

fn put_varuint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    put_varuint(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

fn put_nullable_string(buf: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.push(0);
            put_string(buf, value);
        }
        None => buf.push(1),
    }
}

fn put_nullable_i32(buf: &mut Vec<u8>, value: Option<i32>) {
    match value {
        Some(value) => {
            buf.push(0);
            buf.extend_from_slice(&value.to_le_bytes());
        }
        None => buf.push(1),
    }
}
