//! ClickHouse client over the HTTP interface.
//!
//! Inserts go through `POST /?query=INSERT INTO db.table (…) FORMAT …` with
//! the body LZ4-frame-compressed. The configured protocol picks the payload
//! encoding: `native` ships RowBinary, `http` ships JSONEachRow. ClickHouse
//! treats GET as readonly, so every request is a POST.

use crate::config::{ClickHouseConfig, Protocol};
use crate::model::TableRow;
use crate::rowbinary;
use crate::sink::Sink;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lz4_flex::frame::FrameEncoder;
use reqwest::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Url};
use std::io::Write;
use std::time::Duration;
use tracing::debug;

/// Column list shared by every routed table; order matches the RowBinary
/// encoder.
pub const INSERT_COLUMNS: &str = "EventDate, EventTime, EventType, Duration, User, InfoBase, \
     SessionID, ClientID, ConnectionID, ExceptionType, ErrorText, SQLText, \
     Rows, RowsAffected, Context, ProcessName";

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ClickHouseSink {
    http: Client,
    base: Url,
    username: String,
    password: String,
    database: String,
    protocol: Protocol,
}

impl ClickHouseSink {
    pub fn new(config: &ClickHouseConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to construct http client")?;

        let address = config.address.trim();
        let url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let base = Url::parse(&url).with_context(|| format!("invalid ClickHouse address {address:?}"))?;

        Ok(Self {
            http,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
            protocol: config.protocol,
        })
    }

    fn insert_query(&self, table: &str) -> String {
        let format = match self.protocol {
            Protocol::Native => "RowBinary",
            Protocol::Http => "JSONEachRow",
        };
        format!(
            "INSERT INTO {}.{} ({INSERT_COLUMNS}) FORMAT {format}",
            escape_identifier(&self.database),
            escape_identifier(table)
        )
    }

    fn encode_payload(&self, rows: &[TableRow]) -> Result<Vec<u8>> {
        match self.protocol {
            Protocol::Native => Ok(rowbinary::encode_rows(rows)),
            Protocol::Http => {
                let mut payload = Vec::new();
                for row in rows {
                    let line = serde_json::to_vec(row).context("failed to encode JSON row")?;
                    payload.extend_from_slice(&line);
                    payload.push(b'\n');
                }
                Ok(payload)
            }
        }
    }

    async fn request_text(&self, query: &str, body: Option<Vec<u8>>) -> Result<String> {
        let mut url = self.base.clone();
        url.query_pairs_mut().append_pair("query", query);

        let mut req = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/octet-stream");

        if let Some(raw) = body {
            let compressed = lz4_compress(&raw)?;
            req = req
                .header(CONTENT_ENCODING, "lz4")
                .header(CONTENT_LENGTH, compressed.len())
                .body(compressed);
        } else {
            req = req.header(CONTENT_LENGTH, 0);
        }

        if !self.username.is_empty() {
            req = req.basic_auth(self.username.clone(), Some(self.password.clone()));
        }

        let response = req.send().await.context("clickhouse request failed")?;
        let status = response.status();
        let text = response.text().await.with_context(|| {
            format!("failed to read clickhouse response body (status {status})")
        })?;

        if !status.is_success() {
            return Err(anyhow!("clickhouse returned {}: {}", status, text.trim()));
        }

        Ok(text)
    }
}

#[async_trait]
impl Sink for ClickHouseSink {
    async fn write(&self, table: &str, rows: &[TableRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let payload = self.encode_payload(rows)?;
        debug!(
            table,
            row_count = rows.len(),
            payload_bytes = payload.len(),
            "inserting batch"
        );
        self.request_text(&self.insert_query(table), Some(payload))
            .await
            .with_context(|| format!("insert into {table} failed"))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let response = self.request_text("SELECT 1", None).await?;
        if response.trim() == "1" {
            Ok(())
        } else {
            Err(anyhow!("unexpected ping response: {}", response.trim()))
        }
    }
}

fn lz4_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = FrameEncoder::new(Vec::new());
    encoder
        .write_all(data)
        .context("failed to lz4-compress insert body")?;
    encoder.finish().context("failed to finish lz4 frame")
}

fn escape_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io::Read;

    fn sink(address: &str, protocol: Protocol) -> ClickHouseSink {
        ClickHouseSink::new(&ClickHouseConfig {
            address: address.to_string(),
            username: "default".to_string(),
            password: String::new(),
            database: "techlog".to_string(),
            default_table: "tech_events".to_string(),
            protocol,
            table_map: Default::default(),
        })
        .expect("sink should build")
    }

    fn sample_row() -> TableRow {
        TableRow {
            event_date: NaiveDate::from_ymd_opt(2025, 5, 26).expect("valid date"),
            event_time: NaiveDate::from_ymd_opt(2025, 5, 26)
                .expect("valid date")
                .and_hms_micro_opt(7, 0, 3, 310_025)
                .expect("valid time"),
            event_type: "DBMSSQL".to_string(),
            duration: 1,
            user: "ADMIN".to_string(),
            infobase: "IB".to_string(),
            session_id: 1,
            client_id: 1,
            connection_id: 1,
            exception_type: None,
            error_text: None,
            sql_text: Some("SELECT 1".to_string()),
            rows: Some(1),
            rows_affected: Some(0),
            context: Some(String::new()),
            process_name: "rphost".to_string(),
        }
    }

    /// Minimal single-shot HTTP responder; enough for a ping round trip.
    fn spawn_mock_server(body: &'static str, status_line: &'static str) -> String {
        use std::io::Write as IoWrite;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock listener");
        let addr = listener.local_addr().expect("mock listener addr");

        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0_u8; 8192];
                let _ = stream.read(&mut request);
                let response = format!(
                    "{status_line}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });

        format!("{}:{}", addr.ip(), addr.port())
    }

    #[test]
    fn address_without_scheme_gets_http_prefix() {
        let sink = sink("localhost:8123", Protocol::Native);
        assert_eq!(sink.base.as_str(), "http://localhost:8123/");
    }

    #[test]
    fn insert_query_picks_format_by_protocol() {
        let native = sink("localhost:8123", Protocol::Native);
        assert!(native.insert_query("t_sql").ends_with("FORMAT RowBinary"));
        assert!(native
            .insert_query("t_sql")
            .starts_with("INSERT INTO `techlog`.`t_sql` (EventDate, EventTime"));

        let http = sink("localhost:8123", Protocol::Http);
        assert!(http.insert_query("t_sql").ends_with("FORMAT JSONEachRow"));
    }

    #[test]
    fn json_payload_is_one_object_per_line() {
        let sink = sink("localhost:8123", Protocol::Http);
        let payload = sink
            .encode_payload(&[sample_row(), sample_row()])
            .expect("encode payload");
        let text = String::from_utf8(payload).expect("utf8 payload");
        let lines: Vec<&str> = text.trim_end().lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).expect("json line");
            assert_eq!(value["EventType"], "DBMSSQL");
        }
    }

    #[test]
    fn lz4_body_round_trips() {
        let raw = b"INSERT body with some repetition repetition repetition".to_vec();
        let compressed = lz4_compress(&raw).expect("compress");
        let mut decoder = lz4_flex::frame::FrameDecoder::new(compressed.as_slice());
        let mut restored = Vec::new();
        decoder.read_to_end(&mut restored).expect("decompress");
        assert_eq!(restored, raw);
    }

    #[tokio::test]
    async fn ping_accepts_select_one() {
        let addr = spawn_mock_server("1\n", "HTTP/1.1 200 OK");
        let sink = sink(&addr, Protocol::Native);
        sink.ping().await.expect("ping should succeed");
    }

    #[tokio::test]
    async fn ping_surfaces_http_errors() {
        let addr = spawn_mock_server("boom", "HTTP/1.1 500 Internal Server Error");
        let sink = sink(&addr, Protocol::Native);
        let err = sink.ping().await.expect_err("ping must fail");
        assert!(err.to_string().contains("500"));
    }
}
