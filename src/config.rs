//! Configuration management for techlog-pump.
//!
//! Loads and validates configuration from YAML files. The files produced by
//! the platform operators occasionally carry a UTF-8 BOM and tab indentation,
//! so the raw bytes are sanitized before they reach the YAML parser.

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(rename = "LogDirectoryMap", default)]
    pub log_directory_map: BTreeMap<String, String>,
    #[serde(rename = "FilePattern", default)]
    pub file_pattern: String,
    #[serde(rename = "BatchSize", default)]
    pub batch_size: usize,
    /// Maximum wall time between batch flushes, in seconds.
    #[serde(rename = "BatchInterval", default)]
    pub batch_interval: u64,
    /// Period of the full directory rescan, in seconds.
    #[serde(rename = "RescanInterval", default = "default_rescan_interval")]
    pub rescan_interval: u64,
    #[serde(rename = "ProcessedStorage", default)]
    pub processed_storage: ProcessedStorage,
    #[serde(rename = "ClickHouse", default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(rename = "Redis", default)]
    pub redis: RedisConfig,
    #[serde(rename = "Logging", default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessedStorage {
    #[default]
    File,
    Redis,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ClickHouseConfig {
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "Username", default)]
    pub username: String,
    #[serde(rename = "Password", default)]
    pub password: String,
    #[serde(rename = "Database", default)]
    pub database: String,
    #[serde(rename = "DefaultTable", default)]
    pub default_table: String,
    #[serde(rename = "Protocol", default)]
    pub protocol: Protocol,
    /// Component tag → destination table. Components without an entry land in
    /// `DefaultTable`.
    #[serde(rename = "TableMap", default)]
    pub table_map: BTreeMap<String, String>,
}

/// Insert wire format used over the ClickHouse HTTP interface.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// RowBinary payloads.
    #[default]
    Native,
    /// JSONEachRow payloads.
    Http,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RedisConfig {
    #[serde(rename = "Host", default)]
    pub host: String,
    #[serde(rename = "Port", default)]
    pub port: u16,
    #[serde(rename = "DB", default)]
    pub db: i64,
    #[serde(rename = "Password", default)]
    pub password: String,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(rename = "LogFile", default)]
    pub log_file: String,
    #[serde(rename = "Level", default)]
    pub level: String,
    #[serde(rename = "ConsoleLevel", default)]
    pub console_level: String,
    #[serde(rename = "EnableSentry", default)]
    pub enable_sentry: bool,
    #[serde(rename = "SentryDSN", default)]
    pub sentry_dsn: String,
}

fn default_rescan_interval() -> u64 {
    60
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read(path.as_ref())
            .with_context(|| format!("failed to read config {}", path.as_ref().display()))?;
        let sanitized = sanitize(raw);
        let config: Config =
            serde_yaml::from_slice(&sanitized).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_directory_map.is_empty() {
            bail!("LogDirectoryMap must not be empty");
        }
        if self.file_pattern.trim().is_empty() {
            bail!("FilePattern must not be empty");
        }
        if self.batch_size == 0 {
            bail!("BatchSize must be positive");
        }
        if self.batch_interval == 0 {
            bail!("BatchInterval must be positive");
        }
        if self.rescan_interval == 0 {
            bail!("RescanInterval must be positive");
        }
        if self.clickhouse.address.trim().is_empty() {
            bail!("ClickHouse.Address must not be empty");
        }
        if self.clickhouse.database.trim().is_empty() {
            bail!("ClickHouse.Database must not be empty");
        }
        if self.clickhouse.default_table.trim().is_empty() {
            bail!("ClickHouse.DefaultTable must not be empty");
        }
        self.file_regex()?;
        Ok(())
    }

    /// Root directories to discover log files under. Map keys are logical
    /// names and only informational; the values drive discovery.
    pub fn log_directories(&self) -> Vec<PathBuf> {
        self.log_directory_map
            .values()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).into_owned()))
            .collect()
    }

    /// The glob `FilePattern` translated to an anchored regular expression
    /// matched against file basenames: `.` is literal, `*` matches any run of
    /// characters, `?` matches a single character.
    pub fn file_regex(&self) -> Result<Regex> {
        compile_file_pattern(&self.file_pattern)
    }
}

pub fn compile_file_pattern(pattern: &str) -> Result<Regex> {
    let translated = pattern
        .replace('.', r"\.")
        .replace('*', ".*")
        .replace('?', ".");
    Regex::new(&format!("^{translated}$"))
        .with_context(|| format!("file pattern {pattern:?} does not translate to a valid regex"))
}

/// Strips a UTF-8 BOM and replaces tab indentation with two spaces.
fn sanitize(mut data: Vec<u8>) -> Vec<u8> {
    if data.starts_with(&[0xEF, 0xBB, 0xBF]) {
        data.drain(0..3);
    }
    let mut out = Vec::with_capacity(data.len());
    for byte in data {
        if byte == b'\t' {
            out.extend_from_slice(b"  ");
        } else {
            out.push(byte);
        }
    }
    out
}

/// Configuration snapshot shared between the supervisor, the rescan loop and
/// the batcher. Hot-reloadable fields take effect on the next rescan or
/// batcher iteration; sink, storage and logging changes require a restart.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> Config {
        self.inner.read().clone()
    }

    pub fn replace(&self, config: Config) {
        *self.inner.write() = config;
    }

    pub fn batch_limits(&self) -> (usize, u64) {
        let config = self.inner.read();
        (config.batch_size.max(1), config.batch_interval.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL_YAML: &str = r#"
LogDirectoryMap:
  main: /var/log/onec
FilePattern: "*.log"
BatchSize: 500
BatchInterval: 5
ClickHouse:
  Address: localhost:8123
  Database: techlog
  DefaultTable: tech_events
"#;

    fn write_config(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp config");
        file.write_all(contents).expect("write temp config");
        file
    }

    #[test]
    fn loads_minimal_config() {
        let file = write_config(MINIMAL_YAML.as_bytes());
        let config = Config::load(file.path()).expect("should load");
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.batch_interval, 5);
        assert_eq!(config.rescan_interval, 60);
        assert_eq!(config.processed_storage, ProcessedStorage::File);
        assert_eq!(config.clickhouse.protocol, Protocol::Native);
        assert_eq!(
            config.log_directories(),
            vec![PathBuf::from("/var/log/onec")]
        );
    }

    #[test]
    fn strips_bom_and_tabs_before_parsing() {
        let mut raw = vec![0xEF, 0xBB, 0xBF];
        raw.extend_from_slice(MINIMAL_YAML.replace("  main", "\tmain").as_bytes());
        let file = write_config(&raw);
        let config = Config::load(file.path()).expect("sanitized config should load");
        assert_eq!(config.log_directory_map.len(), 1);
    }

    #[test]
    fn rejects_missing_directories() {
        let file = write_config(b"FilePattern: '*.log'\nBatchSize: 10\nBatchInterval: 1\n");
        let err = Config::load(file.path()).expect_err("empty LogDirectoryMap must fail");
        assert!(err.to_string().contains("LogDirectoryMap"));
    }

    #[test]
    fn rejects_non_positive_sizes() {
        let contents = MINIMAL_YAML.replace("BatchSize: 500", "BatchSize: 0");
        let file = write_config(contents.as_bytes());
        let err = Config::load(file.path()).expect_err("zero BatchSize must fail");
        assert!(err.to_string().contains("BatchSize"));
    }

    #[test]
    fn translates_glob_to_anchored_regex() {
        let regex = compile_file_pattern("*.log").expect("valid pattern");
        assert!(regex.is_match("25052607.log"));
        assert!(!regex.is_match("25052607.log.bak"));
        assert!(!regex.is_match("notes.txt"));

        let regex = compile_file_pattern("????????.log").expect("valid pattern");
        assert!(regex.is_match("25052607.log"));
        assert!(!regex.is_match("2505260.log"));
    }

    #[test]
    fn malformed_pattern_fails_validation() {
        let contents = MINIMAL_YAML.replace("\"*.log\"", "\"[.log\"");
        let file = write_config(contents.as_bytes());
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn http_protocol_parses_from_yaml() {
        let contents = MINIMAL_YAML.replace(
            "DefaultTable: tech_events",
            "DefaultTable: tech_events\n  Protocol: http",
        );
        let file = write_config(contents.as_bytes());
        let config = Config::load(file.path()).expect("should load");
        assert_eq!(config.clickhouse.protocol, Protocol::Http);
    }
}
