//! Logging setup.
//!
//! Console and file layers run at independently configured levels; when
//! Sentry is enabled, records at error level and above are mirrored to the
//! configured DSN. The returned guard keeps the Sentry transport alive for
//! the life of the process.

use crate::config::LoggingConfig;
use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

pub struct LoggingGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let console_level = parse_level(&config.console_level, Level::INFO)?;
    let file_level = parse_level(&config.level, Level::ERROR)?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(LevelFilter::from_level(console_level));

    let file_layer = if config.log_file.trim().is_empty() {
        None
    } else {
        let expanded = shellexpand::tilde(&config.log_file).into_owned();
        let path = Path::new(&expanded);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create log directory {}", parent.display())
                })?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Arc::new(file))
                .with_filter(LevelFilter::from_level(file_level)),
        )
    };

    let sentry_guard = if config.enable_sentry && !config.sentry_dsn.trim().is_empty() {
        Some(sentry::init((
            config.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        )))
    } else {
        None
    };
    let sentry_layer = sentry_guard.as_ref().map(|_| sentry_tracing::layer());

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(sentry_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _sentry: sentry_guard,
    })
}

fn parse_level(value: &str, default: Level) -> Result<Level> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(default);
    }
    trimmed
        .parse::<Level>()
        .map_err(|_| anyhow!("unrecognized log level {trimmed:?}"))
}
