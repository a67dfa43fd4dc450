//! The destination-store capability.
//!
//! The batcher only ever sees this trait: one atomic write of a row batch
//! into one table, plus a startup reachability probe. The concrete
//! implementation lives in [`crate::clickhouse`].

use crate::clickhouse::ClickHouseSink;
use crate::config::ClickHouseConfig;
use crate::model::TableRow;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Sink: Send + Sync {
    /// Writes `rows` into `table` as one all-or-nothing insert.
    async fn write(&self, table: &str, rows: &[TableRow]) -> Result<()>;

    /// Cheap reachability probe; failure at startup is fatal.
    async fn ping(&self) -> Result<()>;
}

pub fn build_sink(config: &ClickHouseConfig) -> Result<Arc<dyn Sink>> {
    Ok(Arc::new(ClickHouseSink::new(config)?))
}
