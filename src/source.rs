//! Row sources and export sinks.
//!
//! A source yields a lazy, finite, restartable sequence of untyped rows;
//! offset-based fetch is what makes chunked processing and resume from a
//! persisted checkpoint possible. File parsing and the concrete commerce
//! connectors live outside this crate and plug in through these traits.

use crate::model::RawRow;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[async_trait]
pub trait RowSource: Send + Sync {
    /// Total number of rows this source will yield. Called once per phase
    /// to seed the job's `total` counter.
    async fn total(&self) -> Result<u64>;

    /// Fetch up to `limit` rows starting at `offset` (0-based). Returns an
    /// empty vec past the end. Fetching the same range twice yields the
    /// same rows.
    async fn fetch(&self, offset: u64, limit: u64) -> Result<Vec<RawRow>>;
}

/// In-process source over already-materialized rows; used by tests and by
/// direct dashboard submissions whose parsing happened upstream.
pub struct MemorySource {
    rows: Vec<RawRow>,
}

impl MemorySource {
    pub fn new(rows: Vec<RawRow>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl RowSource for MemorySource {
    async fn total(&self) -> Result<u64> {
        Ok(self.rows.len() as u64)
    }

    async fn fetch(&self, offset: u64, limit: u64) -> Result<Vec<RawRow>> {
        let start = (offset as usize).min(self.rows.len());
        let end = (start + limit as usize).min(self.rows.len());
        Ok(self.rows[start..end].to_vec())
    }
}

#[async_trait]
pub trait ExportSink: Send + Sync {
    async fn write_rows(&self, rows: &[RawRow]) -> Result<()>;
}

/// Writes one JSON object per line. The concrete spreadsheet format the
/// dashboard serves is assembled elsewhere.
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ExportSink for JsonLinesSink {
    async fn write_rows(&self, rows: &[RawRow]) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open export file {}", self.path.display()))?;
        let mut buf = String::new();
        for row in rows {
            buf.push_str(&serde_json::to_string(row)?);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Collects exported rows in memory; test double.
#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<Vec<RawRow>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<RawRow> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl ExportSink for MemorySink {
    async fn write_rows(&self, rows: &[RawRow]) -> Result<()> {
        self.rows.lock().await.extend_from_slice(rows);
        Ok(())
    }
}
