//! Entity sources: where source records come from.
//!
//! A source is a lazy, finite, non-restartable stream of [`SourceRecord`]s
//! scoped to one run. Relational access lives outside this workspace; the
//! extract step hands records over either in memory or as an NDJSON file
//! with one record object per line.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::error::{Result, SourceError};
use crate::model::SourceRecord;

/// Producer of source records for one pipeline run.
#[async_trait]
pub trait EntitySource: Send {
    /// Return the next record, or `None` once the stream is exhausted.
    async fn next_record(&mut self) -> Result<Option<SourceRecord>>;
}

/// Source backed by an in-memory list of records.
#[derive(Debug)]
pub struct MemorySource {
    records: std::vec::IntoIter<SourceRecord>,
}

impl MemorySource {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

#[async_trait]
impl EntitySource for MemorySource {
    async fn next_record(&mut self) -> Result<Option<SourceRecord>> {
        Ok(self.records.next())
    }
}

/// Source reading newline-delimited JSON records from a file.
///
/// Blank lines are skipped. Each record needs a non-empty `id` and
/// `entityType`.
pub struct NdjsonSource {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

impl NdjsonSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        tracing::debug!(path = %path.display(), "Opened NDJSON entity source");
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EntitySource for NdjsonSource {
    async fn next_record(&mut self) -> Result<Option<SourceRecord>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let record: SourceRecord = serde_json::from_str(trimmed)
                .map_err(|e| SourceError::parse(self.line_no, e.to_string()))?;

            if record.id.is_empty() {
                return Err(SourceError::invalid_record(self.line_no, "empty id"));
            }
            if record.entity_type.is_empty() {
                return Err(SourceError::invalid_record(self.line_no, "empty entityType"));
            }

            return Ok(Some(record));
        }

        Ok(None)
    }
}
