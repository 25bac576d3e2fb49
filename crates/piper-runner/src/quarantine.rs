//! Append-only quarantine for documents that did not pass the gate.

use std::collections::HashMap;
use std::path::Path;

use piper_core::{QuarantineEntry, ReasonCode};

use crate::error::Result;

/// Quarantined entries for one run, in the order they were filed.
///
/// Entries can be looked up by source record id, and by record id plus
/// template id. Nothing is ever removed.
#[derive(Debug, Clone, Default)]
pub struct QuarantineLog {
    entries: Vec<QuarantineEntry>,
    by_record: HashMap<String, Vec<usize>>,
}

impl QuarantineLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: QuarantineEntry) {
        tracing::warn!(
            record_id = %entry.record_id(),
            template_id = %entry.template_id(),
            reason = %entry.reason,
            issues = entry.outcome.issues.len(),
            "Resource quarantined"
        );
        self.by_record
            .entry(entry.record_id().to_string())
            .or_default()
            .push(self.entries.len());
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[QuarantineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry filed for a source record.
    pub fn for_record(&self, record_id: &str) -> Vec<&QuarantineEntry> {
        self.by_record
            .get(record_id)
            .map(|indexes| indexes.iter().map(|&i| &self.entries[i]).collect())
            .unwrap_or_default()
    }

    /// The entry for one (record, template) pair.
    pub fn get(&self, record_id: &str, template_id: &str) -> Option<&QuarantineEntry> {
        self.for_record(record_id)
            .into_iter()
            .find(|e| e.template_id() == template_id)
    }

    pub fn count_by_reason(&self, reason: ReasonCode) -> usize {
        self.entries.iter().filter(|e| e.reason == reason).count()
    }

    /// Write the log as newline-delimited JSON, one entry per line.
    pub async fn write_ndjson(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, out).await?;
        tracing::info!(path = %path.display(), entries = self.len(), "Quarantine log written");
        Ok(())
    }
}
