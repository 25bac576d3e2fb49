//! Load sinks: where validated documents go.

mod fhir;
mod json_file;

use async_trait::async_trait;
use piper_core::{RenderedResource, ResourceRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fhir::FhirServerSink;
pub use json_file::JsonArrayFileSink;

/// When valid documents are handed to the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadMode {
    /// Load everything at the end, and only if the run completed.
    #[default]
    AfterCompletion,
    /// Load each document as soon as it is classified Valid.
    Streaming,
    /// Never load.
    Disabled,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Load destination unreachable: {0}")]
    Transport(String),

    #[error("Invalid load destination: {0}")]
    InvalidDestination(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum LoadStatus {
    Accepted,
    Rejected { message: String },
}

/// The sink's answer for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub resource: ResourceRef,
    #[serde(flatten)]
    pub status: LoadStatus,
}

impl LoadResult {
    pub fn accepted(resource: ResourceRef) -> Self {
        Self {
            resource,
            status: LoadStatus::Accepted,
        }
    }

    pub fn rejected(resource: ResourceRef, message: impl Into<String>) -> Self {
        Self {
            resource,
            status: LoadStatus::Rejected {
                message: message.into(),
            },
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == LoadStatus::Accepted
    }
}

/// Destination for validated documents.
///
/// Authentication and batching are the sink's own business.
#[async_trait]
pub trait LoadSink: Send + Sync {
    /// Load a batch, answering per document.
    async fn load(&self, documents: &[RenderedResource]) -> Result<Vec<LoadResult>, LoadError>;

    /// Flush anything buffered. Called once after the last `load`.
    async fn finish(&self) -> Result<(), LoadError> {
        Ok(())
    }
}

/// Totals of a run's load hand-off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub accepted: u64,
    pub rejected: Vec<LoadResult>,
    /// Batch-level failures; documents in a failed batch are not counted above.
    pub errors: Vec<String>,
}

impl LoadReport {
    pub fn record(&mut self, results: Vec<LoadResult>) {
        for result in results {
            if result.is_accepted() {
                self.accepted += 1;
            } else {
                tracing::warn!(resource = %result.resource, "Document rejected by load sink");
                self.rejected.push(result);
            }
        }
    }

    pub fn record_error(&mut self, error: &LoadError) {
        tracing::error!(error = %error, "Load batch failed");
        self.errors.push(error.to_string());
    }

    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reference(id: &str) -> ResourceRef {
        ResourceRef {
            record_id: id.into(),
            template_id: "Patient".into(),
            resource_kind: "Patient".into(),
        }
    }

    #[test]
    fn test_report_tallies_results() {
        let mut report = LoadReport::default();
        report.record(vec![
            LoadResult::accepted(reference("1")),
            LoadResult::rejected(reference("2"), "HTTP 409"),
            LoadResult::accepted(reference("3")),
        ]);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected.len(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_load_result_serializes_flat() {
        let value = serde_json::to_value(LoadResult::rejected(reference("2"), "gone")).unwrap();
        assert_eq!(
            value,
            json!({
                "resource": {"recordId": "2", "templateId": "Patient", "resourceKind": "Patient"},
                "status": "rejected",
                "message": "gone"
            })
        );
    }

    #[test]
    fn test_load_mode_names() {
        let mode: LoadMode = serde_json::from_value(json!("after-completion")).unwrap();
        assert_eq!(mode, LoadMode::AfterCompletion);
        assert_eq!(LoadMode::default(), LoadMode::AfterCompletion);
    }
}
