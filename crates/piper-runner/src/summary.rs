//! Operator-facing run summary.

use std::collections::BTreeMap;
use std::path::Path;

use piper_core::{Issue, ReasonCode};
use serde::Serialize;
use time::OffsetDateTime;

use crate::controller::RunReport;
use crate::error::Result;
use crate::sink::LoadReport;
use crate::state::{AbortReason, RunState, RunStatus};

/// One non-Valid pair, with the detail needed to fix it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
    pub record_id: String,
    pub template_id: String,
    pub reason: ReasonCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
}

/// Counts per terminal classification plus every failure's detail.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,
    pub state: RunState,
    /// Failed pairs per reason code, keyed by the code's name.
    pub reasons: BTreeMap<String, u64>,
    pub failures: Vec<FailureDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadReport>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

impl RunSummary {
    pub fn from_report(report: &RunReport) -> Self {
        let mut failures: Vec<FailureDetail> = report
            .quarantine
            .entries()
            .iter()
            .map(|entry| FailureDetail {
                record_id: entry.record_id().to_string(),
                template_id: entry.template_id().to_string(),
                reason: entry.reason,
                resource_kind: Some(entry.resource.resource_kind.clone()),
                message: None,
                issues: entry.outcome.issues.clone(),
            })
            .collect();
        failures.extend(report.errors.iter().map(|error| FailureDetail {
            record_id: error.record_id.clone(),
            template_id: error.template_id.clone(),
            reason: error.reason,
            resource_kind: None,
            message: Some(error.message.clone()),
            issues: Vec::new(),
        }));

        let mut reasons = BTreeMap::new();
        for failure in &failures {
            *reasons.entry(failure.reason.as_str().to_string()).or_insert(0) += 1;
        }

        Self {
            status: report.status,
            abort_reason: report.abort_reason.clone(),
            state: report.state.clone(),
            reasons,
            failures,
            load: report.load.clone(),
            started_at: report.started_at,
            finished_at: report.finished_at,
        }
    }

    pub fn elapsed(&self) -> time::Duration {
        self.finished_at - self.started_at
    }

    pub async fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        tracing::info!(path = %path.display(), "Run summary written");
        Ok(())
    }
}
