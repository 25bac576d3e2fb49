//! Reading FHIR `OperationOutcome` resources into [`Issue`]s.

use piper_core::{Issue, IssueSeverity};
use serde_json::Value;

/// Whether a JSON value is an `OperationOutcome` resource.
pub fn is_operation_outcome(value: &Value) -> bool {
    value.get("resourceType").and_then(Value::as_str) == Some("OperationOutcome")
}

/// Extract issues in the order the validator listed them.
///
/// The message is `diagnostics`, falling back to `details.text`. Locations
/// come from `expression`, falling back to the deprecated `location`.
pub fn parse_issues(outcome: &Value) -> Vec<Issue> {
    let Some(issues) = outcome.get("issue").and_then(Value::as_array) else {
        return Vec::new();
    };

    issues.iter().map(parse_issue).collect()
}

fn parse_issue(issue: &Value) -> Issue {
    let severity = issue
        .get("severity")
        .and_then(Value::as_str)
        .map(IssueSeverity::from_code)
        .unwrap_or(IssueSeverity::Error);
    let code = issue
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let message = issue
        .get("diagnostics")
        .and_then(Value::as_str)
        .or_else(|| {
            issue
                .get("details")
                .and_then(|d| d.get("text"))
                .and_then(Value::as_str)
        })
        .unwrap_or_default();

    let mut locations = strings(issue.get("expression"));
    if locations.is_empty() {
        locations = strings(issue.get("location"));
    }

    Issue {
        severity,
        code: code.to_string(),
        message: message.to_string(),
        locations,
    }
}

fn strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
