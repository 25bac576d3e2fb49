//! Pipeline data model.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// A single row read from the entity source.
///
/// Fields hold the row's own columns. Anchors hold related context the row
/// belongs to (for example the owning `study` and `subject`), keyed by the
/// name templates will use to reach them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    pub id: String,
    pub entity_type: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub anchors: BTreeMap<String, Value>,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            fields: Map::new(),
            anchors: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn with_anchor(mut self, name: impl Into<String>, value: Value) -> Self {
        self.anchors.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Association of an entity type with one template and its static parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateBinding {
    pub entity_type: String,
    pub template_id: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Expected `resourceType` of the rendered document, if the binding pins one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_kind: Option<String>,
}

impl TemplateBinding {
    pub fn new(entity_type: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            template_id: template_id.into(),
            parameters: Map::new(),
            resource_kind: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_resource_kind(mut self, kind: impl Into<String>) -> Self {
        self.resource_kind = Some(kind.into());
        self
    }
}

/// Optional run-level narrowing of the active bindings.
///
/// A binding is active when either its entity type or its template id is
/// listed. An empty filter lets everything through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceFilter {
    identifiers: BTreeSet<String>,
}

impl ResourceFilter {
    pub fn new<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identifiers: identifiers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.identifiers.iter().map(String::as_str)
    }

    pub fn allows(&self, binding: &TemplateBinding) -> bool {
        self.is_empty()
            || self.identifiers.contains(&binding.entity_type)
            || self.identifiers.contains(&binding.template_id)
    }
}

/// Provenance of a rendered document: which record and template produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub record_id: String,
    pub template_id: String,
    pub resource_kind: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.template_id, self.resource_kind, self.record_id
        )
    }
}

/// A candidate FHIR document produced by rendering one binding for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedResource {
    pub record_id: String,
    pub entity_type: String,
    pub template_id: String,
    pub resource_kind: String,
    pub document: String,
}

impl RenderedResource {
    pub fn reference(&self) -> ResourceRef {
        ResourceRef {
            record_id: self.record_id.clone(),
            template_id: self.template_id.clone(),
            resource_kind: self.resource_kind.clone(),
        }
    }

    /// Parse the document text back into JSON.
    pub fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.document)
    }
}

/// Issue severity levels as defined by FHIR `OperationOutcome.issue.severity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

impl IssueSeverity {
    /// Parse a FHIR severity code. Unrecognised codes are treated as errors.
    pub fn from_code(code: &str) -> Self {
        match code {
            "fatal" => Self::Fatal,
            "warning" => Self::Warning,
            "information" => Self::Information,
            _ => Self::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "information",
        }
    }

    /// Whether an issue of this severity makes the resource non-conformant.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Fatal | Self::Error)
    }
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single validation issue, kept exactly as the validator reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub severity: IssueSeverity,
    #[serde(default)]
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<String>,
}

impl Issue {
    pub fn new(severity: IssueSeverity, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
            locations: Vec::new(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.locations.push(location.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Invalid,
}

/// Result of validating one rendered resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub resource: ResourceRef,
    pub status: ValidationStatus,
    pub issues: Vec<Issue>,
    /// Raw `OperationOutcome` returned by the validator, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_outcome: Option<Value>,
}

impl ValidationOutcome {
    /// Derive the status from the issue list: any fatal or error issue makes
    /// the resource invalid.
    pub fn from_issues(
        resource: ResourceRef,
        issues: Vec<Issue>,
        operation_outcome: Option<Value>,
    ) -> Self {
        let status = if issues.iter().any(|i| i.severity.is_blocking()) {
            ValidationStatus::Invalid
        } else {
            ValidationStatus::Valid
        };
        Self {
            resource,
            status,
            issues,
            operation_outcome,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }

    pub fn blocking_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity.is_blocking())
    }
}

/// Why a (record, template) pair did not end up Valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    /// The validator reported the document as non-conformant.
    Invalid,
    /// The validation endpoint stayed unreachable through every retry.
    TransportExhausted,
    /// The validation endpoint refused the request in a way retrying cannot fix.
    TransportRejected,
    /// The template could not be rendered for this record.
    RenderFailed,
    /// The run aborted and the pair was still in flight when the drain grace expired.
    Abandoned,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::TransportExhausted => "transport-exhausted",
            Self::TransportRejected => "transport-rejected",
            Self::RenderFailed => "render-failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rendered document held back for operator review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineEntry {
    pub resource: RenderedResource,
    pub outcome: ValidationOutcome,
    pub reason: ReasonCode,
    #[serde(with = "time::serde::rfc3339")]
    pub quarantined_at: OffsetDateTime,
}

impl QuarantineEntry {
    pub fn new(resource: RenderedResource, outcome: ValidationOutcome, reason: ReasonCode) -> Self {
        Self {
            resource,
            outcome,
            reason,
            quarantined_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn record_id(&self) -> &str {
        &self.resource.record_id
    }

    pub fn template_id(&self) -> &str {
        &self.resource.template_id
    }
}

/// A (record, template) pair that failed before or outside validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub record_id: String,
    pub entity_type: String,
    pub template_id: String,
    pub reason: ReasonCode,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl RunError {
    pub fn new(
        record_id: impl Into<String>,
        entity_type: impl Into<String>,
        template_id: impl Into<String>,
        reason: ReasonCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            entity_type: entity_type.into(),
            template_id: template_id.into(),
            reason,
            message: message.into(),
            occurred_at: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource_ref() -> ResourceRef {
        ResourceRef {
            record_id: "r1".into(),
            template_id: "Patient".into(),
            resource_kind: "Patient".into(),
        }
    }

    #[test]
    fn test_source_record_deserializes_camel_case() {
        let record: SourceRecord = serde_json::from_value(json!({
            "id": "s-1",
            "entityType": "Subject",
            "fields": {"gender": "female"},
            "anchors": {"study": {"name": "ABC"}}
        }))
        .unwrap();

        assert_eq!(record.entity_type, "Subject");
        assert_eq!(record.field("gender"), Some(&json!("female")));
        assert_eq!(record.anchors["study"]["name"], "ABC");
    }

    #[test]
    fn test_empty_filter_allows_everything() {
        let filter = ResourceFilter::default();
        assert!(filter.allows(&TemplateBinding::new("Observation", "Vitals")));
    }

    #[test]
    fn test_filter_matches_entity_type_or_template() {
        let filter = ResourceFilter::new(["Patient", "Provenance"]);
        assert!(filter.allows(&TemplateBinding::new("Patient", "P")));
        assert!(filter.allows(&TemplateBinding::new("Observation", "Provenance")));
        assert!(!filter.allows(&TemplateBinding::new("Observation", "O")));
    }

    #[test]
    fn test_outcome_status_follows_blocking_issues() {
        let warnings = vec![Issue::new(IssueSeverity::Warning, "informational", "dom-6")];
        assert!(ValidationOutcome::from_issues(resource_ref(), warnings, None).is_valid());

        let errors = vec![
            Issue::new(IssueSeverity::Warning, "informational", "dom-6"),
            Issue::new(IssueSeverity::Error, "required", "Patient.name: minimum required = 1"),
        ];
        let outcome = ValidationOutcome::from_issues(resource_ref(), errors, None);
        assert_eq!(outcome.status, ValidationStatus::Invalid);
        assert_eq!(outcome.blocking_issues().count(), 1);
    }

    #[test]
    fn test_unknown_severity_is_blocking() {
        assert_eq!(IssueSeverity::from_code("catastrophic"), IssueSeverity::Error);
        assert!(IssueSeverity::from_code("fatal").is_blocking());
        assert!(!IssueSeverity::from_code("information").is_blocking());
    }

    #[test]
    fn test_reason_code_serializes_kebab_case() {
        let value = serde_json::to_value(ReasonCode::TransportExhausted).unwrap();
        assert_eq!(value, json!("transport-exhausted"));
        assert_eq!(ReasonCode::RenderFailed.to_string(), "render-failed");
    }

    #[test]
    fn test_resource_ref_display() {
        assert_eq!(resource_ref().to_string(), "Patient:Patient/r1");
    }
}
