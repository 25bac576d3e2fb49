use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A binding whose template id has no template behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingBinding {
    pub entity_type: String,
    pub template_id: String,
}

impl fmt::Display for DanglingBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.entity_type, self.template_id)
    }
}

fn join_dangling(bindings: &[DanglingBinding]) -> String {
    bindings
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Invalid mapping setup. Always fatal, and always raised before any record
/// is rendered.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Bindings reference unknown templates: {}", join_dangling(.0))]
    DanglingTemplates(Vec<DanglingBinding>),

    #[error("Invalid binding: {0}")]
    InvalidBinding(String),
}

impl ConfigurationError {
    pub fn invalid_binding(message: impl Into<String>) -> Self {
        Self::InvalidBinding(message.into())
    }
}

/// Errors raised by the template store.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Template directory does not exist: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("Failed to parse template '{template_id}': {message}")]
    Parse { template_id: String, message: String },

    #[error("Failed to render template '{template_id}': {message}")]
    Render { template_id: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TemplateError {
    pub fn not_found(template_id: impl Into<String>) -> Self {
        Self::NotFound(template_id.into())
    }

    pub fn parse(template_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            template_id: template_id.into(),
            message: message.into(),
        }
    }

    pub fn render(template_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Render {
            template_id: template_id.into(),
            message: message.into(),
        }
    }
}

/// What went wrong while projecting one (record, binding) pair.
#[derive(Debug, Error)]
pub enum RenderErrorKind {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("rendered output is not valid JSON: {0}")]
    NotJson(String),

    #[error("rendered output is not a FHIR resource (no resourceType)")]
    MissingResourceType,

    #[error("rendered {actual} but the binding expects {expected}")]
    ResourceKindMismatch { expected: String, actual: String },
}

/// Rendering failure for a single (record, binding) pair.
#[derive(Debug, Error)]
#[error("Failed to project {entity_type} '{record_id}' through '{template_id}': {kind}")]
pub struct RenderError {
    pub record_id: String,
    pub entity_type: String,
    pub template_id: String,
    #[source]
    pub kind: RenderErrorKind,
}

impl RenderError {
    pub fn new(
        record_id: impl Into<String>,
        entity_type: impl Into<String>,
        template_id: impl Into<String>,
        kind: impl Into<RenderErrorKind>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            entity_type: entity_type.into(),
            template_id: template_id.into(),
            kind: kind.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dangling_templates_lists_every_binding() {
        let err = ConfigurationError::DanglingTemplates(vec![
            DanglingBinding {
                entity_type: "Subject".into(),
                template_id: "Patient".into(),
            },
            DanglingBinding {
                entity_type: "Sample".into(),
                template_id: "Specimen".into(),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "Bindings reference unknown templates: Subject -> Patient, Sample -> Specimen"
        );
    }

    #[test]
    fn test_render_error_display_includes_provenance() {
        let err = RenderError::new(
            "42",
            "Subject",
            "Patient",
            RenderErrorKind::MissingResourceType,
        );
        assert_eq!(
            err.to_string(),
            "Failed to project Subject '42' through 'Patient': rendered output is not a FHIR resource (no resourceType)"
        );
    }
}
