//! Handlebars-backed template store.
//!
//! Templates produce FHIR JSON. Interpolated values are escaped for use
//! inside JSON string literals, so `"family": "{{record.last_name}}"` is
//! safe for any string value. The `json` helper writes a value as a JSON
//! literal (`"birthDate": {{json record.birth_date}}`). Strict mode is on:
//! referencing a field the context does not have is a render error.

use std::path::Path;

use handlebars::{
    Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderErrorReason,
};
use serde_json::Value;

use crate::error::TemplateError;

const TEMPLATE_EXTENSION: &str = ".hbs";

/// Outcome of loading a template directory.
#[derive(Debug, Default)]
pub struct TemplateLoadReport {
    /// Template ids loaded, in file-name order.
    pub loaded: Vec<String>,
    /// Files that failed to parse.
    pub failed: Vec<TemplateError>,
}

impl TemplateLoadReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Holds one rendering template per resource shape.
pub struct TemplateStore {
    registry: Handlebars<'static>,
}

impl TemplateStore {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(escape_json_string);
        registry.register_helper("json", Box::new(json_helper));
        registry.register_helper("snake", Box::new(snake_helper));
        Self { registry }
    }

    /// Register (or replace) a template from source text.
    pub fn register(&mut self, template_id: &str, source: &str) -> Result<(), TemplateError> {
        self.registry
            .register_template_string(template_id, source)
            .map_err(|e| TemplateError::parse(template_id, e.to_string()))
    }

    /// Load every `<Name>.hbs` (or `<Name>.json.hbs`) file in `dir` whose name
    /// starts with an uppercase letter. The template id is the class name.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<TemplateLoadReport, TemplateError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(TemplateError::DirectoryNotFound(dir.to_path_buf()));
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(template_id) = template_id_for(&file_name) {
                files.push((template_id, entry.path()));
            }
        }
        files.sort();

        let mut report = TemplateLoadReport::default();
        for (template_id, path) in files {
            let source = std::fs::read_to_string(&path)?;
            match self.register(&template_id, &source) {
                Ok(()) => report.loaded.push(template_id),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Error loading template");
                    report.failed.push(e);
                }
            }
        }

        tracing::info!(
            dir = %dir.display(),
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Template files loaded"
        );
        Ok(report)
    }

    pub fn contains(&self, template_id: &str) -> bool {
        self.registry.has_template(template_id)
    }

    /// All template ids, sorted.
    pub fn template_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.get_templates().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.registry.get_templates().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render a template against a JSON context.
    pub fn render(&self, template_id: &str, context: &Value) -> Result<String, TemplateError> {
        if !self.contains(template_id) {
            return Err(TemplateError::not_found(template_id));
        }
        self.registry
            .render(template_id, context)
            .map_err(|e| TemplateError::render(template_id, e.to_string()))
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateStore")
            .field("templates", &self.template_ids())
            .finish()
    }
}

fn template_id_for(file_name: &str) -> Option<String> {
    if !file_name.starts_with(|c: char| c.is_ascii_uppercase()) {
        return None;
    }
    let stem = file_name.strip_suffix(TEMPLATE_EXTENSION)?;
    let stem = stem.strip_suffix(".json").unwrap_or(stem);
    if stem.is_empty() || stem.contains('.') {
        return None;
    }
    Some(stem.to_string())
}

/// Escape a value for embedding inside a JSON string literal.
fn escape_json_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

// Handlebars helpers

fn json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let param = h
        .param(0)
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("json", 0))?;
    let rendered = serde_json::to_string(param.value())
        .map_err(|e| RenderErrorReason::Other(e.to_string()))?;
    out.write(&rendered)?;
    Ok(())
}

fn snake_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let param = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&piper_core::to_snake_case(param))?;
    Ok(())
}
