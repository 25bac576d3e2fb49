//! Assembles the projection engine, validation gate and load sink from a
//! [`PipelineConfig`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use piper_core::{ResourceFilter, TemplateBinding};
use piper_projection::{MappingRegistry, ProjectionEngine, TemplateStore};
use piper_runner::{FhirServerSink, JsonArrayFileSink, LoadSink};
use piper_validation::{HttpValidationEndpoint, ValidationGate};

use crate::config::{ConfigError, LoadConfig, PipelineConfig, resolve_path};

/// Load templates, build the mapping table and check it against the store.
///
/// Any template that fails to parse and any binding to a missing template
/// is a configuration error.
pub fn build_engine(
    cfg: &PipelineConfig,
    config_path: &Path,
    only: &[String],
) -> Result<ProjectionEngine> {
    let dir = resolve_path(config_path, &cfg.templates.dir);
    let mut store = TemplateStore::new();
    let report = store
        .load_dir(&dir)
        .map_err(|e| ConfigError::new(e.to_string()))?;
    if let Some(first) = report.failed.first() {
        return Err(ConfigError::new(format!(
            "{} template(s) failed to load, first: {first}",
            report.failed.len()
        ))
        .into());
    }

    let mut registry = if cfg.templates.conventional {
        MappingRegistry::from_template_store(&store)
    } else {
        MappingRegistry::new()
    };
    for binding in &cfg.bindings {
        let mut entry = TemplateBinding::new(&binding.entity_type, &binding.template)
            .with_parameters(binding.parameters.clone());
        if let Some(kind) = &binding.resource_kind {
            entry = entry.with_resource_kind(kind);
        }
        registry
            .register_binding(entry, binding.position)
            .map_err(|e| ConfigError::new(e.to_string()))?;
    }
    let filter = if only.is_empty() {
        cfg.filter()
    } else {
        Some(ResourceFilter::new(only.iter().cloned()))
    };
    if let Some(filter) = &filter {
        warn_unknown_filter_ids(&registry, filter);
    }

    let engine = ProjectionEngine::new(Arc::new(registry), Arc::new(store))
        .map_err(|e| ConfigError::new(e.to_string()))?;
    Ok(engine
        .with_filter(filter)
        .with_run_parameters(cfg.run_parameters.clone()))
}

fn warn_unknown_filter_ids(registry: &MappingRegistry, filter: &ResourceFilter) {
    for id in filter.identifiers() {
        let known = registry
            .iter()
            .any(|b| b.entity_type == id || b.template_id == id);
        if !known {
            tracing::warn!(id, "Filter id matches no binding");
        }
    }
}

pub fn build_gate(cfg: &PipelineConfig) -> Result<ValidationGate> {
    let endpoint = HttpValidationEndpoint::new(cfg.endpoint_config())
        .map_err(|e| ConfigError::new(e.to_string()))?;
    Ok(ValidationGate::new(Arc::new(endpoint), cfg.retry_policy()))
}

pub fn build_sink(cfg: &PipelineConfig, config_path: &Path) -> Result<Option<Arc<dyn LoadSink>>> {
    let sink: Arc<dyn LoadSink> = match &cfg.load {
        LoadConfig::None => return Ok(None),
        LoadConfig::Fhir {
            base_url,
            auth_token,
            timeout_ms,
        } => Arc::new(
            FhirServerSink::new(
                base_url,
                auth_token.clone(),
                Duration::from_millis(*timeout_ms),
            )
            .map_err(|e| ConfigError::new(e.to_string()))
            .context("building FHIR server sink")?,
        ),
        LoadConfig::JsonFile { path, buffer_size } => Arc::new(JsonArrayFileSink::with_buffer_size(
            resolve_path(config_path, path),
            *buffer_size,
        )),
    };
    Ok(Some(sink))
}
