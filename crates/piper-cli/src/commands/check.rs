use std::path::Path;

use anyhow::{Context, Result};
use piper_projection::MappingRegistry;
use serde::Serialize;

use crate::cli::BindingsArgs;
use crate::config::{BindingConfig, PipelineConfig};
use crate::output::{print_bindings, print_success};
use crate::pipeline::{build_engine, build_gate};

pub fn check(cfg: &PipelineConfig, config_path: &Path) -> Result<()> {
    let engine = build_engine(cfg, config_path, &[])?;
    build_gate(cfg)?;

    let registry = engine.registry();
    print_success(&format!(
        "{} binding(s) for {} entity type(s), every template resolves",
        registry.len(),
        registry.entity_types().count()
    ));
    Ok(())
}

pub fn bindings(cfg: &PipelineConfig, config_path: &Path, args: &BindingsArgs) -> Result<()> {
    let engine = build_engine(cfg, config_path, &[])?;
    if args.toml {
        print!("{}", bindings_toml(engine.registry())?);
    } else {
        print_bindings(engine.registry());
    }
    Ok(())
}

#[derive(Serialize)]
struct BindingsFile {
    bindings: Vec<BindingConfig>,
}

/// The resolved table as `[[bindings]]` entries, ready to paste into a
/// config with `templates.conventional = false`.
fn bindings_toml(registry: &MappingRegistry) -> Result<String> {
    let bindings = registry
        .iter()
        .map(|b| BindingConfig {
            entity_type: b.entity_type.clone(),
            template: b.template_id.clone(),
            parameters: b.parameters.clone(),
            resource_kind: b.resource_kind.clone(),
            position: None,
        })
        .collect();
    toml::to_string_pretty(&BindingsFile { bindings }).context("serializing bindings")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    #[test]
    fn test_bindings_toml_round_trips_through_config_shape() {
        let mut registry = MappingRegistry::new();
        registry.register("Subject", "Patient", Map::new(), None).unwrap();
        let mut params = Map::new();
        params.insert("status".into(), json!("active"));
        registry.register("Subject", "Consent", params, None).unwrap();

        let text = bindings_toml(&registry).unwrap();
        let parsed: toml::Value = toml::from_str(&text).unwrap();
        let entries = parsed["bindings"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["template"].as_str(), Some("Patient"));
        assert!(entries[0].get("parameters").is_none());
        assert_eq!(entries[1]["parameters"]["status"].as_str(), Some("active"));
    }
}
