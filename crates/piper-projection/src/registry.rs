//! Mapping registry: which templates a source entity type projects through.
//!
//! The table is built once at startup, validated against the template store
//! before any rendering begins, and then shared read-only by every worker of
//! a run. Bindings for an entity type are evaluated in registration order.

use indexmap::IndexMap;
use piper_core::{ResourceFilter, TemplateBinding};
use serde_json::{Map, Value};

use crate::error::{ConfigurationError, DanglingBinding};
use crate::templates::TemplateStore;

/// Ordered entity type -> template binding table.
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    bindings: IndexMap<String, Vec<TemplateBinding>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the conventional registry for a template directory: every
    /// template named after an entity class binds that class to itself.
    pub fn from_template_store(store: &TemplateStore) -> Self {
        let mut registry = Self::new();
        for template_id in store.template_ids() {
            registry.insert(TemplateBinding::new(template_id.clone(), template_id), None);
        }
        registry
    }

    /// Register `template_id` for `entity_type`.
    ///
    /// Registering an existing pair replaces its parameters and keeps its
    /// position, unless `position` is given, in which case the binding moves
    /// there. Positions past the end append.
    pub fn register(
        &mut self,
        entity_type: &str,
        template_id: &str,
        parameters: Map<String, Value>,
        position: Option<usize>,
    ) -> Result<(), ConfigurationError> {
        let resource_kind = self
            .find(entity_type, template_id)
            .and_then(|b| b.resource_kind.clone());
        let mut binding = TemplateBinding::new(entity_type, template_id).with_parameters(parameters);
        binding.resource_kind = resource_kind;
        self.register_binding(binding, position)
    }

    /// Register a fully specified binding, replacing parameters and resource
    /// kind of an existing pair. Position rules match [`Self::register`].
    pub fn register_binding(
        &mut self,
        binding: TemplateBinding,
        position: Option<usize>,
    ) -> Result<(), ConfigurationError> {
        if binding.entity_type.trim().is_empty() {
            return Err(ConfigurationError::invalid_binding(format!(
                "empty entity type for template '{}'",
                binding.template_id
            )));
        }
        if binding.template_id.trim().is_empty() {
            return Err(ConfigurationError::invalid_binding(format!(
                "empty template id for entity type '{}'",
                binding.entity_type
            )));
        }
        self.insert(binding, position);
        Ok(())
    }

    fn insert(&mut self, binding: TemplateBinding, position: Option<usize>) {
        let list = self.bindings.entry(binding.entity_type.clone()).or_default();
        let existing = list
            .iter()
            .position(|b| b.template_id == binding.template_id);

        match (existing, position) {
            (Some(index), None) => {
                list[index] = binding;
            }
            (Some(index), Some(target)) => {
                list.remove(index);
                let target = target.min(list.len());
                list.insert(target, binding);
            }
            (None, None) => list.push(binding),
            (None, Some(target)) => {
                let target = target.min(list.len());
                list.insert(target, binding);
            }
        }
    }

    fn find(&self, entity_type: &str, template_id: &str) -> Option<&TemplateBinding> {
        self.bindings_for(entity_type)
            .iter()
            .find(|b| b.template_id == template_id)
    }

    /// Bindings for an entity type in evaluation order. Unknown types have none.
    pub fn bindings_for(&self, entity_type: &str) -> &[TemplateBinding] {
        self.bindings
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Bindings for an entity type that survive the run's resource filter.
    pub fn active_bindings<'a>(
        &'a self,
        entity_type: &str,
        filter: Option<&ResourceFilter>,
    ) -> Vec<&'a TemplateBinding> {
        self.bindings_for(entity_type)
            .iter()
            .filter(|b| filter.is_none_or(|f| f.allows(b)))
            .collect()
    }

    /// Entity types in the order they were first registered.
    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Every binding, grouped by entity type, in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = &TemplateBinding> {
        self.bindings.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.bindings.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check every binding against the template store.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::DanglingTemplates`] naming every binding
    /// whose template is missing.
    pub fn validate(&self, store: &TemplateStore) -> Result<(), ConfigurationError> {
        let dangling: Vec<DanglingBinding> = self
            .iter()
            .filter(|b| !store.contains(&b.template_id))
            .map(|b| DanglingBinding {
                entity_type: b.entity_type.clone(),
                template_id: b.template_id.clone(),
            })
            .collect();

        if dangling.is_empty() {
            tracing::debug!(bindings = self.len(), "Mapping registry validated");
            Ok(())
        } else {
            Err(ConfigurationError::DanglingTemplates(dangling))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn template_ids(registry: &MappingRegistry, entity_type: &str) -> Vec<String> {
        registry
            .bindings_for(entity_type)
            .iter()
            .map(|b| b.template_id.clone())
            .collect()
    }

    #[test]
    fn test_bindings_keep_registration_order() {
        let mut registry = MappingRegistry::new();
        registry.register("Measurement", "Observation", Map::new(), None).unwrap();
        registry.register("Measurement", "Provenance", Map::new(), None).unwrap();
        registry.register("Measurement", "Specimen", Map::new(), None).unwrap();

        for _ in 0..3 {
            assert_eq!(
                template_ids(&registry, "Measurement"),
                vec!["Observation", "Provenance", "Specimen"]
            );
        }
    }

    #[test]
    fn test_unregistered_type_has_no_bindings() {
        let registry = MappingRegistry::new();
        assert!(registry.bindings_for("Nothing").is_empty());
        assert!(registry.active_bindings("Nothing", None).is_empty());
    }

    #[test]
    fn test_reregistering_replaces_parameters_in_place() {
        let mut registry = MappingRegistry::new();
        registry
            .register("Measurement", "Observation", params(json!({"v": 1})), None)
            .unwrap();
        registry.register("Measurement", "Provenance", Map::new(), None).unwrap();
        registry
            .register("Measurement", "Observation", params(json!({"v": 2})), None)
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            template_ids(&registry, "Measurement"),
            vec!["Observation", "Provenance"]
        );
        assert_eq!(registry.bindings_for("Measurement")[0].parameters["v"], 2);
    }

    #[test]
    fn test_reregistering_keeps_resource_kind() {
        let mut registry = MappingRegistry::new();
        registry
            .register_binding(
                TemplateBinding::new("Subject", "SubjectPatient").with_resource_kind("Patient"),
                None,
            )
            .unwrap();
        registry
            .register("Subject", "SubjectPatient", params(json!({"x": true})), None)
            .unwrap();

        let binding = &registry.bindings_for("Subject")[0];
        assert_eq!(binding.resource_kind.as_deref(), Some("Patient"));
        assert_eq!(binding.parameters["x"], true);
    }

    #[test]
    fn test_explicit_position_reorders() {
        let mut registry = MappingRegistry::new();
        registry.register("M", "A", Map::new(), None).unwrap();
        registry.register("M", "B", Map::new(), None).unwrap();
        registry.register("M", "C", Map::new(), None).unwrap();

        registry.register("M", "C", Map::new(), Some(0)).unwrap();
        assert_eq!(template_ids(&registry, "M"), vec!["C", "A", "B"]);

        registry.register("M", "D", Map::new(), Some(99)).unwrap();
        assert_eq!(template_ids(&registry, "M"), vec!["C", "A", "B", "D"]);
    }

    #[test]
    fn test_empty_identifiers_rejected() {
        let mut registry = MappingRegistry::new();
        assert!(registry.register("", "Patient", Map::new(), None).is_err());
        assert!(registry.register("Subject", " ", Map::new(), None).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_active_bindings_apply_filter() {
        let mut registry = MappingRegistry::new();
        registry.register("Measurement", "Observation", Map::new(), None).unwrap();
        registry.register("Measurement", "Provenance", Map::new(), None).unwrap();

        let filter = ResourceFilter::new(["Provenance"]);
        let active = registry.active_bindings("Measurement", Some(&filter));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].template_id, "Provenance");

        let by_type = ResourceFilter::new(["Measurement"]);
        assert_eq!(registry.active_bindings("Measurement", Some(&by_type)).len(), 2);
    }

    #[test]
    fn test_validate_reports_all_dangling_templates() {
        let mut store = TemplateStore::new();
        store.register("Patient", r#"{"resourceType": "Patient"}"#).unwrap();

        let mut registry = MappingRegistry::new();
        registry.register("Subject", "Patient", Map::new(), None).unwrap();
        registry.register("Subject", "Consent", Map::new(), None).unwrap();
        registry.register("Sample", "Specimen", Map::new(), None).unwrap();

        match registry.validate(&store) {
            Err(ConfigurationError::DanglingTemplates(dangling)) => {
                let ids: Vec<_> = dangling.iter().map(|d| d.template_id.as_str()).collect();
                assert_eq!(ids, vec!["Consent", "Specimen"]);
            }
            other => panic!("expected dangling templates, got {other:?}"),
        }
    }

    #[test]
    fn test_from_template_store_binds_class_to_itself() {
        let mut store = TemplateStore::new();
        store.register("Subject", r#"{"resourceType": "Patient"}"#).unwrap();
        store.register("Study", r#"{"resourceType": "ResearchStudy"}"#).unwrap();

        let registry = MappingRegistry::from_template_store(&store);
        assert_eq!(registry.entity_types().collect::<Vec<_>>(), vec!["Study", "Subject"]);
        assert_eq!(template_ids(&registry, "Subject"), vec!["Subject"]);
        assert!(registry.validate(&store).is_ok());
    }
}
