//! Projection engine: source record -> candidate FHIR documents.

use std::sync::Arc;

use piper_core::{RenderedResource, ResourceFilter, SourceRecord, TemplateBinding, to_snake_case};
use serde_json::{Map, Value, json};

use crate::error::{ConfigurationError, RenderError, RenderErrorKind};
use crate::registry::MappingRegistry;
use crate::templates::TemplateStore;

/// Everything one record projected into.
#[derive(Debug, Default)]
pub struct Projection {
    pub resources: Vec<RenderedResource>,
    pub errors: Vec<RenderError>,
}

impl Projection {
    /// Number of (record, binding) pairs this projection accounts for.
    pub fn pair_count(&self) -> usize {
        self.resources.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pair_count() == 0
    }
}

/// Renders every active binding of a record against the template store.
///
/// The engine holds no mutable state, so one instance is shared by every
/// render worker of a run.
#[derive(Debug, Clone)]
pub struct ProjectionEngine {
    registry: Arc<MappingRegistry>,
    store: Arc<TemplateStore>,
    filter: Option<ResourceFilter>,
    run_parameters: Map<String, Value>,
}

impl ProjectionEngine {
    /// Fails when any binding names a template the store does not hold.
    pub fn new(
        registry: Arc<MappingRegistry>,
        store: Arc<TemplateStore>,
    ) -> Result<Self, ConfigurationError> {
        registry.validate(&store)?;
        Ok(Self {
            registry,
            store,
            filter: None,
            run_parameters: Map::new(),
        })
    }

    /// Narrow the run to the bindings the filter allows. An empty filter
    /// means no narrowing.
    pub fn with_filter(mut self, filter: Option<ResourceFilter>) -> Self {
        self.filter = filter.filter(|f| !f.is_empty());
        self
    }

    /// Shared parameters exposed to every template as `run`.
    pub fn with_run_parameters(mut self, run_parameters: Map<String, Value>) -> Self {
        self.run_parameters = run_parameters;
        self
    }

    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    pub fn filter(&self) -> Option<&ResourceFilter> {
        self.filter.as_ref()
    }

    /// Bindings this engine will render for an entity type.
    pub fn active_bindings(&self, entity_type: &str) -> Vec<&TemplateBinding> {
        self.registry
            .active_bindings(entity_type, self.filter.as_ref())
    }

    /// Render all active bindings for `record`, in registration order.
    ///
    /// A failing binding does not stop the others; its error is collected
    /// alongside the successful resources.
    pub fn project(&self, record: &SourceRecord) -> Projection {
        let mut projection = Projection::default();

        for binding in self.active_bindings(&record.entity_type) {
            match self.render_binding(record, binding) {
                Ok(resource) => projection.resources.push(resource),
                Err(e) => {
                    tracing::debug!(
                        record_id = %record.id,
                        template_id = %binding.template_id,
                        error = %e.kind,
                        "Render failed"
                    );
                    projection.errors.push(e);
                }
            }
        }

        projection
    }

    /// Render one binding for one record.
    pub fn render_binding(
        &self,
        record: &SourceRecord,
        binding: &TemplateBinding,
    ) -> Result<RenderedResource, RenderError> {
        let fail = |kind: RenderErrorKind| {
            RenderError::new(&record.id, &record.entity_type, &binding.template_id, kind)
        };

        let context = self.context_for(record, binding);
        let document = self
            .store
            .render(&binding.template_id, &context)
            .map_err(|e| fail(e.into()))?;

        let parsed: Value = serde_json::from_str(&document)
            .map_err(|e| fail(RenderErrorKind::NotJson(e.to_string())))?;
        let resource_kind = parsed
            .get("resourceType")
            .and_then(Value::as_str)
            .filter(|kind| !kind.is_empty())
            .ok_or_else(|| fail(RenderErrorKind::MissingResourceType))?
            .to_string();

        if let Some(expected) = &binding.resource_kind {
            if *expected != resource_kind {
                return Err(fail(RenderErrorKind::ResourceKindMismatch {
                    expected: expected.clone(),
                    actual: resource_kind,
                }));
            }
        }

        Ok(RenderedResource {
            record_id: record.id.clone(),
            entity_type: record.entity_type.clone(),
            template_id: binding.template_id.clone(),
            resource_kind,
            document,
        })
    }

    /// Template context for one (record, binding) pair.
    ///
    /// Anchors go in first so the reserved names always win on collision.
    fn context_for(&self, record: &SourceRecord, binding: &TemplateBinding) -> Value {
        let mut context = Map::new();
        for (name, value) in &record.anchors {
            context.insert(name.clone(), value.clone());
        }

        let fields = Value::Object(record.fields.clone());
        context.insert(to_snake_case(&record.entity_type), fields.clone());
        context.insert("record".into(), fields);
        context.insert("params".into(), Value::Object(binding.parameters.clone()));
        context.insert("run".into(), Value::Object(self.run_parameters.clone()));
        context.insert(
            "meta".into(),
            json!({
                "record_id": record.id,
                "entity_type": record.entity_type,
                "template_id": binding.template_id,
            }),
        );

        Value::Object(context)
    }
}
