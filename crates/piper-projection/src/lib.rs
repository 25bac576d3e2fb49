//! Projection of source records into candidate FHIR documents.
//!
//! # Components
//!
//! - [`TemplateStore`] - Handlebars templates, one per resource shape
//! - [`MappingRegistry`] - Ordered entity type -> template bindings
//! - [`ProjectionEngine`] - Renders every active binding for a record
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use piper_projection::{MappingRegistry, ProjectionEngine, TemplateStore};
//!
//! let mut store = TemplateStore::new();
//! store.load_dir("templates")?;
//!
//! let registry = MappingRegistry::from_template_store(&store);
//! let engine = ProjectionEngine::new(Arc::new(registry), Arc::new(store))?;
//! let projection = engine.project(&record);
//! ```

mod engine;
mod error;
mod registry;
mod templates;

pub use engine::{Projection, ProjectionEngine};
pub use error::{ConfigurationError, DanglingBinding, RenderError, RenderErrorKind, TemplateError};
pub use registry::MappingRegistry;
pub use templates::{TemplateLoadReport, TemplateStore};
