//! Shared types for the piper projection-and-validation pipeline.
//!
//! Every other piper crate speaks in terms of the types defined here:
//! [`SourceRecord`]s come out of an [`EntitySource`], the projection engine
//! turns them into [`RenderedResource`]s, the validation gate answers with a
//! [`ValidationOutcome`], and the run controller files anything that did not
//! make it as a [`QuarantineEntry`] or [`RunError`].

pub mod error;
pub mod model;
pub mod naming;
pub mod source;

pub use error::{Result, SourceError};
pub use model::{
    Issue, IssueSeverity, QuarantineEntry, ReasonCode, RenderedResource, ResourceFilter,
    ResourceRef, RunError, SourceRecord, TemplateBinding, ValidationOutcome, ValidationStatus,
};
pub use naming::to_snake_case;
pub use source::{EntitySource, MemorySource, NdjsonSource};
