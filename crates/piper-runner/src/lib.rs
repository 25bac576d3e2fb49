//! Run controller for the piper pipeline.
//!
//! One run pulls records from an [`EntitySource`](piper_core::EntitySource),
//! projects them through the [`ProjectionEngine`](piper_projection::ProjectionEngine),
//! validates every candidate through the
//! [`ValidationGate`](piper_validation::ValidationGate) and hands Valid
//! documents to a [`LoadSink`]. Each admitted (record, template) pair ends
//! in exactly one classification: Valid, Quarantined, RenderFailed or
//! Abandoned. The [`ThresholdPolicy`] decides when failures abort the run.

mod aggregator;
mod controller;
mod error;
mod policy;
mod quarantine;
pub mod sink;
mod state;
mod summary;

pub use controller::{RunConfig, RunController, RunReport};
pub use error::{Result, RunnerError};
pub use policy::{Ceiling, Decision, ThresholdPolicy};
pub use quarantine::QuarantineLog;
pub use sink::{
    FhirServerSink, JsonArrayFileSink, LoadError, LoadMode, LoadReport, LoadResult, LoadSink,
    LoadStatus,
};
pub use state::{AbortReason, PairClassification, RecordPhase, RunState, RunStatus};
pub use summary::{FailureDetail, RunSummary};
