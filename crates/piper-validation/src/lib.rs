//! Validation gate for rendered FHIR resources.
//!
//! Each [`RenderedResource`](piper_core::RenderedResource) is submitted to a
//! [`ValidationEndpoint`] (normally a FHIR server's `$validate` operation)
//! and classified Valid or Invalid from the returned `OperationOutcome`.
//! Connectivity problems surface as [`TransportError`]s, are retried per the
//! [`RetryPolicy`], and end in a [`GateError`] only once retries run out.

mod endpoint;
mod error;
mod gate;
pub mod operation_outcome;
mod retry;

pub use endpoint::{
    EndpointResponse, HttpEndpointConfig, HttpValidationEndpoint, ValidationEndpoint,
    is_retryable_status, parse_retry_after,
};
pub use error::{EndpointConfigError, GateError, TransportError};
pub use gate::ValidationGate;
pub use retry::RetryPolicy;
