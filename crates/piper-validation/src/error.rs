use std::time::Duration;

use piper_core::ReasonCode;
use thiserror::Error;

/// Failure to get any answer out of the validation endpoint.
///
/// Distinct from an Invalid outcome: a transport error says nothing about
/// the document itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    /// Whether another attempt may succeed.
    pub retryable: bool,
    /// HTTP status, when the endpoint answered at all.
    pub status: Option<u16>,
    /// Server-requested delay before the next attempt.
    pub retry_after: Option<Duration>,
}

impl TransportError {
    /// A failure worth retrying (connect error, timeout, 408/429/5xx).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            status: None,
            retry_after: None,
        }
    }

    /// A refusal that retrying cannot fix.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            status: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let status = e.status().map(|s| s.as_u16());
        let err = if e.is_builder() {
            Self::rejected(format!("Invalid validation request: {e}"))
        } else if e.is_timeout() {
            Self::retryable(format!("Validation request timed out: {e}"))
        } else if e.is_connect() {
            Self::retryable(format!("Failed to connect to validation endpoint: {e}"))
        } else {
            Self::retryable(format!("Validation request failed: {e}"))
        };
        Self { status, ..err }
    }
}

/// Why the gate could not produce a validation outcome for a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("Validation endpoint unreachable after {attempts} attempts: {last}")]
    TransportExhausted { attempts: u32, last: TransportError },

    #[error("Validation endpoint rejected the request: {0}")]
    TransportRejected(TransportError),
}

impl GateError {
    /// Quarantine reason for a resource that failed this way.
    pub fn reason(&self) -> ReasonCode {
        match self {
            Self::TransportExhausted { .. } => ReasonCode::TransportExhausted,
            Self::TransportRejected(_) => ReasonCode::TransportRejected,
        }
    }

    pub fn transport(&self) -> &TransportError {
        match self {
            Self::TransportExhausted { last, .. } => last,
            Self::TransportRejected(e) => e,
        }
    }
}

/// Errors building a validation endpoint.
#[derive(Debug, Error)]
pub enum EndpointConfigError {
    #[error("Invalid validation endpoint URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
