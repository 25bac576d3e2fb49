use thiserror::Error;

use crate::sink::LoadError;

/// Errors that stop a run from starting or from producing its artifacts.
///
/// Failures of individual records never show up here; they are classified
/// and reported in the [`RunReport`](crate::RunReport).
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Invalid run configuration: {0}")]
    InvalidConfig(String),

    #[error("Load sink error: {0}")]
    Load(#[from] LoadError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RunnerError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
