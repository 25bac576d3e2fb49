use thiserror::Error;

/// Errors raised while reading records from an entity source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid record at line {line}: {message}")]
    InvalidRecord { line: usize, message: String },
}

impl SourceError {
    /// Create a new Parse error
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    /// Create a new InvalidRecord error
    pub fn invalid_record(line: usize, message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            line,
            message: message.into(),
        }
    }
}

/// Convenience result type for entity source operations
pub type Result<T> = std::result::Result<T, SourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = SourceError::parse(7, "expected value");
        assert_eq!(err.to_string(), "Malformed record at line 7: expected value");
    }

    #[test]
    fn test_invalid_record_display() {
        let err = SourceError::invalid_record(3, "missing entityType");
        assert_eq!(err.to_string(), "Invalid record at line 3: missing entityType");
    }
}
