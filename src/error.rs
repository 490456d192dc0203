//! Error types for diabuddy-core.

use thiserror::Error;

/// Result type alias using diabuddy-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during query processing.
#[derive(Error, Debug)]
pub enum Error {
    /// Query rejected before the pipeline ran
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    /// LLM API error
    #[error("LLM error: {message}")]
    Llm {
        message: String,
        /// Rate limits, timeouts and connection drops are retried;
        /// auth and quota failures are not.
        transient: bool,
    },

    /// Knowledge store failure; the pipeline degrades to empty retrieval
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Session or personalization state storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transient LLM error (will be retried).
    pub fn llm_transient(message: impl Into<String>) -> Self {
        Self::Llm {
            message: message.into(),
            transient: true,
        }
    }

    /// Create a permanent LLM error (surfaces to the caller).
    pub fn llm_permanent(message: impl Into<String>) -> Self {
        Self::Llm {
            message: message.into(),
            transient: false,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Llm { transient: true, .. } | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::llm_transient("rate limited").is_transient());
        assert!(Error::timeout(60_000).is_transient());
        assert!(!Error::llm_permanent("invalid api key").is_transient());
        assert!(!Error::config("bad threshold").is_transient());
    }

    #[test]
    fn test_display_includes_message() {
        let err = Error::llm_transient("503 service unavailable");
        assert!(err.to_string().contains("503 service unavailable"));
    }
}
