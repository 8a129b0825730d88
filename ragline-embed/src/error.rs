//! Error types for embedding and reranking

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Everything that can go wrong while loading a model or scoring text.
///
/// Callers that retry (the ingestion `embed` step) should consult
/// [`EmbedError::is_transient`] rather than matching on variants directly.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when model configuration is invalid
    #[error("Invalid model configuration: {message}")]
    InvalidConfig { message: String },

    /// The configured model name does not map to a known model
    #[error("Unknown model '{name}' for provider {provider}")]
    UnknownModel { provider: String, name: String },

    /// The model produced a vector of unexpected length
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A call to the provider did not finish in time
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: String,
        timeout_ms: u64,
    },

    /// The provider asked us to back off
    #[error("Rate limited by provider: {message}")]
    RateLimited { message: String },

    /// IO errors when reading model files
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Whether retrying the same call later may succeed.
    ///
    /// Timeouts, rate limits and I/O failures are transient. Configuration
    /// problems, dimension mismatches and model errors are not: repeating the
    /// call would produce the same result.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RateLimited { .. } | Self::Io { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transient_classification() {
        assert!(EmbedError::timeout("embed", Duration::from_millis(10)).is_transient());
        assert!(
            EmbedError::RateLimited {
                message: "slow down".into()
            }
            .is_transient()
        );
        assert!(EmbedError::from(std::io::Error::other("disk")).is_transient());

        assert!(!EmbedError::invalid_config("bad").is_transient());
        assert!(
            !EmbedError::DimensionMismatch {
                expected: 384,
                actual: 768
            }
            .is_transient()
        );
        assert!(!EmbedError::from(anyhow::anyhow!("onnx")).is_transient());
    }

    #[test]
    fn test_timeout_message() {
        let err = EmbedError::timeout("query embedding", Duration::from_secs(2));
        assert_eq!(err.to_string(), "query embedding timed out after 2000 ms");
    }
}
