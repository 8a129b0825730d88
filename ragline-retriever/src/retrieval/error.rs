use crate::storage::StorageError;
use ragline_embed::EmbedError;

pub type Result<T> = std::result::Result<T, RetrievalError>;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("query embedding has dimension {actual}, index expects {expected}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    #[error("index was built with {stored}, query model is {requested}")]
    EmbeddingModelMismatch { stored: String, requested: String },

    #[error("embedding service unavailable: timed out after {timeout_ms} ms")]
    EmbeddingTimeout { timeout_ms: u64 },

    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(#[source] EmbedError),

    #[error("search unavailable: {0}")]
    SearchUnavailable(#[source] StorageError),

    #[error("search unavailable: timed out after {timeout_ms} ms")]
    SearchTimeout { timeout_ms: u64 },

    #[error("rerank timed out after {timeout_ms} ms")]
    RerankTimeout { timeout_ms: u64 },

    #[error("rerank failed: {0}")]
    RerankFailed(#[source] EmbedError),
}

impl RetrievalError {
    /// Problems with a backing service rather than with the request or the
    /// index. Callers report these as "service unavailable".
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            RetrievalError::EmbeddingTimeout { .. }
                | RetrievalError::EmbeddingUnavailable(_)
                | RetrievalError::SearchUnavailable(_)
                | RetrievalError::SearchTimeout { .. }
                | RetrievalError::RerankTimeout { .. }
                | RetrievalError::RerankFailed(_)
        )
    }

    /// Index and query model disagree. Retrying will not help.
    pub fn is_model_mismatch(&self) -> bool {
        matches!(
            self,
            RetrievalError::EmbeddingDimensionMismatch { .. }
                | RetrievalError::EmbeddingModelMismatch { .. }
        )
    }
}

impl From<StorageError> for RetrievalError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ModelMismatch { stored, requested } => {
                RetrievalError::EmbeddingModelMismatch { stored, requested }
            }
            other => RetrievalError::SearchUnavailable(other),
        }
    }
}

impl From<EmbedError> for RetrievalError {
    fn from(err: EmbedError) -> Self {
        match err {
            EmbedError::DimensionMismatch { expected, actual } => {
                RetrievalError::EmbeddingDimensionMismatch { expected, actual }
            }
            EmbedError::Timeout { timeout_ms, .. } => RetrievalError::EmbeddingTimeout { timeout_ms },
            other => RetrievalError::EmbeddingUnavailable(other),
        }
    }
}
