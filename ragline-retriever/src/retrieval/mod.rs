//! Query-time retrieval over the chunk store.

pub mod engine;
pub mod error;
pub mod metric;
pub mod query;
pub mod types;

pub use engine::RetrievalEngine;
pub use error::RetrievalError;
pub use metric::{DistanceMetric, FilterMode, MAX_TOP_K};
pub use query::{PreparedQuery, preprocess_query};
pub use types::{RetrievalRequest, RetrievalResponse, RetrievalResult, ResultMetadata, ScoredChunk};
