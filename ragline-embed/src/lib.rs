//! # ragline-embed
//!
//! Text embeddings and reranking for the ragline index.
//!
//! - [`EmbeddingProvider`] turns text into fixed-dimension `f16` vectors and
//!   reports a [`ModelDescriptor`] that is stored next to every vector, so an
//!   index never mixes embedding spaces.
//! - [`FastEmbedProvider`] runs local ONNX models through fastembed.
//! - [`HashingProvider`] is a deterministic, model-free provider used by tests
//!   and offline setups.
//! - [`Reranker`] scores (query, document) pairs jointly, either with a
//!   fastembed cross-encoder or the lexical [`LexicalReranker`].
//!
//! ```
//! use ragline_embed::{EmbedConfig, EmbeddingProvider, HashingProvider};
//!
//! # async fn example() -> ragline_embed::Result<()> {
//! let provider = HashingProvider::from_config(&EmbedConfig::hashing(64))?;
//! let result = provider.embed_texts(&["hello world".to_string()]).await?;
//! assert_eq!(result.dimension, 64);
//! assert_eq!(provider.model_id(), "hashing:fnv-feature-hash:1:64:norm");
//! # Ok(())
//! # }
//! ```
//!
//! Providers are constructed once and shared as `Arc<dyn EmbeddingProvider>`;
//! there is no process-wide model cache.

pub mod config;
pub mod error;
pub mod hashing;
pub mod lexical;
pub mod provider;
pub mod rerank;

pub use config::{EmbedConfig, ProviderKind, RerankConfig, RerankerKind};
pub use error::{EmbedError, Result};
pub use hashing::HashingProvider;
pub use provider::{
    EmbeddingProvider, EmbeddingResult, FastEmbedProvider, ModelDescriptor, build_provider,
};
pub use rerank::{FastEmbedReranker, LexicalReranker, Reranker, build_reranker};
