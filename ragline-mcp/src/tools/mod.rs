//! Tool implementations for the ragline MCP server.
//!
//! Each tool takes the shared [`ToolContext`] and its request, and returns
//! pretty JSON on success or a one-line error message.

pub mod ingest;
pub mod query;

use anyhow::Result;
use ragline_embed::{EmbeddingProvider, build_provider};
use ragline_retriever::{
    config::RagConfig, ingestion::IngestionEngine, retrieval::RetrievalEngine,
    storage::SqliteStore,
};
use std::sync::Arc;

/// Engines shared by every tool call.
pub struct ToolContext {
    pub ingestion: IngestionEngine,
    pub retrieval: RetrievalEngine,
}

impl ToolContext {
    /// Open the configured database and build both engines.
    pub async fn open(config: &RagConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.database.path).await?;
        let provider = build_provider(&config.embedding).await?;
        Self::with_parts(store, provider, config).await
    }

    pub async fn with_parts(
        store: SqliteStore,
        provider: Arc<dyn EmbeddingProvider>,
        config: &RagConfig,
    ) -> Result<Self> {
        let ingestion = IngestionEngine::from_config(store.clone(), provider.clone(), config)?;
        let retrieval = RetrievalEngine::from_config(store, provider, &config.retrieval).await?;
        Ok(Self {
            ingestion,
            retrieval,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to encode response: {e}"))
}
