//! Read-only query path over the chunk store.
//!
//! ```text
//! preprocess_query -> embed_query -> similarity_search -> [rerank]
//! ```
//!
//! Scoring is brute force over [`SqliteStore::scan_chunks`], which returns
//! rows in insertion order. The sort below is stable on distance, so equal
//! distances keep that order.

use super::error::{Result, RetrievalError};
use super::metric::{DistanceMetric, FilterMode, MAX_TOP_K};
use super::query::preprocess_query;
use super::types::{RetrievalRequest, RetrievalResponse, RetrievalResult, ScoredChunk};
use crate::config::RetrievalConfig;
use crate::storage::{MetadataFilter, SqliteStore};
use half::f16;
use ragline_embed::{EmbedError, EmbeddingProvider, Reranker, build_reranker};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct RetrievalEngine {
    store: SqliteStore,
    provider: Arc<dyn EmbeddingProvider>,
    reranker: Arc<dyn Reranker>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: SqliteStore,
        provider: Arc<dyn EmbeddingProvider>,
        reranker: Arc<dyn Reranker>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            provider,
            reranker,
            config,
        }
    }

    /// Build with the reranker named in `config.reranker`.
    pub async fn from_config(
        store: SqliteStore,
        provider: Arc<dyn EmbeddingProvider>,
        config: &RetrievalConfig,
    ) -> Result<Self> {
        let reranker = build_reranker(&config.reranker)
            .await
            .map_err(RetrievalError::RerankFailed)?;
        Ok(Self::new(store, provider, reranker, config.clone()))
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Embed `text` with the ingestion model.
    ///
    /// Fails before any search if the provider's model is not the one the
    /// index was built with, or if the vector has the wrong length.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f16>> {
        let registered = self.registered_model().await?;
        let expected = match &registered {
            Some(model) => {
                let requested = self.provider.model_id();
                if model.model_id != requested {
                    return Err(RetrievalError::EmbeddingModelMismatch {
                        stored: model.model_id.clone(),
                        requested,
                    });
                }
                model.dimension
            }
            None => self.provider.embedding_dimension(),
        };

        let limit = self.config.embed_timeout_ms;
        let vector = timeout(Duration::from_millis(limit), self.provider.embed_text(text))
            .await
            .map_err(|_| {
                warn!(timeout_ms = limit, "Query embedding timed out");
                RetrievalError::EmbeddingTimeout { timeout_ms: limit }
            })??;

        if vector.len() != expected {
            return Err(RetrievalError::EmbeddingDimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    /// Nearest chunks to `query` by ascending distance.
    ///
    /// In [`FilterMode::Pre`] the indexed part of `filter` narrows the scan;
    /// in [`FilterMode::Post`] it is applied after truncating to `top_k`.
    /// Extra keys are matched after scoring either way.
    pub async fn similarity_search(
        &self,
        query: &[f16],
        top_k: usize,
        metric: DistanceMetric,
        threshold: Option<f32>,
        filter: &MetadataFilter,
        mode: FilterMode,
    ) -> Result<Vec<ScoredChunk>> {
        validate_top_k(top_k)?;
        self.search(query, top_k, metric, threshold, filter, mode)
            .await
    }

    /// Reorder `candidates` by the reranker's score and keep `top_k`.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredChunk>,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let documents: Vec<String> = candidates.iter().map(|c| c.chunk.content.clone()).collect();

        let limit = self.config.rerank_timeout_ms;
        let scores = timeout(
            Duration::from_millis(limit),
            self.reranker.score(query, &documents),
        )
        .await
        .map_err(|_| {
            warn!(timeout_ms = limit, "Rerank timed out");
            RetrievalError::RerankTimeout { timeout_ms: limit }
        })?
        .map_err(RetrievalError::RerankFailed)?;

        if scores.len() != candidates.len() {
            return Err(RetrievalError::RerankFailed(EmbedError::from(
                anyhow::anyhow!(
                    "reranker returned {} scores for {} documents",
                    scores.len(),
                    candidates.len()
                ),
            )));
        }

        let mut ranked: Vec<(ScoredChunk, f32)> = candidates.into_iter().zip(scores).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(top_k);

        debug!(
            reranker = self.reranker.reranker_name(),
            kept = ranked.len(),
            "Rerank complete"
        );
        Ok(ranked
            .into_iter()
            .map(|(scored, score)| RetrievalResult::from_scored(scored, Some(score)))
            .collect())
    }

    /// Run a full query. Never writes to the store.
    pub async fn retrieve(&self, request: &RetrievalRequest) -> Result<RetrievalResponse> {
        let top_k = request.top_k.unwrap_or(self.config.top_k);
        validate_top_k(top_k)?;
        let prepared = preprocess_query(&request.query)?;
        let metric = request.metric.unwrap_or(self.config.metric);
        let mode = request.filter_mode.unwrap_or(self.config.filter_mode);
        let threshold = request.distance_threshold.or(self.config.distance_threshold);
        let rerank = request.rerank.unwrap_or(self.config.rerank);

        info!(
            query = %prepared.original,
            processed = %prepared.normalized,
            top_k,
            metric = metric.as_str(),
            filter_mode = mode.as_str(),
            rerank,
            "Retrieving"
        );

        let vector = self.embed_query(&prepared.normalized).await?;

        let fetch = if rerank {
            top_k.saturating_mul(self.config.rerank_overfetch.max(1))
        } else {
            top_k
        };
        let candidates = self
            .search(&vector, fetch, metric, threshold, &request.filter, mode)
            .await?;
        let candidate_count = candidates.len();

        let results = if rerank {
            self.rerank(&prepared.normalized, candidates, top_k).await?
        } else {
            candidates
                .into_iter()
                .map(|scored| RetrievalResult::from_scored(scored, None))
                .collect()
        };

        info!(
            candidates = candidate_count,
            results = results.len(),
            "Retrieval complete"
        );
        Ok(RetrievalResponse {
            query: prepared.original,
            processed_query: prepared.normalized,
            metric,
            filter_mode: mode,
            reranked: rerank,
            results,
        })
    }

    async fn search(
        &self,
        query: &[f16],
        limit: usize,
        metric: DistanceMetric,
        threshold: Option<f32>,
        filter: &MetadataFilter,
        mode: FilterMode,
    ) -> Result<Vec<ScoredChunk>> {
        let Some(model) = self.registered_model().await? else {
            debug!("Index has no registered model, nothing to search");
            return Ok(Vec::new());
        };
        if query.len() != model.dimension {
            return Err(RetrievalError::EmbeddingDimensionMismatch {
                expected: model.dimension,
                actual: query.len(),
            });
        }

        let scan_filter = match mode {
            FilterMode::Pre => filter.indexed_only(),
            FilterMode::Post => MetadataFilter::default(),
        };
        let search_limit = self.config.search_timeout_ms;
        let rows = timeout(
            Duration::from_millis(search_limit),
            self.store.scan_chunks(&scan_filter),
        )
        .await
        .map_err(|_| {
            warn!(timeout_ms = search_limit, "Chunk scan timed out");
            RetrievalError::SearchTimeout {
                timeout_ms: search_limit,
            }
        })??;
        let scanned = rows.len();

        let query: Vec<f32> = query.iter().map(|v| v.to_f32()).collect();
        let mut scored: Vec<ScoredChunk> = rows
            .into_iter()
            .filter(|chunk| chunk.embedding.len() == query.len())
            .map(|chunk| {
                let distance = metric.distance(&query, &chunk.embedding);
                ScoredChunk {
                    similarity: metric.similarity(distance),
                    distance,
                    chunk,
                }
            })
            .collect();

        if let Some(threshold) = threshold {
            scored.retain(|s| s.distance <= threshold);
        }
        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        match mode {
            FilterMode::Pre => {
                scored.retain(|s| filter.matches_extra(&s.chunk));
                scored.truncate(limit);
            }
            FilterMode::Post => {
                scored.truncate(limit);
                scored.retain(|s| filter.matches(&s.chunk));
            }
        }

        info!(
            scanned,
            results = scored.len(),
            metric = metric.as_str(),
            "similarity search complete"
        );
        Ok(scored)
    }

    async fn registered_model(&self) -> Result<Option<crate::storage::EmbeddingModelRecord>> {
        let limit = self.config.search_timeout_ms;
        Ok(timeout(
            Duration::from_millis(limit),
            self.store.registered_model(),
        )
        .await
        .map_err(|_| RetrievalError::SearchTimeout { timeout_ms: limit })??)
    }
}

fn validate_top_k(top_k: usize) -> Result<()> {
    if !(1..=MAX_TOP_K).contains(&top_k) {
        return Err(RetrievalError::InvalidQuery(format!(
            "top_k must be between 1 and {MAX_TOP_K}, got {top_k}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NewChunk, SourceFile};
    use async_trait::async_trait;
    use chrono::Utc;
    use ragline_embed::{EmbeddingResult, HashingProvider, LexicalReranker, ModelDescriptor};
    use std::collections::BTreeMap;
    use tracing_test::traced_test;

    const DIM: usize = 64;

    async fn seed(
        store: &SqliteStore,
        provider: &HashingProvider,
        path: &str,
        file_type: &str,
        texts: &[&str],
    ) {
        let file_hash = *blake3::hash(path.as_bytes()).as_bytes();
        let descriptor = provider.model_descriptor();
        let source = SourceFile {
            path: path.to_string(),
            file_hash,
            size: 0,
            file_type: file_type.to_string(),
            model_id: descriptor.id(),
            run_id: None,
            last_ingested_at: Utc::now(),
        };
        let chunks: Vec<NewChunk> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| NewChunk {
                chunk_id: crate::storage::chunk_id(&file_hash, i),
                chunk_index: i,
                page: None,
                content: text.to_string(),
                embedding: provider.embed_sync(text),
                extra: BTreeMap::from([("lang".to_string(), "en".to_string())]),
            })
            .collect();
        store
            .replace_source(&source, &descriptor, "1", &chunks)
            .await
            .unwrap();
    }

    async fn engine_with_docs() -> RetrievalEngine {
        engine_with_reranker(Arc::new(LexicalReranker::default())).await
    }

    async fn engine_with_reranker(reranker: Arc<dyn Reranker>) -> RetrievalEngine {
        let store = SqliteStore::open_memory().await.unwrap();
        let provider = HashingProvider::new(DIM);
        seed(
            &store,
            &provider,
            "/docs/rust.md",
            "md",
            &["rust ownership and borrowing", "cargo builds rust crates"],
        )
        .await;
        seed(
            &store,
            &provider,
            "/docs/garden.txt",
            "txt",
            &["tomatoes need full sun", "water the garden daily"],
        )
        .await;
        RetrievalEngine::new(store, Arc::new(provider), reranker, RetrievalConfig::default())
    }

    /// Always returns a single score, whatever it is given.
    struct OneScore;

    #[async_trait]
    impl Reranker for OneScore {
        async fn score(&self, _query: &str, _documents: &[String]) -> ragline_embed::Result<Vec<f32>> {
            Ok(vec![1.0])
        }

        fn reranker_name(&self) -> &str {
            "one-score"
        }
    }

    /// Claims the hashing model's identity but returns short vectors.
    struct ShortVectors(HashingProvider);

    #[async_trait]
    impl EmbeddingProvider for ShortVectors {
        async fn embed_texts(&self, texts: &[String]) -> ragline_embed::Result<EmbeddingResult> {
            Ok(EmbeddingResult::new(
                texts.iter().map(|_| vec![f16::from_f32(0.5); 3]).collect(),
            ))
        }

        fn embedding_dimension(&self) -> usize {
            self.0.embedding_dimension()
        }

        fn provider_name(&self) -> &str {
            "short"
        }

        fn model_descriptor(&self) -> ModelDescriptor {
            self.0.model_descriptor()
        }
    }

    #[tokio::test]
    async fn test_retrieve_orders_by_similarity() {
        let engine = engine_with_docs().await;
        let response = engine
            .retrieve(&RetrievalRequest::new("rust ownership").with_top_k(3))
            .await
            .unwrap();

        assert_eq!(response.processed_query, "rust ownership");
        assert!(!response.reranked);
        assert!(response.results.len() <= 3);
        assert_eq!(response.results[0].content, "rust ownership and borrowing");
        for pair in response.results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!(response.results.iter().all(|r| !r.metadata.source_path.is_empty()));
    }

    #[tokio::test]
    async fn test_pre_filter_on_file_type() {
        let engine = engine_with_docs().await;
        let filter = MetadataFilter {
            file_type: Some("txt".into()),
            ..MetadataFilter::default()
        };
        let response = engine
            .retrieve(
                &RetrievalRequest::new("rust ownership")
                    .with_top_k(2)
                    .with_filter(filter),
            )
            .await
            .unwrap();
        assert_eq!(response.results.len(), 2);
        assert!(response.results.iter().all(|r| r.metadata.file_type == "txt"));
    }

    #[tokio::test]
    async fn test_post_filter_can_return_fewer() {
        let engine = engine_with_docs().await;
        let filter = MetadataFilter {
            file_type: Some("txt".into()),
            ..MetadataFilter::default()
        };
        // The two closest chunks are both markdown, so nothing survives.
        let response = engine
            .retrieve(
                &RetrievalRequest::new("rust ownership borrowing cargo crates")
                    .with_top_k(2)
                    .with_filter(filter)
                    .with_filter_mode(FilterMode::Post),
            )
            .await
            .unwrap();
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn test_extra_filter_applies_after_scoring() {
        let engine = engine_with_docs().await;
        let mut filter = MetadataFilter::default();
        filter.extra.insert("lang".into(), "fr".into());
        let response = engine
            .retrieve(&RetrievalRequest::new("garden").with_filter(filter))
            .await
            .unwrap();
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_keeps_close_results() {
        let engine = engine_with_docs().await;
        let response = engine
            .retrieve(
                &RetrievalRequest::new("tomatoes need full sun")
                    .with_top_k(4)
                    .with_threshold(0.01),
            )
            .await
            .unwrap();
        assert_eq!(response.results.len(), 1);
        assert!(response.results[0].distance <= 0.01);
    }

    #[tokio::test]
    async fn test_rerank_keeps_top_k() {
        let engine = engine_with_docs().await;
        let response = engine
            .retrieve(
                &RetrievalRequest::new("water garden")
                    .with_top_k(1)
                    .with_rerank(true),
            )
            .await
            .unwrap();
        assert!(response.reranked);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].content, "water the garden daily");
        assert!(response.results[0].rerank_score.is_some());
    }

    #[tokio::test]
    async fn test_rerank_score_count_mismatch_fails() {
        let engine = engine_with_reranker(Arc::new(OneScore)).await;
        let err = engine
            .retrieve(
                &RetrievalRequest::new("rust garden")
                    .with_top_k(2)
                    .with_rerank(true),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            RetrievalError::RerankFailed(inner) if inner.to_string().contains("returned 1 scores for")
        ));
    }

    #[tokio::test]
    async fn test_top_k_bounds() {
        let engine = engine_with_docs().await;
        for top_k in [0, MAX_TOP_K + 1] {
            let err = engine
                .retrieve(&RetrievalRequest::new("rust").with_top_k(top_k))
                .await
                .unwrap_err();
            assert!(matches!(err, RetrievalError::InvalidQuery(_)));
        }
    }

    #[tokio::test]
    async fn test_empty_index_returns_nothing() {
        let engine = RetrievalEngine::new(
            SqliteStore::open_memory().await.unwrap(),
            Arc::new(HashingProvider::new(DIM)),
            Arc::new(LexicalReranker::default()),
            RetrievalConfig::default(),
        );
        let response = engine.retrieve(&RetrievalRequest::new("anything")).await.unwrap();
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn test_model_mismatch_is_fatal() {
        let engine = engine_with_docs().await;
        let other = RetrievalEngine::new(
            engine.store.clone(),
            Arc::new(HashingProvider::new(DIM * 2)),
            Arc::new(LexicalReranker::default()),
            RetrievalConfig::default(),
        );
        let err = other
            .retrieve(&RetrievalRequest::new("rust"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::EmbeddingModelMismatch { .. }));
        assert!(err.is_model_mismatch());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dimension_mismatch_stops_before_search() {
        let engine = engine_with_docs().await;
        let faulty = RetrievalEngine::new(
            engine.store.clone(),
            Arc::new(ShortVectors(HashingProvider::new(DIM))),
            Arc::new(LexicalReranker::default()),
            RetrievalConfig::default(),
        );

        let err = faulty
            .retrieve(&RetrievalRequest::new("rust"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::EmbeddingDimensionMismatch {
                expected: DIM,
                actual: 3
            }
        ));
        assert!(!logs_contain("similarity search complete"));

        engine.retrieve(&RetrievalRequest::new("rust")).await.unwrap();
        assert!(logs_contain("similarity search complete"));
    }

    #[tokio::test]
    async fn test_similarity_search_rejects_wrong_length_vector() {
        let engine = engine_with_docs().await;
        let err = engine
            .similarity_search(
                &[f16::from_f32(1.0); 5],
                3,
                DistanceMetric::Cosine,
                None,
                &MetadataFilter::default(),
                FilterMode::Pre,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::EmbeddingDimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_equal_distances_keep_insertion_order() {
        let store = SqliteStore::open_memory().await.unwrap();
        let provider = HashingProvider::new(DIM);
        seed(&store, &provider, "/a.txt", "txt", &["same words", "same words"]).await;
        let engine = RetrievalEngine::new(
            store,
            Arc::new(provider),
            Arc::new(LexicalReranker::default()),
            RetrievalConfig::default(),
        );
        let response = engine
            .retrieve(&RetrievalRequest::new("same words"))
            .await
            .unwrap();
        let indexes: Vec<usize> = response
            .results
            .iter()
            .map(|r| r.metadata.chunk_index)
            .collect();
        assert_eq!(indexes, vec![0, 1]);
    }
}
