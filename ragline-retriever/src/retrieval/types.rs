use super::metric::{DistanceMetric, FilterMode};
use crate::storage::{MetadataFilter, StoredChunk};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One retrieval call. Unset options fall back to `[retrieval]` config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub filter: MetadataFilter,
    pub rerank: Option<bool>,
    pub distance_threshold: Option<f32>,
    pub metric: Option<DistanceMetric>,
    pub filter_mode: Option<FilterMode>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_rerank(mut self, rerank: bool) -> Self {
        self.rerank = Some(rerank);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.distance_threshold = Some(threshold);
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn with_filter_mode(mut self, mode: FilterMode) -> Self {
        self.filter_mode = Some(mode);
        self
    }
}

/// A stored chunk with its distance to the query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: StoredChunk,
    pub distance: f32,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub source_path: String,
    pub chunk_index: usize,
    pub page: Option<u32>,
    pub file_type: String,
    pub file_hash: String,
    pub ingestion_version: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub content: String,
    pub metadata: ResultMetadata,
    /// Higher is closer
    pub score: f32,
    /// Raw distance under the metric used
    pub distance: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

impl RetrievalResult {
    pub(crate) fn from_scored(scored: ScoredChunk, rerank_score: Option<f32>) -> Self {
        let ScoredChunk {
            chunk,
            distance,
            similarity,
        } = scored;
        Self {
            metadata: ResultMetadata {
                source_path: chunk.source_path,
                chunk_index: chunk.chunk_index,
                page: chunk.page,
                file_type: chunk.file_type,
                file_hash: hex::encode(chunk.file_hash),
                ingestion_version: chunk.ingestion_version,
                model_id: chunk.model_id,
                created_at: chunk.created_at,
                extra: chunk.extra,
            },
            chunk_id: chunk.chunk_id,
            content: chunk.content,
            score: similarity,
            distance,
            rerank_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResponse {
    pub query: String,
    pub processed_query: String,
    pub metric: DistanceMetric,
    pub filter_mode: FilterMode,
    pub reranked: bool,
    pub results: Vec<RetrievalResult>,
}
