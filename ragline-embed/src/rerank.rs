//! Second-pass scoring of (query, document) pairs.
//!
//! A [`Reranker`] sees the query and each candidate together, which lets it
//! fix ordering mistakes that come from compressing each text into a single
//! vector independently.

use crate::config::{RerankConfig, RerankerKind};
use crate::error::{EmbedError, Result};
use crate::lexical::terms;
use async_trait::async_trait;
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score every document against `query`. The returned vector is aligned
    /// with `documents`; higher means more relevant.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;

    fn reranker_name(&self) -> &str;
}

pub async fn build_reranker(config: &RerankConfig) -> Result<Arc<dyn Reranker>> {
    match config.kind {
        RerankerKind::Lexical => Ok(Arc::new(LexicalReranker::default())),
        RerankerKind::FastEmbed => Ok(Arc::new(FastEmbedReranker::create(config.clone()).await?)),
    }
}

pub fn resolve_reranker_model(name: &str) -> Result<RerankerModel> {
    let normalized = name.to_ascii_lowercase();
    let short = normalized.rsplit('/').next().unwrap_or(&normalized);
    match short {
        "bge-reranker-base" => Ok(RerankerModel::BGERerankerBase),
        "bge-reranker-v2-m3" => Ok(RerankerModel::BGERerankerV2M3),
        "jina-reranker-v1-turbo-en" => Ok(RerankerModel::JINARerankerV1TurboEn),
        _ => Err(EmbedError::UnknownModel {
            provider: "fastembed-rerank".to_string(),
            name: name.to_string(),
        }),
    }
}

/// Cross-encoder reranking through fastembed.
#[derive(Clone)]
pub struct FastEmbedReranker {
    config: RerankConfig,
    model: Arc<Mutex<TextRerank>>,
}

impl fmt::Debug for FastEmbedReranker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastEmbedReranker")
            .field("config", &self.config)
            .finish()
    }
}

impl FastEmbedReranker {
    pub async fn create(config: RerankConfig) -> Result<Self> {
        let model_kind = resolve_reranker_model(&config.model_name)?;
        tracing::info!(model = %config.model_name, "Initializing FastEmbed reranker");

        let cache_dir = config.cache_dir.clone();
        let model = tokio::task::spawn_blocking(move || -> Result<TextRerank> {
            let mut options = RerankInitOptions::new(model_kind);
            if let Some(dir) = cache_dir {
                options = options.with_cache_dir(dir);
            }
            TextRerank::try_new(options).map_err(|e| EmbedError::External { source: e })
        })
        .await??;

        Ok(Self {
            config,
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl Reranker for FastEmbedReranker {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let model = Arc::clone(&self.model);
        let query = query.to_string();
        let documents = documents.to_vec();
        let batch_size = self.config.batch_size.max(1);

        tokio::task::spawn_blocking(move || -> Result<Vec<f32>> {
            let mut guard = model
                .lock()
                .map_err(|_| EmbedError::invalid_config("reranker model lock poisoned"))?;
            let docs: Vec<&str> = documents.iter().map(String::as_str).collect();
            let results = guard
                .rerank(query.as_str(), docs, false, Some(batch_size))
                .map_err(|e| EmbedError::External { source: e })?;

            // fastembed returns results sorted by score; put them back in input order.
            let mut scores = vec![f32::NEG_INFINITY; documents.len()];
            for result in results {
                if let Some(slot) = scores.get_mut(result.index) {
                    *slot = result.score;
                }
            }
            Ok(scores)
        })
        .await?
    }

    fn reranker_name(&self) -> &str {
        "fastembed"
    }
}

/// Joint query/document scorer based on term overlap.
///
/// The score is the fraction of distinct query terms present in the
/// document, plus `phrase_boost` when the document contains the whole query
/// as a phrase. Terms of `min_term_len` characters or fewer are ignored unless
/// the query has nothing longer.
#[derive(Debug, Clone)]
pub struct LexicalReranker {
    pub phrase_boost: f32,
    pub min_term_len: usize,
}

impl Default for LexicalReranker {
    fn default() -> Self {
        Self {
            phrase_boost: 0.25,
            min_term_len: 2,
        }
    }
}

impl LexicalReranker {
    pub fn score_pair(&self, query: &str, document: &str) -> f32 {
        let query_terms = terms(query);
        let mut distinct: HashSet<&str> = query_terms
            .iter()
            .map(String::as_str)
            .filter(|t| t.chars().count() > self.min_term_len)
            .collect();
        if distinct.is_empty() {
            distinct = query_terms.iter().map(String::as_str).collect();
        }
        if distinct.is_empty() {
            return 0.0;
        }

        let doc_terms = terms(document);
        let doc_set: HashSet<&str> = doc_terms.iter().map(String::as_str).collect();
        let matched = distinct.iter().filter(|t| doc_set.contains(*t)).count();
        let coverage = matched as f32 / distinct.len() as f32;

        let phrase = query_terms.join(" ");
        let boost = if query_terms.len() > 1 && doc_terms.join(" ").contains(&phrase) {
            self.phrase_boost
        } else {
            0.0
        };

        coverage + boost
    }
}

#[async_trait]
impl Reranker for LexicalReranker {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        Ok(documents
            .iter()
            .map(|doc| self.score_pair(query, doc))
            .collect())
    }

    fn reranker_name(&self) -> &str {
        "lexical"
    }
}
