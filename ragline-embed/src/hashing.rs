//! Deterministic feature-hashing embeddings.
//!
//! Each lowercase term (and each of its character trigrams, at half weight)
//! is hashed with FNV-1a into one of `dimension` buckets with a hashed sign.
//! Texts that share vocabulary end up close under cosine similarity. No model
//! files are involved, so this provider is what tests and offline setups use.

use crate::config::{EmbedConfig, ProviderKind};
use crate::error::{EmbedError, Result};
use crate::lexical::terms;
use crate::provider::{EmbeddingProvider, EmbeddingResult, ModelDescriptor, to_f16};
use async_trait::async_trait;
use fnv::FnvHasher;
use half::f16;
use std::hash::Hasher;

const TRIGRAM_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimension: usize,
    model_version: String,
    normalize: bool,
}

impl HashingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_version: "1".to_string(),
            normalize: true,
        }
    }

    pub fn from_config(config: &EmbedConfig) -> Result<Self> {
        let dimension = config.dimension.ok_or_else(|| {
            EmbedError::invalid_config("the hashing provider requires an explicit dimension")
        })?;
        if dimension == 0 {
            return Err(EmbedError::invalid_config("dimension must be at least 1"));
        }
        Ok(Self {
            dimension,
            model_version: config.model_version.clone(),
            normalize: config.normalize,
        })
    }

    /// Embed synchronously. The async trait methods delegate here.
    pub fn embed_sync(&self, text: &str) -> Vec<f16> {
        let mut vector = vec![0.0f32; self.dimension];
        for term in terms(text) {
            self.add_feature(&mut vector, term.as_bytes(), 1.0);
            let chars: Vec<char> = term.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let gram: String = window.iter().collect();
                    self.add_feature(&mut vector, gram.as_bytes(), TRIGRAM_WEIGHT);
                }
            }
        }
        to_f16(vector, self.normalize)
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let mut hasher = FnvHasher::default();
        hasher.write(feature);
        let hash = hasher.finish();
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        Ok(EmbeddingResult::new(
            texts.iter().map(|t| self.embed_sync(t)).collect(),
        ))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        ProviderKind::Hashing.as_str()
    }

    fn model_descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            provider: self.provider_name().to_string(),
            model_name: "fnv-feature-hash".to_string(),
            model_version: self.model_version.clone(),
            dimension: self.dimension,
            normalized: self.normalize,
        }
    }
}
