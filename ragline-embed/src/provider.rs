//! Embedding provider implementations

use crate::config::{EmbedConfig, ProviderKind};
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use half::f16;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f16>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result. The dimension is taken from the first
    /// vector, or 0 when there are none.
    pub fn new(embeddings: Vec<Vec<f16>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Identity of the model that produced a set of vectors.
///
/// Two indexes can only be searched with each other's vectors when their
/// descriptors render to the same [`ModelDescriptor::id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub provider: String,
    pub model_name: String,
    pub model_version: String,
    pub dimension: usize,
    pub normalized: bool,
}

impl ModelDescriptor {
    /// `provider:model:version:dimension:norm`
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.provider,
            self.model_name,
            self.model_version,
            self.dimension,
            if self.normalized { "norm" } else { "raw" }
        )
    }
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// A source of fixed-dimension text embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f16>> {
        let result = self.embed_texts(&[text.to_string()]).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::invalid_config("No embedding generated for text"))
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    fn embedding_dimension(&self) -> usize;

    fn provider_name(&self) -> &str;

    /// Model identity recorded alongside every stored vector.
    fn model_descriptor(&self) -> ModelDescriptor;

    fn model_id(&self) -> String {
        self.model_descriptor().id()
    }
}

/// Build the provider named by `config`, loading model files if needed.
pub async fn build_provider(config: &EmbedConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    config.validate()?;
    match config.provider {
        ProviderKind::FastEmbed => Ok(Arc::new(FastEmbedProvider::create(config.clone()).await?)),
        ProviderKind::Hashing => Ok(Arc::new(crate::hashing::HashingProvider::from_config(
            config,
        )?)),
    }
}

/// Map a configured model name to a built-in fastembed model.
pub fn resolve_fastembed_model(name: &str) -> Result<EmbeddingModel> {
    let normalized = name.to_ascii_lowercase();
    let short = normalized.rsplit('/').next().unwrap_or(&normalized);
    let model = match short {
        "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
        "all-minilm-l12-v2" => EmbeddingModel::AllMiniLML12V2,
        "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        "nomic-embed-text-v1.5" => EmbeddingModel::NomicEmbedTextV15,
        "multilingual-e5-small" => EmbeddingModel::MultilingualE5Small,
        "snowflake-arctic-embed-xs" => EmbeddingModel::SnowflakeArcticEmbedXS,
        _ => {
            return Err(EmbedError::UnknownModel {
                provider: ProviderKind::FastEmbed.as_str().to_string(),
                name: name.to_string(),
            });
        }
    };
    Ok(model)
}

/// Embeddings from a local ONNX model via fastembed.
///
/// The model sits behind a mutex because fastembed needs `&mut` access for
/// inference; all inference runs on the blocking pool.
#[derive(Clone)]
pub struct FastEmbedProvider {
    config: EmbedConfig,
    model: Arc<Mutex<TextEmbedding>>,
    dimension: usize,
}

impl fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("config", &self.config)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl FastEmbedProvider {
    /// Load the configured model and probe its output dimension.
    pub async fn create(config: EmbedConfig) -> Result<Self> {
        let model_kind = resolve_fastembed_model(config.model_name())?;
        tracing::info!(model = %config.model_name(), "Initializing FastEmbed provider");

        let load_config = config.clone();
        let (model, dimension) =
            tokio::task::spawn_blocking(move || -> Result<(TextEmbedding, usize)> {
                let mut init_options = InitOptions::new(model_kind)
                    .with_show_download_progress(load_config.show_download_progress);
                if let Some(dir) = &load_config.cache_dir {
                    init_options = init_options.with_cache_dir(dir.clone());
                }

                let mut model = TextEmbedding::try_new(init_options)
                    .map_err(|e| EmbedError::External { source: e })?;

                let probe = model
                    .embed(vec!["dimension probe".to_string()], None)
                    .map_err(|e| EmbedError::External { source: e })?;
                let dimension = probe.first().map(|emb| emb.len()).unwrap_or(0);
                Ok((model, dimension))
            })
            .await??;

        if dimension == 0 {
            return Err(EmbedError::invalid_config(
                "Model validation failed: empty embedding",
            ));
        }
        if let Some(expected) = config.dimension {
            if expected != dimension {
                return Err(EmbedError::DimensionMismatch {
                    expected,
                    actual: dimension,
                });
            }
        }

        tracing::info!(model = %config.model_name(), dimension, "Model loaded");
        Ok(Self {
            config,
            model: Arc::new(Mutex::new(model)),
            dimension,
        })
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        tracing::debug!("Generating embeddings for {} texts", texts.len());
        let mut all_embeddings = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let batch = batch.to_vec();
            let model = Arc::clone(&self.model);

            let raw = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                let mut model_guard = model
                    .lock()
                    .map_err(|_| EmbedError::invalid_config("embedding model lock poisoned"))?;
                model_guard
                    .embed(batch, None)
                    .map_err(|e| EmbedError::External { source: e })
            })
            .await??;

            for vector in raw {
                if vector.len() != self.dimension {
                    return Err(EmbedError::DimensionMismatch {
                        expected: self.dimension,
                        actual: vector.len(),
                    });
                }
                all_embeddings.push(to_f16(vector, self.config.normalize));
            }
        }

        tracing::debug!("Generated {} embeddings", all_embeddings.len());
        Ok(EmbeddingResult::new(all_embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        ProviderKind::FastEmbed.as_str()
    }

    fn model_descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            provider: self.provider_name().to_string(),
            model_name: self.config.model_name.clone(),
            model_version: self.config.model_version.clone(),
            dimension: self.dimension,
            normalized: self.config.normalize,
        }
    }
}

/// Convert to half precision, L2-normalizing first when asked to.
pub(crate) fn to_f16(mut vector: Vec<f32>, normalize: bool) -> Vec<f16> {
    if normalize {
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
    }
    vector.into_iter().map(f16::from_f32).collect()
}
