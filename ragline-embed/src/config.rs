//! Configuration for embedding models and rerankers

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which embedding backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local ONNX models through fastembed
    #[serde(alias = "fast_embed")]
    FastEmbed,
    /// Deterministic feature hashing, no model files required
    Hashing,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::FastEmbed => "fastembed",
            ProviderKind::Hashing => "hashing",
        }
    }
}

/// Configuration for an embedding provider.
///
/// Every field has a default so a partial `[embedding]` table in a TOML
/// file is enough:
///
/// ```
/// use ragline_embed::{EmbedConfig, ProviderKind};
///
/// let config: EmbedConfig = serde_json::from_str(r#"{"provider": "hashing", "dimension": 64}"#).unwrap();
/// assert_eq!(config.provider, ProviderKind::Hashing);
/// assert_eq!(config.batch_size, 32);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    pub provider: ProviderKind,
    /// Model name, e.g. `all-MiniLM-L6-v2` or `bge-small-en-v1.5`
    pub model_name: String,
    /// Free-form version tag recorded with every stored vector
    pub model_version: String,
    /// Required for the hashing provider; for fastembed it is checked
    /// against the loaded model when set
    pub dimension: Option<usize>,
    pub batch_size: usize,
    /// L2-normalize vectors before returning them
    pub normalize: bool,
    /// Where fastembed keeps downloaded model files
    pub cache_dir: Option<PathBuf>,
    pub show_download_progress: bool,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::FastEmbed,
            model_name: "all-MiniLM-L6-v2".to_string(),
            model_version: "1".to_string(),
            dimension: None,
            batch_size: 32,
            normalize: true,
            cache_dir: None,
            show_download_progress: false,
        }
    }
}

impl EmbedConfig {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    /// Feature-hashing configuration with the given vector length.
    pub fn hashing(dimension: usize) -> Self {
        Self {
            provider: ProviderKind::Hashing,
            model_name: "fnv-feature-hash".to_string(),
            dimension: Some(dimension),
            ..Self::default()
        }
    }

    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    pub fn with_version(self, model_version: impl Into<String>) -> Self {
        Self {
            model_version: model_version.into(),
            ..self
        }
    }

    pub fn with_cache_dir(self, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: Some(cache_dir.into()),
            ..self
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(EmbedError::invalid_config("model_name must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be at least 1"));
        }
        if self.model_version.contains(':') || self.model_name.contains(':') {
            return Err(EmbedError::invalid_config(
                "model_name and model_version must not contain ':'",
            ));
        }
        match (self.provider, self.dimension) {
            (ProviderKind::Hashing, None) => Err(EmbedError::invalid_config(
                "the hashing provider requires an explicit dimension",
            )),
            (_, Some(0)) => Err(EmbedError::invalid_config("dimension must be at least 1")),
            _ => Ok(()),
        }
    }
}

/// Which reranker to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankerKind {
    /// Query/document term overlap, no model files required
    Lexical,
    /// Cross-encoder through fastembed
    #[serde(alias = "fast_embed")]
    FastEmbed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub kind: RerankerKind,
    /// Cross-encoder name, used only by [`RerankerKind::FastEmbed`]
    pub model_name: String,
    pub batch_size: usize,
    pub cache_dir: Option<PathBuf>,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            kind: RerankerKind::Lexical,
            model_name: "bge-reranker-base".to_string(),
            batch_size: 16,
            cache_dir: None,
        }
    }
}
