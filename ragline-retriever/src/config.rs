//! `ragline.toml` configuration.
//!
//! Every section and every field has a default, so an empty file (or no file
//! at all) gives a working local setup:
//!
//! ```toml
//! [database]
//! path = "ragline.db"
//!
//! [embedding]
//! provider = "fastembed"
//! model_name = "all-MiniLM-L6-v2"
//!
//! [chunking]
//! chunk_size = 800
//! chunk_overlap = 100
//! extensions = ["txt", "md", "pdf"]
//!
//! [ingestion]
//! worker_concurrency = 3
//!
//! [retrieval]
//! top_k = 5
//! metric = "cosine"
//! filter_mode = "pre"
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use crate::retrieval::{DistanceMetric, FilterMode};
use anyhow::{Context, Result, bail};
use ragline_context::SplitterConfig;
use ragline_embed::{EmbedConfig, RerankConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "ragline.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub database: DatabaseConfig,
    pub embedding: EmbedConfig,
    pub chunking: ChunkingConfig,
    pub ingestion: IngestionConfig,
    pub retrieval: RetrievalConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ragline.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// File extensions to ingest, without the dot, matched case-insensitively
    pub extensions: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: ragline_context::DEFAULT_CHUNK_SIZE,
            chunk_overlap: ragline_context::DEFAULT_CHUNK_OVERLAP,
            extensions: vec!["txt".into(), "md".into(), "pdf".into()],
        }
    }
}

impl ChunkingConfig {
    pub fn splitter_config(&self) -> SplitterConfig {
        SplitterConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            ..SplitterConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub worker_concurrency: usize,
    pub embed_max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_rate: f64,
    pub backoff_max_ms: u64,
    pub step_timeout_secs: u64,
    /// Recorded on every chunk and run
    pub pipeline_version: String,
    /// Delete stored sources under the folder that no longer exist on disk
    pub prune_missing: bool,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 3,
            embed_max_attempts: 3,
            backoff_initial_ms: 500,
            backoff_rate: 2.0,
            backoff_max_ms: 30_000,
            step_timeout_secs: 120,
            pipeline_version: "1".to_string(),
            prune_missing: true,
        }
    }
}

impl IngestionConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub metric: DistanceMetric,
    pub filter_mode: FilterMode,
    pub rerank: bool,
    pub rerank_overfetch: usize,
    pub reranker: RerankConfig,
    pub distance_threshold: Option<f32>,
    pub embed_timeout_ms: u64,
    pub search_timeout_ms: u64,
    pub rerank_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            metric: DistanceMetric::Cosine,
            filter_mode: FilterMode::Pre,
            rerank: false,
            rerank_overfetch: 3,
            reranker: RerankConfig::default(),
            distance_threshold: None,
            embed_timeout_ms: 10_000,
            search_timeout_ms: 5_000,
            rerank_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RagConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RagConfig = toml::from_str(text).context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Failed to load config file {}", path.display()))
    }

    /// Load `path`, or `ragline.toml` in the current directory. A missing
    /// default file means defaults; a missing explicit file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    tracing::debug!("No {DEFAULT_CONFIG_FILE} found, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be greater than zero");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            bail!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.chunk_overlap,
                self.chunking.chunk_size
            );
        }
        if self.chunking.extensions.is_empty() {
            bail!("chunking.extensions must list at least one extension");
        }
        if self.ingestion.worker_concurrency == 0 {
            bail!("ingestion.worker_concurrency must be at least 1");
        }
        if self.ingestion.embed_max_attempts == 0 {
            bail!("ingestion.embed_max_attempts must be at least 1");
        }
        if self.ingestion.backoff_rate < 1.0 {
            bail!("ingestion.backoff_rate must be at least 1.0");
        }
        if self.ingestion.step_timeout_secs == 0 {
            bail!("ingestion.step_timeout_secs must be at least 1");
        }
        if !(1..=crate::retrieval::MAX_TOP_K).contains(&self.retrieval.top_k) {
            bail!(
                "retrieval.top_k must be between 1 and {}",
                crate::retrieval::MAX_TOP_K
            );
        }
        if self.retrieval.rerank_overfetch == 0 {
            bail!("retrieval.rerank_overfetch must be at least 1");
        }
        self.embedding
            .validate()
            .context("Invalid [embedding] section")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragline_embed::{ProviderKind, RerankerKind};
    use tempfile::tempdir;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = RagConfig::from_toml_str("").unwrap();
        assert_eq!(config, RagConfig::default());
        assert_eq!(config.ingestion.worker_concurrency, 3);
        assert_eq!(config.ingestion.embed_max_attempts, 3);
        assert_eq!(config.ingestion.backoff_rate, 2.0);
        assert_eq!(config.chunking.chunk_size, 800);
        assert_eq!(config.chunking.chunk_overlap, 100);
        assert_eq!(config.retrieval.rerank_overfetch, 3);
        assert_eq!(config.retrieval.metric, DistanceMetric::Cosine);
    }

    #[test]
    fn test_partial_sections() {
        let config = RagConfig::from_toml_str(
            r#"
            [embedding]
            provider = "hashing"
            dimension = 64

            [retrieval]
            metric = "inner_product"
            filter_mode = "post"
            rerank = true
            reranker = { kind = "lexical" }

            [logging]
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.embedding.provider, ProviderKind::Hashing);
        assert_eq!(config.embedding.dimension, Some(64));
        assert_eq!(config.retrieval.metric, DistanceMetric::InnerProduct);
        assert_eq!(config.retrieval.filter_mode, FilterMode::Post);
        assert_eq!(config.retrieval.reranker.kind, RerankerKind::Lexical);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let overlap = "[chunking]\nchunk_size = 100\nchunk_overlap = 100\n";
        assert!(RagConfig::from_toml_str(overlap).is_err());

        let workers = "[ingestion]\nworker_concurrency = 0\n";
        assert!(RagConfig::from_toml_str(workers).is_err());

        let attempts = "[ingestion]\nembed_max_attempts = 0\n";
        assert!(RagConfig::from_toml_str(attempts).is_err());

        let top_k = "[retrieval]\ntop_k = 0\n";
        assert!(RagConfig::from_toml_str(top_k).is_err());

        let hashing = "[embedding]\nprovider = \"hashing\"\n";
        assert!(RagConfig::from_toml_str(hashing).is_err());
    }

    #[test]
    fn test_load_and_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ragline.toml");
        let mut config = RagConfig::default();
        config.database.path = dir.path().join("index.db");
        config.ingestion.worker_concurrency = 5;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = RagConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(loaded, config);

        let missing = dir.path().join("nope.toml");
        assert!(RagConfig::load_or_default(Some(&missing)).is_err());
    }
}
