//! ragline-retriever: durable folder ingestion and retrieval over a local
//! SQLite chunk index.
//!
//! ## Modules
//!
//! - **[`ingestion`]**: discovery, loading and the checkpointed per-file workflow
//! - **[`retrieval`]**: query preprocessing, embedding, similarity search and rerank
//! - **[`storage`]**: the SQLite store shared by both
//! - **[`config`]**: `ragline.toml`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ragline_retriever::{
//!     config::RagConfig,
//!     ingestion::IngestionEngine,
//!     retrieval::{RetrievalEngine, RetrievalRequest},
//!     storage::SqliteStore,
//! };
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RagConfig::load_or_default(None)?;
//! let store = SqliteStore::open(&config.database.path).await?;
//! let provider = ragline_embed::build_provider(&config.embedding).await?;
//!
//! let ingestion = IngestionEngine::from_config(store.clone(), provider.clone(), &config)?;
//! let summary = ingestion.ingest_folder(Path::new("./docs"), None).await?;
//! println!("{} files processed", summary.counters.processed);
//!
//! let retrieval = RetrievalEngine::from_config(store, provider, &config.retrieval).await?;
//! let response = retrieval.retrieve(&RetrievalRequest::new("how do I resume a run?")).await?;
//! for result in response.results {
//!     println!("{:.3} {}", result.score, result.metadata.source_path);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Folder → Discovery → FileQueue → WorkflowEngine (check → load → chunk → embed → save)
//!                                        ↓ checkpoints          ↓
//!                                  workflow journal        SQLite chunks
//!                                                               ↓
//!                        query → preprocess → embed → similarity search → rerank
//! ```

pub mod config;
pub mod ingestion;
pub mod logging;
pub mod retrieval;
pub mod storage;
