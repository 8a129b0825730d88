//! # ragline-mcp
//!
//! A Model Context Protocol (MCP) server over a ragline index. It speaks MCP
//! on stdio and logs to stderr.
//!
//! ## MCP Tools
//!
//! - `query_rag`: `{query, top_k?, rerank?, source?, file_type?}` → ranked
//!   chunks with scores and source metadata
//! - `ingest_folder`: `{folder, run_id?}` → the run id, without waiting for
//!   the run to finish
//! - `ingestion_status`: `{run_id}` → run state, counters and failed files
//!
//! ## Configuration
//!
//! Reads the same `ragline.toml` as the `ragline` CLI, so both share one
//! database and one embedding model.
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "ragline": {
//!       "command": "ragline-mcp",
//!       "args": ["--config", "/path/to/ragline.toml"]
//!     }
//!   }
//! }
//! ```

mod server;
pub mod tools;

pub use server::RaglineMcpServer;

use anyhow::Result;
use ragline_retriever::config::RagConfig;
use std::path::PathBuf;
use tools::ToolContext;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// `ragline.toml` to load; `./ragline.toml` or defaults when unset
    pub config_path: Option<PathBuf>,
    /// Overrides `[database] path`
    pub database: Option<PathBuf>,
}

impl ServerConfig {
    pub fn load(&self) -> Result<RagConfig> {
        let mut config = RagConfig::load_or_default(self.config_path.as_deref())?;
        if let Some(db) = &self.database {
            config.database.path = db.clone();
        }
        Ok(config)
    }
}

/// Open the index described by `config` and serve it over stdio.
pub async fn run_server(config: RagConfig) -> Result<()> {
    info!(
        "Starting ragline MCP server on {}",
        config.database.path.display()
    );
    let ctx = ToolContext::open(&config).await?;
    RaglineMcpServer::new(ctx).serve_stdio().await
}
