use crate::tools::{
    self, ToolContext,
    ingest::{IngestFolderRequest, IngestionStatusRequest},
    query::QueryRagRequest,
};
use anyhow::Result;
use rmcp::{
    ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use std::sync::Arc;
use tokio::io::{stdin, stdout};
use tracing::info;

/// MCP server over one ragline index.
#[derive(Clone)]
pub struct RaglineMcpServer {
    ctx: Arc<ToolContext>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl RaglineMcpServer {
    pub fn new(ctx: ToolContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Search the ingested documents. Returns ranked chunks with similarity scores and source metadata"
    )]
    async fn query_rag(
        &self,
        Parameters(request): Parameters<QueryRagRequest>,
    ) -> Result<String, String> {
        tools::query::query_rag(&self.ctx, request).await
    }

    #[tool(
        description = "Ingest every supported file under a folder. Returns the run id immediately; poll ingestion_status for progress"
    )]
    async fn ingest_folder(
        &self,
        Parameters(request): Parameters<IngestFolderRequest>,
    ) -> Result<String, String> {
        tools::ingest::ingest_folder(&self.ctx, request).await
    }

    #[tool(description = "Show the state and file counters of an ingestion run")]
    async fn ingestion_status(
        &self,
        Parameters(request): Parameters<IngestionStatusRequest>,
    ) -> Result<String, String> {
        tools::ingest::ingestion_status(&self.ctx, request).await
    }

    /// Serve over stdio until the client disconnects.
    pub async fn serve_stdio(self) -> Result<()> {
        info!("Starting MCP server with stdio transport");
        let server = self.serve((stdin(), stdout())).await?;
        let quit_reason = server.waiting().await?;
        info!("MCP server quit: {:?}", quit_reason);
        Ok(())
    }
}

#[tool_handler]
impl ServerHandler for RaglineMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "ragline: ingest local folders into a RAG index and query it".into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
