use super::{ToolContext, to_json};
use ragline_retriever::retrieval::{RetrievalError, RetrievalRequest};
use ragline_retriever::storage::MetadataFilter;
use rmcp::schemars;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct QueryRagRequest {
    #[schemars(description = "Natural language query")]
    pub query: String,
    #[schemars(description = "Number of results to return (1 to 100)")]
    pub top_k: Option<u32>,
    #[schemars(description = "Rerank an over-fetched candidate set before returning")]
    pub rerank: Option<bool>,
    #[schemars(description = "Only return chunks from this source path or path suffix")]
    pub source: Option<String>,
    #[schemars(description = "Only return chunks from files of this type, e.g. md or pdf")]
    pub file_type: Option<String>,
}

pub async fn query_rag(ctx: &ToolContext, request: QueryRagRequest) -> Result<String, String> {
    info!(
        "Processing query_rag: query='{}', top_k={:?}, rerank={:?}",
        request.query, request.top_k, request.rerank
    );

    let retrieval = RetrievalRequest {
        query: request.query,
        top_k: request.top_k.map(|k| k as usize),
        filter: MetadataFilter {
            source_path: request.source,
            file_type: request.file_type,
            ..MetadataFilter::default()
        },
        rerank: request.rerank,
        ..RetrievalRequest::default()
    };

    match ctx.retrieval.retrieve(&retrieval).await {
        Ok(response) => to_json(&response),
        Err(err) => {
            warn!(error = %err, "query_rag failed");
            Err(describe(&err))
        }
    }
}

fn describe(err: &RetrievalError) -> String {
    if err.is_unavailable() {
        format!("service unavailable: {err}")
    } else if err.is_model_mismatch() {
        format!("index/model mismatch: {err}. Re-ingest with the configured model or switch back to the one the index was built with")
    } else {
        err.to_string()
    }
}
