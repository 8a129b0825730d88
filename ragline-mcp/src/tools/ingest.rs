use super::{ToolContext, to_json};
use ragline_retriever::ingestion::ExecutionRecord;
use ragline_retriever::storage::IngestionRun;
use rmcp::schemars;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct IngestFolderRequest {
    #[schemars(description = "Folder to ingest, absolute or relative to the server's working directory")]
    pub folder: String,
    #[schemars(description = "Optional run id to use instead of a generated one")]
    pub run_id: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct IngestionStatusRequest {
    #[schemars(description = "Run id returned by ingest_folder")]
    pub run_id: String,
}

#[derive(Debug, Serialize)]
struct Submitted<'a> {
    run_id: &'a str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct RunStatusView<'a> {
    run: &'a IngestionRun,
    executions_by_state: BTreeMap<String, usize>,
    failures: Vec<FailureView<'a>>,
}

#[derive(Debug, Serialize)]
struct FailureView<'a> {
    execution_id: &'a str,
    path: &'a str,
    state: String,
    error: Option<&'a str>,
}

/// Start a run in the background and return its id right away.
pub async fn ingest_folder(
    ctx: &ToolContext,
    request: IngestFolderRequest,
) -> Result<String, String> {
    info!("Processing ingest_folder: folder='{}'", request.folder);
    let handle = ctx
        .ingestion
        .submit_folder(Path::new(&request.folder), request.run_id)
        .await
        .map_err(|err| {
            warn!(error = %err, "ingest_folder rejected");
            err.to_string()
        })?;
    to_json(&Submitted {
        run_id: &handle.run_id,
        status: "PENDING",
    })
}

pub async fn ingestion_status(
    ctx: &ToolContext,
    request: IngestionStatusRequest,
) -> Result<String, String> {
    let run = ctx
        .ingestion
        .run_status(&request.run_id)
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("no ingestion run with id {}", request.run_id))?;

    let executions: Vec<ExecutionRecord> = ctx
        .ingestion
        .workflow()
        .journal()
        .list(Some(&request.run_id))
        .await
        .map_err(|err| err.to_string())?;

    let mut executions_by_state = BTreeMap::new();
    for record in &executions {
        *executions_by_state
            .entry(record.state.label().to_string())
            .or_insert(0) += 1;
    }
    let failures = executions
        .iter()
        .filter(|r| r.error.is_some())
        .map(|r| FailureView {
            execution_id: &r.execution_id,
            path: &r.file_path,
            state: r.state.to_string(),
            error: r.error.as_deref(),
        })
        .collect();

    to_json(&RunStatusView {
        run: &run,
        executions_by_state,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;

    #[tokio::test]
    async fn test_ingest_then_status() {
        let (dir, ctx) = context().await;
        let docs = dir.path().join("docs");
        std::fs::create_dir(&docs).unwrap();
        std::fs::write(docs.join("a.txt"), "Some text worth indexing.").unwrap();

        let json = ingest_folder(
            &ctx,
            IngestFolderRequest {
                folder: docs.to_string_lossy().into_owned(),
                run_id: Some("run-mcp".into()),
            },
        )
        .await
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["run_id"], "run-mcp");

        // Poll until the background run finishes.
        let mut status = serde_json::Value::Null;
        for _ in 0..200 {
            let json = ingestion_status(
                &ctx,
                IngestionStatusRequest {
                    run_id: "run-mcp".into(),
                },
            )
            .await
            .unwrap();
            status = serde_json::from_str(&json).unwrap();
            if status["run"]["status"] == "COMPLETE" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        assert_eq!(status["run"]["status"], "COMPLETE");
        assert_eq!(status["run"]["counters"]["processed"], 1);
        assert_eq!(status["executions_by_state"]["SUCCEEDED"], 1);
    }

    #[tokio::test]
    async fn test_missing_folder_and_unknown_run() {
        let (dir, ctx) = context().await;
        let err = ingest_folder(
            &ctx,
            IngestFolderRequest {
                folder: dir.path().join("nope").to_string_lossy().into_owned(),
                run_id: None,
            },
        )
        .await
        .unwrap_err();
        assert!(err.contains("nope"));

        let err = ingestion_status(
            &ctx,
            IngestionStatusRequest {
                run_id: "run-missing".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(err.contains("run-missing"));
    }
}
