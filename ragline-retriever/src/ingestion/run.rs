//! Folder ingestion runs.
//!
//! [`IngestionEngine::submit_folder`] records a run and returns right away.
//! The run itself is an umbrella task that streams discovered files into a
//! [`FileQueue`], one child execution per file, and writes the summary when
//! every child has finished. One file failing never stops the others.

use super::discovery::{DiscoveryError, FileDescriptor, discover};
use super::queue::FileQueue;
use super::workflow::{
    ExecutionState, FailureKind, FileOutcome, SkipReason, WorkflowEngine, WorkflowError,
};
use crate::config::RagConfig;
use crate::storage::{IngestionRun, RunCounter, RunCounters, RunStatus, SqliteStore};
use chrono::Utc;
use ragline_embed::EmbeddingProvider;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type Result<T> = std::result::Result<T, WorkflowError>;

/// A file the walk could not read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryFailure {
    pub path: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub folder: String,
    pub status: RunStatus,
    pub counters: RunCounters,
    /// Per-file outcomes sorted by path
    pub outcomes: Vec<FileOutcome>,
    pub discovery_failures: Vec<DiscoveryFailure>,
    /// Stored sources removed because they no longer exist on disk
    pub pruned: Vec<String>,
    pub error: Option<String>,
}

/// Handle to a submitted run. The run keeps going if the handle is dropped.
pub struct RunHandle {
    pub run_id: String,
    task: JoinHandle<Result<RunSummary>>,
}

impl RunHandle {
    pub async fn wait(self) -> Result<RunSummary> {
        self.task.await?
    }
}

#[derive(Clone)]
pub struct IngestionEngine {
    workflow: Arc<WorkflowEngine>,
    extensions: Vec<String>,
}

impl IngestionEngine {
    pub fn new(workflow: Arc<WorkflowEngine>, extensions: Vec<String>) -> Self {
        Self {
            workflow,
            extensions,
        }
    }

    pub fn from_config(
        store: SqliteStore,
        provider: Arc<dyn EmbeddingProvider>,
        config: &RagConfig,
    ) -> Result<Self> {
        let workflow = WorkflowEngine::new(store, provider, config)?;
        Ok(Self::new(
            Arc::new(workflow),
            config.chunking.extensions.clone(),
        ))
    }

    pub fn workflow(&self) -> &Arc<WorkflowEngine> {
        &self.workflow
    }

    pub fn store(&self) -> &SqliteStore {
        self.workflow.store()
    }

    /// Validate `folder`, record a `PENDING` run and start it in the
    /// background. Returns as soon as the run is recorded.
    pub async fn submit_folder(&self, folder: &Path, run_id: Option<String>) -> Result<RunHandle> {
        if !folder.exists() {
            return Err(DiscoveryError::FolderNotFound(folder.to_path_buf()).into());
        }
        if !folder.is_dir() {
            return Err(DiscoveryError::NotADirectory(folder.to_path_buf()).into());
        }
        let folder = tokio::fs::canonicalize(folder)
            .await
            .map_err(|source| DiscoveryError::Unreadable {
                path: folder.to_path_buf(),
                source,
            })?;

        let run_id = run_id.unwrap_or_else(|| new_run_id(&folder));
        let run = IngestionRun {
            run_id: run_id.clone(),
            folder: folder.to_string_lossy().into_owned(),
            pipeline_version: self.workflow.config().pipeline_version.clone(),
            model_id: self.workflow.provider().model_id(),
            status: RunStatus::Pending,
            counters: RunCounters::default(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store().create_run(&run).await?;
        info!(run_id = %run_id, folder = %folder.display(), "Ingestion run submitted");

        let engine = self.clone();
        let task_run_id = run_id.clone();
        let task = tokio::spawn(async move {
            let result = engine.run(&folder, &task_run_id).await;
            if let Err(err) = &result {
                error!(run_id = %task_run_id, error = %err, "Ingestion run aborted");
                if let Err(finish_err) = engine
                    .store()
                    .finish_run(&task_run_id, RunStatus::Failed, Some(&err.to_string()))
                    .await
                {
                    warn!(run_id = %task_run_id, error = %finish_err, "Could not mark run as failed");
                }
            }
            result
        });

        Ok(RunHandle { run_id, task })
    }

    /// Submit and wait.
    pub async fn ingest_folder(&self, folder: &Path, run_id: Option<String>) -> Result<RunSummary> {
        self.submit_folder(folder, run_id).await?.wait().await
    }

    pub async fn run_status(&self, run_id: &str) -> Result<Option<IngestionRun>> {
        Ok(self.store().get_run(run_id).await?)
    }

    async fn run(&self, folder: &Path, run_id: &str) -> Result<RunSummary> {
        let store = self.store();
        store.set_run_status(run_id, RunStatus::Running).await?;

        let (tx, mut rx) = mpsc::channel::<std::result::Result<FileDescriptor, DiscoveryError>>(64);
        let walk_folder = folder.to_path_buf();
        let extensions = self.extensions.clone();
        let walker = tokio::task::spawn_blocking(move || -> std::result::Result<(), DiscoveryError> {
            for item in discover(&walk_folder, &extensions)? {
                if tx.blocking_send(item).is_err() {
                    break;
                }
            }
            Ok(())
        });

        let mut queue = FileQueue::new(self.workflow.config().worker_concurrency);
        let mut seen_hashes = HashSet::new();
        let mut seen_paths = HashSet::new();
        let mut queued = HashMap::new();
        let mut outcomes = Vec::new();
        let mut discovery_failures = Vec::new();
        let mut discovery_done = false;

        loop {
            tokio::select! {
                item = rx.recv(), if !discovery_done => match item {
                    Some(Ok(file)) => {
                        seen_paths.insert(file.path_string());
                        store.bump_run_counter(run_id, RunCounter::FilesFound, 1).await?;
                        if seen_hashes.insert(file.hash) {
                            self.workflow.journal().ensure_pending(&file, Some(run_id)).await?;
                            queued.insert(file.path_string(), file.execution_id());
                            let workflow = Arc::clone(&self.workflow);
                            let child_run_id = run_id.to_string();
                            queue.submit(file.path_string(), async move {
                                workflow.process_file(&file, Some(&child_run_id)).await
                            });
                        } else {
                            info!(path = %file.path.display(), "Same content already queued in this run");
                            store.bump_run_counter(run_id, RunCounter::Skipped, 1).await?;
                            outcomes.push(FileOutcome::Skipped {
                                path: file.path_string(),
                                reason: SkipReason::DuplicateContent,
                            });
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "Skipping file that could not be read");
                        let path = err.path().map(|p| p.to_string_lossy().into_owned());
                        if let Some(path) = &path {
                            seen_paths.insert(path.clone());
                        }
                        store.bump_run_counter(run_id, RunCounter::FilesFound, 1).await?;
                        store.bump_run_counter(run_id, RunCounter::Failed, 1).await?;
                        discovery_failures.push(DiscoveryFailure {
                            path,
                            error: err.to_string(),
                        });
                    }
                    None => discovery_done = true,
                },
                Some((path, result)) = queue.next(), if !queue.is_empty() => {
                    let execution_id = queued.remove(&path);
                    let outcome = match result {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            error!(path = %path, error = %err, "Execution did not finish cleanly");
                            let kind = if err.is_transient() {
                                FailureKind::RetriesExhausted
                            } else {
                                FailureKind::Unrecoverable
                            };
                            let outcome = FileOutcome::Failed {
                                kind,
                                error: err.to_string(),
                                path,
                            };
                            if let Some(execution_id) = &execution_id {
                                self.record_crashed(execution_id, kind, &outcome).await;
                            }
                            outcome
                        }
                    };
                    store.bump_run_counter(run_id, counter_for(&outcome), 1).await?;
                    outcomes.push(outcome);
                }
                else => break,
            }
        }

        let walk_error = match walker.await? {
            Ok(()) => None,
            Err(err) => {
                error!(run_id, error = %err, "Discovery failed");
                Some(err.to_string())
            }
        };

        let mut pruned = Vec::new();
        if walk_error.is_none() && self.workflow.config().prune_missing {
            for path in store
                .source_paths_under(&folder.to_string_lossy())
                .await?
            {
                if !seen_paths.contains(&path) {
                    let removed = store.delete_source(&path).await?;
                    info!(path = %path, chunks = removed, "Pruned source no longer on disk");
                    pruned.push(path);
                }
            }
        }

        let status = if walk_error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Complete
        };
        store.finish_run(run_id, status, walk_error.as_deref()).await?;

        outcomes.sort_by(|a, b| a.path().cmp(b.path()));
        let counters = store
            .get_run(run_id)
            .await?
            .map(|run| run.counters)
            .unwrap_or_default();
        info!(
            run_id,
            status = %status,
            found = counters.files_found,
            processed = counters.processed,
            skipped = counters.skipped,
            cached = counters.cached,
            failed = counters.failed,
            "Ingestion run finished"
        );

        Ok(RunSummary {
            run_id: run_id.to_string(),
            folder: folder.to_string_lossy().into_owned(),
            status,
            counters,
            outcomes,
            discovery_failures,
            pruned,
            error: walk_error,
        })
    }
}

impl IngestionEngine {
    /// Leave a terminal state behind for a child that errored or panicked
    /// instead of returning an outcome, so it is not left `RUNNING`.
    async fn record_crashed(&self, execution_id: &str, kind: FailureKind, outcome: &FileOutcome) {
        let error = match outcome {
            FileOutcome::Failed { error, .. } => Some(error.as_str()),
            _ => None,
        };
        if let Err(err) = self
            .workflow
            .journal()
            .finish(execution_id, ExecutionState::Failed(kind), Some(outcome), error)
            .await
        {
            warn!(execution_id, error = %err, "Could not record failed execution");
        }
    }
}

fn counter_for(outcome: &FileOutcome) -> RunCounter {
    match outcome {
        FileOutcome::Success { .. } => RunCounter::Processed,
        FileOutcome::Skipped { .. } | FileOutcome::AlreadyRunning { .. } => RunCounter::Skipped,
        FileOutcome::Cached { .. } => RunCounter::Cached,
        FileOutcome::Failed { .. } => RunCounter::Failed,
        FileOutcome::Cancelled { .. } => RunCounter::Cancelled,
    }
}

fn new_run_id(folder: &Path) -> String {
    let now = Utc::now();
    let salt = blake3::hash(
        format!(
            "{}:{}",
            folder.display(),
            now.timestamp_nanos_opt().unwrap_or_default()
        )
        .as_bytes(),
    );
    format!(
        "run-{}-{}",
        now.format("%Y%m%d%H%M%S"),
        &salt.to_hex()[..8]
    )
}
