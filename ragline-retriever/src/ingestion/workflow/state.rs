//! Execution states, step names and the typed outputs each step checkpoints.

use super::WorkflowError;
use crate::ingestion::loader::LoadedDocument;
use crate::storage::sqlite_store::SaveReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The five steps of one file execution, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    CheckExists,
    LoadAndNormalize,
    Chunk,
    Embed,
    Save,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::CheckExists,
        Step::LoadAndNormalize,
        Step::Chunk,
        Step::Embed,
        Step::Save,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::CheckExists => "check_exists",
            Step::LoadAndNormalize => "load_and_normalize",
            Step::Chunk => "chunk",
            Step::Embed => "embed",
            Step::Save => "save",
        }
    }

    /// 1-based position in [`Step::ALL`].
    pub fn order(&self) -> u32 {
        match self {
            Step::CheckExists => 1,
            Step::LoadAndNormalize => 2,
            Step::Chunk => 3,
            Step::Embed => 4,
            Step::Save => 5,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| WorkflowError::UnknownStep(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A transient error outlived the step's retries. Resumable.
    RetriesExhausted,
    /// Retrying cannot help. Only a fork re-runs the execution.
    Unrecoverable,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::Unrecoverable => "unrecoverable",
        }
    }
}

impl FromStr for FailureKind {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retries_exhausted" => Ok(FailureKind::RetriesExhausted),
            "unrecoverable" => Ok(FailureKind::Unrecoverable),
            other => Err(WorkflowError::CorruptCheckpoint(format!(
                "unknown failure kind {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Pending,
    Running,
    /// The named step is the last one with a committed checkpoint
    Checkpointed(Step),
    Succeeded,
    Failed(FailureKind),
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded | ExecutionState::Failed(_) | ExecutionState::Cancelled
        )
    }

    /// Name stored in the `state` column.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "PENDING",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Checkpointed(_) => "CHECKPOINTED",
            ExecutionState::Succeeded => "SUCCEEDED",
            ExecutionState::Failed(_) => "FAILED",
            ExecutionState::Cancelled => "CANCELLED",
        }
    }

    pub(crate) fn from_columns(
        state: &str,
        current_step: Option<&str>,
        failure_kind: Option<&str>,
    ) -> Result<Self, WorkflowError> {
        Ok(match state {
            "PENDING" => ExecutionState::Pending,
            "RUNNING" => ExecutionState::Running,
            "CHECKPOINTED" => {
                let step = current_step.ok_or_else(|| {
                    WorkflowError::CorruptCheckpoint("CHECKPOINTED without a step".into())
                })?;
                ExecutionState::Checkpointed(step.parse()?)
            }
            "SUCCEEDED" => ExecutionState::Succeeded,
            "FAILED" => ExecutionState::Failed(
                failure_kind
                    .unwrap_or(FailureKind::Unrecoverable.as_str())
                    .parse()?,
            ),
            "CANCELLED" => ExecutionState::Cancelled,
            other => {
                return Err(WorkflowError::CorruptCheckpoint(format!(
                    "unknown execution state {other}"
                )));
            }
        })
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Checkpointed(step) => write!(f, "CHECKPOINTED({step})"),
            ExecutionState::Failed(kind) => write!(f, "FAILED({})", kind.as_str()),
            other => f.write_str(other.label()),
        }
    }
}

/// Durable record of one file execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub file_path: String,
    pub file_hash: String,
    pub file_size: u64,
    pub state: ExecutionState,
    pub error: Option<String>,
    pub output: Option<FileOutcome>,
    pub last_run_id: Option<String>,
    pub attempt_count: u32,
    pub fork_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A committed checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: Step,
    pub output: serde_json::Value,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckExistsOutput {
    pub already_processed: bool,
}

/// One chunk as produced by the `chunk` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedChunk {
    pub chunk_id: String,
    pub index: usize,
    pub page: Option<u32>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSet {
    pub chunks: Vec<PreparedChunk>,
}

/// Embeddings for a [`ChunkSet`], index-aligned with its chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSet {
    pub model_id: String,
    pub dimension: usize,
    pub vectors: Vec<Vec<f32>>,
}

/// Everything a resumed execution can read back from earlier steps.
#[derive(Debug, Default)]
pub(crate) struct Checkpoints {
    pub check_exists: Option<CheckExistsOutput>,
    pub document: Option<LoadedDocument>,
    pub chunks: Option<ChunkSet>,
    pub embeddings: Option<EmbeddingSet>,
    pub save: Option<SaveReport>,
}

impl Checkpoints {
    pub fn from_records(records: &[StepRecord]) -> Result<Self, WorkflowError> {
        let mut checkpoints = Checkpoints::default();
        for record in records {
            let value = record.output.clone();
            let corrupt = |err: serde_json::Error| {
                WorkflowError::CorruptCheckpoint(format!("{}: {err}", record.step))
            };
            match record.step {
                Step::CheckExists => {
                    checkpoints.check_exists = Some(serde_json::from_value(value).map_err(corrupt)?)
                }
                Step::LoadAndNormalize => {
                    checkpoints.document = Some(serde_json::from_value(value).map_err(corrupt)?)
                }
                Step::Chunk => {
                    checkpoints.chunks = Some(serde_json::from_value(value).map_err(corrupt)?)
                }
                Step::Embed => {
                    checkpoints.embeddings = Some(serde_json::from_value(value).map_err(corrupt)?)
                }
                Step::Save => {
                    checkpoints.save = Some(serde_json::from_value(value).map_err(corrupt)?)
                }
            }
        }
        Ok(checkpoints)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyProcessed,
    NoContent,
    NoChunks,
    DuplicateContent,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadyProcessed => "already_processed",
            SkipReason::NoContent => "no_content",
            SkipReason::NoChunks => "no_chunks",
            SkipReason::DuplicateContent => "duplicate_content",
        }
    }
}

/// Result of processing one file. This is what a succeeded execution stores
/// as its output and what a cache hit hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Success {
        path: String,
        chunks: usize,
        report: SaveReport,
    },
    Skipped {
        path: String,
        reason: SkipReason,
    },
    /// Unchanged content whose execution already succeeded
    Cached {
        path: String,
        previous: Box<FileOutcome>,
    },
    Failed {
        path: String,
        kind: FailureKind,
        error: String,
    },
    Cancelled {
        path: String,
    },
    /// Another task is driving the same execution right now
    AlreadyRunning {
        path: String,
    },
}

impl FileOutcome {
    pub fn path(&self) -> &str {
        match self {
            FileOutcome::Success { path, .. }
            | FileOutcome::Skipped { path, .. }
            | FileOutcome::Cached { path, .. }
            | FileOutcome::Failed { path, .. }
            | FileOutcome::Cancelled { path }
            | FileOutcome::AlreadyRunning { path } => path,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FileOutcome::Success { .. } => "success",
            FileOutcome::Skipped { .. } => "skipped",
            FileOutcome::Cached { .. } => "cached",
            FileOutcome::Failed { .. } => "failed",
            FileOutcome::Cancelled { .. } => "cancelled",
            FileOutcome::AlreadyRunning { .. } => "already_running",
        }
    }
}
