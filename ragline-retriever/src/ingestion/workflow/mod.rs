//! Durable per-file workflow.
//!
//! Every file runs as an execution keyed by its content hash
//! (`process-{blake3 hex}`) through five steps: `check_exists`,
//! `load_and_normalize`, `chunk`, `embed` and `save`. After each step its
//! output is committed to the `workflow_steps` table in the same transaction
//! that moves the execution to `CHECKPOINTED(step)`, so a crashed or
//! cancelled execution picks up at the first step without a checkpoint.
//!
//! ```text
//! PENDING -> RUNNING -> CHECKPOINTED(step)* -> SUCCEEDED
//!                                          \-> FAILED(retries_exhausted | unrecoverable)
//!                                          \-> CANCELLED
//! ```

use super::discovery::DiscoveryError;
use super::loader::LoadError;
use crate::storage::{FileHash, StorageError};
use ragline_context::SplitterError;
use ragline_embed::EmbedError;

pub mod engine;
pub mod journal;
pub mod retry;
pub mod state;

pub use engine::WorkflowEngine;
pub use journal::WorkflowJournal;
pub use retry::RetryPolicy;
pub use state::{
    ChunkSet, EmbeddingSet, ExecutionRecord, ExecutionState, FailureKind, FileOutcome,
    PreparedChunk, SkipReason, Step, StepRecord,
};

/// Deterministic execution id for a file's content.
pub fn execution_id(file_hash: &FileHash) -> String {
    format!("process-{}", hex::encode(file_hash))
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("invalid chunking configuration: {0}")]
    Splitter(#[from] SplitterError),

    #[error("{path} changed on disk before save (expected {expected}, found {found})")]
    StaleSource {
        path: String,
        expected: String,
        found: String,
    },

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("execution {execution_id} is {state} and cannot be resumed")]
    NotResumable {
        execution_id: String,
        state: ExecutionState,
    },

    #[error("execution {0} failed unrecoverably; fork it from a step to run it again")]
    ForkRequired(String),

    #[error("execution {0} is being processed by another task")]
    AlreadyRunning(String),

    #[error("step {step} timed out after {timeout_ms} ms")]
    StepTimeout { step: Step, timeout_ms: u64 },

    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<sqlx::Error> for WorkflowError {
    fn from(err: sqlx::Error) -> Self {
        WorkflowError::Storage(StorageError::Database(err))
    }
}

impl WorkflowError {
    /// Transient errors may go away on retry. Anything else fails the
    /// execution as unrecoverable.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkflowError::Storage(err) => err.is_transient(),
            WorkflowError::Embed(err) => err.is_transient(),
            WorkflowError::Load(err) => err.is_transient(),
            WorkflowError::StepTimeout { .. } => true,
            _ => false,
        }
    }
}
