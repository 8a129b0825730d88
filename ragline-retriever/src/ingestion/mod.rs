//! Folder ingestion: discovery, loading, the durable per-file workflow and
//! the run that ties them together.

pub mod discovery;
pub mod loader;
pub mod queue;
pub mod run;
pub mod workflow;

pub use discovery::{DiscoveryError, FileDescriptor, discover, hash_file};
pub use loader::{DocumentLoader, FileLoader, LoadError, LoadedDocument, LoadedPage};
pub use queue::FileQueue;
pub use run::{DiscoveryFailure, IngestionEngine, RunHandle, RunSummary};
pub use workflow::{
    ExecutionRecord, ExecutionState, FailureKind, FileOutcome, RetryPolicy, SkipReason, Step,
    WorkflowEngine, WorkflowError, WorkflowJournal, execution_id,
};
