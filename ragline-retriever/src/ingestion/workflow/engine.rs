//! The per-file workflow engine.
//!
//! [`WorkflowEngine::process_file`] is the entry point for one discovered
//! file. Dependencies (store, embedding provider, document loader) are passed
//! in at construction; the engine holds no global state besides the set of
//! execution ids it is currently driving.

use super::journal::WorkflowJournal;
use super::retry::RetryPolicy;
use super::state::{
    CheckExistsOutput, ChunkSet, Checkpoints, EmbeddingSet, ExecutionRecord, ExecutionState,
    FailureKind, FileOutcome, PreparedChunk, SkipReason, Step,
};
use super::WorkflowError;
use crate::config::{IngestionConfig, RagConfig};
use crate::ingestion::discovery::{FileDescriptor, hash_file};
use crate::ingestion::loader::{DocumentLoader, FileLoader, LoadedDocument, LoadedPage};
use crate::ingestion::queue::FileQueue;
use crate::storage::sqlite_store::SaveReport;
use crate::storage::{NewChunk, SourceFile, SqliteStore, StorageError, chunk_id, parse_file_hash};
use chrono::Utc;
use half::f16;
use ragline_context::{RecursiveSplitter, normalize_text};
use ragline_embed::{EmbedError, EmbeddingProvider};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

type Result<T> = std::result::Result<T, WorkflowError>;

enum Flow {
    Done(FileOutcome),
    Cancelled,
    /// Stopped on purpose after a given step
    Paused,
}

pub struct WorkflowEngine {
    store: SqliteStore,
    journal: WorkflowJournal,
    provider: Arc<dyn EmbeddingProvider>,
    loader: Arc<dyn DocumentLoader>,
    splitter: RecursiveSplitter,
    config: IngestionConfig,
    retry: RetryPolicy,
    in_flight: Mutex<HashSet<String>>,
}

/// Holds an execution id in the in-flight set until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    execution_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.execution_id);
    }
}

impl WorkflowEngine {
    pub fn new(
        store: SqliteStore,
        provider: Arc<dyn EmbeddingProvider>,
        config: &RagConfig,
    ) -> Result<Self> {
        let splitter = RecursiveSplitter::new(config.chunking.splitter_config())?;
        Ok(Self {
            journal: WorkflowJournal::new(&store),
            store,
            provider,
            loader: Arc::new(FileLoader),
            splitter,
            config: config.ingestion.clone(),
            retry: RetryPolicy::from_config(&config.ingestion),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn with_loader(mut self, loader: Arc<dyn DocumentLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn journal(&self) -> &WorkflowJournal {
        &self.journal
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    fn claim(&self, execution_id: &str) -> Option<InFlight<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !set.insert(execution_id.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            execution_id: execution_id.to_string(),
        })
    }

    /// Process one file.
    ///
    /// - unseen content runs all five steps
    /// - content whose execution succeeded and is still stored is a cache hit
    /// - a failed execution reports its failure without running again
    /// - a non-terminal execution resumes at its first missing checkpoint
    ///
    /// Per-file failures come back as [`FileOutcome::Failed`]; `Err` is only
    /// returned when the journal itself cannot be written.
    pub async fn process_file(
        &self,
        file: &FileDescriptor,
        run_id: Option<&str>,
    ) -> Result<FileOutcome> {
        let execution_id = file.execution_id();
        let path = file.path_string();
        let Some(_guard) = self.claim(&execution_id) else {
            debug!(execution_id = %execution_id, "Execution already in flight");
            return Ok(FileOutcome::AlreadyRunning { path });
        };

        let record = self.journal.ensure_pending(file, run_id).await?;
        match record.state {
            ExecutionState::Succeeded => {
                if let Some(previous) = &record.output {
                    if self.output_still_valid(file, previous).await? {
                        debug!(execution_id = %execution_id, path = %path, "Cache hit");
                        return Ok(FileOutcome::Cached {
                            path,
                            previous: Box::new(previous.clone()),
                        });
                    }
                }
                info!(
                    execution_id = %execution_id,
                    path = %path,
                    "Content no longer in the index, running again"
                );
                self.journal.fork_from(&execution_id, Step::CheckExists).await?;
            }
            ExecutionState::Failed(kind) => {
                debug!(execution_id = %execution_id, kind = kind.as_str(), "Execution previously failed");
                return Ok(FileOutcome::Failed {
                    path,
                    kind,
                    error: record.error.unwrap_or_default(),
                });
            }
            ExecutionState::Cancelled => return Ok(FileOutcome::Cancelled { path }),
            ExecutionState::Pending
            | ExecutionState::Running
            | ExecutionState::Checkpointed(_) => {}
        }

        self.drive(file, &record).await
    }

    /// Continue a cancelled, retries-exhausted or interrupted execution from
    /// its first missing checkpoint.
    pub async fn resume(&self, execution_id: &str) -> Result<FileOutcome> {
        let record = self.require(execution_id).await?;
        match record.state {
            ExecutionState::Cancelled | ExecutionState::Failed(FailureKind::RetriesExhausted) => {}
            ExecutionState::Failed(FailureKind::Unrecoverable) => {
                return Err(WorkflowError::ForkRequired(execution_id.to_string()));
            }
            ExecutionState::Succeeded => {
                return Err(WorkflowError::NotResumable {
                    execution_id: execution_id.to_string(),
                    state: record.state,
                });
            }
            ExecutionState::Pending
            | ExecutionState::Running
            | ExecutionState::Checkpointed(_) => {}
        }

        let _guard = self
            .claim(execution_id)
            .ok_or_else(|| WorkflowError::AlreadyRunning(execution_id.to_string()))?;
        if record.state.is_terminal() {
            self.journal.reopen(execution_id).await?;
        }
        info!(execution_id, from = %record.state, "Resuming execution");
        let file = descriptor_for(&record)?;
        self.drive(&file, &record).await
    }

    /// Drop the checkpoints of `from` and later steps and run the execution
    /// again from there. Works on any terminal execution and is the only way
    /// to re-run one that failed unrecoverably.
    pub async fn fork(&self, execution_id: &str, from: Step) -> Result<FileOutcome> {
        let record = self.require(execution_id).await?;
        if !record.state.is_terminal() {
            return Err(WorkflowError::NotResumable {
                execution_id: execution_id.to_string(),
                state: record.state,
            });
        }

        let _guard = self
            .claim(execution_id)
            .ok_or_else(|| WorkflowError::AlreadyRunning(execution_id.to_string()))?;
        let dropped = self.journal.fork_from(execution_id, from).await?;
        info!(execution_id, from = %from, dropped, "Forked execution");
        let file = descriptor_for(&record)?;
        self.drive(&file, &record).await
    }

    /// Mark a non-terminal execution cancelled. A running execution sees this
    /// before its next step. Returns false if the execution was already
    /// terminal.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        self.require(execution_id).await?;
        let cancelled = self.journal.cancel(execution_id).await?;
        if cancelled {
            info!(execution_id, "Execution cancelled");
        }
        Ok(cancelled)
    }

    /// Resume every execution a crash left `PENDING`, `RUNNING` or
    /// `CHECKPOINTED`, on a bounded queue.
    pub async fn recover(self: &Arc<Self>) -> Result<Vec<FileOutcome>> {
        let incomplete = self.journal.list_incomplete().await?;
        if incomplete.is_empty() {
            return Ok(Vec::new());
        }
        info!("Recovering {} interrupted executions", incomplete.len());

        let mut queue = FileQueue::new(self.config.worker_concurrency);
        for record in incomplete {
            let engine = Arc::clone(self);
            let label = record.file_path.clone();
            queue.submit(label, async move { engine.resume(&record.execution_id).await });
        }

        let mut outcomes = Vec::new();
        for (path, result) in queue.drain().await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    error!(path = %path, error = %err, "Recovery failed");
                    outcomes.push(FileOutcome::Failed {
                        kind: if err.is_transient() {
                            FailureKind::RetriesExhausted
                        } else {
                            FailureKind::Unrecoverable
                        },
                        error: err.to_string(),
                        path,
                    });
                }
            }
        }
        Ok(outcomes)
    }

    /// Run `file`'s execution up to and including `last` and leave it
    /// `CHECKPOINTED` there, exactly as a crash right after that step would.
    /// Errors are returned rather than recorded.
    pub async fn advance_to(
        &self,
        file: &FileDescriptor,
        run_id: Option<&str>,
        last: Step,
    ) -> Result<ExecutionRecord> {
        let execution_id = file.execution_id();
        let _guard = self
            .claim(&execution_id)
            .ok_or_else(|| WorkflowError::AlreadyRunning(execution_id.clone()))?;
        let record = self.journal.ensure_pending(file, run_id).await?;
        if record.state.is_terminal() {
            return Err(WorkflowError::NotResumable {
                execution_id,
                state: record.state,
            });
        }
        self.journal.mark_running(&execution_id).await?;
        let checkpoints = self.load_checkpoints(&execution_id).await?;
        self.run_steps(file, &record, checkpoints, Some(last)).await?;
        self.require(&execution_id).await
    }

    async fn require(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.journal
            .get(execution_id)
            .await?
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn load_checkpoints(&self, execution_id: &str) -> Result<Checkpoints> {
        let records = self.journal.completed_steps(execution_id).await?;
        if let Some(last) = records.last() {
            debug!(execution_id, step = %last.step, "Found checkpoints");
        }
        Checkpoints::from_records(&records)
    }

    /// Run the remaining steps and record the terminal state.
    async fn drive(&self, file: &FileDescriptor, record: &ExecutionRecord) -> Result<FileOutcome> {
        let execution_id = record.execution_id.as_str();
        let path = file.path_string();

        if !self.journal.mark_running(execution_id).await? {
            return Ok(FileOutcome::Cancelled { path });
        }

        let result = match self.load_checkpoints(execution_id).await {
            Ok(checkpoints) => self.run_steps(file, record, checkpoints, None).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(Flow::Done(outcome)) => {
                let recorded = self
                    .journal
                    .finish(execution_id, ExecutionState::Succeeded, Some(&outcome), None)
                    .await?;
                if !recorded {
                    info!(execution_id, "Execution cancelled during its last step");
                    return Ok(FileOutcome::Cancelled { path });
                }
                match &outcome {
                    FileOutcome::Success { chunks, report, .. } => info!(
                        execution_id,
                        path = %path,
                        chunks,
                        inserted = report.chunks_inserted,
                        superseded = report.chunks_superseded,
                        moved = report.chunks_moved,
                        "File ingested"
                    ),
                    other => info!(execution_id, path = %path, outcome = other.label(), "File skipped"),
                }
                Ok(outcome)
            }
            Ok(Flow::Cancelled) | Ok(Flow::Paused) => {
                info!(execution_id, path = %path, "Execution cancelled");
                Ok(FileOutcome::Cancelled { path })
            }
            Err(err) => {
                let kind = if err.is_transient() {
                    FailureKind::RetriesExhausted
                } else {
                    FailureKind::Unrecoverable
                };
                let message = err.to_string();
                error!(
                    execution_id,
                    path = %path,
                    failure = kind.as_str(),
                    error = %message,
                    "Execution failed"
                );
                let outcome = FileOutcome::Failed {
                    path,
                    kind,
                    error: message.clone(),
                };
                self.journal
                    .finish(
                        execution_id,
                        ExecutionState::Failed(kind),
                        Some(&outcome),
                        Some(&message),
                    )
                    .await?;
                Ok(outcome)
            }
        }
    }

    /// Returns false if the execution was cancelled and the step must not run.
    async fn begin_step(&self, execution_id: &str, step: Step) -> Result<bool> {
        if self.journal.is_cancelled(execution_id).await? {
            info!(execution_id, step = %step, "Cancellation observed before step");
            return Ok(false);
        }
        debug!(execution_id, step = %step, "Running step");
        Ok(true)
    }

    async fn commit<T: serde::Serialize>(
        &self,
        execution_id: &str,
        step: Step,
        output: &T,
        attempts: u32,
    ) -> Result<bool> {
        let value = serde_json::to_value(output)?;
        self.journal
            .checkpoint(execution_id, step, &value, attempts)
            .await
    }

    async fn within<T, E, F>(&self, step: Step, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<WorkflowError>,
    {
        let limit = self.config.step_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(WorkflowError::StepTimeout {
                step,
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    async fn run_steps(
        &self,
        file: &FileDescriptor,
        record: &ExecutionRecord,
        checkpoints: Checkpoints,
        stop_after: Option<Step>,
    ) -> Result<Flow> {
        let id = record.execution_id.as_str();
        let path = file.path_string();
        let Checkpoints {
            check_exists,
            document,
            chunks,
            embeddings,
            save,
        } = checkpoints;

        // 1. check_exists
        let check = match check_exists {
            Some(out) => out,
            None => {
                if !self.begin_step(id, Step::CheckExists).await? {
                    return Ok(Flow::Cancelled);
                }
                let out = CheckExistsOutput {
                    already_processed: self.content_is_live(&file.hash).await?,
                };
                if !self.commit(id, Step::CheckExists, &out, 1).await? {
                    return Ok(Flow::Cancelled);
                }
                if stop_after == Some(Step::CheckExists) {
                    return Ok(Flow::Paused);
                }
                out
            }
        };
        if check.already_processed {
            return Ok(Flow::Done(FileOutcome::Skipped {
                path,
                reason: SkipReason::AlreadyProcessed,
            }));
        }

        // 2. load_and_normalize
        let document = match document {
            Some(doc) => doc,
            None => {
                if !self.begin_step(id, Step::LoadAndNormalize).await? {
                    return Ok(Flow::Cancelled);
                }
                let loaded = self
                    .within(Step::LoadAndNormalize, self.loader.load(file))
                    .await?;
                let doc = normalize_document(loaded);
                if !self.commit(id, Step::LoadAndNormalize, &doc, 1).await? {
                    return Ok(Flow::Cancelled);
                }
                if stop_after == Some(Step::LoadAndNormalize) {
                    return Ok(Flow::Paused);
                }
                doc
            }
        };
        if document.is_empty() {
            return Ok(Flow::Done(FileOutcome::Skipped {
                path,
                reason: SkipReason::NoContent,
            }));
        }

        // 3. chunk
        let chunks = match chunks {
            Some(set) => set,
            None => {
                if !self.begin_step(id, Step::Chunk).await? {
                    return Ok(Flow::Cancelled);
                }
                let set = self.chunk_document(file, &document);
                debug!(execution_id = id, chunks = set.chunks.len(), "Chunked document");
                if !self.commit(id, Step::Chunk, &set, 1).await? {
                    return Ok(Flow::Cancelled);
                }
                if stop_after == Some(Step::Chunk) {
                    return Ok(Flow::Paused);
                }
                set
            }
        };
        if chunks.chunks.is_empty() {
            return Ok(Flow::Done(FileOutcome::Skipped {
                path,
                reason: SkipReason::NoChunks,
            }));
        }

        // 4. embed
        let embeddings = match embeddings {
            Some(set) => set,
            None => {
                if !self.begin_step(id, Step::Embed).await? {
                    return Ok(Flow::Cancelled);
                }
                let (set, attempts) = self.embed_chunks(id, &chunks).await?;
                if !self.commit(id, Step::Embed, &set, attempts).await? {
                    return Ok(Flow::Cancelled);
                }
                if stop_after == Some(Step::Embed) {
                    return Ok(Flow::Paused);
                }
                set
            }
        };

        // 5. save
        let report = match save {
            Some(report) => report,
            None => {
                if !self.begin_step(id, Step::Save).await? {
                    return Ok(Flow::Cancelled);
                }
                let report = self
                    .save_chunks(file, record, &document, &chunks, &embeddings)
                    .await?;
                if !self.commit(id, Step::Save, &report, 1).await? {
                    return Ok(Flow::Cancelled);
                }
                report
            }
        };

        Ok(Flow::Done(FileOutcome::Success {
            path,
            chunks: chunks.chunks.len(),
            report,
        }))
    }

    /// Whether some stored source with this content still exists on disk.
    async fn content_is_live(&self, file_hash: &[u8; 32]) -> Result<bool> {
        for path in self.store.paths_with_content(file_hash).await? {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn output_still_valid(&self, file: &FileDescriptor, output: &FileOutcome) -> Result<bool> {
        Ok(match output {
            // Decided by the content alone.
            FileOutcome::Skipped {
                reason: SkipReason::NoContent | SkipReason::NoChunks,
                ..
            } => true,
            FileOutcome::Success { .. } | FileOutcome::Skipped { .. } => {
                self.content_is_live(&file.hash).await?
            }
            _ => false,
        })
    }

    fn chunk_document(&self, file: &FileDescriptor, document: &LoadedDocument) -> ChunkSet {
        let mut chunks = Vec::new();
        for page in &document.pages {
            for text in self.splitter.split_text(&page.text) {
                let index = chunks.len();
                chunks.push(PreparedChunk {
                    chunk_id: chunk_id(&file.hash, index),
                    index,
                    page: page.page,
                    text,
                });
            }
        }
        ChunkSet { chunks }
    }

    async fn embed_chunks(&self, execution_id: &str, chunks: &ChunkSet) -> Result<(EmbeddingSet, u32)> {
        let descriptor = self.provider.model_descriptor();
        self.store.check_model(&descriptor).await?;

        let texts: Vec<String> = chunks.chunks.iter().map(|c| c.text.clone()).collect();
        let limit = self.config.step_timeout();
        let (result, attempts) = self
            .retry
            .run(Step::Embed.as_str(), |attempt| {
                let texts = &texts;
                async move {
                    debug!(execution_id, attempt, chunks = texts.len(), "Embedding chunks");
                    match tokio::time::timeout(limit, self.provider.embed_texts(texts)).await {
                        Ok(result) => result.map_err(WorkflowError::from),
                        Err(_) => Err(WorkflowError::StepTimeout {
                            step: Step::Embed,
                            timeout_ms: limit.as_millis() as u64,
                        }),
                    }
                }
            })
            .await?;

        if result.len() != texts.len() {
            return Err(EmbedError::from(anyhow::anyhow!(
                "provider returned {} vectors for {} chunks",
                result.len(),
                texts.len()
            ))
            .into());
        }
        if let Some(bad) = result
            .embeddings
            .iter()
            .find(|v| v.len() != descriptor.dimension)
        {
            return Err(EmbedError::DimensionMismatch {
                expected: descriptor.dimension,
                actual: bad.len(),
            }
            .into());
        }

        let vectors = result
            .embeddings
            .iter()
            .map(|v| v.iter().map(|x| x.to_f32()).collect())
            .collect();
        Ok((
            EmbeddingSet {
                model_id: descriptor.id(),
                dimension: descriptor.dimension,
                vectors,
            },
            attempts,
        ))
    }

    async fn save_chunks(
        &self,
        file: &FileDescriptor,
        record: &ExecutionRecord,
        document: &LoadedDocument,
        chunks: &ChunkSet,
        embeddings: &EmbeddingSet,
    ) -> Result<SaveReport> {
        let descriptor = self.provider.model_descriptor();
        if embeddings.model_id != descriptor.id() {
            return Err(StorageError::ModelMismatch {
                stored: embeddings.model_id.clone(),
                requested: descriptor.id(),
            }
            .into());
        }
        if embeddings.vectors.len() != chunks.chunks.len() {
            return Err(WorkflowError::CorruptCheckpoint(format!(
                "{} embeddings for {} chunks",
                embeddings.vectors.len(),
                chunks.chunks.len()
            )));
        }

        self.verify_unchanged(file).await?;

        let new_chunks: Vec<NewChunk> = chunks
            .chunks
            .iter()
            .zip(&embeddings.vectors)
            .map(|(chunk, vector)| NewChunk {
                chunk_id: chunk.chunk_id.clone(),
                chunk_index: chunk.index,
                page: chunk.page,
                content: chunk.text.clone(),
                embedding: vector.iter().map(|x| f16::from_f32(*x)).collect(),
                extra: document.metadata.clone(),
            })
            .collect();

        let source = SourceFile {
            path: file.path_string(),
            file_hash: file.hash,
            size: file.size,
            file_type: document.file_type.clone(),
            model_id: descriptor.id(),
            run_id: record.last_run_id.clone(),
            last_ingested_at: Utc::now(),
        };

        self.within(
            Step::Save,
            self.store.replace_source(
                &source,
                &descriptor,
                &self.config.pipeline_version,
                &new_chunks,
            ),
        )
        .await
    }

    /// The file must still hash to the content that was chunked and embedded.
    async fn verify_unchanged(&self, file: &FileDescriptor) -> Result<()> {
        let path: PathBuf = file.path.clone();
        let current = tokio::task::spawn_blocking(move || hash_file(&path)).await?;
        let expected = file.hash_hex();
        let found = match current {
            Ok((hash, _)) if hash == file.hash => return Ok(()),
            Ok((hash, _)) => hex::encode(hash),
            Err(err) => format!("unreadable ({err})"),
        };
        warn!(
            path = %file.path.display(),
            expected = %expected,
            found = %found,
            "Source changed since it was read, leaving stored chunks untouched"
        );
        Err(WorkflowError::StaleSource {
            path: file.path_string(),
            expected,
            found,
        })
    }
}

/// Descriptor for an execution's recorded content, not whatever is on disk
/// now. The save step's hash check catches the difference.
fn descriptor_for(record: &ExecutionRecord) -> Result<FileDescriptor> {
    let path = PathBuf::from(&record.file_path);
    Ok(FileDescriptor {
        extension: Path::new(&record.file_path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default(),
        path,
        hash: parse_file_hash(&record.file_hash)?,
        size: record.file_size,
    })
}

fn normalize_document(loaded: LoadedDocument) -> LoadedDocument {
    LoadedDocument {
        pages: loaded
            .pages
            .into_iter()
            .map(|page| LoadedPage {
                page: page.page,
                text: normalize_text(&page.text),
            })
            .filter(|page| !page.text.is_empty())
            .collect(),
        ..loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ragline_embed::{EmbedConfig, HashingProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    fn test_config() -> RagConfig {
        let mut config = RagConfig::default();
        config.embedding = EmbedConfig::hashing(32);
        config.chunking.chunk_size = 80;
        config.chunking.chunk_overlap = 10;
        config.ingestion.backoff_initial_ms = 1;
        config.ingestion.backoff_max_ms = 2;
        config
    }

    async fn engine() -> (TempDir, WorkflowEngine) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("index.db")).await.unwrap();
        let provider = Arc::new(HashingProvider::new(32));
        let engine = WorkflowEngine::new(store, provider, &test_config()).unwrap();
        (dir, engine)
    }

    fn write(dir: &TempDir, name: &str, text: &str) -> FileDescriptor {
        let path = dir.path().join(name);
        std::fs::write(&path, text).unwrap();
        FileDescriptor::from_path(&path).unwrap()
    }

    const TEXT: &str = "Ragline stores chunks in SQLite.\n\nEach chunk carries an embedding \
                        and its source path.\n\nQueries are embedded with the same model.";

    /// Fails with a transient error a fixed number of times.
    struct FlakyLoader {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl DocumentLoader for FlakyLoader {
        async fn load(
            &self,
            file: &FileDescriptor,
        ) -> std::result::Result<LoadedDocument, crate::ingestion::loader::LoadError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(crate::ingestion::loader::LoadError::Io {
                    path: file.path.clone(),
                    source: std::io::Error::other("disk hiccup"),
                });
            }
            FileLoader.load(file).await
        }
    }

    #[tokio::test]
    async fn test_process_file_runs_all_steps() {
        let (dir, engine) = engine().await;
        let file = write(&dir, "a.txt", TEXT);

        let outcome = engine.process_file(&file, Some("run-1")).await.unwrap();
        let FileOutcome::Success { chunks, report, .. } = &outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(*chunks >= 2);
        assert_eq!(report.chunks_inserted as usize, *chunks);

        let record = engine.journal().get(&file.execution_id()).await.unwrap().unwrap();
        assert_eq!(record.state, ExecutionState::Succeeded);
        assert_eq!(record.output.as_ref(), Some(&outcome));
        let steps = engine.journal().completed_steps(&record.execution_id).await.unwrap();
        assert_eq!(
            steps.iter().map(|s| s.step).collect::<Vec<_>>(),
            Step::ALL.to_vec()
        );

        let source = engine.store().source_file(&file.path_string()).await.unwrap().unwrap();
        assert_eq!(source.run_id.as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn test_unchanged_file_is_a_cache_hit() {
        let (dir, engine) = engine().await;
        let file = write(&dir, "a.txt", TEXT);
        engine.process_file(&file, None).await.unwrap();
        let chunks = engine.store().count_chunks().await.unwrap();

        let again = engine.process_file(&file, None).await.unwrap();
        assert!(matches!(again, FileOutcome::Cached { .. }));
        assert_eq!(engine.store().count_chunks().await.unwrap(), chunks);
        assert_eq!(engine.journal().list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_file_is_skipped() {
        let (dir, engine) = engine().await;
        let file = write(&dir, "blank.txt", " \n\n\t \n");
        let outcome = engine.process_file(&file, None).await.unwrap();
        assert!(matches!(
            outcome,
            FileOutcome::Skipped {
                reason: SkipReason::NoContent,
                ..
            }
        ));
        assert_eq!(engine.store().count_chunks().await.unwrap(), 0);

        // Cached without running again.
        assert!(matches!(
            engine.process_file(&file, None).await.unwrap(),
            FileOutcome::Cached { .. }
        ));
    }

    #[tokio::test]
    async fn test_stored_content_is_already_processed() {
        let (dir, engine) = engine().await;
        let first = write(&dir, "a.txt", TEXT);
        engine.process_file(&first, None).await.unwrap();

        // Same bytes at another path share the execution. Forking it from
        // the start finds the content already stored under a.txt.
        let copy = write(&dir, "b.txt", TEXT);
        assert_eq!(copy.execution_id(), first.execution_id());
        engine
            .fork(&copy.execution_id(), Step::CheckExists)
            .await
            .unwrap();
        let record = engine.journal().get(&copy.execution_id()).await.unwrap().unwrap();
        assert!(matches!(
            record.output,
            Some(FileOutcome::Skipped {
                reason: SkipReason::AlreadyProcessed,
                ..
            })
        ));
        assert!(engine.store().source_file(&copy.path_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_then_resume() {
        let (dir, engine) = engine().await;
        let engine = engine.with_loader(Arc::new(FlakyLoader {
            failures: AtomicUsize::new(1),
        }));
        let file = write(&dir, "a.txt", TEXT);

        let outcome = engine.process_file(&file, None).await.unwrap();
        assert!(matches!(
            outcome,
            FileOutcome::Failed {
                kind: FailureKind::RetriesExhausted,
                ..
            }
        ));

        // Resubmitting reports the failure instead of retrying silently.
        assert!(matches!(
            engine.process_file(&file, None).await.unwrap(),
            FileOutcome::Failed { .. }
        ));

        let resumed = engine.resume(&file.execution_id()).await.unwrap();
        assert!(matches!(resumed, FileOutcome::Success { .. }));
        let record = engine.journal().get(&file.execution_id()).await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_unrecoverable_requires_fork() {
        let (dir, engine) = engine().await;
        let file = write(&dir, "a.txt", TEXT);
        engine.advance_to(&file, None, Step::Embed).await.unwrap();
        std::fs::write(&file.path, "changed underneath").unwrap();

        let outcome = engine.resume(&file.execution_id()).await.unwrap();
        assert!(matches!(
            outcome,
            FileOutcome::Failed {
                kind: FailureKind::Unrecoverable,
                ..
            }
        ));
        assert!(matches!(
            engine.resume(&file.execution_id()).await,
            Err(WorkflowError::ForkRequired(_))
        ));

        // Restore the content and fork from save.
        std::fs::write(&file.path, TEXT).unwrap();
        let forked = engine.fork(&file.execution_id(), Step::Save).await.unwrap();
        assert!(matches!(forked, FileOutcome::Success { .. }));
        let record = engine.journal().get(&file.execution_id()).await.unwrap().unwrap();
        assert_eq!(record.fork_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_next_step() {
        let (dir, engine) = engine().await;
        let file = write(&dir, "a.txt", TEXT);
        let record = engine.advance_to(&file, None, Step::Chunk).await.unwrap();
        assert_eq!(record.state, ExecutionState::Checkpointed(Step::Chunk));

        assert!(engine.cancel(&record.execution_id).await.unwrap());
        assert!(matches!(
            engine.process_file(&file, None).await.unwrap(),
            FileOutcome::Cancelled { .. }
        ));
        assert_eq!(engine.store().count_chunks().await.unwrap(), 0);

        let resumed = engine.resume(&record.execution_id).await.unwrap();
        assert!(matches!(resumed, FileOutcome::Success { .. }));
        assert!(!engine.cancel(&record.execution_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_finishes_interrupted_executions() {
        let (dir, engine) = engine().await;
        let a = write(&dir, "a.txt", TEXT);
        let b = write(&dir, "b.txt", "A second, shorter document.");
        engine.advance_to(&a, None, Step::LoadAndNormalize).await.unwrap();
        engine.advance_to(&b, None, Step::Embed).await.unwrap();

        let engine = Arc::new(engine);
        let outcomes = engine.recover().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(
            outcomes
                .iter()
                .all(|o| matches!(o, FileOutcome::Success { .. }))
        );
        assert!(engine.journal().list_incomplete().await.unwrap().is_empty());
        assert!(engine.recover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_execution_errors() {
        let (_dir, engine) = engine().await;
        assert!(matches!(
            engine.resume("process-missing").await,
            Err(WorkflowError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            engine.cancel("process-missing").await,
            Err(WorkflowError::ExecutionNotFound(_))
        ));
    }

    #[test]
    fn test_normalize_document_drops_blank_pages() {
        let doc = LoadedDocument {
            file_type: "pdf".into(),
            pages: vec![
                LoadedPage {
                    page: Some(1),
                    text: "  one \u{0}\n\n\n\ntwo ".into(),
                },
                LoadedPage {
                    page: Some(2),
                    text: " \t ".into(),
                },
            ],
            metadata: Default::default(),
        };
        let normalized = normalize_document(doc);
        assert_eq!(normalized.pages.len(), 1);
        // Only the ends are trimmed; a space before a line break stays.
        assert_eq!(normalized.pages[0].text, "one \n\ntwo");
    }
}
