//! End-to-end tests over a real database file: folder ingestion, crash and
//! resume, the stale-source check and retrieval on top of what was stored.

use anyhow::Result;
use async_trait::async_trait;
use half::f16;
use ragline_embed::{
    EmbedConfig, EmbeddingProvider, EmbeddingResult, HashingProvider, LexicalReranker,
    ModelDescriptor,
};
use ragline_retriever::{
    config::RagConfig,
    ingestion::{
        DocumentLoader, ExecutionState, FailureKind, FileDescriptor, FileLoader, FileOutcome,
        IngestionEngine, LoadError, LoadedDocument, Step, WorkflowEngine, WorkflowError,
    },
    retrieval::{RetrievalEngine, RetrievalError, RetrievalRequest},
    storage::{SqliteStore, chunk_id},
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::{TempDir, tempdir};

const DIM: usize = 64;

fn test_config(db: &Path) -> RagConfig {
    let mut config = RagConfig::default();
    config.database.path = db.to_path_buf();
    config.embedding = EmbedConfig::hashing(DIM);
    config.ingestion.backoff_initial_ms = 1;
    config.ingestion.backoff_max_ms = 2;
    config
}

/// A folder of documents plus a database file next to it.
struct Fixture {
    dir: TempDir,
    config: RagConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        let config = test_config(&dir.path().join("index.db"));
        Self { dir, config }
    }

    fn docs(&self) -> std::path::PathBuf {
        self.dir.path().join("docs")
    }

    fn write(&self, name: &str, text: &str) -> FileDescriptor {
        let path = self.docs().join(name);
        std::fs::write(&path, text).unwrap();
        FileDescriptor::from_path(&path).unwrap()
    }

    async fn store(&self) -> SqliteStore {
        SqliteStore::open(&self.config.database.path).await.unwrap()
    }

    async fn ingestion(&self) -> IngestionEngine {
        IngestionEngine::from_config(
            self.store().await,
            Arc::new(HashingProvider::new(DIM)),
            &self.config,
        )
        .unwrap()
    }

    async fn retrieval(&self) -> RetrievalEngine {
        RetrievalEngine::new(
            self.store().await,
            Arc::new(HashingProvider::new(DIM)),
            Arc::new(LexicalReranker::default()),
            self.config.retrieval.clone(),
        )
    }
}

fn two_thousand_chars() -> String {
    (0..400).map(|i| format!("w{i:03} ")).collect()
}

/// Counts loads, then defers to the real loader.
#[derive(Default)]
struct CountingLoader {
    loads: AtomicUsize,
}

#[async_trait]
impl DocumentLoader for CountingLoader {
    async fn load(&self, file: &FileDescriptor) -> Result<LoadedDocument, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        FileLoader.load(file).await
    }
}

/// Counts embedding calls, then defers to the hashing provider.
struct CountingProvider {
    inner: HashingProvider,
    calls: AtomicUsize,
}

impl CountingProvider {
    fn new() -> Self {
        Self {
            inner: HashingProvider::new(DIM),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    async fn embed_texts(&self, texts: &[String]) -> ragline_embed::Result<EmbeddingResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed_texts(texts).await
    }

    fn embedding_dimension(&self) -> usize {
        self.inner.embedding_dimension()
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn model_descriptor(&self) -> ModelDescriptor {
        self.inner.model_descriptor()
    }
}

/// Same model identity as the hashing provider, wrong vector length.
struct TruncatingProvider(HashingProvider);

#[async_trait]
impl EmbeddingProvider for TruncatingProvider {
    async fn embed_texts(&self, texts: &[String]) -> ragline_embed::Result<EmbeddingResult> {
        let full = self.0.embed_texts(texts).await?;
        Ok(EmbeddingResult::new(
            full.embeddings
                .into_iter()
                .map(|v| v.into_iter().take(DIM / 2).collect::<Vec<f16>>())
                .collect(),
        ))
    }

    fn embedding_dimension(&self) -> usize {
        DIM
    }

    fn provider_name(&self) -> &str {
        "hashing"
    }

    fn model_descriptor(&self) -> ModelDescriptor {
        self.0.model_descriptor()
    }
}

#[tokio::test]
async fn test_two_thousand_char_document_end_to_end() -> Result<()> {
    let fx = Fixture::new();
    fx.write("doc.txt", &two_thousand_chars());
    let engine = fx.ingestion().await;

    let first = engine.ingest_folder(&fx.docs(), None).await?;
    assert_eq!(first.counters.files_found, 1);
    assert_eq!(first.counters.processed, 1);
    assert_eq!(engine.store().count_chunks().await?, 3);

    let second = engine.ingest_folder(&fx.docs(), None).await?;
    assert_eq!(second.counters.processed, 0);
    assert_eq!(second.counters.cached, 1);
    assert_eq!(engine.store().count_chunks().await?, 3);

    let response = fx
        .retrieval()
        .await
        .retrieve(&RetrievalRequest::new("test query").with_top_k(2))
        .await?;
    assert!(response.results.len() <= 2);
    assert!(!response.results.is_empty());
    for pair in response.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    for result in &response.results {
        assert!(result.metadata.source_path.ends_with("doc.txt"));
    }
    Ok(())
}

#[tokio::test]
async fn test_reingesting_unchanged_folder_adds_nothing() -> Result<()> {
    let fx = Fixture::new();
    fx.write("a.md", "# Alpha\n\nAlpha covers the first topic in some detail.");
    fx.write("b.txt", "Beta is about something else entirely.");
    let engine = fx.ingestion().await;

    engine.ingest_folder(&fx.docs(), None).await?;
    let chunks = engine.store().count_chunks().await?;
    let sources = engine.store().stats().await?.source_files;

    for _ in 0..2 {
        let summary = engine.ingest_folder(&fx.docs(), None).await?;
        assert_eq!(summary.counters.cached, 2);
        assert_eq!(summary.counters.processed, 0);
        assert_eq!(engine.store().count_chunks().await?, chunks);
        assert_eq!(engine.store().stats().await?.source_files, sources);
    }

    // A changed file supersedes its own chunks and nothing else.
    fx.write("b.txt", "Beta now talks about gamma instead.");
    let summary = engine.ingest_folder(&fx.docs(), None).await?;
    assert_eq!(summary.counters.processed, 1);
    assert_eq!(summary.counters.cached, 1);
    let b_chunks = engine
        .store()
        .chunks_for_source(&fx.docs().join("b.txt").canonicalize()?.to_string_lossy())
        .await?;
    assert!(b_chunks.iter().all(|c| c.content.contains("gamma")));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_workers_store_every_file() -> Result<()> {
    let fx = Fixture::new();
    for i in 0..12 {
        fx.write(
            &format!("note-{i:02}.txt"),
            &format!("Note {i} describes topic number {i} and nothing else."),
        );
    }
    assert_eq!(fx.config.ingestion.worker_concurrency, 3);
    let engine = fx.ingestion().await;

    let summary = engine.ingest_folder(&fx.docs(), None).await?;
    let failed: Vec<_> = summary
        .outcomes
        .iter()
        .filter(|o| matches!(o, FileOutcome::Failed { .. }))
        .collect();
    assert!(failed.is_empty(), "failed outcomes: {failed:?}");
    assert_eq!(summary.counters.failed, 0);
    assert_eq!(summary.counters.processed, 12);
    assert_eq!(engine.store().stats().await?.source_files, 12);
    Ok(())
}

#[tokio::test]
async fn test_renamed_file_keeps_its_chunks() -> Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", &two_thousand_chars());
    let engine = fx.ingestion().await;
    engine.ingest_folder(&fx.docs(), None).await?;
    assert_eq!(engine.store().count_chunks().await?, 3);

    std::fs::rename(fx.docs().join("a.txt"), fx.docs().join("b.txt"))?;
    let b_path = fx.docs().join("b.txt").canonicalize()?;
    let b_path = b_path.to_string_lossy();

    let summary = engine.ingest_folder(&fx.docs(), None).await?;
    assert_eq!(summary.counters.failed, 0);
    assert_eq!(engine.store().count_chunks().await?, 3);
    let stored = engine.store().chunks_for_source(&b_path).await?;
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|c| c.extra["source_path"] == b_path));
    assert_eq!(engine.store().stats().await?.source_files, 1);

    let again = engine.ingest_folder(&fx.docs(), None).await?;
    assert_eq!(again.counters.cached, 1);
    assert_eq!(engine.store().count_chunks().await?, 3);

    let response = fx
        .retrieval()
        .await
        .retrieve(&RetrievalRequest::new("w001 w002").with_top_k(3))
        .await?;
    assert!(!response.results.is_empty());
    assert!(response.results.iter().all(|r| r.metadata.source_path == b_path));
    Ok(())
}

#[tokio::test]
async fn test_chunk_ids_depend_only_on_content_and_position() -> Result<()> {
    let text = two_thousand_chars();
    let mut seen = Vec::new();
    for _ in 0..2 {
        let fx = Fixture::new();
        let file = fx.write("same.txt", &text);
        let engine = fx.ingestion().await;
        engine.ingest_folder(&fx.docs(), None).await?;

        let folder = fx.docs().canonicalize()?;
        let source = engine
            .store()
            .source_paths_under(&folder.to_string_lossy())
            .await?;
        assert_eq!(source.len(), 1);
        let chunks = engine.store().chunks_for_source(&source[0]).await?;
        for chunk in &chunks {
            assert_eq!(chunk.chunk_id, chunk_id(&file.hash, chunk.chunk_index));
        }
        seen.push(chunks.into_iter().map(|c| c.chunk_id).collect::<Vec<_>>());
    }
    assert_eq!(seen[0], seen[1]);

    let other = chunk_id(blake3::hash(b"different").as_bytes(), 0);
    assert!(!seen[0].contains(&other));
    Ok(())
}

#[tokio::test]
async fn test_retrieval_is_deterministic() -> Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", "Checkpoints are written after every step of a file.");
    fx.write("b.txt", "Resume continues from the last written checkpoint.");
    fx.write("c.txt", "Fork drops later checkpoints and runs them again.");
    fx.ingestion().await.ingest_folder(&fx.docs(), None).await?;

    let request = RetrievalRequest::new("resume from checkpoint").with_top_k(3);
    let ranked = |response: ragline_retriever::retrieval::RetrievalResponse| {
        response
            .results
            .into_iter()
            .map(|r| (r.chunk_id, r.score.to_bits()))
            .collect::<Vec<_>>()
    };

    let engine = fx.retrieval().await;
    let first = ranked(engine.retrieve(&request).await?);
    let second = ranked(engine.retrieve(&request).await?);
    let fresh = ranked(fx.retrieval().await.retrieve(&request).await?);
    assert_eq!(first, second);
    assert_eq!(first, fresh);
    Ok(())
}

#[tokio::test]
async fn test_wrong_dimension_query_is_rejected() -> Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", "Some indexed text.");
    fx.ingestion().await.ingest_folder(&fx.docs(), None).await?;

    let engine = RetrievalEngine::new(
        fx.store().await,
        Arc::new(TruncatingProvider(HashingProvider::new(DIM))),
        Arc::new(LexicalReranker::default()),
        fx.config.retrieval.clone(),
    );
    let err = engine
        .retrieve(&RetrievalRequest::new("indexed text"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RetrievalError::EmbeddingDimensionMismatch {
            expected: DIM,
            actual
        } if actual == DIM / 2
    ));
    assert!(!err.is_unavailable());
    Ok(())
}

#[tokio::test]
async fn test_resume_after_chunk_skips_finished_steps() -> Result<()> {
    let fx = Fixture::new();
    let file = fx.write("doc.txt", &two_thousand_chars());
    let execution_id = file.execution_id();

    // First process: stop right after the chunk checkpoint, as if killed.
    {
        let loader = Arc::new(CountingLoader::default());
        let engine = WorkflowEngine::new(
            fx.store().await,
            Arc::new(HashingProvider::new(DIM)),
            &fx.config,
        )?
        .with_loader(loader.clone());
        let record = engine.advance_to(&file, Some("run-1"), Step::Chunk).await?;
        assert_eq!(record.state, ExecutionState::Checkpointed(Step::Chunk));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(engine.store().count_chunks().await?, 0);
    }

    // Second process on the same database file.
    let loader = Arc::new(CountingLoader::default());
    let provider = Arc::new(CountingProvider::new());
    let engine = WorkflowEngine::new(fx.store().await, provider.clone(), &fx.config)?
        .with_loader(loader.clone());
    let before = engine.journal().completed_steps(&execution_id).await?;
    assert_eq!(before.len(), 3);

    let outcome = engine.resume(&execution_id).await?;
    assert!(matches!(outcome, FileOutcome::Success { chunks: 3, .. }));
    assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    assert!(provider.calls.load(Ordering::SeqCst) >= 1);

    let after = engine.journal().completed_steps(&execution_id).await?;
    assert_eq!(after.len(), 5);
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.step, new.step);
        assert_eq!(old.completed_at, new.completed_at);
    }
    assert_eq!(engine.store().count_chunks().await?, 3);
    Ok(())
}

#[tokio::test]
async fn test_source_changed_before_save_is_not_written() -> Result<()> {
    let fx = Fixture::new();
    let v1 = fx.write("doc.txt", "Version one of the document.");
    let engine = WorkflowEngine::new(
        fx.store().await,
        Arc::new(HashingProvider::new(DIM)),
        &fx.config,
    )?;
    engine.process_file(&v1, None).await?;

    // v2 gets as far as embed, then the file changes again underneath it.
    let v2 = fx.write("doc.txt", "Version two of the document.");
    engine.advance_to(&v2, None, Step::Embed).await?;
    fx.write("doc.txt", "Version three, written by someone else.");

    let outcome = engine.resume(&v2.execution_id()).await?;
    assert!(matches!(
        outcome,
        FileOutcome::Failed {
            kind: FailureKind::Unrecoverable,
            ..
        }
    ));

    let stored = engine.store().chunks_for_source(&v1.path_string()).await?;
    assert!(!stored.is_empty());
    assert!(stored.iter().all(|c| c.file_hash == v1.hash));

    assert!(matches!(
        engine.resume(&v2.execution_id()).await,
        Err(WorkflowError::ForkRequired(_))
    ));
    Ok(())
}
