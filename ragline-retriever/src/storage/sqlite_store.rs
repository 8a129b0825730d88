//! SQLite implementation of the ragline store.
//!
//! Chunks are scored by brute force: [`SqliteStore::scan_chunks`] streams
//! rows in `id` (insertion) order and the retrieval engine computes distances
//! in memory. The scan order is therefore the tie-break order for equal
//! scores.
//!
//! Embeddings are stored as f16 blobs, two bytes per dimension in native byte
//! order (little-endian on every target we build for).

use super::{
    EmbeddingModelRecord, FileHash, IndexStats, IngestionRun, MetadataFilter, NewChunk,
    RunCounter, RunCounters, RunStatus, SourceFile, StorageError, StorageResult, StoredChunk,
    parse_file_hash,
};
use chrono::{DateTime, Utc};
use half::f16;
use ragline_embed::ModelDescriptor;
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const MODEL_KEY: &str = "embedding_model";
const SCHEMA_KEY: &str = "schema_version";
const SCHEMA_VERSION: &str = "1";

const CHUNK_COLUMNS: &str = "id, chunk_id, source_path, file_hash, chunk_index, page, file_type, \
     ingestion_version, model_id, content, embedding, metadata_json, created_at";

/// Rows written by one save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SaveReport {
    pub chunks_inserted: u64,
    pub chunks_superseded: u64,
    /// Chunks taken over from another path holding the same content
    #[serde(default)]
    pub chunks_moved: u64,
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `db_path`.
    pub async fn open(db_path: &Path) -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .busy_timeout(Duration::from_secs(5))
                    .foreign_keys(true)
                    .create_if_missing(true)
                    .auto_vacuum(SqliteAutoVacuum::Full)
                    .page_size(1 << 16),
            )
            .await?;
        Self::new_with_pool(pool).await
    }

    /// Private in-memory database. A single connection that never expires,
    /// since every new in-memory connection would see an empty database.
    pub async fn open_memory() -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await?;
        Self::new_with_pool(pool).await
    }

    async fn new_with_pool(pool: SqlitePool) -> StorageResult<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_tables(pool: &SqlitePool) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS index_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_files (
                path TEXT PRIMARY KEY,
                file_hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                file_type TEXT NOT NULL,
                model_id TEXT NOT NULL,
                run_id TEXT,
                last_ingested_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chunk_id TEXT NOT NULL UNIQUE,
                source_path TEXT NOT NULL,
                file_hash TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                page INTEGER,
                file_type TEXT NOT NULL,
                ingestion_version TEXT NOT NULL,
                model_id TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                FOREIGN KEY (source_path) REFERENCES source_files(path) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingestion_runs (
                run_id TEXT PRIMARY KEY,
                folder TEXT NOT NULL,
                pipeline_version TEXT NOT NULL,
                model_id TEXT NOT NULL,
                status TEXT NOT NULL,
                files_found INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                cached INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                cancelled INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_executions (
                execution_id TEXT PRIMARY KEY,
                file_path TEXT NOT NULL,
                file_hash TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                state TEXT NOT NULL,
                current_step TEXT,
                failure_kind TEXT,
                error TEXT,
                output_json TEXT,
                last_run_id TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                fork_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_steps (
                execution_id TEXT NOT NULL,
                step TEXT NOT NULL,
                step_order INTEGER NOT NULL,
                status TEXT NOT NULL,
                output_json TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                completed_at TEXT NOT NULL,
                PRIMARY KEY (execution_id, step),
                FOREIGN KEY (execution_id) REFERENCES workflow_executions(execution_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source_path)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_file_type ON chunks(file_type)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_page ON chunks(page)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_file_hash ON chunks(file_hash)",
            "CREATE INDEX IF NOT EXISTS idx_sources_hash ON source_files(file_hash)",
            "CREATE INDEX IF NOT EXISTS idx_exec_state ON workflow_executions(state)",
            "CREATE INDEX IF NOT EXISTS idx_exec_run ON workflow_executions(last_run_id)",
        ] {
            sqlx::query(statement).execute(pool).await?;
        }

        sqlx::query(
            "INSERT INTO index_metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(SCHEMA_KEY)
        .bind(SCHEMA_VERSION)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Ok(())
    }

    // ---- embedding model registry ----

    pub async fn registered_model(&self) -> StorageResult<Option<EmbeddingModelRecord>> {
        let mut conn = self.pool.acquire().await?;
        read_model(&mut conn).await
    }

    /// Register `descriptor` as this index's model, or confirm it matches
    /// the one already registered.
    pub async fn ensure_model(
        &self,
        descriptor: &ModelDescriptor,
    ) -> StorageResult<EmbeddingModelRecord> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let record = ensure_model_in(&mut tx, descriptor).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Fails with [`StorageError::ModelMismatch`] if a different model is
    /// registered. Never registers anything.
    pub async fn check_model(&self, descriptor: &ModelDescriptor) -> StorageResult<()> {
        match self.registered_model().await? {
            Some(stored) if stored.model_id != descriptor.id() => Err(StorageError::ModelMismatch {
                stored: stored.model_id,
                requested: descriptor.id(),
            }),
            _ => Ok(()),
        }
    }

    // ---- sources and chunks ----

    pub async fn source_file(&self, path: &str) -> StorageResult<Option<SourceFile>> {
        let row = sqlx::query(
            "SELECT path, file_hash, size, file_type, model_id, run_id, last_ingested_at
             FROM source_files WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| source_from_row(&r)).transpose()
    }

    /// Whether any stored source has exactly this content.
    pub async fn has_content(&self, file_hash: &FileHash) -> StorageResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM source_files WHERE file_hash = ?1 LIMIT 1")
                .bind(hex::encode(file_hash))
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Paths of stored sources with exactly this content.
    pub async fn paths_with_content(&self, file_hash: &FileHash) -> StorageResult<Vec<String>> {
        let paths = sqlx::query_scalar::<_, String>(
            "SELECT path FROM source_files WHERE file_hash = ?1 ORDER BY path",
        )
        .bind(hex::encode(file_hash))
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    /// Paths of stored sources that live under `folder`.
    pub async fn source_paths_under(&self, folder: &str) -> StorageResult<Vec<String>> {
        let prefix = format!("{}/%", escape_like(folder.trim_end_matches('/')));
        let paths = sqlx::query_scalar::<_, String>(
            "SELECT path FROM source_files WHERE path LIKE ?1 ESCAPE '\\' ORDER BY path",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    /// Write the chunks of one source file.
    ///
    /// In a single transaction: verify the model registry, upsert the source
    /// row, delete chunks left over from a previous version of the file, and
    /// insert the new chunks. A chunk id already stored for this path is left
    /// alone. One stored under another path (same content, e.g. after a
    /// rename) is moved to this path, and the other path's source row is
    /// dropped once it holds no chunks.
    pub async fn replace_source(
        &self,
        source: &SourceFile,
        model: &ModelDescriptor,
        ingestion_version: &str,
        chunks: &[NewChunk],
    ) -> StorageResult<SaveReport> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        ensure_model_in(&mut tx, model).await?;

        let file_hash_hex = hex::encode(source.file_hash);
        sqlx::query(
            r#"
            INSERT INTO source_files (path, file_hash, size, file_type, model_id, run_id, last_ingested_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(path) DO UPDATE SET
                file_hash = excluded.file_hash,
                size = excluded.size,
                file_type = excluded.file_type,
                model_id = excluded.model_id,
                run_id = excluded.run_id,
                last_ingested_at = excluded.last_ingested_at
            "#,
        )
        .bind(&source.path)
        .bind(&file_hash_hex)
        .bind(source.size as i64)
        .bind(&source.file_type)
        .bind(&source.model_id)
        .bind(&source.run_id)
        .bind(source.last_ingested_at)
        .execute(&mut *tx)
        .await?;

        let superseded = sqlx::query("DELETE FROM chunks WHERE source_path = ?1 AND file_hash != ?2")
            .bind(&source.path)
            .bind(&file_hash_hex)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let now = Utc::now();
        let mut inserted = 0u64;
        let mut moved = 0u64;
        let mut moved_from = BTreeSet::new();
        for chunk in chunks {
            if chunk.embedding.len() != model.dimension {
                return Err(StorageError::Corrupt(format!(
                    "chunk {} has dimension {}, index expects {}",
                    chunk.chunk_id,
                    chunk.embedding.len(),
                    model.dimension
                )));
            }
            let metadata_json = serde_json::to_string(&chunk.extra)?;

            let owner = sqlx::query_scalar::<_, String>(
                "SELECT source_path FROM chunks WHERE chunk_id = ?1",
            )
            .bind(&chunk.chunk_id)
            .fetch_optional(&mut *tx)
            .await?;
            match owner {
                Some(owner) if owner == source.path => continue,
                Some(owner) => {
                    sqlx::query(
                        "UPDATE chunks
                         SET source_path = ?1, file_type = ?2, ingestion_version = ?3,
                             metadata_json = ?4
                         WHERE chunk_id = ?5",
                    )
                    .bind(&source.path)
                    .bind(&source.file_type)
                    .bind(ingestion_version)
                    .bind(&metadata_json)
                    .bind(&chunk.chunk_id)
                    .execute(&mut *tx)
                    .await?;
                    moved += 1;
                    moved_from.insert(owner);
                    continue;
                }
                None => {}
            }

            let embedding_bytes = bytemuck::cast_slice::<f16, u8>(&chunk.embedding);
            inserted += sqlx::query(
                r#"
                INSERT INTO chunks (chunk_id, source_path, file_hash, chunk_index, page, file_type,
                                    ingestion_version, model_id, dimension, content, embedding,
                                    metadata_json, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(chunk_id) DO NOTHING
                "#,
            )
            .bind(&chunk.chunk_id)
            .bind(&source.path)
            .bind(&file_hash_hex)
            .bind(chunk.chunk_index as i64)
            .bind(chunk.page.map(i64::from))
            .bind(&source.file_type)
            .bind(ingestion_version)
            .bind(&source.model_id)
            .bind(model.dimension as i64)
            .bind(&chunk.content)
            .bind(embedding_bytes)
            .bind(metadata_json)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        for owner in &moved_from {
            sqlx::query(
                "DELETE FROM source_files WHERE path = ?1
                 AND NOT EXISTS (SELECT 1 FROM chunks WHERE source_path = ?1)",
            )
            .bind(owner)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(SaveReport {
            chunks_inserted: inserted,
            chunks_superseded: superseded,
            chunks_moved: moved,
        })
    }

    /// Remove a source file and its chunks.
    pub async fn delete_source(&self, path: &str) -> StorageResult<u64> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let removed = sqlx::query("DELETE FROM chunks WHERE source_path = ?1")
            .bind(path)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM source_files WHERE path = ?1")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// All chunks matching the indexed part of `filter`, in insertion order.
    pub async fn scan_chunks(&self, filter: &MetadataFilter) -> StorageResult<Vec<StoredChunk>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE 1 = 1"));

        if let Some(source) = &filter.source_path {
            query
                .push(" AND (source_path = ")
                .push_bind(source.clone())
                .push(" OR source_path LIKE ")
                .push_bind(format!("%/{}", escape_like(source)))
                .push(" ESCAPE '\\')");
        }
        if let Some(file_type) = &filter.file_type {
            query
                .push(" AND file_type = ")
                .push_bind(file_type.to_ascii_lowercase());
        }
        if let Some(page) = filter.page {
            query.push(" AND page = ").push_bind(i64::from(page));
        }
        query.push(" ORDER BY id");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(chunk_from_row).collect()
    }

    pub async fn chunks_for_source(&self, path: &str) -> StorageResult<Vec<StoredChunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE source_path = ?1 ORDER BY chunk_index"
        ))
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    pub async fn count_chunks(&self) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    // ---- ingestion runs ----

    pub async fn create_run(&self, run: &IngestionRun) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_runs (run_id, folder, pipeline_version, model_id, status, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.folder)
        .bind(&run.pipeline_version)
        .bind(&run.model_id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_run_status(&self, run_id: &str, status: RunStatus) -> StorageResult<()> {
        sqlx::query("UPDATE ingestion_runs SET status = ?1 WHERE run_id = ?2")
            .bind(status.as_str())
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn bump_run_counter(
        &self,
        run_id: &str,
        counter: RunCounter,
        by: u64,
    ) -> StorageResult<()> {
        let column = counter.column();
        sqlx::query(&format!(
            "UPDATE ingestion_runs SET {column} = {column} + ?1 WHERE run_id = ?2"
        ))
        .bind(by as i64)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE ingestion_runs SET status = ?1, error = ?2, finished_at = ?3 WHERE run_id = ?4",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> StorageResult<Option<IngestionRun>> {
        let row = sqlx::query("SELECT * FROM ingestion_runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    pub async fn list_runs(&self, limit: usize) -> StorageResult<Vec<IngestionRun>> {
        let rows =
            sqlx::query("SELECT * FROM ingestion_runs ORDER BY started_at DESC, run_id LIMIT ?1")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn stats(&self) -> StorageResult<IndexStats> {
        let source_files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM source_files")
            .fetch_one(&self.pool)
            .await?;
        let runs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingestion_runs")
            .fetch_one(&self.pool)
            .await?;
        let state_rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM workflow_executions GROUP BY state ORDER BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut executions_by_state = BTreeMap::new();
        for row in state_rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            executions_by_state.insert(state, n as u64);
        }

        Ok(IndexStats {
            source_files: source_files as u64,
            chunks: self.count_chunks().await?,
            runs: runs as u64,
            executions_by_state,
            model: self.registered_model().await?,
        })
    }
}

async fn read_model(
    conn: &mut sqlx::SqliteConnection,
) -> StorageResult<Option<EmbeddingModelRecord>> {
    let row = sqlx::query("SELECT value, updated_at FROM index_metadata WHERE key = ?1")
        .bind(MODEL_KEY)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let value: String = row.try_get("value")?;
    let registered_at: DateTime<Utc> = row.try_get("updated_at")?;
    let descriptor: ModelDescriptor = serde_json::from_str(&value)?;
    Ok(Some(EmbeddingModelRecord {
        model_id: descriptor.id(),
        provider: descriptor.provider,
        model_name: descriptor.model_name,
        model_version: descriptor.model_version,
        dimension: descriptor.dimension,
        normalized: descriptor.normalized,
        registered_at,
    }))
}

async fn ensure_model_in(
    tx: &mut Transaction<'_, Sqlite>,
    descriptor: &ModelDescriptor,
) -> StorageResult<EmbeddingModelRecord> {
    if let Some(stored) = read_model(tx).await? {
        if stored.model_id != descriptor.id() {
            return Err(StorageError::ModelMismatch {
                stored: stored.model_id,
                requested: descriptor.id(),
            });
        }
        return Ok(stored);
    }

    let now = Utc::now();
    sqlx::query("INSERT INTO index_metadata (key, value, updated_at) VALUES (?1, ?2, ?3)")
        .bind(MODEL_KEY)
        .bind(serde_json::to_string(descriptor)?)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    tracing::info!(model_id = %descriptor.id(), "Registered embedding model for index");

    Ok(EmbeddingModelRecord {
        model_id: descriptor.id(),
        provider: descriptor.provider.clone(),
        model_name: descriptor.model_name.clone(),
        model_version: descriptor.model_version.clone(),
        dimension: descriptor.dimension,
        normalized: descriptor.normalized,
        registered_at: now,
    })
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn decode_embedding(bytes: &[u8]) -> StorageResult<Vec<f16>> {
    if bytes.len() % 2 != 0 {
        return Err(StorageError::Corrupt(format!(
            "embedding blob has odd length {}",
            bytes.len()
        )));
    }
    Ok(match bytemuck::try_cast_slice::<u8, f16>(bytes) {
        Ok(aligned) => aligned.to_vec(),
        Err(_) => bytes
            .chunks_exact(2)
            .map(bytemuck::pod_read_unaligned::<f16>)
            .collect(),
    })
}

fn source_from_row(row: &SqliteRow) -> StorageResult<SourceFile> {
    let hash_hex: String = row.try_get("file_hash")?;
    let size: i64 = row.try_get("size")?;
    Ok(SourceFile {
        path: row.try_get("path")?,
        file_hash: parse_file_hash(&hash_hex)?,
        size: size as u64,
        file_type: row.try_get("file_type")?,
        model_id: row.try_get("model_id")?,
        run_id: row.try_get("run_id")?,
        last_ingested_at: row.try_get("last_ingested_at")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> StorageResult<StoredChunk> {
    let hash_hex: String = row.try_get("file_hash")?;
    let chunk_index: i64 = row.try_get("chunk_index")?;
    let page: Option<i64> = row.try_get("page")?;
    let embedding_bytes: Vec<u8> = row.try_get("embedding")?;
    let metadata_json: String = row.try_get("metadata_json")?;

    Ok(StoredChunk {
        rowid: row.try_get("id")?,
        chunk_id: row.try_get("chunk_id")?,
        source_path: row.try_get("source_path")?,
        file_hash: parse_file_hash(&hash_hex)?,
        chunk_index: chunk_index as usize,
        page: page.map(|p| p as u32),
        file_type: row.try_get("file_type")?,
        ingestion_version: row.try_get("ingestion_version")?,
        model_id: row.try_get("model_id")?,
        content: row.try_get("content")?,
        embedding: decode_embedding(&embedding_bytes)?,
        extra: serde_json::from_str(&metadata_json)?,
        created_at: row.try_get("created_at")?,
    })
}

fn run_from_row(row: &SqliteRow) -> StorageResult<IngestionRun> {
    let status: String = row.try_get("status")?;
    let counter = |name: &str| -> StorageResult<u64> {
        let value: i64 = row.try_get(name)?;
        Ok(value as u64)
    };
    Ok(IngestionRun {
        run_id: row.try_get("run_id")?,
        folder: row.try_get("folder")?,
        pipeline_version: row.try_get("pipeline_version")?,
        model_id: row.try_get("model_id")?,
        status: status.parse()?,
        counters: RunCounters {
            files_found: counter("files_found")?,
            processed: counter("processed")?,
            skipped: counter("skipped")?,
            cached: counter("cached")?,
            failed: counter("failed")?,
            cancelled: counter("cancelled")?,
        },
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}
