//! Persistent storage for ragline.
//!
//! One SQLite database holds everything: source files, chunks with their
//! embeddings, the embedding model registry, ingestion runs and the workflow
//! journal. [`sqlite_store::SqliteStore`] owns the schema and the pool; the
//! workflow journal borrows the same pool.
//!
//! ```text
//! source_files ──< chunks          index_metadata (model registry)
//! ingestion_runs ──< workflow_executions ──< workflow_steps
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod sqlite_store;

pub use sqlite_store::SqliteStore;

/// blake3 digest of a file's bytes.
pub type FileHash = [u8; 32];

/// Hex length of a chunk id (8 bytes of blake3 output).
pub const CHUNK_ID_LEN: usize = 16;

/// Deterministic chunk identifier.
///
/// First 16 hex characters of `blake3("{file_hash_hex}:{index}")`. The same
/// content split the same way always yields the same ids, which is what makes
/// re-ingestion idempotent.
pub fn chunk_id(file_hash: &FileHash, index: usize) -> String {
    let key = format!("{}:{}", hex::encode(file_hash), index);
    let digest = blake3::hash(key.as_bytes());
    let mut id = digest.to_hex().to_string();
    id.truncate(CHUNK_ID_LEN);
    id
}

pub fn parse_file_hash(hex_str: &str) -> Result<FileHash, StorageError> {
    let bytes = hex::decode(hex_str)
        .map_err(|_| StorageError::Corrupt(format!("invalid hex hash: {hex_str}")))?;
    bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt("hash must be 32 bytes (64 hex characters)".into()))
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(
        "embedding model mismatch: index was built with {stored}, refusing to use {requested}"
    )]
    ModelMismatch { stored: String, requested: String },

    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Busy/locked databases, pool exhaustion and I/O hiccups clear up on
    /// their own; everything else is a real failure.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(err) => match err {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(db) => {
                    matches!(db.code().as_deref(), Some("5") | Some("6"))
                        || db.message().contains("locked")
                }
                _ => false,
            },
            _ => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A file whose chunks are in the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFile {
    pub path: String,
    #[serde(with = "hex_hash")]
    pub file_hash: FileHash,
    pub size: u64,
    pub file_type: String,
    pub model_id: String,
    pub run_id: Option<String>,
    pub last_ingested_at: DateTime<Utc>,
}

/// Chunk ready to be written by the save step.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_id: String,
    pub chunk_index: usize,
    pub page: Option<u32>,
    pub content: String,
    pub embedding: Vec<half::f16>,
    pub extra: BTreeMap<String, String>,
}

/// A stored chunk as read back for scoring.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub rowid: i64,
    pub chunk_id: String,
    pub source_path: String,
    pub file_hash: FileHash,
    pub chunk_index: usize,
    pub page: Option<u32>,
    pub file_type: String,
    pub ingestion_version: String,
    pub model_id: String,
    pub content: String,
    pub embedding: Vec<half::f16>,
    pub extra: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Filter on chunk metadata.
///
/// `source_path`, `file_type` and `page` are indexed columns and can be
/// applied in SQL. `extra` keys live in a JSON column and are matched in
/// memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    /// Exact path, or a trailing path suffix such as `docs/guide.md`
    pub source_path: Option<String>,
    pub file_type: Option<String>,
    pub page: Option<u32>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.source_path.is_none()
            && self.file_type.is_none()
            && self.page.is_none()
            && self.extra.is_empty()
    }

    pub fn has_indexed_terms(&self) -> bool {
        self.source_path.is_some() || self.file_type.is_some() || self.page.is_some()
    }

    /// Only the indexed-column part of this filter.
    pub fn indexed_only(&self) -> MetadataFilter {
        MetadataFilter {
            extra: BTreeMap::new(),
            ..self.clone()
        }
    }

    pub fn matches_indexed(&self, chunk: &StoredChunk) -> bool {
        if let Some(source) = &self.source_path {
            if !path_matches(&chunk.source_path, source) {
                return false;
            }
        }
        if let Some(file_type) = &self.file_type {
            if !chunk.file_type.eq_ignore_ascii_case(file_type) {
                return false;
            }
        }
        if let Some(page) = self.page {
            if chunk.page != Some(page) {
                return false;
            }
        }
        true
    }

    pub fn matches_extra(&self, chunk: &StoredChunk) -> bool {
        self.extra
            .iter()
            .all(|(key, value)| chunk.extra.get(key) == Some(value))
    }

    pub fn matches(&self, chunk: &StoredChunk) -> bool {
        self.matches_indexed(chunk) && self.matches_extra(chunk)
    }
}

pub(crate) fn path_matches(stored: &str, wanted: &str) -> bool {
    stored == wanted
        || stored
            .strip_suffix(wanted)
            .is_some_and(|prefix| prefix.ends_with('/'))
}

/// Registered identity of the embedding model an index was built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddingModelRecord {
    pub model_id: String,
    pub provider: String,
    pub model_name: String,
    pub model_version: String,
    pub dimension: usize,
    pub normalized: bool,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Complete => "COMPLETE",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETE" => Ok(RunStatus::Complete),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(StorageError::Corrupt(format!("unknown run status {other}"))),
        }
    }
}

/// Per-run file counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub files_found: u64,
    pub processed: u64,
    pub skipped: u64,
    pub cached: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCounter {
    FilesFound,
    Processed,
    Skipped,
    Cached,
    Failed,
    Cancelled,
}

impl RunCounter {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            RunCounter::FilesFound => "files_found",
            RunCounter::Processed => "processed",
            RunCounter::Skipped => "skipped",
            RunCounter::Cached => "cached",
            RunCounter::Failed => "failed",
            RunCounter::Cancelled => "cancelled",
        }
    }
}

/// One ingestion run over a folder. Written by the ingestion engine only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionRun {
    pub run_id: String,
    pub folder: String,
    pub pipeline_version: String,
    pub model_id: String,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub source_files: u64,
    pub chunks: u64,
    pub runs: u64,
    pub executions_by_state: BTreeMap<String, u64>,
    pub model: Option<EmbeddingModelRecord>,
}

pub(crate) mod hex_hash {
    use super::FileHash;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(hash: &FileHash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_is_pure() {
        let hash = *blake3::hash(b"some file").as_bytes();
        let a = chunk_id(&hash, 0);
        assert_eq!(a, chunk_id(&hash, 0));
        assert_eq!(a.len(), CHUNK_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, chunk_id(&hash, 1));

        let other = *blake3::hash(b"other file").as_bytes();
        assert_ne!(a, chunk_id(&other, 0));
    }

    #[test]
    fn test_chunk_id_matches_definition() {
        let hash = [7u8; 32];
        let expected = blake3::hash(format!("{}:3", hex::encode(hash)).as_bytes()).to_hex();
        assert_eq!(chunk_id(&hash, 3), &expected[..16]);
    }

    #[test]
    fn test_parse_file_hash() {
        let hash = [0xabu8; 32];
        assert_eq!(parse_file_hash(&hex::encode(hash)).unwrap(), hash);
        assert!(parse_file_hash("abcd").is_err());
        assert!(parse_file_hash("zz").is_err());
    }

    #[test]
    fn test_path_matches_suffix_on_component_boundary() {
        assert!(path_matches("/data/docs/guide.md", "/data/docs/guide.md"));
        assert!(path_matches("/data/docs/guide.md", "docs/guide.md"));
        assert!(path_matches("/data/docs/guide.md", "guide.md"));
        assert!(!path_matches("/data/docs/myguide.md", "guide.md"));
        assert!(!path_matches("/data/docs/guide.md", "other.md"));
    }

    #[test]
    fn test_run_status_round_trip_names() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Complete,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<RunStatus>().is_err());
    }
}
