//! Recursive character splitting with overlap.
//!
//! The splitter tries each separator in order (paragraph, line, word, and
//! finally individual characters). Text is split on the first separator that
//! occurs in it; pieces that still exceed the chunk size are split again with
//! the remaining separators. Small pieces are then merged greedily back into
//! chunks of at most `chunk_size` characters, carrying up to `chunk_overlap`
//! characters of trailing context from one chunk into the next.
//!
//! Separators are kept at the start of the piece that follows them, and every
//! emitted chunk is whitespace-trimmed. Lengths are measured in `char`s.
//!
//! ```
//! use ragline_context::text::{RecursiveSplitter, SplitterConfig};
//!
//! let config = SplitterConfig {
//!     chunk_size: 20,
//!     chunk_overlap: 5,
//!     ..SplitterConfig::default()
//! };
//! let splitter = RecursiveSplitter::new(config).unwrap();
//! let chunks = splitter.split_text("alpha beta gamma delta epsilon zeta");
//! assert!(chunks.iter().all(|c| c.chars().count() <= 20));
//! assert_eq!(chunks.first().map(String::as_str), Some("alpha beta gamma"));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

pub const DEFAULT_CHUNK_SIZE: usize = 800;
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

/// Paragraph, line, word, character.
pub const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitterConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separators: Vec<String>,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitterError {
    ZeroChunkSize,
    OverlapTooLarge { chunk_size: usize, chunk_overlap: usize },
}

impl fmt::Display for SplitterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitterError::ZeroChunkSize => write!(f, "chunk_size must be greater than zero"),
            SplitterError::OverlapTooLarge {
                chunk_size,
                chunk_overlap,
            } => write!(
                f,
                "chunk_overlap ({chunk_overlap}) must be smaller than chunk_size ({chunk_size})"
            ),
        }
    }
}

impl std::error::Error for SplitterError {}

/// One chunk of a document, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Zero-based position of the chunk within its document.
    pub sequence: usize,
    pub text: String,
    pub char_len: usize,
}

#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    config: SplitterConfig,
}

impl RecursiveSplitter {
    pub fn new(config: SplitterConfig) -> Result<Self, SplitterError> {
        if config.chunk_size == 0 {
            return Err(SplitterError::ZeroChunkSize);
        }
        if config.chunk_overlap >= config.chunk_size {
            return Err(SplitterError::OverlapTooLarge {
                chunk_size: config.chunk_size,
                chunk_overlap: config.chunk_overlap,
            });
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// Split `text` into chunk strings.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_with(text, &self.config.separators)
    }

    /// Split `text` and number the resulting chunks.
    pub fn chunks(&self, text: &str) -> Vec<TextChunk> {
        self.split_text(text)
            .into_iter()
            .enumerate()
            .map(|(sequence, text)| TextChunk {
                sequence,
                char_len: char_len(&text),
                text,
            })
            .collect()
    }

    fn split_with(&self, text: &str, separators: &[String]) -> Vec<String> {
        let mut separator = separators.last().cloned().unwrap_or_default();
        let mut remaining: &[String] = &[];
        for (i, candidate) in separators.iter().enumerate() {
            if candidate.is_empty() {
                separator = String::new();
                break;
            }
            if text.contains(candidate.as_str()) {
                separator = candidate.clone();
                remaining = &separators[i + 1..];
                break;
            }
        }

        let mut final_chunks = Vec::new();
        let mut good_splits: Vec<String> = Vec::new();
        for split in split_keeping_separator(text, &separator) {
            if char_len(&split) < self.config.chunk_size {
                good_splits.push(split);
                continue;
            }
            if !good_splits.is_empty() {
                final_chunks.extend(self.merge_splits(&good_splits));
                good_splits.clear();
            }
            if remaining.is_empty() {
                final_chunks.push(split);
            } else {
                final_chunks.extend(self.split_with(&split, remaining));
            }
        }
        if !good_splits.is_empty() {
            final_chunks.extend(self.merge_splits(&good_splits));
        }
        final_chunks
    }

    /// Greedily join small pieces into chunks, keeping up to `chunk_overlap`
    /// characters of the previous chunk at the head of the next one.
    fn merge_splits(&self, splits: &[String]) -> Vec<String> {
        let size = self.config.chunk_size;
        let overlap = self.config.chunk_overlap;

        let mut docs = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for split in splits {
            let len = char_len(split);
            if total + len > size && !current.is_empty() {
                if let Some(doc) = join_trimmed(&current) {
                    docs.push(doc);
                }
                while total > overlap || (total + len > size && total > 0) {
                    match current.pop_front() {
                        Some(front) => total -= char_len(front),
                        None => break,
                    }
                }
            }
            current.push_back(split);
            total += len;
        }
        if let Some(doc) = join_trimmed(&current) {
            docs.push(doc);
        }
        docs
    }
}

impl Default for RecursiveSplitter {
    fn default() -> Self {
        Self {
            config: SplitterConfig::default(),
        }
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn join_trimmed(parts: &VecDeque<&str>) -> Option<String> {
    let joined: String = parts.iter().copied().collect();
    let trimmed = joined.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Split on `separator`, attaching each separator to the piece after it.
/// An empty separator splits into single characters.
fn split_keeping_separator(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return text.chars().map(String::from).collect();
    }
    let mut parts = text.split(separator);
    let mut out = Vec::new();
    if let Some(first) = parts.next() {
        out.push(first.to_string());
    }
    out.extend(parts.map(|p| format!("{separator}{p}")));
    out.retain(|s| !s.is_empty());
    out
}
