//! Text preparation for the ragline index.
//!
//! Two stages run before anything is embedded:
//!
//! 1. [`normalize`] cleans up extracted document text (NUL bytes, runs of blank
//!    space, excessive blank lines) so that chunk boundaries depend on content
//!    rather than on how a loader happened to emit whitespace.
//! 2. [`text`] splits the normalized text into overlapping chunks with a
//!    recursive character splitter.
//!
//! ```
//! use ragline_context::{RecursiveSplitter, SplitterConfig, normalize_text};
//!
//! let raw = "Intro\n\n\n\nBody   text\twith  gaps\0";
//! let clean = normalize_text(raw);
//! assert_eq!(clean, "Intro\n\nBody text with gaps");
//!
//! let splitter = RecursiveSplitter::new(SplitterConfig::default()).unwrap();
//! let chunks = splitter.chunks(&clean);
//! assert_eq!(chunks.len(), 1);
//! ```

pub mod normalize;
pub mod text;

pub use normalize::{collapse_whitespace, normalize_text};
pub use text::{
    DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DEFAULT_SEPARATORS, RecursiveSplitter,
    SplitterConfig, SplitterError, TextChunk,
};
