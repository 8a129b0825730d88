//! Whitespace normalization shared by ingestion and query preprocessing.

use regex::Regex;
use std::sync::LazyLock;

/// Any run of whitespace that does not contain a newline.
static INLINE_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\S\n]+").expect("static pattern is valid"));

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("static pattern is valid"));

/// Normalize document text before chunking.
///
/// - NUL bytes are removed (PDF extraction emits them occasionally)
/// - runs of non-newline whitespace become a single space
/// - three or more consecutive newlines become a paragraph break
/// - leading and trailing whitespace is trimmed
///
/// Running it twice gives the same result as running it once.
pub fn normalize_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let without_nul = text.replace('\0', "");
    let spaced = INLINE_WHITESPACE.replace_all(&without_nul, " ");
    let paragraphs = EXCESS_NEWLINES.replace_all(&spaced, "\n\n");
    paragraphs.trim().to_string()
}

/// Collapse every run of whitespace (newlines included) to one space.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
