use super::error::{Result, RetrievalError};
use ragline_context::{collapse_whitespace, normalize_text};
use serde::Serialize;

/// A query as typed and as it will be embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedQuery {
    pub original: String,
    pub normalized: String,
}

/// Normalize the raw query the same way documents are normalized, then fold
/// all whitespace to single spaces.
pub fn preprocess_query(raw: &str) -> Result<PreparedQuery> {
    let normalized = collapse_whitespace(&normalize_text(raw));
    if normalized.is_empty() {
        return Err(RetrievalError::InvalidQuery(
            "query is empty after normalization".to_string(),
        ));
    }
    Ok(PreparedQuery {
        original: raw.to_string(),
        normalized,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_collapses_whitespace() {
        let q = preprocess_query("  what\tis\n\n\n  ragline?\u{0} ").unwrap();
        assert_eq!(q.normalized, "what is ragline?");
        assert_eq!(q.original, "  what\tis\n\n\n  ragline?\u{0} ");
    }

    #[test]
    fn test_blank_query_is_invalid() {
        for raw in ["", "   ", "\n\t\u{0}"] {
            assert!(matches!(
                preprocess_query(raw),
                Err(RetrievalError::InvalidQuery(_))
            ));
        }
    }
}
