//! Document loaders.
//!
//! Plain text and markdown load as a single page-less document. PDFs go
//! through text extraction and are split into pages on form feeds.

use super::discovery::FileDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedPage {
    /// 1-based page number, `None` for formats without pages
    pub page: Option<u32>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedDocument {
    pub file_type: String,
    pub pages: Vec<LoadedPage>,
    /// Attached to every chunk of the document
    pub metadata: BTreeMap<String, String>,
}

impl LoadedDocument {
    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(|p| p.text.trim().is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to extract text from {path}: {message}")]
    Pdf { path: PathBuf, message: String },

    #[error("no loader for .{extension} files ({path})")]
    Unsupported { path: PathBuf, extension: String },

    #[error("loader task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl LoadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LoadError::Io { .. })
    }
}

/// Turns a discovered file into text.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load(&self, file: &FileDescriptor) -> Result<LoadedDocument, LoadError>;
}

/// Loads `.txt`, `.md` and `.pdf` files from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileLoader;

#[async_trait]
impl DocumentLoader for FileLoader {
    async fn load(&self, file: &FileDescriptor) -> Result<LoadedDocument, LoadError> {
        let path = file.path.clone();
        let extension = file.extension.clone();
        let pages = tokio::task::spawn_blocking(move || -> Result<Vec<LoadedPage>, LoadError> {
            let bytes = std::fs::read(&path).map_err(|source| LoadError::Io {
                path: path.clone(),
                source,
            })?;
            match extension.as_str() {
                "txt" | "md" | "markdown" => Ok(vec![LoadedPage {
                    page: None,
                    text: String::from_utf8_lossy(&bytes).into_owned(),
                }]),
                "pdf" => {
                    let text = pdf_extract::extract_text_from_mem(&bytes).map_err(|e| {
                        LoadError::Pdf {
                            path: path.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    Ok(split_pdf_pages(&text))
                }
                _ => Err(LoadError::Unsupported { path, extension }),
            }
        })
        .await??;

        let mut metadata = BTreeMap::new();
        metadata.insert("source_path".to_string(), file.path_string());
        metadata.insert("file_hash".to_string(), file.hash_hex());
        metadata.insert("file_size".to_string(), file.size.to_string());

        Ok(LoadedDocument {
            file_type: file.extension.clone(),
            pages,
            metadata,
        })
    }
}

/// pdf-extract separates pages with form feeds.
fn split_pdf_pages(text: &str) -> Vec<LoadedPage> {
    text.split('\x0c')
        .enumerate()
        .map(|(i, page)| LoadedPage {
            page: Some(i as u32 + 1),
            text: page.to_string(),
        })
        .filter(|page| !page.text.trim().is_empty())
        .collect()
}
