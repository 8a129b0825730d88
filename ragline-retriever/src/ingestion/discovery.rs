//! Folder discovery.
//!
//! [`discover`] walks a folder lazily in sorted path order and yields one
//! [`FileDescriptor`] per matching file, hashing each file as it goes. An
//! unreadable file yields an `Err` item and the walk carries on.

use crate::storage::FileHash;
use ignore::{Walk, WalkBuilder};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// A file selected for ingestion, identified by its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub hash: FileHash,
    pub size: u64,
    /// Lowercase extension without the dot
    pub extension: String,
}

impl FileDescriptor {
    /// Build a descriptor by hashing the file at `path`.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let (hash, size) = hash_file(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            hash,
            size,
            extension: extension_of(path).unwrap_or_default(),
        })
    }

    pub fn path_string(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn execution_id(&self) -> String {
        crate::ingestion::workflow::execution_id(&self.hash)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("folder not found: {0}")]
    FolderNotFound(PathBuf),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("walk error: {0}")]
    Walk(#[from] ignore::Error),
}

impl DiscoveryError {
    /// Path of the file that failed, when the error concerns a single file.
    pub fn path(&self) -> Option<&Path> {
        match self {
            DiscoveryError::Unreadable { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// blake3 hash and byte length of the file at `path`.
pub fn hash_file(path: &Path) -> io::Result<(FileHash, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((*hasher.finalize().as_bytes(), size))
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Lazy iterator over the files of a folder. See [`discover`].
pub struct Discovery {
    walk: Walk,
    extensions: Vec<String>,
}

impl Iterator for Discovery {
    type Item = Result<FileDescriptor, DiscoveryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walk.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(DiscoveryError::Walk(err))),
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            let Some(extension) = extension_of(path) else {
                continue;
            };
            if !self.extensions.iter().any(|e| e == &extension) {
                continue;
            }

            return Some(match hash_file(path) {
                Ok((hash, size)) => Ok(FileDescriptor {
                    path: path.to_path_buf(),
                    hash,
                    size,
                    extension,
                }),
                Err(source) => Err(DiscoveryError::Unreadable {
                    path: path.to_path_buf(),
                    source,
                }),
            });
        }
    }
}

/// Walk `folder` and yield descriptors for files whose extension is in
/// `extensions` (case-insensitive, with or without a leading dot).
///
/// Hidden files and directories are skipped and symlinks are not followed.
/// Entries are visited in sorted path order so repeated runs see files in
/// the same sequence.
pub fn discover(folder: &Path, extensions: &[String]) -> Result<Discovery, DiscoveryError> {
    if !folder.exists() {
        return Err(DiscoveryError::FolderNotFound(folder.to_path_buf()));
    }
    if !folder.is_dir() {
        return Err(DiscoveryError::NotADirectory(folder.to_path_buf()));
    }

    let walk = WalkBuilder::new(folder)
        .standard_filters(false)
        .hidden(true)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    Ok(Discovery {
        walk,
        extensions: extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn default_extensions() -> Vec<String> {
        vec!["txt".into(), ".MD".into(), "pdf".into()]
    }

    #[test]
    fn test_discover_filters_and_sorts() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.md"), "a").unwrap();
        std::fs::write(dir.path().join("C.TXT"), "c").unwrap();
        std::fs::write(dir.path().join("image.png"), "x").unwrap();
        std::fs::write(dir.path().join("sub").join("d.txt"), "d").unwrap();
        std::fs::write(dir.path().join(".hidden.txt"), "h").unwrap();

        let found: Vec<FileDescriptor> = discover(dir.path(), &default_extensions())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|d| {
                d.path
                    .strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["C.TXT", "a.md", "b.txt", "sub/d.txt"]);
        assert_eq!(found[0].extension, "txt");
        assert_eq!(found[2].hash, *blake3::hash(b"b").as_bytes());
        assert_eq!(found[2].size, 1);
    }

    #[test]
    fn test_discover_missing_folder() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(
            discover(&missing, &default_extensions()),
            Err(DiscoveryError::FolderNotFound(_))
        ));

        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(
            discover(&file, &default_extensions()),
            Err(DiscoveryError::NotADirectory(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_does_not_stop_walk() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let locked = dir.path().join("a.txt");
        std::fs::write(&locked, "secret").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        std::fs::write(dir.path().join("b.txt"), "open").unwrap();

        // Root can read anything; nothing to check in that case.
        if File::open(&locked).is_ok() {
            return;
        }

        let items: Vec<_> = discover(dir.path(), &default_extensions())
            .unwrap()
            .collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Err(DiscoveryError::Unreadable { .. })));
        assert!(items[1].is_ok());
    }

    #[test]
    fn test_descriptor_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello").unwrap();
        let descriptor = FileDescriptor::from_path(&path).unwrap();
        assert_eq!(descriptor.hash_hex(), blake3::hash(b"hello").to_hex().as_str());
        assert_eq!(
            descriptor.execution_id(),
            format!("process-{}", descriptor.hash_hex())
        );
    }
}
