//! Object storage for intermediate pipeline artifacts.
//!
//! The pipeline only needs three operations: upload a text object, download one, and list
//! objects under a prefix. `LocalObjectStore` implements them over a directory tree and
//! hands out `file://` URLs. Object paths are always relative, `/`-separated keys.

use natord::compare;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error on object '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Object '{0}' does not exist.")]
    NotFound(String),
    #[error("Object path '{0}' must be a relative key without '..' components.")]
    InvalidPath(String),
    #[error("Object '{0}' is not valid UTF-8 text.")]
    NotText(String),
}

/// A capability for storing and retrieving text artifacts.
pub trait ObjectStore {
    /// Stores `content` under `path`, replacing any previous object, and returns its URL.
    fn upload_string(&self, content: &str, path: &str) -> Result<String, StorageError>;

    fn download_as_text(&self, path: &str) -> Result<String, StorageError>;

    /// Object keys starting with `prefix`, in natural order.
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// An object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let key = Path::new(path);
        let valid = !path.is_empty()
            && key
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> Result<(), StorageError> {
        let entries = fs::read_dir(dir).map_err(|source| StorageError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let key = relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalObjectStore {
    fn upload_string(&self, content: &str, path: &str) -> Result<String, StorageError> {
        let target = self.resolve(path)?;
        let io_error = |source| StorageError::Io {
            path: path.to_string(),
            source,
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(&target, content).map_err(io_error)?;
        log::debug!("Stored {} bytes at {:?}", content.len(), target);
        Ok(format!("file://{}", target.display()))
    }

    fn download_as_text(&self, path: &str) -> Result<String, StorageError> {
        let target = self.resolve(path)?;
        let bytes = fs::read(&target).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                StorageError::Io {
                    path: path.to_string(),
                    source,
                }
            }
        })?;
        String::from_utf8(bytes).map_err(|_| StorageError::NotText(path.to_string()))
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        if self.root.is_dir() {
            self.collect_keys(&self.root, &mut keys)?;
        }
        keys.retain(|key| key.starts_with(prefix));
        keys.sort_by(|a, b| compare(a, b));
        Ok(keys)
    }
}

/// The categories of artifacts a pipeline run may persist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    ProcessedBetaTable,
    CellProportions,
    AdjustedBetaTable,
    RawClockOutput,
    AdjustedClockOutput,
    EpigenTlResults,
}

impl ArtifactKind {
    fn category(self) -> &'static str {
        match self {
            Self::ProcessedBetaTable => "processed_beta_table",
            Self::CellProportions => "cell_proportions",
            Self::AdjustedBetaTable => "adjusted_beta_table",
            Self::RawClockOutput | Self::AdjustedClockOutput => "biolearn_output",
            Self::EpigenTlResults => "epigentl_results",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::ProcessedBetaTable => "processed",
            Self::CellProportions => "cell_proportions",
            Self::AdjustedBetaTable => "adjusted",
            Self::RawClockOutput => "raw_clocks",
            Self::AdjustedClockOutput => "adjusted_clocks",
            Self::EpigenTlResults => "epigentl_results",
        }
    }
}

/// The storage key of one artifact of one batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactPath {
    pub kind: ArtifactKind,
    pub batch_name: String,
}

impl ArtifactPath {
    pub fn new(kind: ArtifactKind, batch_name: impl Into<String>) -> Self {
        Self {
            kind,
            batch_name: batch_name.into(),
        }
    }
}

impl fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}_{}.csv",
            self.kind.category(),
            self.batch_name,
            self.kind.suffix()
        )
    }
}
