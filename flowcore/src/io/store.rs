//! Artifact storage keyed by logical, forward-slash paths.
//!
//! [`LocalArtifactStore`] resolves every key in three layers before touching
//! the filesystem:
//!
//! 1. [`clean_key`] drops empty, `.` and `..` segments.
//! 2. The same pass rejects segments on the sensitive-directory denylist.
//! 3. [`LocalArtifactStore::resolve`] joins only `Normal` path components onto
//!    the base directory and checks the result is still below it.
//!
//! Writes stage bytes in a scratch file named with
//! [`RESERVED_PREFIX`](crate::core::keys::RESERVED_PREFIX), which no key can
//! use, and then persist it over the target.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::keys::{
    CleanKey, KeyError, RESERVED_PREFIX, clean_key, clean_prefix, is_reserved_segment,
};
use crate::core::types::ErrorKind;

fn scratch_prefix() -> String {
    format!("{RESERVED_PREFIX}tmp-")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid artifact key: {0}")]
    InvalidKey(String),
    #[error("artifact key '{key}' resolves to sensitive path segment '{segment}'")]
    SensitivePath { key: String, segment: String },
    #[error("artifact '{0}' not found")]
    NotFound(String),
    #[error("artifact store I/O failed for '{key}'")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidKey(_) | StoreError::SensitivePath { .. } => {
                ErrorKind::ValidationError
            }
            StoreError::NotFound(_) => ErrorKind::InvalidRequest,
            StoreError::Io { .. } => ErrorKind::ProviderError,
        }
    }

    fn io(key: &str, source: io::Error) -> Self {
        StoreError::Io {
            key: key.to_string(),
            source,
        }
    }
}

impl From<KeyError> for StoreError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::SensitivePath { key, segment } => StoreError::SensitivePath { key, segment },
            other => StoreError::InvalidKey(other.to_string()),
        }
    }
}

/// Where a written artifact landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocator {
    /// Cleaned logical key; use this for later reads.
    pub key: String,
    /// Backend-specific address, e.g. `file:///...` for the local store.
    pub uri: String,
}

/// Durable byte storage shared across workflows.
///
/// Implementations must be safe for concurrent access to disjoint keys.
pub trait ArtifactStore: Send + Sync {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<ArtifactLocator, StoreError>;
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    fn exists(&self, key: &str) -> Result<bool, StoreError>;
    /// Fails with [`StoreError::NotFound`] when nothing is stored at `key`.
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Cleaned keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Filesystem-backed store rooted at a fixed base directory.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    base_dir: PathBuf,
}

impl LocalArtifactStore {
    /// Use `base_dir` as-is. The directory is created lazily on first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Create `base_dir` if needed and return a store rooted there.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .map_err(|err| StoreError::io(&base_dir.display().to_string(), err))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Map a raw key to a path under the base directory. Pure; no filesystem access.
    pub fn resolve(&self, key: &str) -> Result<(CleanKey, PathBuf), StoreError> {
        let clean = clean_key(key)?;
        let mut path = self.base_dir.clone();
        for segment in clean.segments() {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(part)), None) => path.push(part),
                _ => {
                    return Err(StoreError::InvalidKey(format!(
                        "segment '{segment}' of '{key}' is not a plain name"
                    )));
                }
            }
        }
        if !path.starts_with(&self.base_dir) || path == self.base_dir {
            return Err(StoreError::InvalidKey(format!(
                "'{key}' escapes the store root"
            )));
        }
        Ok((clean, path))
    }

    fn collect(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StoreError::io(rel, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::io(rel, err))?;
            let file_type = entry.file_type().map_err(|err| StoreError::io(rel, err))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let child = if rel.is_empty() {
                name.clone()
            } else {
                format!("{rel}/{name}")
            };
            if file_type.is_symlink() {
                warn!(key = %child, "skipping symlink in artifact store");
                continue;
            }
            if file_type.is_dir() {
                self.collect(&entry.path(), &child, out)?;
            } else if file_type.is_file() && !is_reserved_segment(&name) {
                out.push(child);
            }
        }
        Ok(())
    }
}

impl ArtifactStore for LocalArtifactStore {
    #[instrument(skip_all, fields(key = key, bytes = bytes.len()))]
    fn write(&self, key: &str, bytes: &[u8]) -> Result<ArtifactLocator, StoreError> {
        let (clean, path) = self.resolve(key)?;
        let clean_str = clean.as_string();
        let parent = path.parent().unwrap_or(&self.base_dir);
        fs::create_dir_all(parent).map_err(|err| StoreError::io(&clean_str, err))?;
        let mut scratch = tempfile::Builder::new()
            .prefix(&scratch_prefix())
            .tempfile_in(parent)
            .map_err(|err| StoreError::io(&clean_str, err))?;
        scratch
            .write_all(bytes)
            .map_err(|err| StoreError::io(&clean_str, err))?;
        scratch
            .persist(&path)
            .map_err(|err| StoreError::io(&clean_str, err.error))?;
        debug!(path = %path.display(), "artifact written");
        Ok(ArtifactLocator {
            uri: format!("file://{}", path.display()),
            key: clean_str,
        })
    }

    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let (clean, path) = self.resolve(key)?;
        fs::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(clean.as_string()),
            _ => StoreError::io(&clean.as_string(), err),
        })
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let (_, path) = self.resolve(key)?;
        Ok(path.is_file())
    }

    #[instrument(skip_all, fields(key = key))]
    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let (clean, path) = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(clean.as_string()))
            }
            Err(err) => Err(StoreError::io(&clean.as_string(), err)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = clean_prefix(prefix)?;
        let mut keys = Vec::new();
        self.collect(&self.base_dir, "", &mut keys)?;
        keys.retain(|key| key.starts_with(&prefix));
        keys.sort();
        Ok(keys)
    }
}
