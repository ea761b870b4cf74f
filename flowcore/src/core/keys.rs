//! Artifact key cleaning.
//!
//! Keys are caller-supplied and untrusted. Cleaning happens before any
//! filesystem access so a hostile key can never name a location outside the
//! store root or a well-known system directory.

use std::fmt;

use thiserror::Error;

/// Top-level system directories that may never appear as a key segment.
const SENSITIVE_SEGMENTS: &[&str] = &[
    "etc", "proc", "sys", "dev", "boot", "root", "bin", "sbin", "usr", "var", "lib", "windows",
    "system32",
];

/// Name prefix the store keeps for its own scratch files. No key segment may
/// start with it.
pub const RESERVED_PREFIX: &str = ".flowcore-";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("artifact key '{0}' is empty after cleaning")]
    Empty(String),
    #[error("artifact key '{key}' has invalid segment '{segment}'")]
    InvalidSegment { key: String, segment: String },
    #[error("artifact key '{key}' references sensitive path segment '{segment}'")]
    SensitivePath { key: String, segment: String },
}

/// A key reduced to plain, relative path segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanKey {
    segments: Vec<String>,
}

impl CleanKey {
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn as_string(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for CleanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

/// Clean `key` into relative segments.
///
/// Both `/` and `\` separate segments. Empty, `.` and `..` segments are
/// dropped, which strips leading separators and any upward traversal.
/// Segments with a drive/stream colon or a NUL byte are rejected, as are
/// segments using [`RESERVED_PREFIX`] and segments on the sensitive-directory
/// denylist (case-insensitive).
pub fn clean_key(key: &str) -> Result<CleanKey, KeyError> {
    let segments = clean_segments(key)?;
    if segments.is_empty() {
        return Err(KeyError::Empty(key.to_string()));
    }
    Ok(CleanKey { segments })
}

/// Clean a listing prefix. Unlike [`clean_key`], an empty result is allowed
/// and means "everything".
pub fn clean_prefix(prefix: &str) -> Result<String, KeyError> {
    Ok(clean_segments(prefix)?.join("/"))
}

fn clean_segments(raw: &str) -> Result<Vec<String>, KeyError> {
    let mut segments = Vec::new();
    for segment in raw.split(['/', '\\']) {
        if segment.is_empty() || segment == "." || segment == ".." {
            continue;
        }
        if segment.contains(':') || segment.contains('\0') || is_reserved_segment(segment) {
            return Err(KeyError::InvalidSegment {
                key: raw.to_string(),
                segment: segment.to_string(),
            });
        }
        let lowered = segment.to_ascii_lowercase();
        if SENSITIVE_SEGMENTS.contains(&lowered.as_str()) {
            return Err(KeyError::SensitivePath {
                key: raw.to_string(),
                segment: segment.to_string(),
            });
        }
        segments.push(segment.to_string());
    }
    Ok(segments)
}

/// True for names the store uses internally; such names are never keys.
pub fn is_reserved_segment(segment: &str) -> bool {
    segment.to_ascii_lowercase().starts_with(RESERVED_PREFIX)
}
