//! File descriptors: point-in-time snapshots of a filesystem entry.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content metadata of a regular file.
///
/// This is the `fileDescriptor` object on the wire:
/// `{"hash":"…","lastModified":1700000000000,"fileSize":42}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Hex-encoded SHA-256 of the file content
    pub hash: String,
    /// Modification time in milliseconds since epoch
    pub last_modified: u64,
    /// File size in bytes
    pub file_size: u64,
}

impl FileMetadata {
    pub fn new(hash: impl Into<String>, last_modified: u64, file_size: u64) -> Self {
        Self {
            hash: hash.into(),
            last_modified,
            file_size,
        }
    }

    /// Describe an in-memory buffer.
    pub fn of_bytes(content: &[u8], last_modified: u64) -> Self {
        Self::new(content_hash(content), last_modified, content.len() as u64)
    }

    /// Same content version: equal hash and size. Timestamps are ignored.
    pub fn same_content(&self, other: &FileMetadata) -> bool {
        self.hash == other.hash && self.file_size == other.file_size
    }
}

/// Identity and content version of one filesystem entry.
///
/// `metadata` is `None` for directories. Descriptors are never mutated;
/// [`FileDescriptor::rename`] produces a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileDescriptor {
    pub path_name: String,
    pub metadata: Option<FileMetadata>,
}

impl FileDescriptor {
    pub fn file(path_name: impl Into<String>, metadata: FileMetadata) -> Self {
        Self {
            path_name: path_name.into(),
            metadata: Some(metadata),
        }
    }

    pub fn directory(path_name: impl Into<String>) -> Self {
        Self {
            path_name: path_name.into(),
            metadata: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.metadata.is_none()
    }

    /// Same content metadata under a new path.
    pub fn rename(&self, new_path_name: impl Into<String>) -> Self {
        Self {
            path_name: new_path_name.into(),
            metadata: self.metadata.clone(),
        }
    }

    /// True when both are files with the same hash and size.
    pub fn same_content(&self, other: &FileDescriptor) -> bool {
        match (&self.metadata, &other.metadata) {
            (Some(a), Some(b)) => a.same_content(b),
            _ => false,
        }
    }

    pub fn hash(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.hash.as_str())
    }

    pub fn file_size(&self) -> u64 {
        self.metadata.as_ref().map(|m| m.file_size).unwrap_or(0)
    }

    pub fn last_modified(&self) -> u64 {
        self.metadata.as_ref().map(|m| m.last_modified).unwrap_or(0)
    }
}

/// Hex-encoded SHA-256 of `content`.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}
