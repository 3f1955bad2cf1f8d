//! Local filesystem change events.
//!
//! Produced by the filesystem (watcher refreshes and snapshots) and turned
//! into protocol requests that are fanned out to every active peer.

use crate::descriptor::{FileDescriptor, FileMetadata};
use crate::protocol::Message;

/// One change to the local tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    DirectoryCreate { path_name: String },
    DirectoryDelete { path_name: String },
    FileCreate { path_name: String, metadata: FileMetadata },
    FileModify { path_name: String, metadata: FileMetadata },
    /// Carries the last known content so peers only delete a matching copy.
    FileDelete { path_name: String, metadata: FileMetadata },
}

impl FileEvent {
    pub fn path_name(&self) -> &str {
        match self {
            FileEvent::DirectoryCreate { path_name }
            | FileEvent::DirectoryDelete { path_name }
            | FileEvent::FileCreate { path_name, .. }
            | FileEvent::FileModify { path_name, .. }
            | FileEvent::FileDelete { path_name, .. } => path_name,
        }
    }

    /// Event announcing that `descriptor` exists.
    pub fn created(descriptor: &FileDescriptor) -> Self {
        match &descriptor.metadata {
            Some(metadata) => FileEvent::FileCreate {
                path_name: descriptor.path_name.clone(),
                metadata: metadata.clone(),
            },
            None => FileEvent::DirectoryCreate {
                path_name: descriptor.path_name.clone(),
            },
        }
    }

    /// Event announcing that `descriptor` is gone.
    pub fn deleted(descriptor: &FileDescriptor) -> Self {
        match &descriptor.metadata {
            Some(metadata) => FileEvent::FileDelete {
                path_name: descriptor.path_name.clone(),
                metadata: metadata.clone(),
            },
            None => FileEvent::DirectoryDelete {
                path_name: descriptor.path_name.clone(),
            },
        }
    }

    /// The request that propagates this change to a peer.
    pub fn to_request(&self) -> Message {
        match self.clone() {
            FileEvent::DirectoryCreate { path_name } => {
                Message::DirectoryCreateRequest { path_name }
            }
            FileEvent::DirectoryDelete { path_name } => {
                Message::DirectoryDeleteRequest { path_name }
            }
            FileEvent::FileCreate {
                path_name,
                metadata,
            } => Message::FileCreateRequest {
                file_descriptor: metadata,
                path_name,
            },
            FileEvent::FileModify {
                path_name,
                metadata,
            } => Message::FileModifyRequest {
                file_descriptor: metadata,
                path_name,
            },
            FileEvent::FileDelete {
                path_name,
                metadata,
            } => Message::FileDeleteRequest {
                file_descriptor: metadata,
                path_name,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_from_descriptor() {
        let dir = FileDescriptor::directory("docs");
        assert_eq!(
            FileEvent::created(&dir),
            FileEvent::DirectoryCreate {
                path_name: "docs".into()
            }
        );

        let file = FileDescriptor::file("docs/a.txt", FileMetadata::of_bytes(b"a", 1));
        let event = FileEvent::created(&file);
        assert_eq!(event.path_name(), "docs/a.txt");
        assert!(matches!(
            event.to_request(),
            Message::FileCreateRequest { ref path_name, .. } if path_name == "docs/a.txt"
        ));
    }

    #[test]
    fn test_deleted_carries_last_content() {
        let meta = FileMetadata::of_bytes(b"gone", 5);
        let file = FileDescriptor::file("a.txt", meta.clone());
        match FileEvent::deleted(&file).to_request() {
            Message::FileDeleteRequest {
                file_descriptor, ..
            } => assert_eq!(file_descriptor, meta),
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
