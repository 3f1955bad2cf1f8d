//! bitsync-core: shared library for peer-to-peer directory synchronization.
//!
//! This crate provides:
//! - The line-delimited JSON message protocol exchanged between peers
//! - File descriptors and peer addresses (`HostPort`)
//! - The `FileSystemManager` trait and an in-memory implementation
//! - The sync engine that turns remote announcements into local changes

pub mod descriptor;
pub mod engine;
pub mod events;
pub mod fs;
pub mod host_port;
pub mod protocol;

pub use descriptor::{content_hash, FileDescriptor, FileMetadata};
pub use engine::{on_sent, OnSent, Outbox, SyncEngine, TransferState, MAX_BLOCK_SIZE};
pub use events::FileEvent;
pub use fs::{is_safe_path_name, normalize_path, FileSystemManager, FsError, MemoryFs};
pub use host_port::{HostPort, HostPortError};
pub use protocol::{Message, ProtocolError, MAX_MESSAGE_SIZE};
