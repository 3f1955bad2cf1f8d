//! bitsync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod connection;
pub mod handler;
pub mod native_fs;
pub mod peers;
pub mod reconnect;
pub mod transport;
pub mod watcher;

// Re-export key types for convenience
pub use config::Config;
pub use connection::{Admission, Direction, PeerConnection, PeerError, PeerObserver, PeerState};
pub use handler::{ConnectionHandler, HandlerConfig};
pub use native_fs::NativeFs;
pub use peers::{keeps_existing, PeerTable, PEER_NAMES};
pub use reconnect::{KnownPeers, ReconnectConfig, Retry};
pub use transport::Transport;
pub use watcher::FileWatcher;
