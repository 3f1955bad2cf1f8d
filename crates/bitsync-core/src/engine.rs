//! SyncEngine: turns remote file announcements into local filesystem changes.
//!
//! Every request is answered with a predicted status right away. Mutations
//! (make directory, open a file loader, delete) run in the response's
//! on-sent hook, after the acknowledgement has been flushed to the peer.
//!
//! Receiving a file:
//!
//! 1. FILE_CREATE/FILE_MODIFY request: the path is reserved (`Requested`)
//!    and "file loader ready" is queued.
//! 2. On sent: the loader is opened (`LoaderOpen`). A local file with the
//!    same content is copied instead of transferred; an empty file
//!    completes at once.
//! 3. Otherwise FILE_BYTES requests are issued in `block_size` chunks
//!    (`ReceivingBytes`) until the loader reports complete.
//!
//! A failed FILE_BYTES response, undecodable content, a write failure or
//! the owning peer going away aborts the transfer and discards the partial
//! data. Only one transfer per path is in flight at a time.

use crate::descriptor::{FileDescriptor, FileMetadata};
use crate::fs::{normalize_path, FileSystemManager, FsError};
use crate::protocol::Message;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Largest chunk served or requested; its base64 form fits in one line.
pub const MAX_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Finished transfers remembered for `transfer_state`.
const FINISHED_HISTORY: usize = 64;

/// Side effect run once, right after a message has been flushed.
pub type OnSent = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Wrap an async closure as an [`OnSent`] hook.
pub fn on_sent<F, Fut>(f: F) -> OnSent
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// Where the engine sends replies: the connection a request arrived on.
pub trait Outbox: Send + Sync {
    /// Display name of the peer behind this outbox.
    fn peer_name(&self) -> &str;

    fn send(&self, message: Message);

    fn send_then(&self, message: Message, hook: OnSent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    LoaderOpen,
    ReceivingBytes,
    Complete,
    Aborted,
}

impl TransferState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TransferState::Requested | TransferState::LoaderOpen | TransferState::ReceivingBytes
        )
    }
}

struct Transfer {
    peer: String,
    descriptor: FileDescriptor,
    state: TransferState,
}

/// In-flight transfers keyed by normalized path, plus the outcomes of the
/// most recently finished ones.
#[derive(Default)]
struct Transfers {
    active: HashMap<String, Transfer>,
    finished: VecDeque<(String, TransferState)>,
}

impl Transfers {
    fn state(&self, key: &str) -> Option<TransferState> {
        self.active.get(key).map(|t| t.state).or_else(|| {
            self.finished
                .iter()
                .rev()
                .find(|(path, _)| path == key)
                .map(|(_, state)| *state)
        })
    }

    /// Drop an active transfer, recording how it ended.
    fn finish(&mut self, key: &str, outcome: TransferState) -> Option<Transfer> {
        let transfer = self.active.remove(key)?;
        self.finished.retain(|(path, _)| path != key);
        if self.finished.len() >= FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back((key.to_string(), outcome));
        Some(transfer)
    }
}

/// File-transfer state machine shared by all peer connections.
pub struct SyncEngine<F> {
    fs: Arc<F>,
    block_size: u64,
    transfers: Mutex<Transfers>,
}

impl<F: FileSystemManager + 'static> SyncEngine<F> {
    pub fn new(fs: Arc<F>, block_size: u64) -> Self {
        Self {
            fs,
            block_size: block_size.clamp(1, MAX_BLOCK_SIZE),
            transfers: Mutex::new(Transfers::default()),
        }
    }

    pub fn fs(&self) -> &Arc<F> {
        &self.fs
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// State of the transfer for `path_name`, or how it recently ended.
    pub fn transfer_state(&self, path_name: &str) -> Option<TransferState> {
        let transfers = self.transfers.lock().ok()?;
        transfers.state(&normalize_path(path_name))
    }

    /// Number of transfers in flight.
    pub fn active_transfers(&self) -> usize {
        self.transfers.lock().map(|t| t.active.len()).unwrap_or(0)
    }

    /// Handle one message from an active peer.
    pub async fn handle(self: &Arc<Self>, outbox: Arc<dyn Outbox>, message: Message) {
        debug!(
            "Engine handling {} from {}",
            message.command(),
            outbox.peer_name()
        );
        match message {
            Message::DirectoryCreateRequest { path_name } => {
                self.directory_create(outbox, path_name).await
            }
            Message::DirectoryDeleteRequest { path_name } => {
                self.directory_delete(outbox, path_name).await
            }
            Message::FileCreateRequest {
                file_descriptor,
                path_name,
            } => self.file_create(outbox, file_descriptor, path_name).await,
            Message::FileModifyRequest {
                file_descriptor,
                path_name,
            } => self.file_modify(outbox, file_descriptor, path_name).await,
            Message::FileDeleteRequest {
                file_descriptor,
                path_name,
            } => self.file_delete(outbox, file_descriptor, path_name).await,
            Message::FileBytesRequest {
                file_descriptor,
                path_name,
                position,
                length,
            } => {
                self.file_bytes_request(outbox, file_descriptor, path_name, position, length)
                    .await
            }
            Message::FileBytesResponse {
                file_descriptor,
                path_name,
                position,
                content,
                message,
                status,
                ..
            } => {
                self.file_bytes_response(
                    outbox,
                    file_descriptor,
                    path_name,
                    position,
                    content,
                    message,
                    status,
                )
                .await
            }
            other => log_response(outbox.peer_name(), &other),
        }
    }

    /// Abort every in-flight transfer owned by `peer`.
    pub async fn abort_transfers_from(&self, peer: &str) {
        let paths: Vec<String> = match self.transfers.lock() {
            Ok(mut transfers) => {
                let owned: Vec<String> = transfers
                    .active
                    .iter()
                    .filter(|(_, t)| t.peer == peer)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in &owned {
                    transfers.finish(path, TransferState::Aborted);
                }
                owned
            }
            Err(_) => return,
        };
        for path in paths {
            info!("Aborting transfer of {} from closed peer {}", path, peer);
            self.discard_loader(&path).await;
        }
    }

    // ==================== Directories ====================

    async fn directory_create(self: &Arc<Self>, outbox: Arc<dyn Outbox>, path_name: String) {
        let reply = |message: String, status: bool| Message::DirectoryCreateResponse {
            path_name: path_name.clone(),
            message,
            status,
        };

        if !self.fs.is_safe_path_name(&path_name) {
            outbox.send(reply(unsafe_path(&path_name), false));
        } else if self.fs.dir_name_exists(&path_name).await {
            outbox.send(reply("directory already exists".into(), true));
        } else if self.fs.file_name_exists(&path_name, None).await {
            outbox.send(reply("pathname already exists as a file".into(), false));
        } else {
            let fs = self.fs.clone();
            let path = path_name.clone();
            outbox.send_then(
                reply("directory created".into(), true),
                on_sent(move || async move {
                    match fs.make_directory(&path).await {
                        Ok(()) => info!("Created directory {}", path),
                        Err(e) => warn!("Failed to create directory {}: {}", path, e),
                    }
                }),
            );
        }
    }

    async fn directory_delete(self: &Arc<Self>, outbox: Arc<dyn Outbox>, path_name: String) {
        let reply = |message: String, status: bool| Message::DirectoryDeleteResponse {
            path_name: path_name.clone(),
            message,
            status,
        };

        if !self.fs.is_safe_path_name(&path_name) {
            outbox.send(reply(unsafe_path(&path_name), false));
        } else if !self.fs.dir_name_exists(&path_name).await {
            outbox.send(reply("pathname does not exist".into(), false));
        } else {
            let fs = self.fs.clone();
            let path = path_name.clone();
            outbox.send_then(
                reply("directory deleted".into(), true),
                on_sent(move || async move {
                    match fs.delete_directory(&path).await {
                        Ok(()) => info!("Deleted directory {}", path),
                        Err(e) => warn!("Failed to delete directory {}: {}", path, e),
                    }
                }),
            );
        }
    }

    // ==================== Files ====================

    async fn file_create(
        self: &Arc<Self>,
        outbox: Arc<dyn Outbox>,
        metadata: FileMetadata,
        path_name: String,
    ) {
        let descriptor = FileDescriptor::file(path_name.clone(), metadata.clone());
        let reply = |message: String, status: bool| Message::FileCreateResponse {
            file_descriptor: metadata.clone(),
            path_name: path_name.clone(),
            message,
            status,
        };

        if !self.fs.is_safe_path_name(&path_name) {
            outbox.send(reply(unsafe_path(&path_name), false));
            return;
        }

        // Same path with different content is handled as a modify.
        let replaces_local = match self.fs.file_descriptor(&path_name).await {
            Ok(local) if local.is_directory() => {
                outbox.send(reply("pathname already exists as a directory".into(), false));
                return;
            }
            Ok(local) if local.same_content(&descriptor) => {
                outbox.send(reply("file already exists locally".into(), true));
                return;
            }
            Ok(local) => {
                if let Some(reason) = self.conflict(&local, &descriptor) {
                    outbox.send(reply(reason, false));
                    return;
                }
                true
            }
            Err(FsError::NotFound(_)) => false,
            Err(e) => {
                outbox.send(reply(e.to_string(), false));
                return;
            }
        };

        if !self.reserve(outbox.peer_name(), &descriptor) {
            outbox.send(reply(in_progress(&path_name), false));
            return;
        }

        let engine = self.clone();
        let peer = outbox.clone();
        outbox.send_then(
            reply("file loader ready".into(), true),
            on_sent(move || async move {
                engine.open_transfer(peer, descriptor, replaces_local).await
            }),
        );
    }

    async fn file_modify(
        self: &Arc<Self>,
        outbox: Arc<dyn Outbox>,
        metadata: FileMetadata,
        path_name: String,
    ) {
        let descriptor = FileDescriptor::file(path_name.clone(), metadata.clone());
        let reply = |message: String, status: bool| Message::FileModifyResponse {
            file_descriptor: metadata.clone(),
            path_name: path_name.clone(),
            message,
            status,
        };

        if !self.fs.is_safe_path_name(&path_name) {
            outbox.send(reply(unsafe_path(&path_name), false));
            return;
        }

        match self.fs.file_descriptor(&path_name).await {
            Ok(local) if local.is_directory() => {
                outbox.send(reply("pathname already exists as a directory".into(), false));
                return;
            }
            Ok(local) if local.same_content(&descriptor) => {
                outbox.send(reply(
                    "file already exists with matching content".into(),
                    true,
                ));
                return;
            }
            Ok(local) => {
                if let Some(reason) = self.conflict(&local, &descriptor) {
                    outbox.send(reply(reason, false));
                    return;
                }
            }
            Err(FsError::NotFound(_)) => {
                outbox.send(reply("pathname does not exist".into(), false));
                return;
            }
            Err(e) => {
                outbox.send(reply(e.to_string(), false));
                return;
            }
        }

        if !self.reserve(outbox.peer_name(), &descriptor) {
            outbox.send(reply(in_progress(&path_name), false));
            return;
        }

        let engine = self.clone();
        let peer = outbox.clone();
        outbox.send_then(
            reply("file loader ready".into(), true),
            on_sent(move || async move { engine.open_transfer(peer, descriptor, true).await }),
        );
    }

    async fn file_delete(
        self: &Arc<Self>,
        outbox: Arc<dyn Outbox>,
        metadata: FileMetadata,
        path_name: String,
    ) {
        let descriptor = FileDescriptor::file(path_name.clone(), metadata.clone());
        let reply = |message: String, status: bool| Message::FileDeleteResponse {
            file_descriptor: metadata.clone(),
            path_name: path_name.clone(),
            message,
            status,
        };

        if !self.fs.is_safe_path_name(&path_name) {
            outbox.send(reply(unsafe_path(&path_name), false));
            return;
        }

        match self.fs.file_descriptor(&path_name).await {
            Ok(local) if local.is_directory() => {
                outbox.send(reply("pathname is a directory".into(), false));
            }
            Ok(local) if !local.same_content(&descriptor) => {
                outbox.send(reply("local file differs from deleted version".into(), false));
            }
            Ok(_) if self.is_transferring(&path_name) => {
                outbox.send(reply(in_progress(&path_name), false));
            }
            Ok(_) => {
                let fs = self.fs.clone();
                outbox.send_then(
                    reply("file deleted".into(), true),
                    on_sent(move || async move {
                        match fs.delete_file(&descriptor).await {
                            Ok(()) => info!("Deleted file {}", descriptor.path_name),
                            Err(e) => {
                                warn!("Failed to delete file {}: {}", descriptor.path_name, e)
                            }
                        }
                    }),
                );
            }
            Err(FsError::NotFound(_)) => {
                outbox.send(reply("pathname does not exist".into(), false));
            }
            Err(e) => {
                outbox.send(reply(e.to_string(), false));
            }
        }
    }

    // ==================== Byte transfer ====================

    async fn file_bytes_request(
        self: &Arc<Self>,
        outbox: Arc<dyn Outbox>,
        metadata: FileMetadata,
        path_name: String,
        position: u64,
        length: u64,
    ) {
        let descriptor = FileDescriptor::file(path_name.clone(), metadata.clone());
        let reply = |length: u64, content: String, message: String, status: bool| {
            Message::FileBytesResponse {
                file_descriptor: metadata.clone(),
                path_name: path_name.clone(),
                position,
                length,
                content,
                message,
                status,
            }
        };

        if !self.fs.is_safe_path_name(&path_name) {
            outbox.send(reply(0, String::new(), unsafe_path(&path_name), false));
            return;
        }

        let length = length.min(MAX_BLOCK_SIZE);
        match self.fs.read_file(&descriptor, position, length).await {
            Ok(bytes) => {
                let content = BASE64.encode(&bytes);
                outbox.send(reply(
                    bytes.len() as u64,
                    content,
                    "successful read".into(),
                    true,
                ));
            }
            Err(e) => {
                warn!(
                    "Read of {} at {} for {} failed: {}",
                    path_name,
                    position,
                    outbox.peer_name(),
                    e
                );
                outbox.send(reply(0, String::new(), "unsuccessful read".into(), false));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn file_bytes_response(
        self: &Arc<Self>,
        outbox: Arc<dyn Outbox>,
        metadata: FileMetadata,
        path_name: String,
        position: u64,
        content: String,
        message: String,
        status: bool,
    ) {
        if !self.fs.is_safe_path_name(&path_name) {
            warn!("FILE_BYTES_RESPONSE with unsafe path {:?}", path_name);
            return;
        }
        let key = normalize_path(&path_name);

        let Some(descriptor) = self.owned_transfer(&key, outbox.peer_name(), &metadata) else {
            warn!(
                "Ignoring FILE_BYTES_RESPONSE for {} from {}: no matching transfer",
                path_name,
                outbox.peer_name()
            );
            return;
        };

        if !status {
            warn!("Peer failed to read {}: {}", path_name, message);
            self.abort(&key).await;
            return;
        }

        let bytes = match BASE64.decode(content.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Undecodable content for {}: {}", path_name, e);
                self.abort(&key).await;
                return;
            }
        };
        if bytes.is_empty() && position < descriptor.file_size() {
            warn!("Empty chunk for {} at {}", path_name, position);
            self.abort(&key).await;
            return;
        }

        if let Err(e) = self.fs.write_file(&key, &bytes, position).await {
            warn!("Write to {} failed: {}", path_name, e);
            self.abort(&key).await;
            return;
        }

        match self.fs.check_write_complete(&key).await {
            Ok(true) => self.complete(&key),
            Ok(false) => self.request_bytes(&outbox, &descriptor, position + bytes.len() as u64),
            Err(e) => {
                warn!("Transfer of {} failed: {}", path_name, e);
                self.abort(&key).await;
            }
        }
    }

    /// Open the loader for a reserved transfer and start pulling bytes.
    async fn open_transfer(
        self: Arc<Self>,
        outbox: Arc<dyn Outbox>,
        descriptor: FileDescriptor,
        replaces_local: bool,
    ) {
        let key = normalize_path(&descriptor.path_name);
        let opened = if replaces_local {
            self.fs.modify_file_loader(&descriptor).await
        } else {
            match self.fs.create_file_loader(&descriptor).await {
                // Created locally since the reply was predicted
                Err(FsError::AlreadyExists(_)) => self.fs.modify_file_loader(&descriptor).await,
                other => other,
            }
        };
        if let Err(e) = opened {
            warn!("Could not open loader for {}: {}", descriptor.path_name, e);
            self.finish(&key, TransferState::Aborted);
            return;
        }

        // The owning peer may have closed while the loader was opening.
        if !self.advance(&key, outbox.peer_name(), TransferState::LoaderOpen) {
            self.discard_loader(&key).await;
            return;
        }

        match self.fs.check_shortcut(&key).await {
            Ok(true) => {
                info!("Copied {} from a local file with the same content", key);
                self.complete(&key);
                return;
            }
            Ok(false) => {}
            Err(e) => debug!("No shortcut for {}: {}", key, e),
        }

        match self.fs.check_write_complete(&key).await {
            Ok(true) => {
                self.complete(&key);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Transfer of {} failed: {}", key, e);
                self.abort(&key).await;
                return;
            }
        }

        if self.advance(&key, outbox.peer_name(), TransferState::ReceivingBytes) {
            self.request_bytes(&outbox, &descriptor, 0);
        }
    }

    fn request_bytes(&self, outbox: &Arc<dyn Outbox>, descriptor: &FileDescriptor, position: u64) {
        let Some(metadata) = descriptor.metadata.clone() else {
            return;
        };
        let length = self.block_size.min(metadata.file_size.saturating_sub(position));
        debug!(
            "Requesting {} bytes of {} at {} from {}",
            length,
            descriptor.path_name,
            position,
            outbox.peer_name()
        );
        outbox.send(Message::FileBytesRequest {
            file_descriptor: metadata,
            path_name: descriptor.path_name.clone(),
            position,
            length,
        });
    }

    // ==================== Transfer table ====================

    /// Reason a replacement of `local` by `remote` must be refused.
    fn conflict(&self, local: &FileDescriptor, remote: &FileDescriptor) -> Option<String> {
        if self.is_transferring(&remote.path_name) {
            return Some(in_progress(&remote.path_name));
        }
        if local.last_modified() > remote.last_modified() {
            return Some("local version is newer".into());
        }
        None
    }

    fn is_transferring(&self, path_name: &str) -> bool {
        self.transfer_state(path_name)
            .is_some_and(TransferState::is_active)
    }

    /// Claim the path for a new transfer. False if one is already active.
    fn reserve(&self, peer: &str, descriptor: &FileDescriptor) -> bool {
        let Ok(mut transfers) = self.transfers.lock() else {
            return false;
        };
        let key = normalize_path(&descriptor.path_name);
        if transfers.active.contains_key(&key) {
            return false;
        }
        transfers.active.insert(
            key,
            Transfer {
                peer: peer.to_string(),
                descriptor: descriptor.clone(),
                state: TransferState::Requested,
            },
        );
        true
    }

    /// Descriptor of the transfer `peer` is sending us for `key`.
    fn owned_transfer(
        &self,
        key: &str,
        peer: &str,
        metadata: &FileMetadata,
    ) -> Option<FileDescriptor> {
        let transfers = self.transfers.lock().ok()?;
        let transfer = transfers.active.get(key)?;
        let matches = transfer.peer == peer
            && transfer.state == TransferState::ReceivingBytes
            && transfer.descriptor.hash() == Some(metadata.hash.as_str());
        matches.then(|| transfer.descriptor.clone())
    }

    /// Move an active transfer owned by `peer` to `state`.
    fn advance(&self, key: &str, peer: &str, state: TransferState) -> bool {
        let Ok(mut transfers) = self.transfers.lock() else {
            return false;
        };
        match transfers.active.get_mut(key) {
            Some(t) if t.peer == peer => {
                t.state = state;
                true
            }
            _ => false,
        }
    }

    fn finish(&self, key: &str, outcome: TransferState) {
        if let Ok(mut transfers) = self.transfers.lock() {
            transfers.finish(key, outcome);
        }
    }

    fn complete(&self, key: &str) {
        info!("Transfer of {} complete", key);
        self.finish(key, TransferState::Complete);
    }

    async fn abort(&self, key: &str) {
        self.finish(key, TransferState::Aborted);
        self.discard_loader(key).await;
    }

    async fn discard_loader(&self, key: &str) {
        if let Err(e) = self.fs.cancel_file_loader(key).await {
            warn!("Failed to discard partial data for {}: {}", key, e);
        }
    }
}

fn unsafe_path(path_name: &str) -> String {
    format!("unsafe pathname given: {}", path_name)
}

fn in_progress(path_name: &str) -> String {
    format!("file transfer already in progress: {}", path_name)
}

fn log_response(peer: &str, message: &Message) {
    match message.outcome() {
        Some((true, reason)) => debug!(
            "{} from {} for {:?}: {}",
            message.command(),
            peer,
            message.path_name(),
            reason
        ),
        Some((false, reason)) => warn!(
            "{} from {} for {:?} failed: {}",
            message.command(),
            peer,
            message.path_name(),
            reason
        ),
        None => debug!("Engine ignoring {} from {}", message.command(), peer),
    }
}
