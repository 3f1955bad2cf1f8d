//! Sync engine tests against the in-memory filesystem.
//!
//! The recording outbox keeps on-sent hooks instead of running them, so each
//! test decides when the "flush" happens.

use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitsync_core::{
    FileMetadata, FileSystemManager, MemoryFs, Message, OnSent, Outbox, SyncEngine,
    TransferState,
};

struct RecordingOutbox {
    name: String,
    sent: Mutex<Vec<(Message, Option<OnSent>)>>,
}

impl RecordingOutbox {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Drain queued messages, returning them with their hooks.
    fn take(&self) -> Vec<(Message, Option<OnSent>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Drain queued messages, running each hook as if it had been flushed.
    /// Messages queued by the hooks themselves are drained too.
    async fn flush(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        loop {
            let batch = self.take();
            if batch.is_empty() {
                return messages;
            }
            for (message, hook) in batch {
                messages.push(message);
                if let Some(hook) = hook {
                    hook().await;
                }
            }
        }
    }
}

impl Outbox for RecordingOutbox {
    fn peer_name(&self) -> &str {
        &self.name
    }

    fn send(&self, message: Message) {
        self.sent.lock().unwrap().push((message, None));
    }

    fn send_then(&self, message: Message, hook: OnSent) {
        self.sent.lock().unwrap().push((message, Some(hook)));
    }
}

fn setup(block_size: u64) -> (Arc<MemoryFs>, Arc<SyncEngine<MemoryFs>>) {
    let fs = Arc::new(MemoryFs::new());
    let engine = Arc::new(SyncEngine::new(fs.clone(), block_size));
    (fs, engine)
}

fn single(messages: Vec<Message>) -> Message {
    assert_eq!(messages.len(), 1, "expected one message, got {messages:?}");
    messages.into_iter().next().unwrap()
}

/// Answer every FILE_BYTES_REQUEST in `requests` from `content`.
fn serve(requests: Vec<Message>, content: &[u8]) -> Vec<Message> {
    requests
        .into_iter()
        .filter_map(|m| match m {
            Message::FileBytesRequest {
                file_descriptor,
                path_name,
                position,
                length,
            } => {
                let start = position as usize;
                let end = (position + length) as usize;
                Some(Message::FileBytesResponse {
                    file_descriptor,
                    path_name,
                    position,
                    length,
                    content: BASE64.encode(&content[start..end]),
                    message: "successful read".into(),
                    status: true,
                })
            }
            _ => None,
        })
        .collect()
}

// ============================================================================
// Acknowledgement ordering
// ============================================================================

#[tokio::test]
async fn test_ack_is_queued_before_directory_is_made() {
    let (fs, engine) = setup(1024);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::DirectoryCreateRequest {
                path_name: "docs".into(),
            },
        )
        .await;

    let mut queued = peer.take();
    assert_eq!(queued.len(), 1);
    let (reply, hook) = queued.remove(0);
    assert_eq!(reply.outcome(), Some((true, "directory created")));
    assert!(!fs.dir_name_exists("docs").await, "mutation ran before flush");

    hook.expect("directory create carries a hook")().await;
    assert!(fs.dir_name_exists("docs").await);
}

#[tokio::test]
async fn test_ack_is_queued_before_file_is_deleted() {
    let (fs, engine) = setup(1024);
    fs.insert_file("a.txt", b"bye", 10);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::FileDeleteRequest {
                file_descriptor: FileMetadata::of_bytes(b"bye", 10),
                path_name: "a.txt".into(),
            },
        )
        .await;

    let (reply, hook) = peer.take().remove(0);
    assert_eq!(reply.outcome(), Some((true, "file deleted")));
    assert!(fs.read("a.txt").is_some());
    hook.unwrap()().await;
    assert!(fs.read("a.txt").is_none());
}

// ============================================================================
// Conflict avoidance
// ============================================================================

#[tokio::test]
async fn test_create_with_same_content_is_noop_success() {
    let (fs, engine) = setup(1024);
    fs.insert_file("a.txt", b"same", 10);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::FileCreateRequest {
                file_descriptor: FileMetadata::of_bytes(b"same", 99),
                path_name: "a.txt".into(),
            },
        )
        .await;

    let queued = peer.take();
    assert_eq!(queued.len(), 1);
    assert_eq!(
        queued[0].0.outcome(),
        Some((true, "file already exists locally"))
    );
    assert!(queued[0].1.is_none(), "no mutation expected");
    assert_eq!(engine.transfer_state("a.txt"), None);
}

#[tokio::test]
async fn test_create_over_newer_local_file_fails() {
    let (fs, engine) = setup(1024);
    fs.insert_file("a.txt", b"local", 200);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::FileCreateRequest {
                file_descriptor: FileMetadata::of_bytes(b"remote", 100),
                path_name: "a.txt".into(),
            },
        )
        .await;

    let reply = single(peer.flush().await);
    assert_eq!(reply.outcome(), Some((false, "local version is newer")));
    assert_eq!(fs.read("a.txt").unwrap(), b"local");
}

#[tokio::test]
async fn test_create_over_older_local_file_replaces_it() {
    let (fs, engine) = setup(1024);
    fs.insert_file("a.txt", b"old", 100);
    let peer = RecordingOutbox::new("Alpha");
    let remote = b"new content";

    engine
        .handle(
            peer.clone(),
            Message::FileCreateRequest {
                file_descriptor: FileMetadata::of_bytes(remote, 200),
                path_name: "a.txt".into(),
            },
        )
        .await;

    let messages = peer.flush().await;
    assert_eq!(messages[0].outcome(), Some((true, "file loader ready")));
    for response in serve(messages, remote) {
        engine.handle(peer.clone(), response).await;
    }
    assert_eq!(fs.read("a.txt").unwrap(), remote);
    assert_eq!(engine.transfer_state("a.txt"), Some(TransferState::Complete));
}

#[tokio::test]
async fn test_modify_missing_file_fails() {
    let (_fs, engine) = setup(1024);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::FileModifyRequest {
                file_descriptor: FileMetadata::of_bytes(b"x", 1),
                path_name: "missing.txt".into(),
            },
        )
        .await;

    let reply = single(peer.flush().await);
    assert_eq!(reply.outcome(), Some((false, "pathname does not exist")));
}

#[tokio::test]
async fn test_delete_of_changed_file_reports_conflict() {
    let (fs, engine) = setup(1024);
    fs.insert_file("a.txt", b"edited locally", 10);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::FileDeleteRequest {
                file_descriptor: FileMetadata::of_bytes(b"original", 5),
                path_name: "a.txt".into(),
            },
        )
        .await;

    let reply = single(peer.flush().await);
    assert_eq!(
        reply.outcome(),
        Some((false, "local file differs from deleted version"))
    );
    assert!(fs.read("a.txt").is_some());
}

// ============================================================================
// Path safety
// ============================================================================

#[tokio::test]
async fn test_unsafe_paths_fail_every_request_type() {
    let (fs, engine) = setup(1024);
    fs.insert_file("inside.txt", b"x", 1);
    let meta = FileMetadata::of_bytes(b"x", 1);
    let peer = RecordingOutbox::new("Alpha");

    for path in ["../outside.txt", "a/../../b", ".bitsync/partial/x"] {
        let requests = vec![
            Message::DirectoryCreateRequest {
                path_name: path.into(),
            },
            Message::DirectoryDeleteRequest {
                path_name: path.into(),
            },
            Message::FileCreateRequest {
                file_descriptor: meta.clone(),
                path_name: path.into(),
            },
            Message::FileModifyRequest {
                file_descriptor: meta.clone(),
                path_name: path.into(),
            },
            Message::FileDeleteRequest {
                file_descriptor: meta.clone(),
                path_name: path.into(),
            },
            Message::FileBytesRequest {
                file_descriptor: meta.clone(),
                path_name: path.into(),
                position: 0,
                length: 1,
            },
        ];
        for request in requests {
            engine.handle(peer.clone(), request).await;
            let queued = peer.take();
            assert_eq!(queued.len(), 1);
            let (reply, hook) = &queued[0];
            assert!(hook.is_none(), "unsafe path must not schedule a mutation");
            let (status, message) = reply.outcome().unwrap();
            assert!(!status, "{} for {path} succeeded", reply.command());
            assert!(message.starts_with("unsafe pathname given"));
        }
    }

    let events = fs.generate_sync_events().await.unwrap();
    assert_eq!(events.len(), 1, "tree changed: {events:?}");
}

// ============================================================================
// Directories
// ============================================================================

#[tokio::test]
async fn test_directory_create_is_idempotent() {
    let (fs, engine) = setup(1024);
    fs.insert_dir("docs");
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::DirectoryCreateRequest {
                path_name: "docs".into(),
            },
        )
        .await;

    let reply = single(peer.flush().await);
    assert_eq!(reply.outcome(), Some((true, "directory already exists")));
}

#[tokio::test]
async fn test_directory_delete_of_missing_directory_fails() {
    let (_fs, engine) = setup(1024);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::DirectoryDeleteRequest {
                path_name: "nope".into(),
            },
        )
        .await;

    let reply = single(peer.flush().await);
    assert_eq!(reply.outcome(), Some((false, "pathname does not exist")));
}

// ============================================================================
// File transfer
// ============================================================================

#[tokio::test]
async fn test_transfer_in_chunks() {
    let (fs, engine) = setup(4);
    let peer = RecordingOutbox::new("Alpha");
    let content = b"0123456789";

    engine
        .handle(
            peer.clone(),
            Message::FileCreateRequest {
                file_descriptor: FileMetadata::of_bytes(content, 1),
                path_name: "docs/n.txt".into(),
            },
        )
        .await;
    assert_eq!(
        engine.transfer_state("docs/n.txt"),
        Some(TransferState::Requested)
    );

    let mut pending = peer.flush().await;
    assert_eq!(
        engine.transfer_state("docs/n.txt"),
        Some(TransferState::ReceivingBytes)
    );

    let mut positions = Vec::new();
    loop {
        let responses = serve(pending, content);
        if responses.is_empty() {
            break;
        }
        for response in responses {
            if let Message::FileBytesResponse { position, .. } = &response {
                positions.push(*position);
            }
            engine.handle(peer.clone(), response).await;
        }
        pending = peer.flush().await;
    }

    assert_eq!(positions, vec![0, 4, 8]);
    assert_eq!(fs.read("docs/n.txt").unwrap(), content);
    assert_eq!(
        engine.transfer_state("docs/n.txt"),
        Some(TransferState::Complete)
    );
}

#[tokio::test]
async fn test_zero_byte_file_completes_when_loader_opens() {
    let (fs, engine) = setup(1024);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::FileCreateRequest {
                file_descriptor: FileMetadata::of_bytes(b"", 1),
                path_name: "empty.txt".into(),
            },
        )
        .await;

    let messages = peer.flush().await;
    assert_eq!(messages.len(), 1, "no FILE_BYTES request expected");
    assert_eq!(fs.read("empty.txt").unwrap(), b"");
    assert_eq!(
        engine.transfer_state("empty.txt"),
        Some(TransferState::Complete)
    );
}

#[tokio::test]
async fn test_finished_transfers_leave_the_table() {
    let (_fs, engine) = setup(1024);
    let peer = RecordingOutbox::new("Alpha");

    for i in 0..100 {
        engine
            .handle(
                peer.clone(),
                Message::FileCreateRequest {
                    file_descriptor: FileMetadata::of_bytes(b"", 1),
                    path_name: format!("empty-{i}.txt"),
                },
            )
            .await;
        peer.flush().await;
    }

    assert_eq!(engine.active_transfers(), 0);
    assert_eq!(
        engine.transfer_state("empty-99.txt"),
        Some(TransferState::Complete)
    );
    // Only recent outcomes are remembered
    assert_eq!(engine.transfer_state("empty-0.txt"), None);
}

#[tokio::test]
async fn test_shortcut_copies_local_file() {
    let (fs, engine) = setup(1024);
    fs.insert_file("original.txt", b"shared bytes", 1);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::FileCreateRequest {
                file_descriptor: FileMetadata::of_bytes(b"shared bytes", 2),
                path_name: "copy.txt".into(),
            },
        )
        .await;

    let messages = peer.flush().await;
    assert_eq!(messages.len(), 1, "no FILE_BYTES request expected");
    assert_eq!(fs.read("copy.txt").unwrap(), b"shared bytes");
}

#[tokio::test]
async fn test_create_during_transfer_is_rejected_and_transfer_completes() {
    let (fs, engine) = setup(4);
    let alpha = RecordingOutbox::new("Alpha");
    let bravo = RecordingOutbox::new("Bravo");
    let content = b"abcdefgh";

    engine
        .handle(
            alpha.clone(),
            Message::FileCreateRequest {
                file_descriptor: FileMetadata::of_bytes(content, 1),
                path_name: "a.txt".into(),
            },
        )
        .await;
    let first_chunk = alpha.flush().await;
    assert_eq!(
        engine.transfer_state("a.txt"),
        Some(TransferState::ReceivingBytes)
    );

    // A second peer announces another version of the same path
    engine
        .handle(
            bravo.clone(),
            Message::FileCreateRequest {
                file_descriptor: FileMetadata::of_bytes(b"other version", 2),
                path_name: "a.txt".into(),
            },
        )
        .await;
    let reply = single(bravo.flush().await);
    let (status, message) = reply.outcome().unwrap();
    assert!(!status);
    assert!(message.starts_with("file transfer already in progress"));

    // Bravo cannot inject bytes into Alpha's transfer
    for response in serve(first_chunk.clone(), content) {
        engine.handle(bravo.clone(), response).await;
    }
    assert!(bravo.take().is_empty());

    let mut pending = first_chunk;
    loop {
        let responses = serve(pending, content);
        if responses.is_empty() {
            break;
        }
        for response in responses {
            engine.handle(alpha.clone(), response).await;
        }
        pending = alpha.flush().await;
    }
    assert_eq!(fs.read("a.txt").unwrap(), content);
    assert_eq!(engine.transfer_state("a.txt"), Some(TransferState::Complete));
}

#[tokio::test]
async fn test_failed_bytes_response_aborts_and_discards() {
    let (fs, engine) = setup(4);
    let peer = RecordingOutbox::new("Alpha");
    let meta = FileMetadata::of_bytes(b"abcdefgh", 1);

    engine
        .handle(
            peer.clone(),
            Message::FileCreateRequest {
                file_descriptor: meta.clone(),
                path_name: "a.txt".into(),
            },
        )
        .await;
    peer.flush().await;
    assert!(fs.has_loader("a.txt"));

    engine
        .handle(
            peer.clone(),
            Message::FileBytesResponse {
                file_descriptor: meta,
                path_name: "a.txt".into(),
                position: 0,
                length: 0,
                content: String::new(),
                message: "unsuccessful read".into(),
                status: false,
            },
        )
        .await;

    assert_eq!(engine.transfer_state("a.txt"), Some(TransferState::Aborted));
    assert!(!fs.has_loader("a.txt"));
    assert!(fs.read("a.txt").is_none());
}

#[tokio::test]
async fn test_undecodable_content_aborts() {
    let (fs, engine) = setup(4);
    let peer = RecordingOutbox::new("Alpha");
    let meta = FileMetadata::of_bytes(b"abcdefgh", 1);

    engine
        .handle(
            peer.clone(),
            Message::FileCreateRequest {
                file_descriptor: meta.clone(),
                path_name: "a.txt".into(),
            },
        )
        .await;
    peer.flush().await;

    engine
        .handle(
            peer.clone(),
            Message::FileBytesResponse {
                file_descriptor: meta,
                path_name: "a.txt".into(),
                position: 0,
                length: 4,
                content: "!!not base64!!".into(),
                message: "successful read".into(),
                status: true,
            },
        )
        .await;

    assert_eq!(engine.transfer_state("a.txt"), Some(TransferState::Aborted));
    assert!(!fs.has_loader("a.txt"));
}

#[tokio::test]
async fn test_closing_peer_aborts_its_transfers() {
    let (fs, engine) = setup(4);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::FileCreateRequest {
                file_descriptor: FileMetadata::of_bytes(b"abcdefgh", 1),
                path_name: "a.txt".into(),
            },
        )
        .await;
    peer.flush().await;
    assert!(fs.has_loader("a.txt"));

    engine.abort_transfers_from("Alpha").await;
    assert_eq!(engine.transfer_state("a.txt"), Some(TransferState::Aborted));
    assert!(!fs.has_loader("a.txt"));

    // The path is free for a new transfer
    let other = RecordingOutbox::new("Bravo");
    engine
        .handle(
            other.clone(),
            Message::FileCreateRequest {
                file_descriptor: FileMetadata::of_bytes(b"abcdefgh", 1),
                path_name: "a.txt".into(),
            },
        )
        .await;
    let queued = other.take();
    assert_eq!(queued[0].0.outcome(), Some((true, "file loader ready")));
}

#[tokio::test]
async fn test_peer_closing_before_flush_never_opens_loader() {
    let (fs, engine) = setup(4);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::FileCreateRequest {
                file_descriptor: FileMetadata::of_bytes(b"abcdefgh", 1),
                path_name: "a.txt".into(),
            },
        )
        .await;
    let queued = peer.take();
    engine.abort_transfers_from("Alpha").await;

    // A late hook finds the transfer aborted and backs out
    for (_, hook) in queued {
        if let Some(hook) = hook {
            hook().await;
        }
    }
    assert!(!fs.has_loader("a.txt"));
    assert_eq!(engine.transfer_state("a.txt"), Some(TransferState::Aborted));
}

// ============================================================================
// Serving bytes
// ============================================================================

#[tokio::test]
async fn test_bytes_request_is_served_base64() {
    let (fs, engine) = setup(1024);
    fs.insert_file("a.txt", b"hello world", 1);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::FileBytesRequest {
                file_descriptor: FileMetadata::of_bytes(b"hello world", 1),
                path_name: "a.txt".into(),
                position: 6,
                length: 5,
            },
        )
        .await;

    match single(peer.flush().await) {
        Message::FileBytesResponse {
            content,
            status,
            message,
            ..
        } => {
            assert!(status);
            assert_eq!(message, "successful read");
            assert_eq!(BASE64.decode(content).unwrap(), b"world");
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn test_bytes_request_for_changed_file_fails() {
    let (fs, engine) = setup(1024);
    fs.insert_file("a.txt", b"changed", 1);
    let peer = RecordingOutbox::new("Alpha");

    engine
        .handle(
            peer.clone(),
            Message::FileBytesRequest {
                file_descriptor: FileMetadata::of_bytes(b"announced", 1),
                path_name: "a.txt".into(),
                position: 0,
                length: 5,
            },
        )
        .await;

    let reply = single(peer.flush().await);
    assert_eq!(reply.outcome(), Some((false, "unsuccessful read")));
}
