//! Individual peer connection management.
//!
//! Each connection runs two tasks over a split transport:
//! - a receive loop that reads lines, decodes them and routes messages
//! - a send loop that drains the outgoing queue, flushing one line at a time
//!   and running its on-sent hook before taking the next
//!
//! The queue is the only path to the writer, so per-peer order is the order
//! of `send_*` calls.

use crate::transport::Transport;
use async_trait::async_trait;
use bitsync_core::{on_sent, HostPort, Message, OnSent, Outbox, MAX_MESSAGE_SIZE};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => write!(f, "incoming"),
            Direction::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// `Pending -> Active -> Closed`. Closed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Pending,
    Active,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("Connection closed")]
    Closed,
    #[error("{0} is not a request")]
    NotARequest(&'static str),
}

/// Outcome of checking a handshake against the peer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Refuse, listing the peers the remote may try instead.
    Refuse(Vec<HostPort>),
}

/// Receives connection lifecycle events and activated-peer traffic.
#[async_trait]
pub trait PeerObserver: Send + Sync + 'static {
    /// Called for a handshake advertising `host_port`.
    fn admit(&self, peer: &PeerConnection, host_port: &HostPort) -> Admission;

    /// The peer became active.
    fn activated(&self, peer: &PeerConnection);

    /// A message from an active peer that is not an awaited response.
    async fn dispatch(&self, peer: &PeerConnection, message: Message);

    /// The remote refused our handshake, suggesting `peers`.
    fn refused(&self, peer: &PeerConnection, peers: Vec<HostPort>);

    /// The connection closed. Called once, when the receive loop stops.
    async fn closed(&self, peer: &PeerConnection);
}

/// One queued line and its post-flush hook.
pub struct Outgoing {
    line: String,
    on_sent: Option<OnSent>,
}

type Waiter = oneshot::Sender<Result<Message, PeerError>>;

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<String, VecDeque<Waiter>>,
}

struct Status {
    state: PeerState,
    host_port: Option<HostPort>,
}

struct Inner {
    name: String,
    direction: Direction,
    remote: Option<HostPort>,
    status: Mutex<Status>,
    pending: Mutex<Pending>,
    tx: mpsc::UnboundedSender<Outgoing>,
    cancel: CancellationToken,
}

/// Future resolving with the response to a request, or `PeerError::Closed`.
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Message, PeerError>>,
}

impl Future for PendingResponse {
    type Output = Result<Message, PeerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(PeerError::Closed)))
    }
}

/// Handle to one peer connection. Cheap to clone.
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("name", &self.inner.name)
            .field("direction", &self.inner.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl PeerConnection {
    /// Create a pending connection and the receiving end of its queue.
    ///
    /// `host_port` is known up front for outgoing peers (the dialled
    /// address) and set by the handshake for incoming ones.
    pub fn new(
        name: impl Into<String>,
        direction: Direction,
        remote: Option<HostPort>,
        host_port: Option<HostPort>,
    ) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Self {
            inner: Arc::new(Inner {
                name: name.into(),
                direction,
                remote,
                status: Mutex::new(Status {
                    state: PeerState::Pending,
                    host_port,
                }),
                pending: Mutex::new(Pending::default()),
                tx,
                cancel: CancellationToken::new(),
            }),
        };
        (peer, rx)
    }

    /// Spawn the receive and send loops over `transport`.
    ///
    /// `local` is the address we advertise in handshake responses.
    pub fn start<T: Transport>(
        &self,
        transport: T,
        rx: mpsc::UnboundedReceiver<Outgoing>,
        local: HostPort,
        observer: Arc<dyn PeerObserver>,
    ) {
        let (reader, writer) = transport.split();
        tokio::spawn(self.clone().send_loop(writer, rx));
        tokio::spawn(self.clone().receive_loop(reader, local, observer));
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Socket address of the remote end.
    pub fn remote(&self) -> Option<&HostPort> {
        self.inner.remote.as_ref()
    }

    /// Advertised (incoming) or dialled (outgoing) address.
    pub fn host_port(&self) -> Option<HostPort> {
        self.inner
            .status
            .lock()
            .ok()
            .and_then(|s| s.host_port.clone())
    }

    pub fn state(&self) -> PeerState {
        self.inner
            .status
            .lock()
            .map(|s| s.state)
            .unwrap_or(PeerState::Closed)
    }

    pub fn is_active(&self) -> bool {
        self.state() == PeerState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == PeerState::Closed
    }

    /// `Pending -> Active`. False if the peer was not pending.
    pub fn activate(&self, host_port: HostPort) -> bool {
        let Ok(mut status) = self.inner.status.lock() else {
            return false;
        };
        if status.state != PeerState::Pending {
            return false;
        }
        status.state = PeerState::Active;
        status.host_port = Some(host_port);
        true
    }

    /// Enqueue a message. Returns immediately.
    pub fn send_message(&self, message: Message) {
        self.enqueue(message, None);
    }

    /// Enqueue a message whose `hook` runs once the line has been flushed.
    pub fn send_message_then(&self, message: Message, hook: OnSent) {
        self.enqueue(message, Some(hook));
    }

    /// Enqueue a request and wait for the response with the same
    /// correlation key.
    pub fn send_request(&self, message: Message) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let key = message.correlation_key().filter(|_| message.is_request());
        let Some(key) = key else {
            let _ = tx.send(Err(PeerError::NotARequest(message.command())));
            return PendingResponse { rx };
        };

        match self.inner.pending.lock() {
            Ok(mut pending) if !pending.closed => {
                // Callers that gave up (timed out) leave closed senders behind
                pending.waiters.retain(|_, queue| {
                    queue.retain(|waiter| !waiter.is_closed());
                    !queue.is_empty()
                });
                pending.waiters.entry(key).or_default().push_back(tx);
            }
            _ => {
                let _ = tx.send(Err(PeerError::Closed));
                return PendingResponse { rx };
            }
        }
        self.send_message(message);
        PendingResponse { rx }
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner
            .pending
            .lock()
            .map(|p| p.waiters.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Stop both loops and fail every pending request. Idempotent.
    pub fn close(&self) {
        let first = match self.inner.status.lock() {
            Ok(mut status) if status.state != PeerState::Closed => {
                status.state = PeerState::Closed;
                true
            }
            _ => false,
        };
        self.inner.cancel.cancel();

        let waiters = match self.inner.pending.lock() {
            Ok(mut pending) => {
                pending.closed = true;
                std::mem::take(&mut pending.waiters)
            }
            Err(_) => HashMap::new(),
        };
        for waiter in waiters.into_values().flatten() {
            let _ = waiter.send(Err(PeerError::Closed));
        }

        if first {
            info!("Closed {} peer {}", self.inner.direction, self.inner.name);
        }
    }

    fn enqueue(&self, message: Message, on_sent: Option<OnSent>) {
        if self.is_closed() {
            debug!(
                "Dropping {} for closed peer {}",
                message.command(),
                self.inner.name
            );
            return;
        }
        debug!("Queueing {} for {}", message.command(), self.inner.name);
        let item = Outgoing {
            line: message.encode(),
            on_sent,
        };
        if self.inner.tx.send(item).is_err() {
            debug!("Send loop for {} already stopped", self.inner.name);
        }
    }

    /// Hand a response to the request waiting for it.
    ///
    /// Returns the message back if nobody is waiting.
    fn resolve(&self, message: Message) -> Option<Message> {
        let Some(key) = message.correlation_key() else {
            return Some(message);
        };
        let Ok(mut pending) = self.inner.pending.lock() else {
            return Some(message);
        };
        let Some(queue) = pending.waiters.get_mut(&key) else {
            return Some(message);
        };

        let mut message = message;
        while let Some(waiter) = queue.pop_front() {
            // A dropped receiver (timed-out caller) hands the message back
            match waiter.send(Ok(message)) {
                Ok(()) | Err(Err(_)) => {
                    if queue.is_empty() {
                        pending.waiters.remove(&key);
                    }
                    return None;
                }
                Err(Ok(returned)) => message = returned,
            }
        }
        pending.waiters.remove(&key);
        Some(message)
    }

    async fn send_loop<W: AsyncWrite + Unpin>(
        self,
        mut writer: W,
        mut rx: mpsc::UnboundedReceiver<Outgoing>,
    ) {
        let cancel = self.inner.cancel.clone();
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = write_line(&mut writer, &item.line) => result,
            };
            if let Err(e) = written {
                error!("Write to {} failed: {}", self.inner.name, e);
                self.close();
                break;
            }

            if let Some(hook) = item.on_sent {
                hook().await;
            }
        }
        let _ = writer.shutdown().await;
        debug!("Send loop for {} stopped", self.inner.name);
    }

    async fn receive_loop<R: AsyncRead + Unpin>(
        self,
        reader: R,
        local: HostPort,
        observer: Arc<dyn PeerObserver>,
    ) {
        let cancel = self.inner.cancel.clone();
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_MESSAGE_SIZE));
        // FramedRead yields one None after a decode error; reading may resume.
        let mut after_error = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = lines.next() => next,
            };

            match next {
                Some(Ok(line)) => {
                    after_error = false;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Message::decode(&line) {
                        Ok(message) => self.on_message(message, &local, &observer).await,
                        Err(e) => warn!("Dropping line from {}: {}", self.inner.name, e),
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(
                        "Line from {} exceeds max size ({} bytes), discarding",
                        self.inner.name, MAX_MESSAGE_SIZE
                    );
                    after_error = true;
                }
                Some(Err(LinesCodecError::Io(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                    warn!("Dropping non UTF-8 line from {}: {}", self.inner.name, e);
                    after_error = true;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    error!("Read from {} failed: {}", self.inner.name, e);
                    break;
                }
                None if after_error => after_error = false,
                None => {
                    debug!("Peer {} closed the connection", self.inner.name);
                    break;
                }
            }
        }

        self.close();
        observer.closed(&self).await;
    }

    async fn on_message(&self, message: Message, local: &HostPort, observer: &Arc<dyn PeerObserver>) {
        let state = self.state();
        debug!(
            "Received {} from {} ({:?})",
            message.command(),
            self.inner.name,
            state
        );

        match (state, message) {
            (PeerState::Closed, _) => {}

            (_, Message::InvalidProtocol { message }) => {
                warn!("Peer {} reported invalid protocol: {}", self.inner.name, message);
                self.close();
            }

            (PeerState::Pending, Message::HandshakeRequest { host_port })
                if self.inner.direction == Direction::Incoming =>
            {
                match observer.admit(self, &host_port) {
                    Admission::Accept if self.activate(host_port.clone()) => {
                        info!("Peer {} is {}", self.inner.name, host_port);
                        self.send_message(Message::HandshakeResponse {
                            host_port: local.clone(),
                        });
                        observer.activated(self);
                    }
                    Admission::Accept => {}
                    Admission::Refuse(peers) => {
                        info!(
                            "Refusing handshake from {} as {}",
                            self.inner.name, host_port
                        );
                        let peer = self.clone();
                        self.send_message_then(
                            Message::connection_refused(peers),
                            on_sent(move || async move { peer.close() }),
                        );
                    }
                }
            }

            (PeerState::Pending, Message::HandshakeResponse { host_port })
                if self.inner.direction == Direction::Outgoing =>
            {
                let dialled = self.host_port().unwrap_or_else(|| host_port.clone());
                match observer.admit(self, &host_port) {
                    Admission::Accept if self.activate(dialled) => {
                        info!("Peer {} is {}", self.inner.name, host_port);
                        observer.activated(self);
                    }
                    Admission::Accept => {}
                    Admission::Refuse(_) => {
                        info!(
                            "Already connected to {}, dropping {}",
                            host_port, self.inner.name
                        );
                        self.close();
                    }
                }
            }

            (PeerState::Pending, Message::ConnectionRefused { message, peers })
                if self.inner.direction == Direction::Outgoing =>
            {
                info!(
                    "Peer {} refused connection: {} ({} alternatives)",
                    self.inner.name,
                    message,
                    peers.len()
                );
                observer.refused(self, peers);
                self.close();
            }

            (PeerState::Pending, other) => {
                warn!(
                    "Unexpected {} from {} before handshake",
                    other.command(),
                    self.inner.name
                );
                self.send_message(Message::invalid_protocol(format!(
                    "expected handshake, got {}",
                    other.command()
                )));
            }

            (PeerState::Active, other) if other.is_handshake() => {
                warn!(
                    "Unexpected {} from active peer {}",
                    other.command(),
                    self.inner.name
                );
                self.send_message(Message::invalid_protocol(format!(
                    "unexpected {} after handshake",
                    other.command()
                )));
            }

            (PeerState::Active, other) => {
                let unclaimed = if other.is_response() {
                    self.resolve(other)
                } else {
                    Some(other)
                };
                if let Some(message) = unclaimed {
                    observer.dispatch(self, message).await;
                }
            }
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

impl Outbox for PeerConnection {
    fn peer_name(&self) -> &str {
        self.name()
    }

    fn send(&self, message: Message) {
        self.send_message(message);
    }

    fn send_then(&self, message: Message, hook: OnSent) {
        self.send_message_then(message, hook);
    }
}
