//! Connection handler: accepts and dials peers, owns the peer table.
//!
//! Incoming sockets are admitted up to `max_incoming_connections`; beyond
//! that they get one CONNECTION_REFUSED listing our active peers and are
//! closed without ever becoming a peer. Outgoing dials are deduplicated
//! against the table, and every dialled address stays known so it can be
//! retried with backoff when its peer goes away.

use crate::connection::{Admission, Direction, PeerConnection, PeerObserver};
use crate::peers::{keeps_existing, PeerTable};
use crate::reconnect::{ReconnectConfig, Retry};
use crate::transport::Transport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bitsync_core::{FileEvent, FileSystemManager, HostPort, Message, Outbox, SyncEngine};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Address advertised in handshakes
    pub local: HostPort,
    pub max_incoming_connections: usize,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl HandlerConfig {
    pub fn new(local: HostPort) -> Self {
        Self {
            local,
            max_incoming_connections: 10,
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }
}

pub struct ConnectionHandler<F> {
    config: HandlerConfig,
    table: Mutex<PeerTable>,
    engine: Arc<SyncEngine<F>>,
    me: Weak<Self>,
}

impl<F: FileSystemManager + 'static> ConnectionHandler<F> {
    pub fn new(config: HandlerConfig, engine: Arc<SyncEngine<F>>) -> Arc<Self> {
        let table = PeerTable::new(config.reconnect.clone());
        Arc::new_cyclic(|me| Self {
            config,
            table: Mutex::new(table),
            engine,
            me: me.clone(),
        })
    }

    /// Bind the listening socket. Failure here is fatal for the daemon.
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<SyncEngine<F>> {
        &self.engine
    }

    /// HostPorts of all active peers.
    pub fn active_peers(&self) -> Vec<HostPort> {
        self.table().active_peers()
    }

    pub fn peer_count(&self) -> usize {
        self.table().len()
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn accept_connections(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    self.accept_transport(stream);
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Register an accepted transport as an incoming peer, or refuse it.
    pub fn accept_transport<T: Transport>(&self, transport: T) {
        let remote = transport.remote_address();
        let added = {
            let mut table = self.table();
            table
                .add_peer(
                    Direction::Incoming,
                    remote.clone(),
                    None,
                    self.config.max_incoming_connections,
                )
                .map_err(|e| (e, table.active_peers()))
        };

        match added {
            Ok((peer, rx)) => {
                info!(
                    "Incoming connection from {} is {}",
                    remote.map(|r| r.to_string()).unwrap_or_default(),
                    peer.name()
                );
                self.start_peer(&peer, transport, rx);
            }
            Err((reason, peers)) => {
                info!("Refusing incoming connection: {}", reason);
                tokio::spawn(refuse(transport, peers));
            }
        }
    }

    /// Dial `host_port` unless a peer or dial already covers it.
    pub async fn try_peer(&self, host_port: HostPort) -> Option<PeerConnection> {
        if host_port == self.config.local {
            return None;
        }
        {
            let mut table = self.table();
            table.remember(host_port.clone());
            if !table.claim_dial(&host_port) {
                debug!("Already connected or dialling {}", host_port);
                return None;
            }
        }

        info!("Connecting to {}", host_port);
        let connect = TcpStream::connect((host_port.host.as_str(), host_port.port));
        let stream = match timeout(self.config.handshake_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Failed to connect to {}: {}", host_port, e);
                self.dial_failed(&host_port);
                return None;
            }
            Err(_) => {
                warn!("Timed out connecting to {}", host_port);
                self.dial_failed(&host_port);
                return None;
            }
        };
        let _ = stream.set_nodelay(true);

        let added = {
            let mut table = self.table();
            table.release_dial(&host_port);
            table.add_peer(
                Direction::Outgoing,
                stream.remote_address(),
                Some(host_port.clone()),
                usize::MAX,
            )
        };
        match added {
            Ok((peer, rx)) => {
                info!("Outgoing connection to {} is {}", host_port, peer.name());
                peer.send_message(Message::HandshakeRequest {
                    host_port: self.config.local.clone(),
                });
                self.start_peer(&peer, stream, rx);
                Some(peer)
            }
            Err(e) => {
                warn!("Dropping connection to {}: {}", host_port, e);
                None
            }
        }
    }

    /// Send `event` to every active peer and log each response.
    pub fn broadcast(&self, event: &FileEvent) {
        let peers = self.table().active_connections();
        if peers.is_empty() {
            debug!("No peers for {:?}", event);
            return;
        }
        let request = event.to_request();
        for peer in peers {
            self.spawn_request(&peer, request.clone());
        }
    }

    /// Announce the full local tree to every active peer.
    pub async fn sync_all(&self) {
        let peers = self.table().active_connections();
        if peers.is_empty() {
            return;
        }
        debug!("Periodic sync with {} peers", peers.len());
        for peer in peers {
            self.send_snapshot(&peer).await;
        }
    }

    /// Redial known addresses whose backoff has elapsed.
    pub fn reconnect_due(&self) {
        let due = self.table().due_reconnects(Instant::now());
        for host_port in due {
            let Some(me) = self.me.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                me.try_peer(host_port).await;
            });
        }
    }

    /// Close every peer.
    pub fn shutdown(&self) {
        let peers: Vec<PeerConnection> = self.table().active_connections();
        for peer in peers {
            peer.close();
        }
    }

    async fn send_snapshot(&self, peer: &PeerConnection) {
        let events = match self.engine.fs().generate_sync_events().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to scan local tree: {}", e);
                return;
            }
        };
        debug!("Sending {} sync events to {}", events.len(), peer.name());
        for event in events {
            self.spawn_request(peer, event.to_request());
        }
    }

    fn spawn_request(&self, peer: &PeerConnection, request: Message) {
        let pending = peer.send_request(request.clone());
        let name = peer.name().to_string();
        let wait = self.config.request_timeout;
        tokio::spawn(async move {
            match timeout(wait, pending).await {
                Ok(Ok(response)) => match response.outcome() {
                    Some((true, reason)) => debug!(
                        "{} {:?} on {}: {}",
                        request.command(),
                        request.path_name(),
                        name,
                        reason
                    ),
                    _ => warn!(
                        "{} {:?} on {} failed: {}",
                        request.command(),
                        request.path_name(),
                        name,
                        response.outcome().map(|(_, r)| r).unwrap_or("no status")
                    ),
                },
                Ok(Err(e)) => debug!("{} to {} not answered: {}", request.command(), name, e),
                Err(_) => warn!(
                    "{} {:?} to {} timed out",
                    request.command(),
                    request.path_name(),
                    name
                ),
            }
        });
    }

    fn start_peer<T: Transport>(
        &self,
        peer: &PeerConnection,
        transport: T,
        rx: tokio::sync::mpsc::UnboundedReceiver<crate::connection::Outgoing>,
    ) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let observer: Arc<dyn PeerObserver> = me;
        peer.start(transport, rx, self.config.local.clone(), observer);

        let pending = peer.clone();
        let wait = self.config.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if pending.state() == crate::connection::PeerState::Pending {
                warn!("Handshake with {} timed out", pending.name());
                pending.close();
            }
        });
    }

    fn dial_failed(&self, host_port: &HostPort) {
        let retry = {
            let mut table = self.table();
            table.release_dial(host_port);
            table.schedule_reconnect(host_port, Instant::now())
        };
        log_retry(host_port, retry);
    }

    fn table(&self) -> MutexGuard<'_, PeerTable> {
        // A poisoned table is still structurally valid
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn log_retry(host_port: &HostPort, retry: Option<Retry>) {
    match retry {
        Some(Retry::After(delay)) => info!("Retrying {} in {:?}", host_port, delay),
        Some(Retry::GaveUp) => info!("Giving up on {}", host_port),
        Some(Retry::Unknown) | None => {}
    }
}

/// Write one CONNECTION_REFUSED and close, draining what the remote sent
/// so the close does not reset the connection before it reads the refusal.
async fn refuse<T: Transport>(transport: T, peers: Vec<HostPort>) {
    let (mut reader, mut writer) = transport.split();
    let line = Message::connection_refused(peers).encode();
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        debug!("Failed to send refusal: {}", e);
        return;
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    let _ = timeout(
        Duration::from_secs(2),
        tokio::io::copy(&mut reader, &mut tokio::io::sink()),
    )
    .await;
}

#[async_trait]
impl<F: FileSystemManager + 'static> PeerObserver for ConnectionHandler<F> {
    fn admit(&self, peer: &PeerConnection, host_port: &HostPort) -> Admission {
        let table = self.table();
        let local = &self.config.local;
        let superseded = table
            .holders(peer.name(), host_port)
            .iter()
            .any(|existing| keeps_existing(existing, peer, local, host_port));
        if host_port == local || superseded {
            Admission::Refuse(table.active_peers())
        } else {
            Admission::Accept
        }
    }

    fn activated(&self, peer: &PeerConnection) {
        let Some(host_port) = peer.host_port() else {
            return;
        };
        {
            let mut table = self.table();
            // Both ends of a simultaneous dial may activate both sockets;
            // each end then drops the one the tie-break loses.
            let local = &self.config.local;
            for existing in table.holders(peer.name(), &host_port) {
                if keeps_existing(&existing, peer, local, &host_port) {
                    info!(
                        "{} duplicates {} for {}, dropping it",
                        peer.name(),
                        existing.name(),
                        host_port
                    );
                    peer.close();
                    return;
                }
                info!(
                    "{} replaces {} for {}",
                    peer.name(),
                    existing.name(),
                    host_port
                );
                existing.close();
            }
            table.mark_connected(&host_port);
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let peer = peer.clone();
        tokio::spawn(async move {
            me.send_snapshot(&peer).await;
        });
    }

    async fn dispatch(&self, peer: &PeerConnection, message: Message) {
        let outbox: Arc<dyn Outbox> = Arc::new(peer.clone());
        self.engine.handle(outbox, message).await;
    }

    fn refused(&self, _peer: &PeerConnection, peers: Vec<HostPort>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            for host_port in peers {
                me.try_peer(host_port).await;
            }
        });
    }

    async fn closed(&self, peer: &PeerConnection) {
        self.engine.abort_transfers_from(peer.name()).await;

        let retry = {
            let mut table = self.table();
            table.remove(peer.name());
            match peer.host_port() {
                Some(host_port) if peer.direction() == Direction::Outgoing => {
                    table.schedule_reconnect(&host_port, Instant::now())
                }
                _ => None,
            }
        };
        if let Some(host_port) = peer.host_port() {
            log_retry(&host_port, retry);
        }
    }
}
