//! Peer table: live connections, display names and known addresses.
//!
//! The handler keeps one `PeerTable` behind a single mutex; every method
//! here is synchronous so the lock is never held across an await.

use crate::connection::{Direction, Outgoing, PeerConnection, PeerState};
use crate::reconnect::{KnownPeers, ReconnectConfig, Retry};
use bitsync_core::HostPort;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

/// Display names handed out to peers, lowest free first.
pub const PEER_NAMES: [&str; 26] = [
    "Alpha", "Bravo", "Charlie", "Delta", "Echo", "Foxtrot", "Golf", "Hotel", "India", "Juliett",
    "Kilo", "Lima", "Mike", "November", "Oscar", "Papa", "Quebec", "Romeo", "Sierra", "Tango",
    "Uniform", "Victor", "Whiskey", "Xray", "Yankee", "Zulu",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddPeerError {
    #[error("Incoming connection limit reached ({active} peers)")]
    AtCapacity { active: usize },
    #[error("No peer name available")]
    NoNameAvailable,
}

/// Bounded pool of display names.
#[derive(Debug, Default)]
pub struct NamePool {
    in_use: BTreeSet<usize>,
}

impl NamePool {
    pub fn allocate(&mut self) -> Option<&'static str> {
        let index = (0..PEER_NAMES.len()).find(|i| !self.in_use.contains(i))?;
        self.in_use.insert(index);
        Some(PEER_NAMES[index])
    }

    pub fn release(&mut self, name: &str) {
        if let Some(index) = PEER_NAMES.iter().position(|n| *n == name) {
            self.in_use.remove(&index);
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}

#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<String, PeerConnection>,
    names: NamePool,
    /// Addresses with a dial in progress
    dialing: HashSet<HostPort>,
    /// Addresses we may (re)dial
    known: KnownPeers,
}

impl PeerTable {
    pub fn new(reconnect: ReconnectConfig) -> Self {
        Self {
            known: KnownPeers::new(reconnect),
            ..Default::default()
        }
    }

    /// Register a new pending peer under a fresh name.
    ///
    /// Incoming peers are refused once `incoming_limit` live incoming peers
    /// exist.
    pub fn add_peer(
        &mut self,
        direction: Direction,
        remote: Option<HostPort>,
        host_port: Option<HostPort>,
        incoming_limit: usize,
    ) -> Result<(PeerConnection, mpsc::UnboundedReceiver<Outgoing>), AddPeerError> {
        if direction == Direction::Incoming {
            let active = self.incoming_count();
            if active >= incoming_limit {
                return Err(AddPeerError::AtCapacity { active });
            }
        }
        let name = self.names.allocate().ok_or(AddPeerError::NoNameAvailable)?;
        let (peer, rx) = PeerConnection::new(name, direction, remote, host_port);
        self.peers.insert(name.to_string(), peer.clone());
        Ok((peer, rx))
    }

    /// Drop a peer and release its name.
    pub fn remove(&mut self, name: &str) -> Option<PeerConnection> {
        let peer = self.peers.remove(name)?;
        self.names.release(name);
        Some(peer)
    }

    pub fn get(&self, name: &str) -> Option<PeerConnection> {
        self.peers.get(name).cloned()
    }

    /// Live (pending or active) incoming peers.
    pub fn incoming_count(&self) -> usize {
        self.live()
            .filter(|p| p.direction() == Direction::Incoming)
            .count()
    }

    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if a live peer or a dial in progress already covers `host_port`.
    pub fn has_peer(&self, host_port: &HostPort) -> bool {
        self.dialing.contains(host_port)
            || self
                .live()
                .any(|p| p.host_port().as_ref() == Some(host_port) || p.remote() == Some(host_port))
    }

    /// Active peers other than `name` known as `host_port`.
    pub fn holders(&self, name: &str, host_port: &HostPort) -> Vec<PeerConnection> {
        self.peers
            .values()
            .filter(|p| {
                p.name() != name
                    && p.state() == PeerState::Active
                    && p.host_port().as_ref() == Some(host_port)
            })
            .cloned()
            .collect()
    }

    /// HostPorts of all active peers, sorted.
    pub fn active_peers(&self) -> Vec<HostPort> {
        let mut peers: Vec<HostPort> = self
            .peers
            .values()
            .filter(|p| p.is_active())
            .filter_map(|p| p.host_port())
            .collect();
        peers.sort();
        peers
    }

    pub fn active_connections(&self) -> Vec<PeerConnection> {
        self.peers.values().filter(|p| p.is_active()).cloned().collect()
    }

    // ==================== Dialing ====================

    /// Reserve `host_port` for an outgoing dial. False if already covered.
    pub fn claim_dial(&mut self, host_port: &HostPort) -> bool {
        if self.has_peer(host_port) {
            return false;
        }
        self.dialing.insert(host_port.clone())
    }

    pub fn release_dial(&mut self, host_port: &HostPort) {
        self.dialing.remove(host_port);
    }

    // ==================== Known addresses ====================

    pub fn remember(&mut self, host_port: HostPort) {
        self.known.remember(host_port);
    }

    pub fn is_known(&self, host_port: &HostPort) -> bool {
        self.known.contains(host_port)
    }

    /// A peer on `host_port` activated, whichever side dialled.
    pub fn mark_connected(&mut self, host_port: &HostPort) {
        self.known.connected(host_port);
    }

    /// Schedule the next attempt for a known address unless a live peer or
    /// dial already covers it.
    pub fn schedule_reconnect(&mut self, host_port: &HostPort, now: Instant) -> Option<Retry> {
        if self.has_peer(host_port) {
            return None;
        }
        Some(self.known.lost(host_port, now))
    }

    /// Known addresses whose wait is over and that have no peer. Each is
    /// handed out once per loss.
    pub fn due_reconnects(&mut self, now: Instant) -> Vec<HostPort> {
        let due: Vec<HostPort> = self
            .known
            .due(now)
            .into_iter()
            .filter(|hp| !self.has_peer(hp))
            .collect();
        for hp in &due {
            self.known.take(hp);
        }
        due
    }

    fn live(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values().filter(|p| !p.is_closed())
    }
}

/// Whether `existing` survives over `candidate`, both connected to `remote`.
///
/// When two nodes dial each other at once, each ends up with one incoming
/// and one outgoing connection. Both ends keep the connection dialled by
/// the lower address, so they drop the same one. Between two connections in
/// the same direction the established one stays.
pub fn keeps_existing(
    existing: &PeerConnection,
    candidate: &PeerConnection,
    local: &HostPort,
    remote: &HostPort,
) -> bool {
    if existing.direction() == candidate.direction() {
        return true;
    }
    let dialler = |peer: &PeerConnection| match peer.direction() {
        Direction::Outgoing => local,
        Direction::Incoming => remote,
    };
    dialler(existing) < dialler(candidate)
}
