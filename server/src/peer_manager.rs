//! Peer connection tracking for the file distribution server
//!
//! This module maintains the server-side roster of connected peers:
//! - Connection lifecycle (connect, disconnect, timeout)
//! - Last-seen bookkeeping driven by inbound traffic
//! - Capacity enforcement at connect time
//!
//! The file sender consults this roster at the top of every tick sweep;
//! a transfer whose recipient is no longer listed here gets finalized and
//! removed on that sweep.

use crate::transfer::Recipient;
use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How long a peer may stay silent before it counts as disconnected.
const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected peer and its liveness bookkeeping.
#[derive(Debug)]
pub struct Peer {
    pub addr: SocketAddr,
    /// Display name supplied at connect time, used only for logging.
    pub name: String,
    /// Last time we received any packet from this peer.
    pub last_seen: Instant,
}

impl Peer {
    pub fn new(addr: SocketAddr, name: String) -> Self {
        Self {
            addr,
            name,
            last_seen: Instant::now(),
        }
    }

    pub fn refresh_last_seen(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Tracks all connected peers and answers connection-status queries.
///
/// The local owner (the process hosting the server) is always considered
/// connected and never appears in the roster; only remote peers are
/// tracked, keyed by their socket address.
pub struct PeerManager {
    peers: HashMap<SocketAddr, Peer>,
    max_peers: usize,
    timeout: Duration,
}

impl PeerManager {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
            timeout: PEER_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(max_peers: usize, timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
            timeout,
        }
    }

    /// Admits a new peer, or returns false when the server is full.
    /// Reconnecting from an address that is already listed just refreshes
    /// the existing entry.
    pub fn add_peer(&mut self, addr: SocketAddr, name: String) -> bool {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.name = name;
            peer.refresh_last_seen();
            return true;
        }
        if self.peers.len() >= self.max_peers {
            return false;
        }

        info!("Peer {} connected from {}", name, addr);
        self.peers.insert(addr, Peer::new(addr, name));
        true
    }

    /// Removes a peer from the roster. Returns true if it was present.
    pub fn remove_peer(&mut self, addr: &SocketAddr) -> bool {
        if let Some(peer) = self.peers.remove(addr) {
            info!("Peer {} ({}) disconnected", peer.name, addr);
            true
        } else {
            false
        }
    }

    /// Marks the peer alive. Called for every inbound packet.
    pub fn touch(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.refresh_last_seen();
        }
    }

    /// Connection-status query used by the transfer sweep.
    pub fn is_connected(&self, recipient: &Recipient) -> bool {
        match recipient {
            Recipient::LocalOwner => true,
            Recipient::Remote(addr) => self.peers.contains_key(addr),
        }
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Drops every peer that has been silent past the timeout and returns
    /// their addresses so the caller can clean up dependent state.
    pub fn check_timeouts(&mut self) -> Vec<SocketAddr> {
        let timeout = self.timeout;
        let timed_out: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|peer| peer.is_timed_out(timeout))
            .map(|peer| peer.addr)
            .collect();

        for addr in &timed_out {
            self.remove_peer(addr);
        }

        timed_out
    }

    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
