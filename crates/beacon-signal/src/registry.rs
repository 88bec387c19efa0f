//! Peer registry for the signal server
//!
//! The registry owns every live peer record, including the handle used to
//! reach its connection. Callers never see the table itself: they go through
//! the methods below, all of which take the lock for the duration of one
//! operation and never across an await point.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use beacon_core::crypto::try_generate_peer_id;
use beacon_core::RegistryError;

use crate::messages::PeerSummary;

/// Sending half of a connection, owned by its registry record
#[derive(Debug)]
pub struct PeerHandle {
    tx: mpsc::Sender<String>,
    shutdown: Arc<Notify>,
}

/// Receiving half of a connection, owned by the connection task
#[derive(Debug)]
pub struct PeerMailbox {
    pub rx: mpsc::Receiver<String>,
    pub shutdown: Arc<Notify>,
}

impl PeerHandle {
    /// Create a handle and the mailbox it feeds
    pub fn channel(capacity: usize) -> (PeerHandle, PeerMailbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shutdown = Arc::new(Notify::new());
        (
            PeerHandle {
                tx,
                shutdown: shutdown.clone(),
            },
            PeerMailbox { rx, shutdown },
        )
    }

    /// Queue a message without waiting. Fails if the queue is full or closed.
    fn try_send(&self, text: String) -> bool {
        self.tx.try_send(text).is_ok()
    }

    /// Ask the connection task to close the socket
    pub fn close(&self) {
        // notify_one stores a permit if the task is not currently waiting
        self.shutdown.notify_one();
    }
}

/// Alternate direct-connection address advertised by a peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RelayAddr {
    pub host: String,
    pub port: u16,
}

/// Liveness state derived from a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// Registered, no alias yet
    Connected,
    /// Alias set
    Identified,
}

/// A live peer record
#[derive(Debug)]
pub struct Peer {
    pub id: String,
    pub origin: SocketAddr,
    pub alias: Option<String>,
    pub relay_addr: Option<RelayAddr>,
    pub last_seen: Instant,
    pub connected_at: Instant,
    handle: PeerHandle,
}

impl Peer {
    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    pub fn state(&self) -> PeerState {
        if self.alias.is_some() {
            PeerState::Identified
        } else {
            PeerState::Connected
        }
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            origin: self.origin,
            alias: self.alias.clone(),
            relay_addr: self.relay_addr.clone(),
            last_seen: self.last_seen,
        }
    }
}

/// Point-in-time copy of a peer record, without its handle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub id: String,
    pub origin: SocketAddr,
    pub alias: Option<String>,
    pub relay_addr: Option<RelayAddr>,
    pub last_seen: Instant,
}

impl PeerSnapshot {
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.id.clone(),
            alias: self.alias.clone(),
        }
    }
}

/// Entry of the out-of-band peer-address listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RelayListing {
    pub username: String,
    pub host: String,
    pub port: u16,
}

/// Process-wide table of live peers
#[derive(Default)]
pub struct Registry {
    peers: RwLock<HashMap<String, Peer>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer under a freshly generated id
    pub fn register(
        &self,
        handle: PeerHandle,
        origin: SocketAddr,
        relay_addr: Option<RelayAddr>,
    ) -> Result<String, RegistryError> {
        let mut peers = self.peers.write();

        let mut id = try_generate_peer_id()?;
        while peers.contains_key(&id) {
            id = try_generate_peer_id()?;
        }

        let now = Instant::now();
        peers.insert(
            id.clone(),
            Peer {
                id: id.clone(),
                origin,
                alias: None,
                relay_addr,
                last_seen: now,
                connected_at: now,
                handle,
            },
        );

        debug!("Registered peer {} from {}", id, origin);
        Ok(id)
    }

    /// Refresh a peer's last-seen time
    pub fn touch(&self, peer_id: &str) -> bool {
        self.touch_at(peer_id, Instant::now())
    }

    pub(crate) fn touch_at(&self, peer_id: &str, at: Instant) -> bool {
        match self.peers.write().get_mut(peer_id) {
            Some(peer) => {
                peer.last_seen = at;
                true
            }
            None => false,
        }
    }

    pub fn set_alias(&self, peer_id: &str, alias: String) -> bool {
        match self.peers.write().get_mut(peer_id) {
            Some(peer) => {
                peer.alias = Some(alias);
                true
            }
            None => false,
        }
    }

    pub fn set_relay_addr(&self, peer_id: &str, addr: RelayAddr) -> bool {
        match self.peers.write().get_mut(peer_id) {
            Some(peer) => {
                peer.relay_addr = Some(addr);
                true
            }
            None => false,
        }
    }

    /// Remove and return a peer record
    pub fn remove(&self, peer_id: &str) -> Option<Peer> {
        self.peers.write().remove(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerSnapshot> {
        self.peers.read().get(peer_id).map(Peer::snapshot)
    }

    /// Consistent copy of every live peer
    pub fn list(&self) -> Vec<PeerSnapshot> {
        self.peers.read().values().map(Peer::snapshot).collect()
    }

    /// Summaries of identified peers only
    pub fn identified(&self) -> Vec<PeerSummary> {
        self.peers
            .read()
            .values()
            .filter(|p| p.state() == PeerState::Identified)
            .map(|p| p.snapshot().summary())
            .collect()
    }

    /// Ids of peers not seen since `threshold`
    pub fn list_idle_before(&self, threshold: Instant) -> Vec<String> {
        self.peers
            .read()
            .values()
            .filter(|p| p.last_seen < threshold)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Identified peers with a relay address, seen within `window` of `now`
    pub fn relay_listing(&self, now: Instant, window: Duration) -> Vec<RelayListing> {
        let cutoff = now.checked_sub(window);
        self.peers
            .read()
            .values()
            .filter(|p| cutoff.map_or(true, |c| p.last_seen >= c))
            .filter_map(|p| {
                let alias = p.alias.as_ref()?;
                let addr = p.relay_addr.as_ref()?;
                Some(RelayListing {
                    username: alias.clone(),
                    host: addr.host.clone(),
                    port: addr.port,
                })
            })
            .collect()
    }

    /// Queue a message for one peer
    pub fn send_to(&self, peer_id: &str, text: String) -> bool {
        let peers = self.peers.read();
        let Some(peer) = peers.get(peer_id) else {
            return false;
        };
        let queued = peer.handle.try_send(text);
        if !queued {
            debug!("Dropped message for {}: queue full or closed", peer_id);
        }
        queued
    }

    /// Queue a message for every peer except `except`. Returns how many
    /// queues accepted it.
    pub fn broadcast(&self, text: &str, except: Option<&str>) -> usize {
        let peers = self.peers.read();
        let mut delivered = 0;
        for peer in peers.values() {
            if Some(peer.id.as_str()) == except {
                continue;
            }
            if peer.handle.try_send(text.to_owned()) {
                delivered += 1;
            } else {
                debug!("Dropped broadcast for {}: queue full or closed", peer.id);
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
