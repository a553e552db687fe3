use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Slot index assigned to a peer at registration. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl PeerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The registry's view of a peer: where it is and how to reach its writer.
#[derive(Debug)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub outbound: mpsc::Sender<Bytes>,
}

impl PeerHandle {
    pub fn new(addr: SocketAddr, outbound: mpsc::Sender<Bytes>) -> Self {
        Self { addr, outbound }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
}

/// Every peer currently connected to the relay.
///
/// Shared between the listener and all workers behind an `Arc`. The lock is only ever held for
/// synchronous work, never across an `.await`.
#[derive(Debug)]
pub struct Registry {
    peers: Mutex<HashMap<PeerId, PeerHandle>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a peer and returns its freshly assigned slot.
    pub fn add(&self, handle: PeerHandle) -> PeerId {
        let id = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.peers.lock().insert(id, handle);
        id
    }

    /// Removes a peer, returning its handle if it was still registered.
    pub fn remove(&self, id: PeerId) -> Option<PeerHandle> {
        self.peers.lock().remove(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Returns the registered peers ordered by slot.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self
            .peers
            .lock()
            .iter()
            .map(|(&id, handle)| PeerInfo {
                id,
                addr: handle.addr,
            })
            .collect();
        peers.sort_unstable_by_key(|peer| peer.id);
        peers
    }

    /// Applies `f` to every registered peer other than `except`.
    ///
    /// The whole pass runs under the registry lock, so a concurrent [`Registry::add`] is either
    /// seen in full or not at all.
    pub fn for_each_except<F>(&self, except: PeerId, mut f: F)
    where
        F: FnMut(PeerId, &PeerHandle),
    {
        let peers = self.peers.lock();
        for (&id, handle) in peers.iter().filter(|(&id, _)| id != except) {
            f(id, handle);
        }
    }
}
