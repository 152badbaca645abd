use std::hash::Hasher;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use siphasher::sip::SipHasher13;
use thiserror::Error;
use tracing::info;

use crate::discovery::{PeerListListener, PeerListProvider};
use crate::event::HashKey;

pub const DEFAULT_VIRTUAL_NODES: usize = 128;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no peers available to route to")]
    NoPeersAvailable,
}

#[derive(Debug, Clone, Copy)]
struct RingEntry {
    hash: u64,
    /// Index into `HashRing::peers`.
    peer: usize,
}

/// An immutable consistent-hash ring. Every peer owns `virtual_nodes` positions and a key
/// belongs to the first position at or after its own hash, wrapping around to the start.
///
/// Peers are de-duplicated and sorted before placement, so two nodes that know the same
/// peer set build identical rings whatever order their lists came in.
#[derive(Debug)]
pub struct HashRing {
    entries: Vec<RingEntry>,
    peers: Vec<String>,
}

impl HashRing {
    pub fn build<I, S>(peers: I, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut peers: Vec<String> = peers.into_iter().map(Into::into).collect();
        peers.sort();
        peers.dedup();

        let virtual_nodes = virtual_nodes.max(1);
        let mut entries = Vec::with_capacity(peers.len() * virtual_nodes);
        for (index, peer) in peers.iter().enumerate() {
            for vnode in 0..virtual_nodes {
                entries.push(RingEntry {
                    hash: hash_bytes(format!("{peer}#{vnode}").as_bytes()),
                    peer: index,
                });
            }
        }
        // Ties are broken by peer index, which follows the sorted peer names.
        entries.sort_unstable_by(|a, b| a.hash.cmp(&b.hash).then(a.peer.cmp(&b.peer)));

        HashRing { entries, peers }
    }

    pub fn empty() -> Self {
        HashRing {
            entries: Vec::new(),
            peers: Vec::new(),
        }
    }

    /// Returns the peer owning `key`. Pure: the same ring and key always give the same peer.
    pub fn resolve(&self, key: &HashKey) -> Result<&str, RoutingError> {
        let hash = hash_bytes(key.as_bytes());
        let position = self.entries.partition_point(|entry| entry.hash < hash);
        let entry = self
            .entries
            .get(position)
            .or_else(|| self.entries.first())
            .ok_or(RoutingError::NoPeersAvailable)?;

        Ok(&self.peers[entry.peer])
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new();
    hasher.write(bytes);
    hasher.finish()
}

/// The ring currently in use. Readers take a snapshot without locking; a membership change
/// builds a complete new ring and swaps it in, so a lookup never sees a half-built ring.
pub struct SharedHashRing {
    current: ArcSwap<HashRing>,
    virtual_nodes: usize,
    /// Number of membership notifications applied. Guarded so that the initial build in
    /// `attach` can tell whether a newer list already landed.
    generation: Mutex<u64>,
}

impl SharedHashRing {
    pub fn new(peers: Vec<String>, virtual_nodes: usize) -> Self {
        Self {
            current: ArcSwap::from_pointee(HashRing::build(peers, virtual_nodes)),
            virtual_nodes,
            generation: Mutex::new(0),
        }
    }

    /// Builds a ring from the provider's current peers and keeps it up to date with the
    /// provider's membership notifications.
    pub fn attach(provider: &dyn PeerListProvider, virtual_nodes: usize) -> Arc<Self> {
        let ring = Arc::new(Self::new(Vec::new(), virtual_nodes));
        // Subscribe before the first read so no change can fall between the two.
        provider.add_listener(ring.clone());
        let seen = ring.generation();
        let peers = provider.peer_list();

        let generation = ring.generation.lock().unwrap_or_else(PoisonError::into_inner);
        // A notification applied meanwhile carries a list at least as recent as `peers`.
        if *generation == seen {
            ring.install(&peers);
        }
        drop(generation);
        ring
    }

    fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Arc<HashRing> {
        self.current.load_full()
    }

    pub fn rebuild(&self, peers: &[String]) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        self.install(peers);
    }

    fn install(&self, peers: &[String]) {
        let ring = HashRing::build(peers.iter().cloned(), self.virtual_nodes);
        info!(
            peers = ?ring.peers(),
            virtual_nodes = self.virtual_nodes,
            "rebuilt hash ring"
        );
        metrics::gauge!("peer_forwarder_ring_peers").set(ring.peers().len() as f64);
        self.current.store(Arc::new(ring));
    }
}

impl PeerListListener for SharedHashRing {
    fn on_peer_list_change(&self, peers: &[String]) {
        self.rebuild(peers);
    }
}
