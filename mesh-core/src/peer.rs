//! In-memory mapping from peer hostname to peer record — the sole source of
//! truth the reconciler diffs against kernel state.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::error::Error;

/// A remote node: hostname, machine address, inner address, public key,
/// listen port, pod subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub hostname: String,
    pub machine_ip: IpAddr,
    pub inner_ip: IpAddr,
    pub public_key: String,
    pub listen_port: u16,
    pub pod_subnet: String,
}

/// Owned exclusively by the control loop; nothing else may mutate it.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fully replaces any prior value for the same hostname.
    pub fn upsert(&mut self, peer: Peer) {
        self.peers.insert(peer.hostname.clone(), peer);
    }

    /// Idempotent: deleting an absent hostname succeeds.
    pub fn delete(&mut self, hostname: &str) {
        self.peers.remove(hostname);
    }

    pub fn get(&self, hostname: &str) -> Result<&Peer, Error> {
        self.peers
            .get(hostname)
            .ok_or_else(|| Error::NotFound(format!("no peer named {hostname}")))
    }

    pub fn iterate(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
