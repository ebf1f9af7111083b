//! Secondary peer indices.
//!
//! The transport owns the peers themselves; the dispatcher owns these maps
//! over them: which affine peers are actually held open per service (and the
//! mirror per peer), which peers have been seen this reap window, which are
//! queued for reaping, and which are queued for pruning.
//!
//! Pruning closes outbound connections only and keeps the peer; reaping
//! closes both directions and deletes it.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use relaymesh_common::{HostPort, ServiceName};

/// Why a peer was scheduled for pruning; carried into the log line when the
/// pruner gets to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneEntry {
    pub last_refresh: Instant,
    pub reason: String,
}

/// Peers seen per service with their last-refresh stamp.
pub type SeenPeers = HashMap<HostPort, HashMap<ServiceName, Instant>>;

#[derive(Debug, Default)]
pub struct PeerIndex {
    /// service → affine peers held open. Mirror of `connected_peer_services`.
    connected_service_peers: HashMap<ServiceName, HashSet<HostPort>>,
    /// peer → services holding it open. Mirror of `connected_service_peers`.
    connected_peer_services: HashMap<HostPort, HashSet<ServiceName>>,
    /// Peers re-advertised since the last reap tick.
    known_peers: SeenPeers,
    /// Candidates from the previous reap tick; still here and not re-known
    /// at the next tick means dead.
    peers_to_reap: SeenPeers,
    /// Out-of-affinity peers awaiting outbound-connection close.
    peers_to_prune: HashMap<HostPort, PruneEntry>,
}

impl PeerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `(service, peer)` as held open, both directions of the mirror.
    pub fn add_connected(&mut self, service_name: &str, host_port: &str) {
        self.connected_service_peers
            .entry(service_name.to_string())
            .or_default()
            .insert(host_port.to_string());
        self.connected_peer_services
            .entry(host_port.to_string())
            .or_default()
            .insert(service_name.to_string());
    }

    /// Drop `(service, peer)` from both mirrors. Returns true when the peer
    /// now holds no services at all.
    pub fn remove_connected(&mut self, service_name: &str, host_port: &str) -> bool {
        if let Some(peers) = self.connected_service_peers.get_mut(service_name) {
            peers.remove(host_port);
            if peers.is_empty() {
                self.connected_service_peers.remove(service_name);
            }
        }
        match self.connected_peer_services.get_mut(host_port) {
            Some(services) => {
                services.remove(service_name);
                if services.is_empty() {
                    self.connected_peer_services.remove(host_port);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    pub fn connected_peers_of(&self, service_name: &str) -> HashSet<HostPort> {
        self.connected_service_peers
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connected_services_of(&self, host_port: &str) -> HashSet<ServiceName> {
        self.connected_peer_services
            .get(host_port)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_connected(&self, service_name: &str, host_port: &str) -> bool {
        self.connected_service_peers
            .get(service_name)
            .map(|peers| peers.contains(host_port))
            .unwrap_or(false)
    }

    /// An advertise landed: the peer is alive for this service. Clears any
    /// pending reap entry for the pair.
    pub fn mark_known(&mut self, service_name: &str, host_port: &str, now: Instant) {
        self.known_peers
            .entry(host_port.to_string())
            .or_default()
            .insert(service_name.to_string(), now);
        self.unmark_reap(service_name, host_port);
    }

    pub fn unmark_known(&mut self, service_name: &str, host_port: &str) {
        if let Some(services) = self.known_peers.get_mut(host_port) {
            services.remove(service_name);
            if services.is_empty() {
                self.known_peers.remove(host_port);
            }
        }
    }

    pub fn unmark_reap(&mut self, service_name: &str, host_port: &str) {
        if let Some(services) = self.peers_to_reap.get_mut(host_port) {
            services.remove(service_name);
            if services.is_empty() {
                self.peers_to_reap.remove(host_port);
            }
        }
    }

    /// One reap tick: what was queued and never re-known is dead and
    /// returned to the caller; what was known moves into the queue.
    pub fn begin_reap_cycle(&mut self) -> SeenPeers {
        let dead = std::mem::take(&mut self.peers_to_reap);
        self.peers_to_reap = std::mem::take(&mut self.known_peers);
        dead
    }

    /// Queue a peer for pruning unless it is already queued. Returns true
    /// when newly scheduled.
    pub fn schedule_prune(&mut self, host_port: &str, reason: &str, now: Instant) -> bool {
        if self.peers_to_prune.contains_key(host_port) {
            return false;
        }
        self.peers_to_prune.insert(
            host_port.to_string(),
            PruneEntry { last_refresh: now, reason: reason.to_string() },
        );
        true
    }

    pub fn cancel_prune(&mut self, host_port: &str) -> bool {
        self.peers_to_prune.remove(host_port).is_some()
    }

    pub fn is_scheduled_for_prune(&self, host_port: &str) -> bool {
        self.peers_to_prune.contains_key(host_port)
    }

    /// Drain the prune queue for one pruner pass.
    pub fn take_prunables(&mut self) -> Vec<(HostPort, PruneEntry)> {
        std::mem::take(&mut self.peers_to_prune).into_iter().collect()
    }

    pub fn known_peer_count(&self) -> usize {
        self.known_peers.len()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.connected_peer_services.len()
    }

    /// Mirror-consistency check for debug builds and tests.
    pub fn assert_mirrors(&self) {
        for (service_name, peers) in &self.connected_service_peers {
            for host_port in peers {
                debug_assert!(
                    self.connected_peer_services
                        .get(host_port)
                        .map(|s| s.contains(service_name))
                        .unwrap_or(false),
                    "index mirror broken: {service_name} -> {host_port}"
                );
            }
        }
        for (host_port, services) in &self.connected_peer_services {
            for service_name in services {
                debug_assert!(
                    self.connected_service_peers
                        .get(service_name)
                        .map(|p| p.contains(host_port))
                        .unwrap_or(false),
                    "index mirror broken: {host_port} -> {service_name}"
                );
            }
        }
    }
}
