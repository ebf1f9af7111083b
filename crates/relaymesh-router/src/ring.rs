//! Read-only projection of the membership ring.
//!
//! The ring itself belongs to the gossip/membership layer; this module only
//! answers "which K hosts own this service" and "am I one of them", and
//! fires a change event when the membership layer reports a delta. The view
//! caches nothing but the configured K values.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use tokio::sync::broadcast;

use relaymesh_common::{HostPort, ServiceName};

/// Membership snapshot supplied by the gossip layer.
///
/// `hosts_for` must be deterministic for a given ring state: the same
/// (service, k) yields the same host set on every fleet member.
pub trait Ring: Send + Sync {
    fn hosts_for(&self, service_name: &str, k: usize) -> Vec<HostPort>;
}

/// Fired on every membership delta. Carries no payload; subscribers
/// recompute from the ring.
#[derive(Debug, Clone, Copy)]
pub struct RingChanged;

/// Per-router projection of the ring: exit sets, the local role, and the
/// per-service K overrides from remote config.
pub struct RingView {
    ring: Arc<dyn Ring>,
    local: HostPort,
    k_default: AtomicUsize,
    k_services: StdRwLock<HashMap<ServiceName, usize>>,
    changed_tx: broadcast::Sender<RingChanged>,
}

impl RingView {
    pub fn new(ring: Arc<dyn Ring>, local: impl Into<HostPort>, k_default: usize) -> Self {
        let (changed_tx, _) = broadcast::channel(16);
        Self {
            ring,
            local: local.into(),
            k_default: AtomicUsize::new(k_default),
            k_services: StdRwLock::new(HashMap::new()),
            changed_tx,
        }
    }

    pub fn local_host_port(&self) -> &str {
        &self.local
    }

    /// Effective K for a service: remote-config override, else the default.
    pub fn k_for(&self, service_name: &str) -> usize {
        if let Some(k) = self.k_services.read().unwrap().get(service_name) {
            return *k;
        }
        self.k_default.load(Ordering::Relaxed)
    }

    /// The exit hosts responsible for a service, sorted. At most K entries;
    /// fewer when the fleet is smaller than K.
    pub fn exits_for(&self, service_name: &str) -> Vec<HostPort> {
        let mut exits = self.ring.hosts_for(service_name, self.k_for(service_name));
        exits.sort();
        exits.dedup();
        exits
    }

    pub fn is_exit_for(&self, service_name: &str) -> bool {
        self.exits_for(service_name).iter().any(|hp| *hp == self.local)
    }

    pub fn set_k_default(&self, k: usize) {
        self.k_default.store(k, Ordering::Relaxed);
    }

    pub fn set_k_for_service(&self, service_name: &str, k: usize) {
        self.k_services.write().unwrap().insert(service_name.to_string(), k);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RingChanged> {
        self.changed_tx.subscribe()
    }

    /// Called by the membership layer after it swaps in a new ring snapshot.
    pub fn notify_changed(&self) {
        // no receivers is fine; reconciliation starts with the first subscriber
        let _ = self.changed_tx.send(RingChanged);
    }
}

/// Rendezvous-hash ring over a flat member list.
///
/// Good enough for tests and single-process embedding; production routers
/// plug the gossip layer's ring in behind [`Ring`] instead. Selection is
/// highest-random-weight: for each member, hash (member, service) and take
/// the top K, so a membership delta only moves the services that hashed to
/// the departed member.
pub struct HashRing {
    members: StdRwLock<Vec<HostPort>>,
}

impl HashRing {
    pub fn new(members: Vec<HostPort>) -> Self {
        Self { members: StdRwLock::new(members) }
    }

    pub fn set_members(&self, members: Vec<HostPort>) {
        *self.members.write().unwrap() = members;
    }

    pub fn members(&self) -> Vec<HostPort> {
        self.members.read().unwrap().clone()
    }

    fn weight(member: &str, service_name: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        member.hash(&mut hasher);
        service_name.hash(&mut hasher);
        hasher.finish()
    }
}

impl Ring for HashRing {
    fn hosts_for(&self, service_name: &str, k: usize) -> Vec<HostPort> {
        let members = self.members.read().unwrap();
        let mut weighted: Vec<(u64, &HostPort)> = members
            .iter()
            .map(|m| (Self::weight(m, service_name), m))
            .collect();
        weighted.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        weighted.into_iter().take(k).map(|(_, m)| m.clone()).collect()
    }
}
