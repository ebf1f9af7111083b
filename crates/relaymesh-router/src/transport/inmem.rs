//! Loopback transport.
//!
//! Full peer-table semantics with no sockets: connection direction
//! bookkeeping, drain recording, and a pluggable network function that
//! routes a send to the target host's handler. Integration tests wire the
//! network function to other routers' dispatchers to get a single-process
//! cluster; unit tests script per-peer outcomes instead.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use relaymesh_common::{CallRequest, CallResponse, CallResult, ErrorFrame, HostPort};

use super::{ConnectionDirection, DrainDirection, DrainGoal, Transport, TransportPeer};

/// Routes a send to the addressed host. Receives the target host-port and
/// the request; returns what that host answered.
pub type NetworkFn =
    Arc<dyn Fn(HostPort, CallRequest) -> BoxFuture<'static, CallResult> + Send + Sync>;

/// A completed or cancelled drain, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainRecord {
    pub goal: DrainGoal,
    pub direction: DrainDirection,
    pub cancelled: bool,
}

pub struct InMemoryPeer {
    host_port: HostPort,
    out_connections: AtomicUsize,
    in_connections: AtomicUsize,
    draining: StdMutex<Option<DrainGoal>>,
    drains: StdMutex<Vec<DrainRecord>>,
    sent: StdMutex<Vec<CallRequest>>,
    scripted: StdMutex<VecDeque<CallResult>>,
    network: StdRwLock<Option<NetworkFn>>,
}

impl InMemoryPeer {
    fn new(host_port: HostPort, network: Option<NetworkFn>) -> Self {
        Self {
            host_port,
            out_connections: AtomicUsize::new(0),
            in_connections: AtomicUsize::new(0),
            draining: StdMutex::new(None),
            drains: StdMutex::new(Vec::new()),
            sent: StdMutex::new(Vec::new()),
            scripted: StdMutex::new(VecDeque::new()),
            network: StdRwLock::new(network),
        }
    }

    /// Queue an outcome for the next send; scripted outcomes win over the
    /// network function.
    pub fn script_outcome(&self, outcome: CallResult) {
        self.scripted.lock().unwrap().push_back(outcome);
    }

    /// Queue `n` identical failures.
    pub fn script_failures(&self, n: usize, frame: ErrorFrame) {
        let mut scripted = self.scripted.lock().unwrap();
        for _ in 0..n {
            scripted.push_back(Err(frame.clone()));
        }
    }

    /// Requests sent through this peer, in order.
    pub fn sent_requests(&self) -> Vec<CallRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn drain_history(&self) -> Vec<DrainRecord> {
        self.drains.lock().unwrap().clone()
    }

    /// Simulate an inbound connection from the remote side.
    pub fn add_in_connection(&self) {
        self.in_connections.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl TransportPeer for InMemoryPeer {
    fn host_port(&self) -> &str {
        &self.host_port
    }

    fn ensure_out_connection(&self) {
        // idempotent: one live outbound connection is all the core asks for
        self.out_connections
            .compare_exchange(0, 1, Ordering::Relaxed, Ordering::Relaxed)
            .ok();
    }

    fn close_out_connections(&self, reason: &str) {
        debug!(host_port = %self.host_port, reason, "closing outbound connections");
        self.out_connections.store(0, Ordering::Relaxed);
    }

    fn connection_count(&self, direction: ConnectionDirection) -> usize {
        match direction {
            ConnectionDirection::In => self.in_connections.load(Ordering::Relaxed),
            ConnectionDirection::Out => self.out_connections.load(Ordering::Relaxed),
        }
    }

    fn is_draining(&self) -> bool {
        self.draining.lock().unwrap().is_some()
    }

    fn drain_goal(&self) -> Option<DrainGoal> {
        *self.draining.lock().unwrap()
    }

    fn cancel_drain(&self) {
        let mut draining = self.draining.lock().unwrap();
        if let Some(goal) = draining.take() {
            self.drains.lock().unwrap().push(DrainRecord {
                goal,
                direction: DrainDirection::Both,
                cancelled: true,
            });
        }
    }

    async fn drain(
        &self,
        goal: DrainGoal,
        direction: DrainDirection,
        _timeout: Duration,
    ) -> Result<(), ErrorFrame> {
        *self.draining.lock().unwrap() = Some(goal);
        // the loopback has no in-flight requests to wait on
        tokio::task::yield_now().await;
        if self.draining.lock().unwrap().take().is_none() {
            // cancelled while yielded; the caller must not delete the peer
            return Err(ErrorFrame::new(relaymesh_common::ErrorCode::Cancelled, "drain cancelled"));
        }
        match direction {
            DrainDirection::In => self.in_connections.store(0, Ordering::Relaxed),
            DrainDirection::Out => self.out_connections.store(0, Ordering::Relaxed),
            DrainDirection::Both => {
                self.in_connections.store(0, Ordering::Relaxed);
                self.out_connections.store(0, Ordering::Relaxed);
            }
        }
        self.drains.lock().unwrap().push(DrainRecord { goal, direction, cancelled: false });
        Ok(())
    }

    async fn send(&self, req: CallRequest, _timeout: Duration) -> CallResult {
        self.sent.lock().unwrap().push(req.clone());
        if let Some(outcome) = self.scripted.lock().unwrap().pop_front() {
            return outcome;
        }
        let network = self.network.read().unwrap().clone();
        match network {
            Some(route) => route(self.host_port.clone(), req).await,
            None => Ok(CallResponse::empty()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryTransport {
    peers: StdMutex<HashMap<HostPort, Arc<InMemoryPeer>>>,
    network: StdRwLock<Option<NetworkFn>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the routing function; applies to peers created afterwards
    /// and to existing ones.
    pub fn set_network(&self, network: NetworkFn) {
        for peer in self.peers.lock().unwrap().values() {
            *peer.network.write().unwrap() = Some(network.clone());
        }
        *self.network.write().unwrap() = Some(network);
    }

    /// Typed accessor for test assertions.
    pub fn mem_peer(&self, host_port: &str) -> Arc<InMemoryPeer> {
        self.peer_inner(host_port)
    }

    fn peer_inner(&self, host_port: &str) -> Arc<InMemoryPeer> {
        let mut peers = self.peers.lock().unwrap();
        peers
            .entry(host_port.to_string())
            .or_insert_with(|| {
                let network = self.network.read().unwrap().clone();
                Arc::new(InMemoryPeer::new(host_port.to_string(), network))
            })
            .clone()
    }
}

impl Transport for InMemoryTransport {
    fn peer(&self, host_port: &str) -> Arc<dyn TransportPeer> {
        self.peer_inner(host_port)
    }

    fn get_peer(&self, host_port: &str) -> Option<Arc<dyn TransportPeer>> {
        self.peers
            .lock()
            .unwrap()
            .get(host_port)
            .map(|peer| peer.clone() as Arc<dyn TransportPeer>)
    }

    fn delete_peer(&self, host_port: &str) {
        self.peers.lock().unwrap().remove(host_port);
    }

    fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    fn peer_host_ports(&self) -> Vec<String> {
        let mut host_ports: Vec<String> = self.peers.lock().unwrap().keys().cloned().collect();
        host_ports.sort();
        host_ports
    }
}
