//! The dispatch core.
//!
//! One [`Dispatcher`] per router instance owns the service-to-peer routing
//! table and everything that keeps it converged: request admission
//! (blocking, rate limiting, circuit breaking), lazy service-channel
//! creation in exit or forward mode, peer refresh on advertise, graceful
//! peer removal on unadvertise, membership-change reconciliation, and the
//! periodic purge/reap/prune/stat tasks.
//!
//! Admission is synchronous: the blocking table, rate limiter, and circuit
//! tree sit behind short `std` locks. The routing tables (channels, peer
//! indices, advertisement records) live behind one coarse async mutex, and
//! anything that suspends — drains, fan-out sends — runs in spawned tasks
//! outside that lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use relaymesh_common::{
    CallRequest, CallResponse, ErrorCode, ErrorFrame, HostPort, ServiceName,
};
use relaymesh_metrics::StatsSink;

use crate::blocking::{BlockingError, BlockingTable};
use crate::circuits::{CircuitRegistry, NO_CALLER};
use crate::config::RouterConfig;
use crate::partial_range::PartialRange;
use crate::peer_index::{PeerIndex, PruneEntry};
use crate::rate_limiter::RateLimiter;
use crate::remote::RemoteConfig;
use crate::ring::RingView;
use crate::scanner::{IntervalScanner, ScanTarget};
use crate::service_channel::{ChannelMode, ServiceChannel};
use crate::transport::{ConnectionDirection, DrainDirection, DrainGoal, Transport, TransportPeer};

/// Everything a router is built from. Each subsystem receives clones of
/// only the handles it uses.
pub struct RouterContext {
    pub config: RouterConfig,
    pub ring: Arc<RingView>,
    pub transport: Arc<dyn Transport>,
    pub stats: Arc<dyn StatsSink>,
}

/// How the dispatcher disposed of a request.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Forwarded and answered.
    Response(CallResponse),
    /// Answered with an error frame.
    Error(ErrorFrame),
    /// Silently popped; the caller gets nothing, by design.
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Blocked,
    KillSwitch,
}

impl DispatchOutcome {
    pub fn err_code(&self) -> Option<ErrorCode> {
        match self {
            DispatchOutcome::Error(frame) => Some(frame.code),
            _ => None,
        }
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, DispatchOutcome::Dropped(_))
    }

    pub fn response(self) -> Option<CallResponse> {
        match self {
            DispatchOutcome::Response(res) => Some(res),
            _ => None,
        }
    }
}

/// Emitted when a membership change flips a channel between exit and
/// forward mode.
#[derive(Debug, Clone)]
pub struct RoleTransition {
    pub service_name: ServiceName,
    pub old_mode: ChannelMode,
    pub new_mode: ChannelMode,
}

/// One row of the periodic stats emission.
#[derive(Debug, Clone)]
pub struct ServiceStatsRow {
    pub peers: usize,
    pub connections: usize,
}

pub(crate) struct PartialOutcome {
    pub noop: bool,
    pub range: Option<PartialRange>,
}

impl PartialOutcome {
    fn is_affine(&self, host_port: &str) -> bool {
        self.range
            .as_ref()
            .map(|range| range.contains(host_port))
            .unwrap_or(false)
    }
}

struct DispatcherState {
    channels: HashMap<ServiceName, ServiceChannel>,
    /// Advertisement records: service → last refresh. TTL-driven purge.
    exit_services: HashMap<ServiceName, Instant>,
    peer_index: PeerIndex,
}

pub struct Dispatcher {
    config: RouterConfig,
    ring: Arc<RingView>,
    transport: Arc<dyn Transport>,
    stats: Arc<dyn StatsSink>,
    limiter: RateLimiter,
    circuits: Arc<CircuitRegistry>,
    blocking: BlockingTable,
    partial_affinity: AtomicBool,
    lazy_handling: AtomicBool,
    state: Mutex<DispatcherState>,
    role_events: broadcast::Sender<RoleTransition>,
    scanners: StdMutex<Vec<IntervalScanner>>,
}

impl Dispatcher {
    /// Build the dispatcher and start its background tasks: the ring
    /// reconciler plus the purge, reap, prune, and stat-emit scanners.
    pub fn spawn(ctx: RouterContext) -> Arc<Self> {
        let RouterContext { config, ring, transport, stats } = ctx;
        let limiter = RateLimiter::new(&config.rate_limiter);
        let circuits = Arc::new(CircuitRegistry::new(config.circuits.clone(), stats.clone()));
        let (role_events, _) = broadcast::channel(32);

        let dispatcher = Arc::new(Self {
            partial_affinity: AtomicBool::new(config.partial_affinity_enabled),
            lazy_handling: AtomicBool::new(config.lazy_handling),
            config,
            ring,
            transport,
            stats,
            limiter,
            circuits,
            blocking: BlockingTable::new(),
            state: Mutex::new(DispatcherState {
                channels: HashMap::new(),
                exit_services: HashMap::new(),
                peer_index: PeerIndex::new(),
            }),
            role_events,
            scanners: StdMutex::new(Vec::new()),
        });
        dispatcher.spawn_reconciler();
        dispatcher.spawn_scanners();
        dispatcher
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn ring(&self) -> &Arc<RingView> {
        &self.ring
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn stats(&self) -> &Arc<dyn StatsSink> {
        &self.stats
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn partial_affinity_enabled(&self) -> bool {
        self.partial_affinity.load(Ordering::Relaxed)
    }

    pub fn subscribe_role_transitions(&self) -> broadcast::Receiver<RoleTransition> {
        self.role_events.subscribe()
    }

    /// Operator block of a (caller, service) edge.
    pub fn block(&self, caller_name: &str, service_name: &str) -> Result<(), BlockingError> {
        self.blocking.block(caller_name, service_name, Instant::now())
    }

    pub fn unblock(&self, caller_name: &str, service_name: &str) {
        self.blocking.unblock(caller_name, service_name);
    }

    /// Invoked by the config poller every tick; every updater is idempotent.
    pub fn apply_remote_config(&self, remote: &RemoteConfig) {
        if let Some(enabled) = remote.circuits.enabled {
            self.circuits.set_enabled(enabled);
        }
        if let Some(enabled) = remote.rate_limiting.enabled {
            self.limiter.set_enabled(enabled);
        }
        if let Some(limit) = remote.rate_limiting.total_rps_limit {
            self.limiter.update_total_limit(limit);
        }
        if let Some(limits) = &remote.rate_limiting.rps_limit_for_service_name {
            self.limiter
                .update_service_limits(self.config.rate_limiter.default_service_rps_limit, limits);
        }
        if let Some(exempt) = &remote.rate_limiting.exempt_services {
            self.limiter.update_exempt_services(exempt);
        }
        if let Some(k) = remote.k_value.default {
            self.ring.set_k_default(k);
        }
        if let Some(services) = &remote.k_value.services {
            for (service_name, k) in services {
                self.ring.set_k_for_service(service_name, *k);
            }
        }
        if let Some(entries) = &remote.kill_switch {
            self.blocking.update_remote(entries, Instant::now());
        }
        if let Some(period_ms) = remote.peer_reaper.period_ms {
            self.set_scanner_interval("peer-reap", Duration::from_millis(period_ms));
        }
        if let Some(enabled) = remote.partial_affinity.enabled {
            self.partial_affinity.store(enabled, Ordering::Relaxed);
        }
        if let Some(enabled) = remote.lazy_handling.enabled {
            self.lazy_handling.store(enabled, Ordering::Relaxed);
        }
    }

    fn set_scanner_interval(&self, name: &str, interval: Duration) {
        let scanners = self.scanners.lock().unwrap();
        if let Some(scanner) = scanners.iter().find(|s| s.name() == name) {
            scanner.set_interval(interval);
        }
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Classify and admit one inbound data-path request, then relay it.
    ///
    /// Checks run in a fixed order and the first match short-circuits:
    /// routing delegate, service name, caller name, block tables, rate
    /// limits (kill-switch tier first), then dispatch.
    pub async fn handle_request(&self, req: CallRequest) -> DispatchOutcome {
        let now = Instant::now();

        let service_name = req.effective_service().to_string();
        if service_name.is_empty() {
            return DispatchOutcome::Error(ErrorFrame::bad_request("no service name given"));
        }
        if self.lazy_handling.load(Ordering::Relaxed) && req.caller_name.is_none() {
            return DispatchOutcome::Error(ErrorFrame::bad_request("missing cn header"));
        }
        let caller_name = req.caller_name.clone().unwrap_or_else(|| NO_CALLER.to_string());

        if self.blocking.is_blocked(&caller_name, &service_name) {
            debug!(caller = %caller_name, service = %service_name, "dropping blocked request");
            self.stats.incr("request.blocked", 1);
            return DispatchOutcome::Dropped(DropReason::Blocked);
        }

        if self.limiter.enabled() {
            self.limiter.increment_edge(&caller_name, &service_name, now);
            let is_exit = self.ring.is_exit_for(&service_name);
            if is_exit {
                self.limiter.ensure_service_counters(&service_name, now);
                if self.limiter.should_kill_switch_total(&service_name, now)
                    || self.limiter.should_kill_switch_service(&service_name, now)
                {
                    self.stats.incr("rate-limiting.kill-switch", 1);
                    return DispatchOutcome::Dropped(DropReason::KillSwitch);
                }
            }
            self.limiter.increment_kill_switch(&service_name, now);
            if self.limiter.should_rate_limit_total(&service_name, now) {
                self.stats.incr("rate-limiting.total-busy", 1);
                return DispatchOutcome::Error(ErrorFrame::busy(format!(
                    "{} node is rate-limited by the total rps of {}",
                    self.config.router_service,
                    self.limiter.total_limit()
                )));
            }
            if is_exit && self.limiter.should_rate_limit_service(&service_name, now) {
                self.stats.incr("rate-limiting.service-busy", 1);
                return DispatchOutcome::Error(ErrorFrame::busy(format!(
                    "{} is rate-limited by the service rps of {}",
                    service_name,
                    self.limiter.service_limit(&service_name)
                )));
            }
            self.limiter.increment_total(now);
            if is_exit {
                self.limiter.increment_service(&service_name, now);
            }
        }

        self.relay(req, &service_name).await
    }

    /// Relay one admitted request through the service channel: circuit
    /// admission in exit mode, round-robin peer selection, one send.
    async fn relay(&self, req: CallRequest, service_name: &str) -> DispatchOutcome {
        let (selected, circuit) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let channel = self.channel_entry(&mut state.channels, service_name);
            let circuit = if channel.mode == ChannelMode::Exit && self.circuits.enabled() {
                match self.circuits.get_circuit_for_request(&req) {
                    Ok(circuit) => Some(circuit),
                    Err(frame) => return DispatchOutcome::Error(frame),
                }
            } else {
                None
            };
            (channel.next_peer(), circuit)
        };

        let Some(host_port) = selected else {
            return DispatchOutcome::Error(ErrorFrame::declined("no peer available for request"));
        };

        let peer = self.transport.peer(&host_port);
        let result = peer.send(req, self.config.forward_timeout).await;

        if let Some(circuit) = circuit {
            // declines and rate-limit pushback never feed the error budget
            let ok = match &result {
                Ok(_) => true,
                Err(frame) => matches!(
                    frame.code,
                    ErrorCode::Declined | ErrorCode::Unhealthy | ErrorCode::Busy
                ),
            };
            circuit.observe(ok);
        }

        match result {
            Ok(res) => DispatchOutcome::Response(res),
            Err(frame) => DispatchOutcome::Error(frame),
        }
    }

    // ------------------------------------------------------------------
    // Service channels
    // ------------------------------------------------------------------

    fn channel_entry<'a>(
        &self,
        channels: &'a mut HashMap<ServiceName, ServiceChannel>,
        service_name: &str,
    ) -> &'a mut ServiceChannel {
        channels.entry(service_name.to_string()).or_insert_with(|| {
            if self.ring.is_exit_for(service_name) {
                info!(service = %service_name, "creating exit-mode service channel");
                ServiceChannel::new_exit(service_name)
            } else {
                let exits = self.ring.exits_for(service_name);
                info!(
                    service = %service_name,
                    exits = exits.len(),
                    "creating forward-mode service channel"
                );
                ServiceChannel::new_forward(service_name, exits)
            }
        })
    }

    /// The (mode, sorted peers) view of a channel, creating it if needed.
    pub async fn channel_view(&self, service_name: &str) -> (ChannelMode, Vec<HostPort>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let channel = self.channel_entry(&mut state.channels, service_name);
        (channel.mode, channel.sorted_peers())
    }

    pub async fn service_names(&self) -> Vec<ServiceName> {
        let state = self.state.lock().await;
        let mut names: Vec<ServiceName> = state.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn channel_mode(&self, service_name: &str) -> Option<ChannelMode> {
        let state = self.state.lock().await;
        state.channels.get(service_name).map(|c| c.mode)
    }

    pub async fn channel_peers(&self, service_name: &str) -> Vec<HostPort> {
        let state = self.state.lock().await;
        state
            .channels
            .get(service_name)
            .map(|c| c.sorted_peers())
            .unwrap_or_default()
    }

    pub async fn connected_peers_of(&self, service_name: &str) -> Vec<HostPort> {
        let state = self.state.lock().await;
        let mut peers: Vec<HostPort> = state
            .peer_index
            .connected_peers_of(service_name)
            .into_iter()
            .collect();
        peers.sort();
        peers
    }

    // ------------------------------------------------------------------
    // Advertise lifecycle
    // ------------------------------------------------------------------

    /// An advertisement landed for (service, worker). Only meaningful on
    /// exit nodes; forward-mode advertises are dropped.
    pub async fn refresh_service_peer(&self, service_name: &str, host_port: &str) {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let channel = self.channel_entry(&mut state.channels, service_name);
        if channel.mode == ChannelMode::Forward {
            debug!(
                service = %service_name,
                host_port = %host_port,
                "dropping advertise on forward-mode channel"
            );
            return;
        }
        channel.peers.insert(host_port.to_string());
        state.exit_services.insert(service_name.to_string(), now);
        state.peer_index.mark_known(service_name, host_port, now);

        if self.partial_affinity_enabled() {
            let outcome = self.ensure_partial_connections(state, service_name, "advertise", now);
            if outcome.noop && outcome.is_affine(host_port) {
                // nothing moved; refresh the advertiser's indices directly
                state.peer_index.add_connected(service_name, host_port);
                state.peer_index.cancel_prune(host_port);
                let peer = self.transport.peer(host_port);
                peer.cancel_drain();
                peer.ensure_out_connection();
            }
        } else {
            state.peer_index.cancel_prune(host_port);
            state.peer_index.add_connected(service_name, host_port);
            let peer = self.transport.peer(host_port);
            peer.cancel_drain();
            peer.ensure_out_connection();
        }
    }

    /// An unadvertise landed for (service, worker): release the peer, and
    /// close it once no channel retains it.
    pub async fn remove_service_peer(&self, service_name: &str, host_port: &str) {
        let now = Instant::now();
        let peer_to_close = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(channel) = state.channels.get_mut(service_name) else {
                return;
            };
            channel.peers.remove(host_port);
            let is_exit = channel.mode == ChannelMode::Exit;
            state.peer_index.unmark_known(service_name, host_port);
            state.peer_index.unmark_reap(service_name, host_port);
            if self.partial_affinity_enabled() && is_exit {
                // worker list changed: recompute the window
                self.ensure_partial_connections(state, service_name, "unadvertise", now);
            }
            state.peer_index.remove_connected(service_name, host_port);

            if state.channels.values().any(|c| c.peers.contains(host_port)) {
                info!(
                    service = %service_name,
                    host_port = %host_port,
                    "unadvertised peer retained by another service channel"
                );
                None
            } else {
                self.transport.get_peer(host_port)
            }
        };

        if let Some(peer) = peer_to_close {
            if peer.drain_goal() == Some(DrainGoal::ClosePeer) {
                // an existing reap-drain is not interrupted
                debug!(host_port = %host_port, "close-peer drain already in flight");
                return;
            }
            self.spawn_peer_close(peer, "unadvertised");
        }
    }

    /// Connect the affine window, disconnect what fell out of it.
    fn ensure_partial_connections(
        &self,
        state: &mut DispatcherState,
        service_name: &str,
        reason: &str,
        now: Instant,
    ) -> PartialOutcome {
        let Some(channel) = state.channels.get_mut(service_name) else {
            return PartialOutcome { noop: true, range: None };
        };
        if channel.mode != ChannelMode::Exit {
            return PartialOutcome { noop: true, range: None };
        }
        let relays = self.ring.exits_for(service_name);
        let workers = channel.sorted_peers();
        let Some(range) = PartialRange::compute(
            &relays,
            &workers,
            &self.config.local_host_port,
            self.config.min_peers_per_worker,
            self.config.min_peers_per_relay,
        ) else {
            warn!(
                service = %service_name,
                reason,
                "not in relay set for owned service; awaiting reconciliation"
            );
            return PartialOutcome { noop: true, range: None };
        };

        let affine: std::collections::HashSet<&str> =
            range.affine_workers.iter().map(|hp| hp.as_str()).collect();
        let connected = state.peer_index.connected_peers_of(service_name);
        let to_connect: Vec<HostPort> = range
            .affine_workers
            .iter()
            .filter(|hp| !connected.contains(*hp))
            .cloned()
            .collect();
        let to_disconnect: Vec<HostPort> = connected
            .iter()
            .filter(|hp| {
                !affine.contains(hp.as_str()) && !state.peer_index.is_scheduled_for_prune(hp)
            })
            .cloned()
            .collect();
        channel.partial_range = Some(range.clone());

        if to_connect.is_empty() && to_disconnect.is_empty() {
            return PartialOutcome { noop: true, range: Some(range) };
        }

        for host_port in &to_connect {
            state.peer_index.add_connected(service_name, host_port);
            state.peer_index.cancel_prune(host_port);
            let peer = self.transport.peer(host_port);
            peer.cancel_drain();
            peer.ensure_out_connection();
        }
        for host_port in &to_disconnect {
            let released = state.peer_index.remove_connected(service_name, host_port);
            if released {
                state.peer_index.schedule_prune(host_port, reason, now);
            }
        }
        debug!(
            service = %service_name,
            reason,
            connect = to_connect.len(),
            disconnect = to_disconnect.len(),
            "partial affinity window applied"
        );
        PartialOutcome { noop: false, range: Some(range) }
    }

    // ------------------------------------------------------------------
    // Membership reconciliation
    // ------------------------------------------------------------------

    fn spawn_reconciler(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut rx = self.ring.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                // run on the next tick, coalescing bursts of deltas
                tokio::task::yield_now().await;
                while rx.try_recv().is_ok() {}
                let Some(dispatcher) = weak.upgrade() else { break };
                dispatcher.update_service_channels().await;
            }
        });
    }

    /// Re-derive every channel's mode from the ring and repair peer sets.
    pub async fn update_service_channels(&self) {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let service_names: Vec<ServiceName> = state.channels.keys().cloned().collect();

        for service_name in service_names {
            let exits = self.ring.exits_for(&service_name);
            let is_exit = exits.iter().any(|hp| *hp == self.config.local_host_port);
            let Some(mode) = state.channels.get(&service_name).map(|c| c.mode) else {
                continue;
            };

            match (mode, is_exit) {
                (ChannelMode::Forward, true) => {
                    if let Some(channel) = state.channels.get_mut(&service_name) {
                        channel.change_to_exit();
                    }
                    // start the purge clock; workers re-advertise within it
                    state.exit_services.insert(service_name.clone(), now);
                    self.emit_role_transition(&service_name, mode, ChannelMode::Exit);
                }
                (ChannelMode::Exit, false) => {
                    let workers = match state.channels.get_mut(&service_name) {
                        Some(channel) => channel.change_to_forward(exits),
                        None => continue,
                    };
                    state.exit_services.remove(&service_name);
                    for host_port in workers {
                        let released =
                            state.peer_index.remove_connected(&service_name, &host_port);
                        state.peer_index.unmark_known(&service_name, &host_port);
                        state.peer_index.unmark_reap(&service_name, &host_port);
                        if released {
                            state.peer_index.schedule_prune(&host_port, "no longer exit", now);
                        }
                    }
                    self.emit_role_transition(&service_name, mode, ChannelMode::Forward);
                }
                (ChannelMode::Forward, false) => {
                    if let Some(channel) = state.channels.get_mut(&service_name) {
                        channel.peers = exits.into_iter().collect();
                    }
                }
                (ChannelMode::Exit, true) => {
                    if self.partial_affinity_enabled() {
                        self.ensure_partial_connections(
                            state,
                            &service_name,
                            "membership-change",
                            now,
                        );
                    }
                }
            }
        }

        let ring = self.ring.clone();
        self.circuits.update_services(move |service_name| ring.is_exit_for(service_name));
    }

    fn emit_role_transition(&self, service_name: &str, old_mode: ChannelMode, new_mode: ChannelMode) {
        info!(service = %service_name, ?old_mode, ?new_mode, "service channel role transition");
        self.stats.incr("channel.role-transition", 1);
        let _ = self.role_events.send(RoleTransition {
            service_name: service_name.to_string(),
            old_mode,
            new_mode,
        });
    }

    // ------------------------------------------------------------------
    // Periodic tasks
    // ------------------------------------------------------------------

    fn spawn_scanners(self: &Arc<Self>) {
        let scanners = vec![
            IntervalScanner::spawn(
                "service-purge",
                self.config.service_purge_period,
                Arc::new(ServicePurger(Arc::downgrade(self))),
            ),
            IntervalScanner::spawn(
                "peer-reap",
                self.config.peer_reap_period,
                Arc::new(PeerReaper(Arc::downgrade(self))),
            ),
            IntervalScanner::spawn(
                "peer-prune",
                self.config.peer_prune_period,
                Arc::new(PeerPruner(Arc::downgrade(self))),
            ),
            IntervalScanner::spawn(
                "stat-emit",
                self.config.stat_emit_period,
                Arc::new(StatEmitter(Arc::downgrade(self))),
            ),
        ];
        *self.scanners.lock().unwrap() = scanners;
    }

    /// Services whose advertisement record has outlived the purge period.
    pub async fn collect_expired_services(&self, now: Instant) -> Vec<(ServiceName, Instant)> {
        let state = self.state.lock().await;
        state
            .exit_services
            .iter()
            .filter(|(_, last)| {
                now.saturating_duration_since(**last) >= self.config.service_purge_period
            })
            .map(|(service_name, last)| (service_name.clone(), *last))
            .collect()
    }

    /// Drop one expired service channel and everything only it was holding.
    pub async fn purge_service(&self, service_name: &str, now: Instant) {
        let peers_to_close = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            match state.exit_services.get(service_name) {
                Some(last)
                    if now.saturating_duration_since(*last)
                        >= self.config.service_purge_period => {}
                // re-advertised since the scan snapshot
                _ => return,
            }
            state.exit_services.remove(service_name);
            let Some(channel) = state.channels.remove(service_name) else {
                return;
            };
            info!(service = %service_name, peers = channel.peers.len(), "purging service channel");
            self.limiter.remove_service_counters(service_name);

            let mut closable = Vec::new();
            for host_port in channel.peers {
                state.peer_index.remove_connected(service_name, &host_port);
                state.peer_index.unmark_known(service_name, &host_port);
                state.peer_index.unmark_reap(service_name, &host_port);
                let retained = state.channels.values().any(|c| c.peers.contains(&host_port));
                if !retained {
                    if let Some(peer) = self.transport.get_peer(&host_port) {
                        closable.push(peer);
                    }
                }
            }
            closable
        };

        self.stats.incr("service.purged", 1);
        for peer in peers_to_close {
            if peer.drain_goal() != Some(DrainGoal::ClosePeer) {
                self.spawn_peer_close(peer, "service purged");
            }
        }
    }

    /// One reap tick: swap the seen/queued maps and return the dead.
    pub async fn begin_reap_cycle(&self) -> Vec<(HostPort, Vec<ServiceName>)> {
        let mut state = self.state.lock().await;
        state
            .peer_index
            .begin_reap_cycle()
            .into_iter()
            .map(|(host_port, services)| (host_port, services.into_keys().collect()))
            .collect()
    }

    /// Delete a peer that stayed silent for two reap windows.
    pub async fn reap_peer(&self, host_port: &str, services: &[ServiceName]) {
        let now = Instant::now();
        let peer_to_close = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            for service_name in services {
                if let Some(channel) = state.channels.get_mut(service_name) {
                    channel.peers.remove(host_port);
                }
                state.peer_index.remove_connected(service_name, host_port);
                if self.partial_affinity_enabled() {
                    self.ensure_partial_connections(state, service_name, "reap", now);
                }
            }
            if state.channels.values().any(|c| c.peers.contains(host_port)) {
                None
            } else {
                self.transport.get_peer(host_port)
            }
        };

        if let Some(peer) = peer_to_close {
            info!(host_port = %host_port, "reaping silent peer");
            self.stats.incr("peer.reaped", 1);
            if peer.drain_goal() != Some(DrainGoal::ClosePeer) {
                self.spawn_peer_close(peer, "reaped");
            }
        }
    }

    pub async fn collect_prunables(&self) -> Vec<(HostPort, PruneEntry)> {
        let mut state = self.state.lock().await;
        state.peer_index.take_prunables()
    }

    /// Close outbound connections to one out-of-affinity peer. The peer is
    /// not deleted; inbound traffic may still arrive on it.
    pub async fn prune_peer(&self, host_port: &str, entry: &PruneEntry) {
        let reacquired = {
            let state = self.state.lock().await;
            !state.peer_index.connected_services_of(host_port).is_empty()
        };
        if reacquired {
            debug!(host_port = %host_port, "peer reacquired since prune was scheduled");
            return;
        }
        if let Some(peer) = self.transport.get_peer(host_port) {
            peer.close_out_connections(&entry.reason);
            self.stats.incr("peer.pruned", 1);
        }
    }

    pub async fn collect_service_stats(&self) -> Vec<(ServiceName, ServiceStatsRow)> {
        let state = self.state.lock().await;
        self.stats.gauge("services.count", state.channels.len() as u64);
        state
            .channels
            .iter()
            .map(|(service_name, channel)| {
                let connections = channel
                    .peers
                    .iter()
                    .filter_map(|hp| self.transport.get_peer(hp))
                    .map(|peer| {
                        peer.connection_count(ConnectionDirection::In)
                            + peer.connection_count(ConnectionDirection::Out)
                    })
                    .sum();
                (
                    service_name.clone(),
                    ServiceStatsRow { peers: channel.peers.len(), connections },
                )
            })
            .collect()
    }

    pub fn emit_service_stats(&self, service_name: &str, row: &ServiceStatsRow) {
        self.stats
            .gauge(&format!("service.peers.{service_name}"), row.peers as u64);
        self.stats
            .gauge(&format!("service.connections.{service_name}"), row.connections as u64);
    }

    // ------------------------------------------------------------------
    // Peer closure
    // ------------------------------------------------------------------

    /// Drain then delete, off the dispatcher lock. On drain error or
    /// timeout the peer is deleted anyway; only a cancellation (a refresh
    /// rescued the peer) aborts the deletion.
    fn spawn_peer_close(&self, peer: Arc<dyn TransportPeer>, reason: &'static str) {
        let transport = self.transport.clone();
        let timeout = self.config.drain_timeout;
        tokio::spawn(async move {
            let host_port = peer.host_port().to_string();
            match peer.drain(DrainGoal::ClosePeer, DrainDirection::Both, timeout).await {
                Ok(()) => {
                    debug!(host_port = %host_port, reason, "peer drained; deleting");
                    transport.delete_peer(&host_port);
                }
                Err(frame) if frame.code == ErrorCode::Cancelled => {
                    debug!(host_port = %host_port, "peer drain cancelled by refresh");
                }
                Err(frame) => {
                    warn!(host_port = %host_port, error = %frame, "peer drain failed; deleting anyway");
                    transport.delete_peer(&host_port);
                }
            }
        });
    }
}

// ----------------------------------------------------------------------
// Scan targets
// ----------------------------------------------------------------------

struct ServicePurger(Weak<Dispatcher>);

#[async_trait]
impl ScanTarget for ServicePurger {
    type Key = ServiceName;
    type Value = Instant;

    async fn collect(&self) -> Vec<(ServiceName, Instant)> {
        match self.0.upgrade() {
            Some(dispatcher) => dispatcher.collect_expired_services(Instant::now()).await,
            None => Vec::new(),
        }
    }

    async fn each(&self, service_name: ServiceName, _last: Instant, now: Instant) {
        if let Some(dispatcher) = self.0.upgrade() {
            dispatcher.purge_service(&service_name, now).await;
        }
    }
}

struct PeerReaper(Weak<Dispatcher>);

#[async_trait]
impl ScanTarget for PeerReaper {
    type Key = HostPort;
    type Value = Vec<ServiceName>;

    async fn collect(&self) -> Vec<(HostPort, Vec<ServiceName>)> {
        match self.0.upgrade() {
            Some(dispatcher) => dispatcher.begin_reap_cycle().await,
            None => Vec::new(),
        }
    }

    async fn each(&self, host_port: HostPort, services: Vec<ServiceName>, _now: Instant) {
        if let Some(dispatcher) = self.0.upgrade() {
            dispatcher.reap_peer(&host_port, &services).await;
        }
    }
}

struct PeerPruner(Weak<Dispatcher>);

#[async_trait]
impl ScanTarget for PeerPruner {
    type Key = HostPort;
    type Value = PruneEntry;

    async fn collect(&self) -> Vec<(HostPort, PruneEntry)> {
        match self.0.upgrade() {
            Some(dispatcher) => dispatcher.collect_prunables().await,
            None => Vec::new(),
        }
    }

    async fn each(&self, host_port: HostPort, entry: PruneEntry, _now: Instant) {
        if let Some(dispatcher) = self.0.upgrade() {
            dispatcher.prune_peer(&host_port, &entry).await;
        }
    }
}

struct StatEmitter(Weak<Dispatcher>);

#[async_trait]
impl ScanTarget for StatEmitter {
    type Key = ServiceName;
    type Value = ServiceStatsRow;

    async fn collect(&self) -> Vec<(ServiceName, ServiceStatsRow)> {
        match self.0.upgrade() {
            Some(dispatcher) => dispatcher.collect_service_stats().await,
            None => Vec::new(),
        }
    }

    async fn each(&self, service_name: ServiceName, row: ServiceStatsRow, _now: Instant) {
        if let Some(dispatcher) = self.0.upgrade() {
            dispatcher.emit_service_stats(&service_name, &row);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::HashRing;
    use crate::transport::inmem::InMemoryTransport;
    use relaymesh_metrics::NullSink;

    const LOCAL: &str = "10.0.0.1:4040";
    const WORKER: &str = "10.9.0.1:7000";

    fn exit_dispatcher() -> (Arc<Dispatcher>, Arc<InMemoryTransport>) {
        // single-member ring: every service is exit-mode locally
        let config = RouterConfig::new(LOCAL);
        let ring = Arc::new(RingView::new(
            Arc::new(HashRing::new(vec![LOCAL.to_string()])),
            LOCAL,
            config.k_default,
        ));
        let transport = Arc::new(InMemoryTransport::new());
        let dispatcher = Dispatcher::spawn(RouterContext {
            config,
            ring,
            transport: transport.clone() as Arc<dyn Transport>,
            stats: Arc::new(NullSink),
        });
        (dispatcher, transport)
    }

    fn forward_dispatcher() -> Arc<Dispatcher> {
        // local host is not on the ring at all
        let config = RouterConfig::new(LOCAL);
        let ring = Arc::new(RingView::new(
            Arc::new(HashRing::new(vec!["10.0.0.2:4040".to_string()])),
            LOCAL,
            config.k_default,
        ));
        Dispatcher::spawn(RouterContext {
            config,
            ring,
            transport: Arc::new(InMemoryTransport::new()),
            stats: Arc::new(NullSink),
        })
    }

    #[tokio::test]
    async fn test_channels_created_lazily() {
        let (dispatcher, _) = exit_dispatcher();
        assert!(dispatcher.service_names().await.is_empty());

        let (mode, peers) = dispatcher.channel_view("steve").await;
        assert_eq!(mode, ChannelMode::Exit);
        assert!(peers.is_empty());
        assert_eq!(dispatcher.service_names().await, vec!["steve".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_connects_worker() {
        let (dispatcher, transport) = exit_dispatcher();
        dispatcher.refresh_service_peer("steve", WORKER).await;

        assert_eq!(dispatcher.channel_peers("steve").await, vec![WORKER.to_string()]);
        let peer = transport.mem_peer(WORKER);
        assert_eq!(peer.connection_count(ConnectionDirection::Out), 1);
    }

    #[tokio::test]
    async fn test_forward_mode_drops_advertise() {
        let dispatcher = forward_dispatcher();
        dispatcher.refresh_service_peer("steve", WORKER).await;

        // forward channel keeps its exit peers, not the advertiser
        let peers = dispatcher.channel_peers("steve").await;
        assert!(!peers.contains(&WORKER.to_string()));
        assert!(dispatcher.collect_expired_services(Instant::now() + Duration::from_secs(600)).await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_service_is_noop() {
        let (dispatcher, _) = exit_dispatcher();
        dispatcher.remove_service_peer("never-seen", WORKER).await;
        assert!(dispatcher.service_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_retained_peer_keeps_transport_entry() {
        let (dispatcher, transport) = exit_dispatcher();
        dispatcher.refresh_service_peer("steve", WORKER).await;
        dispatcher.refresh_service_peer("mary", WORKER).await;

        dispatcher.remove_service_peer("steve", WORKER).await;
        tokio::task::yield_now().await;
        // mary still holds the peer: no drain, no deletion
        assert!(transport.get_peer(WORKER).is_some());
        assert!(transport.mem_peer(WORKER).drain_history().is_empty());

        dispatcher.remove_service_peer("mary", WORKER).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.get_peer(WORKER).is_none());
    }

    #[tokio::test]
    async fn test_purge_rechecks_freshness() {
        let (dispatcher, _) = exit_dispatcher();
        dispatcher.refresh_service_peer("steve", WORKER).await;

        // stale timestamp from an old snapshot must not purge a live channel
        dispatcher.purge_service("steve", Instant::now()).await;
        assert_eq!(dispatcher.channel_mode("steve").await, Some(ChannelMode::Exit));

        let later = Instant::now() + Duration::from_secs(301);
        dispatcher.purge_service("steve", later).await;
        assert_eq!(dispatcher.channel_mode("steve").await, None);
    }

    #[tokio::test]
    async fn test_block_validation_rejects_full_wildcard() {
        let (dispatcher, _) = exit_dispatcher();
        assert!(dispatcher.block("*", "*").is_err());
        assert!(dispatcher.block("*", "steve").is_ok());
    }
}
