use std::time::Duration;

use relaymesh_common::{ErrorCode, HostPort, ServiceName};

/// Static configuration of one router instance.
///
/// Everything here has a default; the remote-config surface
/// ([`crate::remote::RemoteConfig`]) can override the subset of knobs that
/// operators tune at runtime without restarting the fleet.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// This router's own advertised address on the ring.
    pub local_host_port: HostPort,
    /// Service name the router answers to itself (`ad`, `discover`, ...).
    pub router_service: ServiceName,
    /// `cn` header stamped on outgoing fan-out requests.
    pub caller_name: String,

    /// Replication factor: exits assigned per service.
    pub k_default: usize,

    /// Drop service channels whose last advertisement is older than this.
    pub service_purge_period: Duration,
    /// Delete peers not seen for two consecutive windows of this length.
    /// Zero disables reaping.
    pub peer_reap_period: Duration,
    /// Close outbound connections to peers that fell out of affinity.
    pub peer_prune_period: Duration,
    /// Emit per-service peer/connection gauges at this cadence.
    pub stat_emit_period: Duration,

    /// Grace given to a peer drain before the peer is closed anyway.
    pub drain_timeout: Duration,
    /// Per-attempt timeout on `relay-ad` / `relay-unad` fan-out sends.
    pub relay_ad_timeout: Duration,
    /// Pause between fan-out retry attempts.
    pub relay_ad_retry_delay: Duration,
    /// Attempts per exit before a fan-out failure is swallowed.
    pub max_relay_ad_attempts: u32,
    /// Timeout on a forwarded `discover` lookup.
    pub discover_timeout: Duration,
    /// Timeout on a relayed data-path call.
    pub forward_timeout: Duration,

    /// Deterministic worker subsetting across exits. Off by default; flipped
    /// fleet-wide through remote config once a cluster is large enough for
    /// full-mesh fan-out to hurt.
    pub partial_affinity_enabled: bool,
    /// Every worker must be held by at least this many relays.
    pub min_peers_per_worker: usize,
    /// Every relay must hold at least this many workers.
    pub min_peers_per_relay: usize,

    /// Reject requests missing a `cn` header at admission.
    pub lazy_handling: bool,

    pub rate_limiter: RateLimiterOptions,
    pub circuits: CircuitOptions,
}

/// Rate limiter tuning.
#[derive(Debug, Clone)]
pub struct RateLimiterOptions {
    pub enabled: bool,
    /// Sliding-window length.
    pub window: Duration,
    /// Buckets per window; stale buckets rotate to zero.
    pub num_buckets: usize,
    /// Fleet-member-wide RPS ceiling.
    pub total_rps_limit: u64,
    /// Per-service ceiling applied on exit nodes when no override exists.
    pub default_service_rps_limit: u64,
    /// Kill-switch tier sits at `buffer × limit` above each soft limit.
    pub kill_switch_buffer: f64,
    /// Services that bypass every check.
    pub exempt_services: Vec<ServiceName>,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            window: Duration::from_secs(1),
            num_buckets: 20,
            total_rps_limit: 1000,
            default_service_rps_limit: 100,
            kill_switch_buffer: 2.0,
            exempt_services: Vec::new(),
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitOptions {
    pub enabled: bool,
    /// Rolling window length per circuit.
    pub period: Duration,
    /// Requests needed in a window before an error rate is computed.
    pub min_requests: u64,
    /// Error rate above which a circuit trips, in [0, 1].
    pub max_error_rate: f64,
    /// Consecutive probe successes needed to leave Unhealthy.
    pub probation: u32,
    /// Code returned for tripped circuits: `Declined`, or the `Unhealthy`
    /// alias when operators want them distinguishable.
    pub code_name: ErrorCode,
}

impl Default for CircuitOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            period: Duration::from_secs(1),
            min_requests: 5,
            max_error_rate: 0.5,
            probation: 5,
            code_name: ErrorCode::Declined,
        }
    }
}

impl RouterConfig {
    pub fn new(local_host_port: impl Into<HostPort>) -> Self {
        Self {
            local_host_port: local_host_port.into(),
            router_service: "relaymesh".to_string(),
            caller_name: "relaymesh-router".to_string(),
            k_default: 10,
            service_purge_period: Duration::from_secs(5 * 60),
            peer_reap_period: Duration::from_secs(5 * 60),
            peer_prune_period: Duration::from_secs(2 * 60),
            stat_emit_period: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            relay_ad_timeout: Duration::from_millis(500),
            relay_ad_retry_delay: Duration::from_secs(1),
            max_relay_ad_attempts: 2,
            discover_timeout: Duration::from_secs(1),
            forward_timeout: Duration::from_secs(5),
            partial_affinity_enabled: false,
            min_peers_per_worker: 5,
            min_peers_per_relay: 5,
            lazy_handling: true,
            rate_limiter: RateLimiterOptions::default(),
            circuits: CircuitOptions::default(),
        }
    }
}
