//! Per-(caller, service, endpoint) circuit breaking.
//!
//! Circuits are created Healthy on first reference and driven by request
//! outcomes. A Healthy circuit that closes a period with enough traffic and
//! an error rate over the threshold goes Unhealthy; an Unhealthy circuit
//! admits only a small probe stream and returns to Healthy after
//! `probation` consecutive probe successes.
//!
//! Declines themselves never count toward the error budget — a circuit that
//! fed its own rejections back into its error rate would never recover.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use relaymesh_common::{CallRequest, CallerName, EndpointName, ErrorFrame, ServiceName};
use relaymesh_metrics::StatsSink;

use crate::config::CircuitOptions;

/// Sentinel caller for requests with no `cn` header, so unnamed callers
/// share one circuit per (service, endpoint).
pub const NO_CALLER: &str = "no-cn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CircuitKey {
    pub caller_name: CallerName,
    pub service_name: ServiceName,
    pub endpoint_name: EndpointName,
}

/// Emitted on every Healthy ↔ Unhealthy transition.
#[derive(Debug, Clone)]
pub struct CircuitStateChange {
    pub key: CircuitKey,
    pub old_state: CircuitState,
    pub new_state: CircuitState,
}

/// One row of the control endpoint's circuit listing.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitHealth {
    #[serde(flatten)]
    pub key: CircuitKey,
    pub healthy: bool,
    pub requests: u64,
    pub errors: u64,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    period_start: Instant,
    requests: u64,
    errors: u64,
    /// Probes admitted in the current period while Unhealthy.
    probes_admitted: u32,
    consecutive_successes: u32,
}

/// Health state machine for one (caller, service, endpoint).
pub struct Circuit {
    key: CircuitKey,
    options: CircuitOptions,
    inner: StdMutex<CircuitInner>,
    events: broadcast::Sender<CircuitStateChange>,
    stats: Arc<dyn StatsSink>,
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("key", &self.key)
            .field("options", &self.options)
            .field("inner", &self.inner)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Circuit {
    fn new(
        key: CircuitKey,
        options: CircuitOptions,
        events: broadcast::Sender<CircuitStateChange>,
        stats: Arc<dyn StatsSink>,
        now: Instant,
    ) -> Self {
        Self {
            key,
            options,
            inner: StdMutex::new(CircuitInner {
                state: CircuitState::Healthy,
                period_start: now,
                requests: 0,
                errors: 0,
                probes_admitted: 0,
                consecutive_successes: 0,
            }),
            events,
            stats,
        }
    }

    pub fn key(&self) -> &CircuitKey {
        &self.key
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Close out the window if a period boundary has passed. Healthy
    /// circuits evaluate the finished window here, so an idle circuit still
    /// trips at the end of the period that went bad.
    fn roll_period(&self, inner: &mut CircuitInner, now: Instant) {
        if now.saturating_duration_since(inner.period_start) < self.options.period {
            return;
        }
        if inner.state == CircuitState::Healthy
            && inner.requests >= self.options.min_requests.max(1)
            && inner.errors as f64 / inner.requests as f64 > self.options.max_error_rate
        {
            self.transition(inner, CircuitState::Unhealthy);
        }
        inner.period_start = now;
        inner.requests = 0;
        inner.errors = 0;
        inner.probes_admitted = 0;
    }

    fn transition(&self, inner: &mut CircuitInner, new_state: CircuitState) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }
        inner.state = new_state;
        inner.consecutive_successes = 0;
        inner.probes_admitted = 0;
        info!(
            caller = %self.key.caller_name,
            service = %self.key.service_name,
            endpoint = %self.key.endpoint_name,
            ?old_state,
            ?new_state,
            "circuit state change"
        );
        self.stats.incr("circuit.state-change", 1);
        let _ = self.events.send(CircuitStateChange {
            key: self.key.clone(),
            old_state,
            new_state,
        });
    }

    /// Whether a request may pass. Healthy circuits accept everything;
    /// Unhealthy ones admit up to `probation` probes per period.
    pub fn should_request_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.roll_period(&mut inner, now);
        match inner.state {
            CircuitState::Healthy => true,
            CircuitState::Unhealthy => {
                if inner.probes_admitted < self.options.probation {
                    inner.probes_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn should_request(&self) -> bool {
        self.should_request_at(Instant::now())
    }

    /// Record a request outcome.
    pub fn observe_at(&self, ok: bool, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        self.roll_period(&mut inner, now);
        inner.requests += 1;
        if !ok {
            inner.errors += 1;
        }
        match inner.state {
            CircuitState::Healthy => {}
            CircuitState::Unhealthy => {
                if ok {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.options.probation {
                        self.transition(&mut inner, CircuitState::Healthy);
                    }
                } else {
                    inner.consecutive_successes = 0;
                }
            }
        }
    }

    pub fn observe(&self, ok: bool) {
        self.observe_at(ok, Instant::now());
    }

    fn health(&self) -> CircuitHealth {
        let inner = self.inner.lock().unwrap();
        CircuitHealth {
            key: self.key.clone(),
            healthy: inner.state == CircuitState::Healthy,
            requests: inner.requests,
            errors: inner.errors,
        }
    }
}

/// Three-level circuit map: `service → caller → endpoint → Circuit`.
pub struct CircuitRegistry {
    options: CircuitOptions,
    enabled: AtomicBool,
    tree: StdRwLock<HashMap<ServiceName, HashMap<CallerName, HashMap<EndpointName, Arc<Circuit>>>>>,
    events: broadcast::Sender<CircuitStateChange>,
    stats: Arc<dyn StatsSink>,
}

impl CircuitRegistry {
    pub fn new(options: CircuitOptions, stats: Arc<dyn StatsSink>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            enabled: AtomicBool::new(options.enabled),
            options,
            tree: StdRwLock::new(HashMap::new()),
            events,
            stats,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitStateChange> {
        self.events.subscribe()
    }

    /// Look up a circuit, creating it Healthy on first reference.
    pub fn circuit_for(
        &self,
        caller_name: Option<&str>,
        service_name: &str,
        endpoint_name: &str,
    ) -> Arc<Circuit> {
        let caller = caller_name.unwrap_or(NO_CALLER);
        {
            let tree = self.tree.read().unwrap();
            if let Some(circuit) = tree
                .get(service_name)
                .and_then(|callers| callers.get(caller))
                .and_then(|endpoints| endpoints.get(endpoint_name))
            {
                return circuit.clone();
            }
        }
        let mut tree = self.tree.write().unwrap();
        tree.entry(service_name.to_string())
            .or_default()
            .entry(caller.to_string())
            .or_default()
            .entry(endpoint_name.to_string())
            .or_insert_with(|| {
                Arc::new(Circuit::new(
                    CircuitKey {
                        caller_name: caller.to_string(),
                        service_name: service_name.to_string(),
                        endpoint_name: endpoint_name.to_string(),
                    },
                    self.options.clone(),
                    self.events.clone(),
                    self.stats.clone(),
                    Instant::now(),
                ))
            })
            .clone()
    }

    /// Admission lookup: the circuit for a request, or the error frame to
    /// answer with.
    pub fn get_circuit_for_request(&self, req: &CallRequest) -> Result<Arc<Circuit>, ErrorFrame> {
        let service_name = req.effective_service();
        if service_name.is_empty() {
            return Err(ErrorFrame::bad_request("no service name given"));
        }
        let circuit = self.circuit_for(req.caller_name.as_deref(), service_name, &req.endpoint);
        if !circuit.should_request() {
            return Err(ErrorFrame::new(self.options.code_name, "Service is not healthy"));
        }
        Ok(circuit)
    }

    /// Drop circuit subtrees for services this router no longer owns.
    pub fn update_services(&self, is_exit: impl Fn(&str) -> bool) {
        let mut tree = self.tree.write().unwrap();
        tree.retain(|service_name, _| is_exit(service_name));
    }

    /// Everything the control endpoint reports.
    pub fn snapshot(&self) -> Vec<CircuitHealth> {
        let tree = self.tree.read().unwrap();
        let mut rows: Vec<CircuitHealth> = tree
            .values()
            .flat_map(|callers| callers.values())
            .flat_map(|endpoints| endpoints.values())
            .map(|circuit| circuit.health())
            .collect();
        rows.sort_by(|a, b| {
            (&a.key.service_name, &a.key.caller_name, &a.key.endpoint_name)
                .cmp(&(&b.key.service_name, &b.key.caller_name, &b.key.endpoint_name))
        });
        rows
    }

    pub fn len(&self) -> usize {
        self.tree
            .read()
            .unwrap()
            .values()
            .flat_map(|callers| callers.values())
            .map(|endpoints| endpoints.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaymesh_common::ErrorCode;
    use relaymesh_metrics::NullSink;
    use std::time::Duration;

    fn options() -> CircuitOptions {
        CircuitOptions {
            enabled: true,
            period: Duration::from_millis(10),
            min_requests: 0,
            max_error_rate: 0.5,
            probation: 5,
            ..Default::default()
        }
    }

    fn registry() -> CircuitRegistry {
        CircuitRegistry::new(options(), Arc::new(NullSink))
    }

    #[test]
    fn test_created_healthy_and_shared() {
        let registry = registry();
        let a = registry.circuit_for(Some("bob"), "steve", "echo");
        let b = registry.circuit_for(Some("bob"), "steve", "echo");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.state(), CircuitState::Healthy);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_missing_caller_shares_sentinel_circuit() {
        let registry = registry();
        let a = registry.circuit_for(None, "steve", "echo");
        assert_eq!(a.key().caller_name, NO_CALLER);
        let b = registry.circuit_for(None, "steve", "echo");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_trips_on_error_rate_at_period_end() {
        let registry = registry();
        let circuit = registry.circuit_for(Some("bob"), "steve", "ifyousayso");
        let start = Instant::now();

        for i in 0..100 {
            circuit.observe_at(i % 5 == 0, start); // ~80% errors
        }
        assert_eq!(circuit.state(), CircuitState::Healthy);

        // period boundary closes the bad window
        let after = start + Duration::from_millis(11);
        circuit.should_request_at(after);
        assert_eq!(circuit.state(), CircuitState::Unhealthy);
    }

    #[test]
    fn test_min_requests_gate() {
        let registry = CircuitRegistry::new(
            CircuitOptions { min_requests: 10, ..options() },
            Arc::new(NullSink),
        );
        let circuit = registry.circuit_for(Some("bob"), "steve", "echo");
        let start = Instant::now();
        for _ in 0..5 {
            circuit.observe_at(false, start); // 100% errors but under min
        }
        circuit.should_request_at(start + Duration::from_millis(11));
        assert_eq!(circuit.state(), CircuitState::Healthy);
    }

    #[test]
    fn test_unhealthy_admits_probe_stream_only() {
        let registry = registry();
        let circuit = registry.circuit_for(Some("bob"), "steve", "echo");
        let start = Instant::now();
        for _ in 0..10 {
            circuit.observe_at(false, start);
        }
        let after = start + Duration::from_millis(11);
        circuit.should_request_at(after);
        assert_eq!(circuit.state(), CircuitState::Unhealthy);

        // the first probe was just admitted; 4 more pass, then declines
        let mut admitted = 1;
        for _ in 0..20 {
            if circuit.should_request_at(after) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_probation_successes_recover() {
        let registry = registry();
        let circuit = registry.circuit_for(Some("bob"), "steve", "echo");
        let start = Instant::now();
        for _ in 0..10 {
            circuit.observe_at(false, start);
        }
        let t1 = start + Duration::from_millis(11);
        circuit.should_request_at(t1);
        assert_eq!(circuit.state(), CircuitState::Unhealthy);

        for _ in 0..5 {
            circuit.observe_at(true, t1);
        }
        assert_eq!(circuit.state(), CircuitState::Healthy);
    }

    #[test]
    fn test_probe_failure_resets_probation() {
        let registry = registry();
        let circuit = registry.circuit_for(Some("bob"), "steve", "echo");
        let start = Instant::now();
        for _ in 0..10 {
            circuit.observe_at(false, start);
        }
        let t1 = start + Duration::from_millis(11);
        circuit.should_request_at(t1);

        for _ in 0..4 {
            circuit.observe_at(true, t1);
        }
        circuit.observe_at(false, t1);
        for _ in 0..4 {
            circuit.observe_at(true, t1);
        }
        assert_eq!(circuit.state(), CircuitState::Unhealthy);
        circuit.observe_at(true, t1);
        assert_eq!(circuit.state(), CircuitState::Healthy);
    }

    #[test]
    fn test_transition_emits_event() {
        let registry = registry();
        let mut rx = registry.subscribe();
        let circuit = registry.circuit_for(Some("bob"), "steve", "echo");
        let start = Instant::now();
        for _ in 0..10 {
            circuit.observe_at(false, start);
        }
        circuit.should_request_at(start + Duration::from_millis(11));

        let change = rx.try_recv().unwrap();
        assert_eq!(change.old_state, CircuitState::Healthy);
        assert_eq!(change.new_state, CircuitState::Unhealthy);
        assert_eq!(change.key.service_name, "steve");
    }

    #[test]
    fn test_request_lookup_declines_unhealthy() {
        let registry = registry();
        let req = CallRequest::new("steve", "echo").with_caller("bob");
        let circuit = registry.get_circuit_for_request(&req).unwrap();
        let start = Instant::now();
        for _ in 0..10 {
            circuit.observe_at(false, start);
        }
        circuit.should_request_at(start + Duration::from_millis(11));

        // probe budget was spent by the tripping call above plus these
        let mut declined = None;
        for _ in 0..10 {
            if let Err(frame) = registry.get_circuit_for_request(&req) {
                declined = Some(frame);
                break;
            }
        }
        let frame = declined.expect("expected a decline after probe budget");
        assert_eq!(frame.code, ErrorCode::Declined);
        assert_eq!(frame.message, "Service is not healthy");
    }

    #[test]
    fn test_unhealthy_code_name_alias() {
        let registry = CircuitRegistry::new(
            CircuitOptions { code_name: ErrorCode::Unhealthy, probation: 0, ..options() },
            Arc::new(NullSink),
        );
        let req = CallRequest::new("steve", "echo").with_caller("bob");
        let circuit = registry.get_circuit_for_request(&req).unwrap();
        let start = Instant::now();
        for _ in 0..10 {
            circuit.observe_at(false, start);
        }
        circuit.should_request_at(start + Duration::from_millis(11));
        let frame = registry.get_circuit_for_request(&req).unwrap_err();
        assert_eq!(frame.code, ErrorCode::Unhealthy);
    }

    #[test]
    fn test_empty_service_rejected() {
        let registry = registry();
        let req = CallRequest::new("", "echo");
        let frame = registry.get_circuit_for_request(&req).unwrap_err();
        assert_eq!(frame.code, ErrorCode::BadRequest);
    }

    #[test]
    fn test_update_services_drops_unowned_subtrees() {
        let registry = registry();
        registry.circuit_for(Some("bob"), "steve", "echo");
        registry.circuit_for(Some("bob"), "mary", "echo");
        registry.update_services(|sn| sn == "steve");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].key.service_name, "steve");
    }
}
