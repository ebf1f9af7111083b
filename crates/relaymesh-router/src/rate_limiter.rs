//! Sliding-window rate limiting.
//!
//! Counters are kept per {total, service, caller~service edge} plus a
//! kill-switch tier above the soft limits. Each counter is a ring of
//! `num_buckets` buckets covering `window / num_buckets` each; on every
//! touch, stale buckets rotate to zero and `rps` is the sum of the rest.
//!
//! Limits can be retuned in place (`update_total_limit`,
//! `update_service_limits`) without resetting counters, so an operator
//! raising a limit mid-incident does not grant a free burst.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use relaymesh_common::ServiceName;

use crate::config::RateLimiterOptions;

/// Sliding-window RPS counter.
#[derive(Debug)]
pub struct SlidingWindowCounter {
    buckets: Vec<u64>,
    head: usize,
    last_rotation: Instant,
    bucket_span: Duration,
    rps_limit: u64,
}

impl SlidingWindowCounter {
    pub fn new(rps_limit: u64, window: Duration, num_buckets: usize, now: Instant) -> Self {
        Self {
            buckets: vec![0; num_buckets.max(1)],
            head: 0,
            last_rotation: now,
            bucket_span: window / num_buckets.max(1) as u32,
            rps_limit,
        }
    }

    /// Zero every bucket that has aged out since the last touch.
    fn rotate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_rotation);
        if elapsed < self.bucket_span {
            return;
        }
        let stale = (elapsed.as_nanos() / self.bucket_span.as_nanos().max(1)) as usize;
        if stale >= self.buckets.len() {
            self.buckets.fill(0);
            self.last_rotation = now;
            return;
        }
        for _ in 0..stale {
            self.head = (self.head + 1) % self.buckets.len();
            self.buckets[self.head] = 0;
        }
        // advance in whole bucket spans so slow tick drift does not accumulate
        self.last_rotation += self.bucket_span * stale as u32;
    }

    pub fn increment(&mut self, now: Instant) {
        self.rotate(now);
        self.buckets[self.head] += 1;
    }

    /// Requests seen across the live window.
    pub fn rps(&mut self, now: Instant) -> u64 {
        self.rotate(now);
        self.buckets.iter().sum()
    }

    pub fn limit(&self) -> u64 {
        self.rps_limit
    }

    /// Retune the limit. Bucket contents are preserved.
    pub fn set_limit(&mut self, rps_limit: u64) {
        self.rps_limit = rps_limit;
    }

    pub fn over_limit(&mut self, now: Instant) -> bool {
        self.rps(now) >= self.rps_limit
    }
}

struct RateState {
    total: SlidingWindowCounter,
    ks_total: SlidingWindowCounter,
    services: HashMap<ServiceName, SlidingWindowCounter>,
    ks_services: HashMap<ServiceName, SlidingWindowCounter>,
    edges: HashMap<String, SlidingWindowCounter>,
    service_limit_overrides: HashMap<ServiceName, u64>,
    default_service_limit: u64,
    total_limit: u64,
    exempt: HashSet<ServiceName>,
}

impl RateState {
    fn service_limit(&self, service_name: &str) -> u64 {
        self.service_limit_overrides
            .get(service_name)
            .copied()
            .unwrap_or(self.default_service_limit)
    }
}

/// Multi-dimensional sliding-window rate limiter.
///
/// Admission calls are synchronous; state sits behind a short `std` mutex
/// so the dispatch path never suspends here.
pub struct RateLimiter {
    enabled: AtomicBool,
    window: Duration,
    num_buckets: usize,
    kill_switch_buffer: f64,
    state: StdMutex<RateState>,
}

impl RateLimiter {
    pub fn new(options: &RateLimiterOptions) -> Self {
        let now = Instant::now();
        let ks_total_limit = Self::buffered(options.total_rps_limit, options.kill_switch_buffer);
        Self {
            enabled: AtomicBool::new(options.enabled),
            window: options.window,
            num_buckets: options.num_buckets,
            kill_switch_buffer: options.kill_switch_buffer,
            state: StdMutex::new(RateState {
                total: SlidingWindowCounter::new(options.total_rps_limit, options.window, options.num_buckets, now),
                ks_total: SlidingWindowCounter::new(ks_total_limit, options.window, options.num_buckets, now),
                services: HashMap::new(),
                ks_services: HashMap::new(),
                edges: HashMap::new(),
                service_limit_overrides: HashMap::new(),
                default_service_limit: options.default_service_rps_limit,
                total_limit: options.total_rps_limit,
                exempt: options.exempt_services.iter().cloned().collect(),
            }),
        }
    }

    fn buffered(limit: u64, buffer: f64) -> u64 {
        (limit as f64 * buffer).ceil() as u64
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn counter<'a>(
        map: &'a mut HashMap<String, SlidingWindowCounter>,
        key: &str,
        limit: u64,
        window: Duration,
        num_buckets: usize,
        now: Instant,
    ) -> &'a mut SlidingWindowCounter {
        map.entry(key.to_string())
            .or_insert_with(|| SlidingWindowCounter::new(limit, window, num_buckets, now))
    }

    /// Stats-only per-edge counter; no limit is enforced on it.
    pub fn increment_edge(&self, caller_name: &str, service_name: &str, now: Instant) {
        let mut state = self.state.lock().unwrap();
        let key = format!("{caller_name}~~{service_name}");
        Self::counter(&mut state.edges, &key, u64::MAX, self.window, self.num_buckets, now)
            .increment(now);
    }

    /// Ensure the service and kill-switch counters exist before checks read
    /// them. Exit nodes call this once the effective service is known.
    pub fn ensure_service_counters(&self, service_name: &str, now: Instant) {
        let state = &mut *self.state.lock().unwrap();
        let limit = state.service_limit(service_name);
        let ks_limit = Self::buffered(limit, self.kill_switch_buffer);
        Self::counter(&mut state.services, service_name, limit, self.window, self.num_buckets, now);
        Self::counter(&mut state.ks_services, service_name, ks_limit, self.window, self.num_buckets, now);
    }

    pub fn is_exempt(&self, service_name: &str) -> bool {
        self.state.lock().unwrap().exempt.contains(service_name)
    }

    pub fn should_kill_switch_total(&self, service_name: &str, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.exempt.contains(service_name) {
            return false;
        }
        state.ks_total.over_limit(now)
    }

    pub fn should_kill_switch_service(&self, service_name: &str, now: Instant) -> bool {
        let state = &mut *self.state.lock().unwrap();
        if state.exempt.contains(service_name) {
            return false;
        }
        match state.ks_services.get_mut(service_name) {
            Some(counter) => counter.over_limit(now),
            None => false,
        }
    }

    pub fn increment_kill_switch(&self, service_name: &str, now: Instant) {
        let state = &mut *self.state.lock().unwrap();
        state.ks_total.increment(now);
        if let Some(counter) = state.ks_services.get_mut(service_name) {
            counter.increment(now);
        }
    }

    pub fn should_rate_limit_total(&self, service_name: &str, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.exempt.contains(service_name) {
            return false;
        }
        state.total.over_limit(now)
    }

    pub fn should_rate_limit_service(&self, service_name: &str, now: Instant) -> bool {
        let state = &mut *self.state.lock().unwrap();
        if state.exempt.contains(service_name) {
            return false;
        }
        match state.services.get_mut(service_name) {
            Some(counter) => counter.over_limit(now),
            None => false,
        }
    }

    pub fn increment_total(&self, now: Instant) {
        self.state.lock().unwrap().total.increment(now);
    }

    pub fn increment_service(&self, service_name: &str, now: Instant) {
        if let Some(counter) = self.state.lock().unwrap().services.get_mut(service_name) {
            counter.increment(now);
        }
    }

    pub fn total_limit(&self) -> u64 {
        self.state.lock().unwrap().total_limit
    }

    pub fn service_limit(&self, service_name: &str) -> u64 {
        self.state.lock().unwrap().service_limit(service_name)
    }

    /// Retune the total limit in place; counter values are preserved.
    pub fn update_total_limit(&self, limit: u64) {
        let state = &mut *self.state.lock().unwrap();
        state.total_limit = limit;
        state.total.set_limit(limit);
        let ks = Self::buffered(limit, self.kill_switch_buffer);
        state.ks_total.set_limit(ks);
    }

    /// Retune every per-service limit: explicit overrides win, everything
    /// else follows the default. Existing counters keep their buckets.
    pub fn update_service_limits(&self, default_limit: u64, overrides: &HashMap<ServiceName, u64>) {
        let state = &mut *self.state.lock().unwrap();
        state.default_service_limit = default_limit;
        state.service_limit_overrides = overrides.clone();
        let buffer = self.kill_switch_buffer;
        let limits: Vec<(ServiceName, u64)> = state
            .services
            .keys()
            .map(|sn| (sn.clone(), state.service_limit(sn)))
            .collect();
        for (sn, limit) in limits {
            if let Some(counter) = state.services.get_mut(&sn) {
                counter.set_limit(limit);
            }
            if let Some(counter) = state.ks_services.get_mut(&sn) {
                counter.set_limit(Self::buffered(limit, buffer));
            }
        }
    }

    pub fn update_exempt_services(&self, exempt: &[ServiceName]) {
        self.state.lock().unwrap().exempt = exempt.iter().cloned().collect();
    }

    /// Service purge drops the purged service's counters.
    pub fn remove_service_counters(&self, service_name: &str) {
        let state = &mut *self.state.lock().unwrap();
        state.services.remove(service_name);
        state.ks_services.remove(service_name);
    }

    /// Current RPS on the total counter, for introspection.
    pub fn total_rps(&self, now: Instant) -> u64 {
        self.state.lock().unwrap().total.rps(now)
    }
}
