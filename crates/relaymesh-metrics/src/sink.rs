use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock as StdRwLock;
use std::time::Duration;

/// Emission boundary between the router core and whatever aggregates stats.
///
/// Keys are flat dotted strings (`"rate-limiting.total-busy"`,
/// `"service.peers.steve"`). Implementations must be cheap and non-blocking;
/// the core calls these on the admission path.
pub trait StatsSink: Send + Sync {
    fn incr(&self, key: &str, value: u64);
    fn gauge(&self, key: &str, value: u64);
    fn timing(&self, key: &str, duration: Duration);
}

/// Discards every emission. Used when no sink is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StatsSink for NullSink {
    fn incr(&self, _key: &str, _value: u64) {}
    fn gauge(&self, _key: &str, _value: u64) {}
    fn timing(&self, _key: &str, _duration: Duration) {}
}

/// Point-in-time copy of everything a [`MemorySink`] has seen.
///
/// Maps are ordered so snapshots render deterministically in test output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
    pub timings: BTreeMap<String, Vec<Duration>>,
}

/// Thread-safe in-memory registry.
///
/// Counters accumulate, gauges keep the last value, timings keep every
/// sample. Locking is a pair of short critical sections per emission, which
/// is fine at test volumes; production sinks should batch.
#[derive(Debug, Default)]
pub struct MemorySink {
    counters: StdRwLock<HashMap<String, u64>>,
    gauges: StdRwLock<HashMap<String, u64>>,
    timings: StdRwLock<HashMap<String, Vec<Duration>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, 0 if never incremented.
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.read().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Last value of a gauge, if one was ever set.
    pub fn gauge_value(&self, key: &str) -> Option<u64> {
        self.gauges.read().unwrap().get(key).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().unwrap().iter().map(|(k, v)| (k.clone(), *v)).collect(),
            gauges: self.gauges.read().unwrap().iter().map(|(k, v)| (k.clone(), *v)).collect(),
            timings: self.timings.read().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

impl StatsSink for MemorySink {
    fn incr(&self, key: &str, value: u64) {
        let mut counters = self.counters.write().unwrap();
        *counters.entry(key.to_string()).or_insert(0) += value;
    }

    fn gauge(&self, key: &str, value: u64) {
        self.gauges.write().unwrap().insert(key.to_string(), value);
    }

    fn timing(&self, key: &str, duration: Duration) {
        self.timings
            .write()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let sink = MemorySink::new();
        sink.incr("a", 1);
        sink.incr("a", 2);
        assert_eq!(sink.counter("a"), 3);
        assert_eq!(sink.counter("missing"), 0);
    }

    #[test]
    fn test_gauge_keeps_last_value() {
        let sink = MemorySink::new();
        sink.gauge("g", 5);
        sink.gauge("g", 2);
        assert_eq!(sink.gauge_value("g"), Some(2));
        assert_eq!(sink.gauge_value("missing"), None);
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let sink = MemorySink::new();
        sink.incr("b", 1);
        sink.incr("a", 1);
        let snap = sink.snapshot();
        let keys: Vec<_> = snap.counters.keys().cloned().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_null_sink_is_silent() {
        let sink = NullSink;
        sink.incr("a", 1);
        sink.gauge("g", 1);
        sink.timing("t", Duration::from_millis(1));
    }
}
