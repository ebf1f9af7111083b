//! Relaymesh Metrics
//!
//! The statsd sink boundary for the router core. The core emits counters and
//! gauges through the [`StatsSink`] trait and never talks to a wire protocol
//! directly; production embeds a statsd client behind the trait, tests and
//! introspection use the in-memory [`MemorySink`].
//!
//! # Components
//!
//! - [`StatsSink`] - the emission trait the core is generic over
//! - [`NullSink`] - discards everything; the default when stats are not wired
//! - [`MemorySink`] - thread-safe in-memory registry with snapshots
//!
//! # Example
//!
//! ```
//! use relaymesh_metrics::{MemorySink, StatsSink};
//!
//! let sink = MemorySink::new();
//! sink.incr("request.blocked", 1);
//! sink.gauge("services.count", 3);
//! assert_eq!(sink.counter("request.blocked"), 1);
//! ```

mod sink;

pub use sink::{MemorySink, MetricsSnapshot, NullSink, StatsSink};
