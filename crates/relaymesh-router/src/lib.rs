//! Relaymesh Router Core
//!
//! This crate is the per-router dispatch subsystem of the relaymesh fleet.
//! A fleet of identical routers sits between service callers and service
//! workers: workers advertise themselves to any router, the fleet partitions
//! responsibility for service names across its members with a
//! consistent-hash ring, and traffic is forwarded to the authoritative
//! members ("exit nodes") which hold the live worker connections.
//!
//! # Architecture
//!
//! The [`Dispatcher`] is the glue. An inbound request is classified (service
//! name, caller name, routing-delegate override), run through admission
//! (blocking, rate limiting, circuit breaking), then handed to the relay
//! handler of a per-service channel which selects a peer and forwards.
//!
//! Around it:
//!
//! 1. **Ring view** ([`ring`]): read-only projection of the membership ring;
//!    which K hosts own a service, and whether this router is one of them
//! 2. **Rate limiter** ([`rate_limiter`]): sliding-window RPS counters with a
//!    kill-switch tier above the soft limits
//! 3. **Circuit registry** ([`circuits`]): per-(caller, service, endpoint)
//!    health state machines gating calls
//! 4. **Partial affinity** ([`partial_range`]): deterministic subsetting of
//!    worker peers across exit routers to bound connection fan-out
//! 5. **Peer lifecycle**: advertise refresh, graceful drains, pruning of
//!    out-of-affinity peers, reaping of silent ones ([`peer_index`],
//!    [`scanner`])
//! 6. **Discovery** ([`discovery`], [`advertise`]): the `ad`/`unad` protocol
//!    with bounded-retry fan-out to exits, and `discover` lookups resolved
//!    locally or forwarded to an exit
//!
//! External collaborators — the framed transport, the gossip membership
//! feed, the statsd sink — are consumed through traits ([`transport::Transport`],
//! [`ring::Ring`], `relaymesh_metrics::StatsSink`); the crate ships in-memory
//! implementations for tests and single-process embedding.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use relaymesh_router::config::RouterConfig;
//! use relaymesh_router::dispatcher::{Dispatcher, RouterContext};
//! use relaymesh_router::ring::{HashRing, RingView};
//! use relaymesh_router::transport::inmem::InMemoryTransport;
//! use relaymesh_metrics::NullSink;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = RouterConfig::new("127.0.0.1:4040");
//! let ring = Arc::new(HashRing::new(vec!["127.0.0.1:4040".into()]));
//! let view = Arc::new(RingView::new(ring, "127.0.0.1:4040", config.k_default));
//! let ctx = RouterContext {
//!     config,
//!     ring: view,
//!     transport: Arc::new(InMemoryTransport::new()),
//!     stats: Arc::new(NullSink),
//! };
//! let dispatcher = Dispatcher::spawn(ctx);
//! assert!(dispatcher.service_names().await.is_empty());
//! # }
//! ```

pub mod advertise;
pub mod blocking;
pub mod circuits;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod partial_range;
pub mod peer_index;
pub mod rate_limiter;
pub mod remote;
pub mod ring;
pub mod scanner;
pub mod service_channel;
pub mod transport;

pub use advertise::AdvertiseHandler;
pub use circuits::{Circuit, CircuitRegistry, CircuitState};
pub use config::RouterConfig;
pub use dispatcher::{DispatchOutcome, Dispatcher, DropReason, RouterContext};
pub use partial_range::PartialRange;
pub use rate_limiter::RateLimiter;
pub use remote::RemoteConfig;
pub use ring::{HashRing, Ring, RingView};
pub use service_channel::ChannelMode;
