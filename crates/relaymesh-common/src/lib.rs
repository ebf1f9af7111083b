//! Relaymesh Common Types
//!
//! This crate provides the protocol definitions shared by every component of
//! the relaymesh router fleet: the advertise/unadvertise bodies exchanged
//! between workers and routers, the discovery query/result shapes, the wire
//! error frames, and the request envelope the dispatch core classifies.
//!
//! # Overview
//!
//! Relaymesh is a cluster-wide RPC router. A fleet of identical router
//! instances partitions responsibility for logical service names across its
//! members with a consistent-hash ring; workers advertise themselves to any
//! router, and the fleet converges on which members ("exit nodes") hold live
//! connections to which workers. This crate contains only the vocabulary of
//! that conversation — the dispatch machinery lives in `relaymesh-router`.
//!
//! # Components
//!
//! - [`protocol`] - request envelope, advertise/discovery bodies, error frames
//!
//! # Example
//!
//! ```
//! use relaymesh_common::protocol::{AdRequest, AdService, CallRequest};
//!
//! let ad = AdRequest {
//!     services: vec![AdService { service_name: "steve".into(), cost: 0 }],
//! };
//! let req = CallRequest::new("relaymesh", "ad")
//!     .with_remote_name("10.0.0.7:4040")
//!     .with_body(serde_json::to_value(&ad).unwrap());
//! assert_eq!(req.effective_service(), "relaymesh");
//! ```

pub mod protocol;

pub use protocol::*;

/// Logical destination identifier. Opaque, non-empty on every admitted path.
pub type ServiceName = String;

/// `ip:port` address of a router or worker instance.
pub type HostPort = String;

/// Identity of the originating service, carried in the `cn` header.
pub type CallerName = String;

/// Method name within a service, used for circuit keys.
pub type EndpointName = String;
