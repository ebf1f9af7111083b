//! Relaymesh Protocol Definitions
//!
//! Wire-facing types for the router fleet:
//!
//! - **[`CallRequest`] / [`CallResponse`]**: the request envelope as the
//!   dispatch core sees it after the framed transport has decoded headers
//! - **[`AdRequest`] / [`RelayAdRequest`]**: advertise bodies (JSON over the
//!   framed RPC)
//! - **[`DiscoveryQuery`] / [`DiscoveryResult`]**: discovery lookup shapes
//! - **[`ErrorFrame`] / [`ErrorCode`]**: error frames returned on the wire
//! - **[`Endpoint`]**: the tagged endpoint set the router itself serves
//!
//! Header contract: incoming requests carry `cn` (caller name) and optionally
//! `rd` (routing delegate). Outgoing fan-out requests set `cn` to the
//! router's configured caller name; forwarded discoveries set `cn` to the
//! router service name to signal "do not forward again".

pub mod advertise;
pub mod discovery;
pub mod endpoints;
pub mod error;
pub mod request;

pub use advertise::{AdRequest, AdResponse, AdService, RelayAdRequest, RelayAdService, UnadResponse};
pub use discovery::{DiscoveryQuery, DiscoveryResult, IpInfo, PeerInfo};
pub use endpoints::Endpoint;
pub use error::{CommonError, ErrorCode, ErrorFrame, Result};
pub use request::{CallRequest, CallResponse, CallResult};
