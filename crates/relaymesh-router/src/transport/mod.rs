//! Transport collaborator traits.
//!
//! The framed RPC transport and its connection objects are external to the
//! dispatch core; the core drives them through these traits. A peer is one
//! host-port plus its connections, shared between service channels — the
//! core must only close a peer once no channel retains it.
//!
//! [`inmem`] provides the loopback implementation used by the integration
//! tests and single-process embedding.

pub mod inmem;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use relaymesh_common::{CallRequest, CallResult, ErrorFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    In,
    Out,
}

/// What a drain is trying to achieve. `ClosePeer` drains are terminal: the
/// peer is deleted on completion and a refresh must cancel them explicitly
/// to rescue the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainGoal {
    /// Close connections once their in-flight requests finish; keep the peer.
    CloseDrained,
    /// Close everything and delete the peer afterwards.
    ClosePeer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainDirection {
    In,
    Out,
    Both,
}

/// One remote host-port and its connections.
#[async_trait]
pub trait TransportPeer: Send + Sync {
    fn host_port(&self) -> &str;

    /// Open an outbound connection if none is live.
    fn ensure_out_connection(&self);

    /// Close outbound connections only; the peer survives. Used by pruning.
    fn close_out_connections(&self, reason: &str);

    fn connection_count(&self, direction: ConnectionDirection) -> usize;

    fn is_draining(&self) -> bool;

    /// Goal of the in-flight drain, if any.
    fn drain_goal(&self) -> Option<DrainGoal>;

    fn cancel_drain(&self);

    /// Gracefully wind the peer down. On timeout the connections are closed
    /// anyway and an error is returned for logging; the caller proceeds with
    /// deletion regardless.
    async fn drain(
        &self,
        goal: DrainGoal,
        direction: DrainDirection,
        timeout: Duration,
    ) -> Result<(), ErrorFrame>;

    /// Wait for the connection to identify, then send one framed call with
    /// no transport-level retries; retry policy belongs to the core.
    async fn send(&self, req: CallRequest, timeout: Duration) -> CallResult;
}

/// The transport's shared peer table.
pub trait Transport: Send + Sync {
    /// Get or create the peer for a host-port.
    fn peer(&self, host_port: &str) -> Arc<dyn TransportPeer>;

    fn get_peer(&self, host_port: &str) -> Option<Arc<dyn TransportPeer>>;

    /// Drop the peer from the table. Only called once every service channel
    /// has released it.
    fn delete_peer(&self, host_port: &str);

    fn peer_count(&self) -> usize;

    fn peer_host_ports(&self) -> Vec<String>;
}
