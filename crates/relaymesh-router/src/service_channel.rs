//! Per-service routing channels.
//!
//! A service channel is this router's view of one service. In exit mode it
//! holds the advertised worker peers; in forward mode it holds the exit
//! host-ports the ring assigns to the service. The mode is re-derived from
//! the ring on every membership change, so a channel can flip roles without
//! being recreated.

use std::collections::BTreeSet;

use relaymesh_common::{HostPort, ServiceName};

use crate::partial_range::PartialRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// This router owns the service: peers are live workers.
    Exit,
    /// Another router owns it: peers are the exit host-ports.
    Forward,
}

#[derive(Debug)]
pub struct ServiceChannel {
    pub service_name: ServiceName,
    pub mode: ChannelMode,
    /// Sorted so peer selection and discovery output are deterministic.
    pub peers: BTreeSet<HostPort>,
    /// Exit channels prefer opening connections outward, toward workers.
    pub prefer_out: bool,
    /// Current affine window, when partial affinity is on.
    pub partial_range: Option<PartialRange>,
    rr_cursor: usize,
}

impl ServiceChannel {
    pub fn new_exit(service_name: impl Into<ServiceName>) -> Self {
        Self {
            service_name: service_name.into(),
            mode: ChannelMode::Exit,
            peers: BTreeSet::new(),
            prefer_out: true,
            partial_range: None,
            rr_cursor: 0,
        }
    }

    /// Forward channels are born with their exit set so the load balancer
    /// has targets before the first response comes back.
    pub fn new_forward(service_name: impl Into<ServiceName>, exits: Vec<HostPort>) -> Self {
        Self {
            service_name: service_name.into(),
            mode: ChannelMode::Forward,
            peers: exits.into_iter().collect(),
            prefer_out: false,
            partial_range: None,
            rr_cursor: 0,
        }
    }

    /// Flip to exit mode, clearing the peer set; workers re-advertise
    /// within a purge window.
    pub fn change_to_exit(&mut self) -> Vec<HostPort> {
        let old = std::mem::take(&mut self.peers).into_iter().collect();
        self.mode = ChannelMode::Exit;
        self.prefer_out = true;
        self.partial_range = None;
        self.rr_cursor = 0;
        old
    }

    /// Flip to forward mode, swapping workers out for the exit set. Returns
    /// the worker peers that must be disconnected.
    pub fn change_to_forward(&mut self, exits: Vec<HostPort>) -> Vec<HostPort> {
        let workers = std::mem::take(&mut self.peers).into_iter().collect();
        self.peers = exits.into_iter().collect();
        self.mode = ChannelMode::Forward;
        self.prefer_out = false;
        self.partial_range = None;
        self.rr_cursor = 0;
        workers
    }

    pub fn sorted_peers(&self) -> Vec<HostPort> {
        self.peers.iter().cloned().collect()
    }

    /// Round-robin peer selection for the relay handler.
    pub fn next_peer(&mut self) -> Option<HostPort> {
        if self.peers.is_empty() {
            return None;
        }
        let index = self.rr_cursor % self.peers.len();
        self.rr_cursor = self.rr_cursor.wrapping_add(1) % self.peers.len();
        self.peers.iter().nth(index).cloned()
    }
}
