//! Deterministic worker subsetting for partial affinity.
//!
//! With N exit routers and M workers per service, a full mesh costs N·M
//! connections. Partial affinity gives each relay a contiguous window of the
//! sorted worker list instead, sized so every worker is held by at least
//! `min_peers_per_worker` relays and every relay holds at least
//! `min_peers_per_relay` workers. All relays compute the same answer from
//! the same sorted inputs; no coordination happens.

use relaymesh_common::HostPort;

/// The affine window one relay holds for one service.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialRange {
    /// Position of this relay in the sorted relay list.
    pub relay_index: usize,
    /// workers / relays.
    pub ratio: f64,
    /// Window length, bounded by the worker count.
    pub length: usize,
    /// Window start in the sorted worker list.
    pub start: usize,
    /// `start + length`; indexing wraps around the worker list.
    pub stop: usize,
    /// The workers this relay connects to.
    pub affine_workers: Vec<HostPort>,
}

impl PartialRange {
    /// Compute the window for `local` given the sorted relay and worker
    /// lists. Returns `None` when `local` is not among the relays — the
    /// caller logs and waits for reconciliation to catch up.
    pub fn compute(
        relays: &[HostPort],
        workers: &[HostPort],
        local: &str,
        min_peers_per_worker: usize,
        min_peers_per_relay: usize,
    ) -> Option<PartialRange> {
        let relay_index = relays.iter().position(|hp| hp == local)?;
        if workers.is_empty() {
            // tolerated only while the ring is transiently empty
            return Some(PartialRange {
                relay_index,
                ratio: 0.0,
                length: 0,
                start: 0,
                stop: 0,
                affine_workers: Vec::new(),
            });
        }

        let ratio = workers.len() as f64 / relays.len() as f64;
        let length = workers.len().min(
            min_peers_per_relay.max((ratio * min_peers_per_worker as f64).ceil() as usize),
        );
        let start = (relay_index as f64 * ratio).floor() as usize % workers.len();
        let stop = start + length;
        let affine_workers = (start..stop)
            .map(|i| workers[i % workers.len()].clone())
            .collect::<Vec<_>>();
        debug_assert!(!affine_workers.is_empty());

        Some(PartialRange { relay_index, ratio, length, start, stop, affine_workers })
    }

    pub fn contains(&self, host_port: &str) -> bool {
        self.affine_workers.iter().any(|hp| hp == host_port)
    }
}
