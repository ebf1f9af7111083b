//! Remote-config surface.
//!
//! The fleet-wide configuration service is polled outside this crate; every
//! poll tick hands the decoded document to
//! [`crate::dispatcher::Dispatcher::apply_remote_config`], which invokes all
//! updaters idempotently. Absent fields leave the running value untouched,
//! so a partial document is a valid delta.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use relaymesh_common::ServiceName;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteConfig {
    pub circuits: CircuitsSection,
    pub rate_limiting: RateLimitingSection,
    pub k_value: KValueSection,
    /// Block-table entries, `"cn~~sn"` with `*` wildcards on either side.
    /// `"*~~*"` is ignored with a warning.
    pub kill_switch: Option<Vec<String>>,
    pub peer_reaper: PeerReaperSection,
    pub partial_affinity: PartialAffinitySection,
    pub lazy_handling: LazyHandlingSection,
    /// Log-reservoir tuning for the external logging sink; carried through
    /// for the embedder, not interpreted by the core.
    pub log_reservoir: Option<LogReservoirSection>,
    /// Transport write-buffer mode; carried through for the embedder.
    pub write_buffer_mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitsSection {
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitingSection {
    pub enabled: Option<bool>,
    pub total_rps_limit: Option<u64>,
    pub exempt_services: Option<Vec<ServiceName>>,
    pub rps_limit_for_service_name: Option<HashMap<ServiceName, u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KValueSection {
    pub default: Option<usize>,
    pub services: Option<HashMap<ServiceName, usize>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PeerReaperSection {
    /// Reap period in milliseconds; 0 disables the reaper.
    pub period_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PartialAffinitySection {
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LazyHandlingSection {
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogReservoirSection {
    pub size: Option<usize>,
    pub flush_interval_ms: Option<u64>,
}
