use serde::{Deserialize, Serialize};

use crate::{HostPort, ServiceName};

/// One service entry in an `ad` or `unad` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdService {
    pub service_name: ServiceName,
    /// Advertised cost. Carried for forward compatibility; the dispatch core
    /// does not weight peers by it.
    #[serde(default)]
    pub cost: u32,
}

/// `ad` / `unad` request body: `{services: [{serviceName, cost}]}`.
///
/// The advertiser's own host-port is not in the body; it is taken from the
/// remote name of the connection the request arrived on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdRequest {
    pub services: Vec<AdService>,
}

/// `ad` response body, returned immediately without waiting on the fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdResponse {
    /// Number of distinct exit routers the advertisement was fanned out to.
    pub connection_count: usize,
}

/// `unad` response body: empty object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnadResponse {}

/// One service entry in a `relay-ad` / `relay-unad` request. Unlike the
/// ingress form, the worker's host-port travels in the body because the
/// relaying router, not the worker, owns the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayAdService {
    pub service_name: ServiceName,
    pub host_port: HostPort,
    #[serde(default)]
    pub cost: u32,
}

/// `relay-ad` / `relay-unad` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayAdRequest {
    pub services: Vec<RelayAdService>,
}
