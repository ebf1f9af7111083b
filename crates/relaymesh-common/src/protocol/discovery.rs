use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::error::CommonError;
use crate::{HostPort, ServiceName};

/// `discover` query body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryQuery {
    pub service_name: ServiceName,
}

/// A single peer in a discovery result. The address is packed the way the
/// worker client libraries expect it: IPv4 as a big-endian u32 plus a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub ip: IpInfo,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpInfo {
    pub ipv4: u32,
}

impl PeerInfo {
    /// Packs an `ip:port` host-port string. Only IPv4 literals are accepted;
    /// workers advertise the address their connections identify as.
    pub fn from_host_port(hp: &str) -> Result<Self, CommonError> {
        let (ip_part, port_part) = hp
            .rsplit_once(':')
            .ok_or_else(|| CommonError::InvalidHostPort(hp.to_string()))?;
        let ip: Ipv4Addr = ip_part
            .parse()
            .map_err(|_| CommonError::InvalidHostPort(hp.to_string()))?;
        let port: u16 = port_part
            .parse()
            .map_err(|_| CommonError::InvalidHostPort(hp.to_string()))?;
        Ok(Self { ip: IpInfo { ipv4: u32::from(ip) }, port })
    }

    pub fn to_host_port(&self) -> HostPort {
        format!("{}:{}", Ipv4Addr::from(self.ip.ipv4), self.port)
    }
}

/// `discover` / `discover-affine` result body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub peers: Vec<PeerInfo>,
}
