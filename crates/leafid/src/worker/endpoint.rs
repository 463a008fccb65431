use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The payload stored in a worker node, refreshed by every heartbeat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: String,
    /// Milliseconds since the Unix epoch at the time of writing.
    pub timestamp: i64,
}

impl Endpoint {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::coordination(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::coordination(format!("malformed endpoint: {e}")))
    }
}

/// The address this host uses to reach other hosts.
///
/// Connecting a UDP socket sends nothing but makes the OS pick the outbound
/// interface. Falls back to loopback on hosts without a route.
pub fn local_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
