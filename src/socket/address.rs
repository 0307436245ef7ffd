//! Socket addresses as reported in events, and host/port resolution.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::Serialize;

use super::error::SocketError;
use crate::constants::DEFAULT_CONNECT_HOST;

/// IP family of a [`SocketAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddressFamily {
    /// IPv4.
    IPv4,
    /// IPv6.
    IPv6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IPv4 => write!(f, "IPv4"),
            Self::IPv6 => write!(f, "IPv6"),
        }
    }
}

/// Immutable address of a bound, connected, or accepted socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SocketAddress {
    /// Numeric host address (`127.0.0.1`, `::1`, `0.0.0.0`).
    #[serde(rename = "address")]
    pub host: String,
    /// Port number.
    pub port: u16,
    /// Address family.
    pub family: AddressFamily,
}

impl From<SocketAddr> for SocketAddress {
    /// IPv4 peers seen through a dual-stack listener are reported as IPv4.
    fn from(addr: SocketAddr) -> Self {
        let ip = addr.ip().to_canonical();
        let family = if ip.is_ipv4() {
            AddressFamily::IPv4
        } else {
            AddressFamily::IPv6
        };
        Self {
            host: ip.to_string(),
            port: addr.port(),
            family,
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            AddressFamily::IPv4 => write!(f, "{}:{}", self.host, self.port),
            AddressFamily::IPv6 => write!(f, "[{}]:{}", self.host, self.port),
        }
    }
}

/// Resolves the candidate addresses a listener tries to bind, in order.
///
/// A missing or blank host means every interface: the dual-stack `[::]`
/// first, then `0.0.0.0` for hosts without IPv6.
pub(crate) async fn resolve_bind(
    host: Option<&str>,
    port: u16,
) -> Result<Vec<SocketAddr>, SocketError> {
    match non_blank(host) {
        None => Ok(vec![
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        ]),
        Some(host) => resolve_all(host, port).await,
    }
}

/// Resolves every candidate address for an outbound connect.
///
/// A missing or blank host means `localhost`. The result is never empty.
pub(crate) async fn resolve_connect(
    host: Option<&str>,
    port: u16,
) -> Result<Vec<SocketAddr>, SocketError> {
    resolve_all(non_blank(host).unwrap_or(DEFAULT_CONNECT_HOST), port).await
}

async fn resolve_all(host: &str, port: u16) -> Result<Vec<SocketAddr>, SocketError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SocketError::AddressResolution {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(SocketError::AddressResolution {
            host: host.to_string(),
            reason: "no addresses found".to_string(),
        });
    }
    Ok(addrs)
}

fn non_blank(host: Option<&str>) -> Option<&str> {
    host.map(str::trim).filter(|h| !h.is_empty())
}
