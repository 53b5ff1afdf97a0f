use std::{
    fmt::{self, Display, Formatter},
    net::{IpAddr, SocketAddr},
    str::FromStr,
};
use thiserror::Error as ThisError;

/// The address a node listens on, as advertised to the rest of the overlay.
///
/// The canonical `host:port` form is what connection caches and the
/// registry's membership table key on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether `observed` is the same host this address claims to be on.
    /// Hosts that are not IP literals never match.
    pub fn matches_host(&self, observed: IpAddr) -> bool {
        match self.host.parse::<IpAddr>() {
            Ok(claimed) => canonical(claimed) == canonical(observed),
            Err(_) => false,
        }
    }
}

/// Folds IPv4-mapped IPv6 addresses back to IPv4 so dual-stack listeners
/// compare equal to the IPv4 form a peer advertises.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        if host.is_empty() {
            Err(AddressParseError::MissingHost)?
        }
        let port = port.parse().map_err(|_| AddressParseError::InvalidPort)?;
        Ok(Self::new(host, port))
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("Expected an address of the form host:port")]
    MissingPort,
    #[error("The address has no host part")]
    MissingHost,
    #[error("The port is not a number between 0 and 65535")]
    InvalidPort,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn parse_and_display() {
        let address: PeerAddress = "127.0.0.1:5001".parse().unwrap();
        assert_eq!(address, PeerAddress::new("127.0.0.1", 5001));
        assert_eq!(address.to_string(), "127.0.0.1:5001");
        assert_eq!(
            "localhost".parse::<PeerAddress>(),
            Err(AddressParseError::MissingPort)
        );
        assert_eq!(
            ":80".parse::<PeerAddress>(),
            Err(AddressParseError::MissingHost)
        );
        assert_eq!(
            "host:99999".parse::<PeerAddress>(),
            Err(AddressParseError::InvalidPort)
        );
    }

    #[test]
    fn host_matching() {
        let address = PeerAddress::new("10.0.0.7", 4000);
        assert!(address.matches_host(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))));
        assert!(address.matches_host(IpAddr::V6(
            Ipv4Addr::new(10, 0, 0, 7).to_ipv6_mapped()
        )));
        assert!(!address.matches_host(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8))));
        assert!(!PeerAddress::new("node-a", 1).matches_host(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }
}
