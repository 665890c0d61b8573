//! Allowed-network filter
//!
//! Only internal hosts inside one of the configured CIDR ranges may be given
//! an external port. Unlike an access allowlist, an empty filter admits
//! nothing: every external port handed out must be attributable to an
//! intended host.

use ipnetwork::IpNetwork;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NetworkError {
    #[error("Invalid CIDR notation '{network}': {reason}")]
    InvalidCidr { network: String, reason: String },
}

/// Set of CIDR ranges whose hosts are eligible for full-cone mappings
#[derive(Debug, Clone, Default)]
pub struct AllowedNetworks {
    networks: Vec<IpNetwork>,
}

impl AllowedNetworks {
    /// Parse a list of CIDR strings (e.g. "192.168.0.0/16", "10.0.0.1")
    ///
    /// A bare address is treated as a single-host network.
    pub fn parse<I, S>(networks: I) -> Result<Self, NetworkError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Vec::new();

        for network_str in networks {
            let network_str = network_str.as_ref().trim();
            let network =
                IpNetwork::from_str(network_str).map_err(|e| NetworkError::InvalidCidr {
                    network: network_str.to_string(),
                    reason: e.to_string(),
                })?;
            parsed.push(network);
        }

        Ok(Self { networks: parsed })
    }

    /// Check if an IP address falls inside any allowed network
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(*ip))
    }

    /// Check the IP part of a socket address
    pub fn contains_socket(&self, addr: &SocketAddr) -> bool {
        self.contains(&addr.ip())
    }

    pub fn networks(&self) -> &[IpNetwork] {
        &self.networks
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_empty_filter_admits_nothing() {
        let networks = AllowedNetworks::default();
        assert!(networks.is_empty());
        assert!(!networks.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
    }

    #[test]
    fn test_cidr_membership() {
        let networks = AllowedNetworks::parse(["192.168.25.0/24"]).unwrap();

        assert!(networks.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 25, 44))));
        assert!(networks.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 25, 255))));
        assert!(!networks.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 26, 1))));
        assert!(!networks.contains(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))));
    }

    #[test]
    fn test_multiple_networks() {
        let networks = AllowedNetworks::parse(["192.168.25.0/24", "172.16.0.0/12"]).unwrap();

        assert_eq!(networks.len(), 2);
        assert!(networks.contains(&IpAddr::V4(Ipv4Addr::new(172, 20, 1, 1))));
        assert!(!networks.contains(&IpAddr::V4(Ipv4Addr::new(172, 32, 0, 1))));
    }

    #[test]
    fn test_single_host_entry() {
        let networks = AllowedNetworks::parse(["192.168.1.100"]).unwrap();

        assert!(networks.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100))));
        assert!(!networks.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 101))));
    }

    #[test]
    fn test_ipv6_does_not_match_ipv4_network() {
        let networks = AllowedNetworks::parse(["0.0.0.0/0"]).unwrap();

        assert!(networks.contains(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
        assert!(!networks.contains(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_socket_membership() {
        let networks = AllowedNetworks::parse(["192.168.25.0/24"]).unwrap();

        let inside: SocketAddr = "192.168.25.44:5000".parse().unwrap();
        let outside: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        assert!(networks.contains_socket(&inside));
        assert!(!networks.contains_socket(&outside));
    }

    #[test]
    fn test_invalid_cidr() {
        let result = AllowedNetworks::parse(["192.168.1.0/33"]);
        assert!(matches!(result, Err(NetworkError::InvalidCidr { .. })));

        let result = AllowedNetworks::parse(["not-a-network"]);
        assert!(result.is_err());
    }
}
