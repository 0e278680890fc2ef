//! Static client network sets used by the exemption handlers.

use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("invalid network address '{0}'")]
    InvalidAddress(String),
    #[error("invalid prefix length in '{0}'")]
    InvalidPrefix(String),
}

/// An address prefix such as `192.0.2.0/24` or `2001:db8::/32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix <= max).then_some(Network { addr, prefix })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        prefix_match(&self.addr, ip, self.prefix)
    }
}

impl FromStr for Network {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let addr = addr_part
            .parse::<IpAddr>()
            .map_err(|_| NetworkError::InvalidAddress(s.to_string()))?;

        let prefix = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| NetworkError::InvalidPrefix(s.to_string()))?,
            None if addr.is_ipv4() => 32,
            None => 128,
        };

        Network::new(addr, prefix).ok_or_else(|| NetworkError::InvalidPrefix(s.to_string()))
    }
}

/// Compare the leading `prefix` bits of two addresses of the same family.
/// IPv4-mapped IPv6 candidates are compared as IPv4.
pub fn prefix_match(network: &IpAddr, candidate: &IpAddr, prefix: u8) -> bool {
    let candidate = unmap(*candidate);
    match (network, candidate) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let prefix = u32::from(prefix.min(32));
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            u32::from(*net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let prefix = u32::from(prefix.min(128));
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            u128::from(*net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

/// Turn `::ffff:a.b.c.d` into `a.b.c.d`; other addresses pass through.
pub fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkSet {
    networks: Vec<Network>,
}

impl NetworkSet {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, NetworkError> {
        let networks = entries
            .iter()
            .map(|entry| entry.as_ref().parse::<Network>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NetworkSet { networks })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(ip))
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

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_networks() {
        assert_eq!(
            "10.0.0.0/8".parse::<Network>().unwrap(),
            Network::new(ip("10.0.0.0"), 8).unwrap()
        );
        assert_eq!(
            "192.0.2.7".parse::<Network>().unwrap(),
            Network::new(ip("192.0.2.7"), 32).unwrap()
        );
        assert_eq!(
            "::1".parse::<Network>().unwrap(),
            Network::new(ip("::1"), 128).unwrap()
        );
        assert!(matches!(
            "10.0.0.0/33".parse::<Network>(),
            Err(NetworkError::InvalidPrefix(_))
        ));
        assert!(matches!(
            "mail.example.com/24".parse::<Network>(),
            Err(NetworkError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_set_contains() {
        let set = NetworkSet::parse(&["127.0.0.0/8", "::1/128", "2001:db8::/32"]).unwrap();

        assert!(set.contains(&ip("127.0.0.1")));
        assert!(set.contains(&ip("127.255.0.9")));
        assert!(set.contains(&ip("::1")));
        assert!(set.contains(&ip("2001:db8:1::25")));
        assert!(!set.contains(&ip("128.0.0.1")));
        assert!(!set.contains(&ip("2001:db9::1")));
    }

    #[test]
    fn test_mapped_ipv4_matches_ipv4_network() {
        let set = NetworkSet::parse(&["10.0.0.0/8"]).unwrap();
        assert!(set.contains(&ip("::ffff:10.0.0.5")));
    }

    #[test]
    fn test_zero_prefix_matches_family() {
        let set = NetworkSet::parse(&["0.0.0.0/0"]).unwrap();
        assert!(set.contains(&ip("203.0.113.9")));
        assert!(!set.contains(&ip("2001:db8::1")));
    }

    #[test]
    fn test_empty_set() {
        let set = NetworkSet::parse::<&str>(&[]).unwrap();
        assert!(set.is_empty());
        assert!(!set.contains(&ip("10.0.0.5")));
    }
}
