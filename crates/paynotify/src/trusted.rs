//! Source-address allow-list for notification callbacks.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ConfigError;

/// A CIDR network. Host bits in the configured address are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix <= max).then_some(Self { addr, prefix })
    }

    /// Whether `ip` falls inside this network. Families never mix.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidTrustedSource(s.to_string());
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
        IpNetwork::new(addr, prefix).ok_or_else(invalid)
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustedSource {
    /// Compared by exact string equality with the caller's address.
    Exact(String),
    Network(IpNetwork),
}

impl FromStr for TrustedSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::InvalidTrustedSource(s.to_string()));
        }
        if s.contains('/') {
            s.parse().map(TrustedSource::Network)
        } else {
            Ok(TrustedSource::Exact(s.to_string()))
        }
    }
}

/// Set of addresses and networks allowed to deliver notifications.
///
/// An empty set admits every source; that is a configuration choice, and
/// [`TrustedSources::is_open`] lets the caller warn about it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedSources {
    entries: Vec<TrustedSource>,
}

impl TrustedSources {
    pub fn new(entries: Vec<TrustedSource>) -> Self {
        Self { entries }
    }

    /// Parse a comma-separated list such as `"197.97.145.144/28, 41.74.179.194"`.
    pub fn parse_list(list: &str) -> Result<Self, ConfigError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }

    pub fn is_open(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TrustedSource] {
        &self.entries
    }

    /// Whether `source` may deliver notifications.
    ///
    /// A source that is not a valid IP address is refused unless the set is
    /// empty.
    pub fn allows(&self, source: &str) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let source = source.trim();
        let Ok(ip) = source.parse::<IpAddr>() else {
            return false;
        };
        self.entries.iter().any(|entry| match entry {
            TrustedSource::Exact(addr) => addr == source,
            TrustedSource::Network(net) => net.contains(&ip),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_membership() {
        let set = TrustedSources::parse_list("10.0.0.0/24").unwrap();
        assert!(set.allows("10.0.0.5"));
        assert!(set.allows("10.0.0.255"));
        assert!(!set.allows("10.0.1.5"));
    }

    #[test]
    fn empty_set_allows_everything() {
        let set = TrustedSources::parse_list("").unwrap();
        assert!(set.is_open());
        assert!(set.allows("203.0.113.9"));
        assert!(set.allows("not an ip"));
    }

    #[test]
    fn exact_entries_match_by_string() {
        let set = TrustedSources::parse_list("41.74.179.194, 10.0.0.0/8").unwrap();
        assert!(set.allows("41.74.179.194"));
        assert!(!set.allows("41.74.179.195"));
        assert!(set.allows("10.200.1.1"));
    }

    #[test]
    fn surrounding_whitespace_is_ignored_for_every_entry_kind() {
        let set = TrustedSources::parse_list("41.74.179.194, 10.0.0.0/8").unwrap();
        assert!(set.allows(" 41.74.179.194 "));
        assert!(set.allows("10.1.2.3\n"));
        assert!(!set.allows(" 41.74.179.195"));
    }

    #[test]
    fn unparsable_source_is_refused() {
        let set = TrustedSources::parse_list("10.0.0.0/8").unwrap();
        assert!(!set.allows("localhost"));
        assert!(!set.allows(""));
    }

    #[test]
    fn host_bits_are_ignored() {
        let set = TrustedSources::parse_list("192.168.1.77/24").unwrap();
        assert!(set.allows("192.168.1.1"));
        assert!(!set.allows("192.168.2.1"));
    }

    #[test]
    fn zero_and_full_prefixes() {
        let any = TrustedSources::parse_list("0.0.0.0/0").unwrap();
        assert!(any.allows("8.8.8.8"));
        assert!(!any.allows("::1"));

        let one = TrustedSources::parse_list("8.8.8.8/32").unwrap();
        assert!(one.allows("8.8.8.8"));
        assert!(!one.allows("8.8.8.9"));
    }

    #[test]
    fn ipv6_networks() {
        let set = TrustedSources::parse_list("2001:db8::/32").unwrap();
        assert!(set.allows("2001:db8::1"));
        assert!(!set.allows("2001:db9::1"));
        assert!(!set.allows("10.0.0.1"));
    }

    #[test]
    fn malformed_cidr_is_a_config_error() {
        assert!(TrustedSources::parse_list("10.0.0.0/33").is_err());
        assert!(TrustedSources::parse_list("10.0.0/24").is_err());
        assert!(TrustedSources::parse_list("10.0.0.0/x").is_err());
    }
}
