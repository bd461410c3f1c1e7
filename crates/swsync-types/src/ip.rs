//! IP prefixes and address-family helpers.
//!
//! Addresses themselves are plain [`std::net::IpAddr`]; everything that differs
//! between IPv4 and IPv6 is expressed through [`AddrFamily`] instead of separate
//! per-family types.

use crate::{MacAddress, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrFamily {
    Inet,
    Inet6,
}

impl AddrFamily {
    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddrFamily::Inet,
            IpAddr::V6(_) => AddrFamily::Inet6,
        }
    }

    /// Length in bits of a full address of this family.
    pub const fn max_prefix_len(&self) -> u8 {
        match self {
            AddrFamily::Inet => 32,
            AddrFamily::Inet6 => 128,
        }
    }
}

impl fmt::Display for AddrFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrFamily::Inet => write!(f, "inet"),
            AddrFamily::Inet6 => write!(f, "inet6"),
        }
    }
}

/// True for IPv6 fe80::/10. IPv4 link-local (169.254/16) is treated as a
/// regular address by the engines.
pub fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(_) => false,
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Ethernet group address for an IP multicast group.
///
/// IPv4 maps the low 23 bits under 01:00:5e, IPv6 the low 32 bits under 33:33.
pub fn multicast_mac(group: &IpAddr) -> Option<MacAddress> {
    if !group.is_multicast() {
        return None;
    }
    let mac = match group {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            [0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]]
        }
        IpAddr::V6(v6) => {
            let o = v6.octets();
            [0x33, 0x33, o[12], o[13], o[14], o[15]]
        }
    };
    Some(MacAddress::new(mac))
}

/// An IP network prefix in CIDR notation.
///
/// The stored address keeps the host bits as given, so an interface address
/// such as `10.0.0.1/24` round-trips unchanged; use [`IpPrefix::network`] for
/// the masked form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

impl IpPrefix {
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, ParseError> {
        if len > AddrFamily::of(&addr).max_prefix_len() {
            return Err(ParseError::InvalidIpPrefix(format!("{}/{}", addr, len)));
        }
        Ok(IpPrefix { addr, len })
    }

    /// Full-length prefix covering exactly `addr`.
    pub fn host(addr: IpAddr) -> Self {
        let len = AddrFamily::of(&addr).max_prefix_len();
        IpPrefix { addr, len }
    }

    pub const fn addr(&self) -> IpAddr {
        self.addr
    }

    pub const fn len(&self) -> u8 {
        self.len
    }

    pub const fn family(&self) -> AddrFamily {
        AddrFamily::of(&self.addr)
    }

    /// /32 for IPv4, /128 for IPv6.
    pub const fn is_host(&self) -> bool {
        self.len == self.family().max_prefix_len()
    }

    pub const fn is_default(&self) -> bool {
        self.len == 0
    }

    /// Prefix with host bits cleared.
    pub fn network(&self) -> IpPrefix {
        let addr = match self.addr {
            IpAddr::V4(v4) => {
                let mask = v4_mask(self.len);
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = v6_mask(self.len);
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        };
        IpPrefix { addr, len: self.len }
    }

    /// True if `other` lies inside this prefix. Addresses of the other family
    /// never match.
    pub fn contains(&self, other: &IpAddr) -> bool {
        match (self.addr, other) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let mask = v4_mask(self.len);
                u32::from(net) & mask == u32::from(*a) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let mask = v6_mask(self.len);
                u128::from(net) & mask == u128::from(*a) & mask
            }
            _ => false,
        }
    }
}

fn v4_mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(len))
    }
}

fn v6_mask(len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(len))
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr
                    .parse()
                    .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;
                let len: u8 = len
                    .parse()
                    .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;
                IpPrefix::new(addr, len)
            }
            None => {
                let addr: IpAddr = s
                    .parse()
                    .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))?;
                Ok(IpPrefix::host(addr))
            }
        }
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> String {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prefix_parse() {
        let p: IpPrefix = "10.0.0.1/24".parse().unwrap();
        assert_eq!(p.len(), 24);
        assert_eq!(p.family(), AddrFamily::Inet);
        assert_eq!(p.to_string(), "10.0.0.1/24");
        assert_eq!(p.network().to_string(), "10.0.0.0/24");

        let bare: IpPrefix = "2001:db8::1".parse().unwrap();
        assert!(bare.is_host());
        assert_eq!(bare.len(), 128);

        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("10.0.0/8".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_prefix_contains() {
        let p: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(p.contains(&"10.0.0.77".parse().unwrap()));
        assert!(!p.contains(&"10.0.1.1".parse().unwrap()));
        assert!(!p.contains(&"::1".parse().unwrap()));

        let default: IpPrefix = "0.0.0.0/0".parse().unwrap();
        assert!(default.is_default());
        assert!(default.contains(&"203.0.113.5".parse().unwrap()));

        let v6: IpPrefix = "fe80::/64".parse().unwrap();
        assert!(v6.contains(&"fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_link_local() {
        assert!(is_link_local(&"fe80::1".parse().unwrap()));
        assert!(is_link_local(&"febf::1".parse().unwrap()));
        assert!(!is_link_local(&"fec0::1".parse().unwrap()));
        assert!(!is_link_local(&"169.254.1.1".parse().unwrap()));
    }

    #[test]
    fn test_multicast_mac() {
        let v4 = multicast_mac(&"239.129.1.2".parse().unwrap()).unwrap();
        assert_eq!(v4.to_string(), "01:00:5e:01:01:02");

        let v6 = multicast_mac(&"ff02::1:ff00:1234".parse().unwrap()).unwrap();
        assert_eq!(v6.to_string(), "33:33:ff:00:12:34");

        assert_eq!(multicast_mac(&"10.0.0.1".parse().unwrap()), None);
    }
}
