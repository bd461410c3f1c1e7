//! Value types shared by the switch synchronization crates.
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`IpPrefix`] / [`AddrFamily`]: CIDR prefixes tagged by address family
//! - [`VlanId`], [`VlanBitmap`], [`VlanMembership`]: 802.1Q ids and per-port
//!   membership snapshots with a word-wise diff
//! - [`PortId`]: tagged hardware port handle (physical, tunnel, LAG)
//! - [`StpState`]: spanning-tree port state and the effective-state merge

mod ip;
mod mac;
mod port;
mod stp;
mod vlan;

pub use ip::{is_link_local, multicast_mac, AddrFamily, IpPrefix};
pub use mac::MacAddress;
pub use port::{PortId, PortKind};
pub use stp::StpState;
pub use vlan::{VlanBitmap, VlanDiff, VlanId, VlanMembership};

/// Common error type for parsing and validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid port id: {0:#x}")]
    InvalidPortId(u32),

    #[error("invalid STP state: {0}")]
    InvalidStpState(String),

    #[error("PVID {0} is not a member VLAN")]
    PvidNotMember(u16),
}
