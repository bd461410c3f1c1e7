//! L3 engine types.

use crate::kernel::{L3Port, Route};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use swsync_hal::RouteTarget;
use swsync_types::{AddrFamily, IpPrefix, MacAddress, PortId, VlanId};

/// Identity of an egress rewrite in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EgressKey {
    pub port: PortId,
    pub vid: VlanId,
    pub src: MacAddress,
    pub dst: MacAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TerminationKey {
    /// `None` for a bridge SVI.
    pub port: Option<PortId>,
    pub vid: VlanId,
    pub mac: MacAddress,
    pub family: AddrFamily,
}

/// A next hop as the hardware sees it: a neighbour on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NextHopKey {
    pub addr: IpAddr,
    pub ifindex: u32,
}

impl fmt::Display for NextHopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%{}", self.addr, self.ifindex)
    }
}

/// ECMP groups are shared by routes with the same next-hop set. The key is
/// the sorted set.
pub type EcmpKey = Vec<NextHopKey>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub vrf: u32,
    pub prefix: IpPrefix,
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vrf {}", self.prefix, self.vrf)
    }
}

/// An address the engine programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AddrState {
    /// Routed binding whose VLAN this address holds.
    pub binding: Option<L3Port>,
    pub termination: Option<TerminationKey>,
    pub host: bool,
    pub vrf: u32,
}

/// A neighbour the engine programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighEntry {
    pub lladdr: MacAddress,
    pub egress: EgressKey,
    /// Host entry installed (link-local neighbours have none).
    pub host: bool,
    pub vrf: u32,
}

/// A route the engine programmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InstalledRoute {
    pub route: Route,
    /// Next hops on switch links; `Some` holds one egress reference.
    pub hops: BTreeMap<NextHopKey, Option<EgressKey>>,
    pub ecmp: Option<EcmpKey>,
    pub target: RouteTarget,
}

#[derive(Debug, Clone, Default)]
pub struct L3Stats {
    pub terminations_added: u64,
    pub egresses_created: u64,
    pub egresses_removed: u64,
    pub neighbors_programmed: u64,
    pub neighbors_unroutable: u64,
    pub routes_added: u64,
    pub routes_updated: u64,
    pub routes_removed: u64,
    pub ecmp_created: u64,
}
