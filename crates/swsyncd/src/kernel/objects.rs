//! Kernel network objects as the engines see them.
//!
//! These are owned, decoded copies of rtnetlink objects. Only the attributes
//! the engines act on are carried.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use swsync_types::{IpPrefix, MacAddress, StpState, VlanId, VlanMembership};

/// Main routing table; routes in it belong to VRF 0.
pub const RT_TABLE_MAIN: u32 = 254;

/// Maps a kernel routing table to the hardware VRF id.
pub fn vrf_of_table(table: u32) -> u32 {
    if table == RT_TABLE_MAIN {
        0
    } else {
        table
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkKind {
    /// Front-panel port backed by hardware port `port`.
    SwitchPort { port: u16 },
    Bridge {
        #[serde(default)]
        vlan_filtering: bool,
    },
    /// 802.1Q sub-interface on `Link::lower`; `qinq` marks an 802.1ad (S-tag)
    /// link.
    Vlan {
        id: VlanId,
        #[serde(default)]
        qinq: bool,
    },
    Bond {
        #[serde(default)]
        mode: u8,
    },
    Vxlan {
        vni: u32,
        #[serde(default)]
        local: Option<IpAddr>,
        #[serde(default)]
        group: Option<IpAddr>,
        #[serde(default)]
        dst_port: Option<u16>,
    },
    Vrf { table: u32 },
    Loopback,
    Other,
}

/// Bond slave attributes of a link enslaved to a bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondSlave {
    pub active: bool,
}

/// Bridge-port attributes of a link enslaved to a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgePortInfo {
    #[serde(default)]
    pub state: StpState,
    #[serde(default)]
    pub vlans: VlanMembership,
    #[serde(default = "default_true")]
    pub flood_unicast: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BridgePortInfo {
    fn default() -> Self {
        Self {
            state: StpState::Forwarding,
            vlans: VlanMembership::new(),
            flood_unicast: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub ifindex: u32,
    pub name: String,
    pub kind: LinkKind,
    pub mac: MacAddress,
    /// Bridge, bond or VRF this link is enslaved to.
    #[serde(default)]
    pub master: Option<u32>,
    /// Parent link of a VLAN sub-interface.
    #[serde(default)]
    pub lower: Option<u32>,
    #[serde(default)]
    pub admin_up: bool,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub slave: Option<BondSlave>,
    #[serde(default)]
    pub bridge: Option<BridgePortInfo>,
}

impl Link {
    pub fn is_bridge(&self) -> bool {
        matches!(self.kind, LinkKind::Bridge { .. })
    }

    pub fn is_bond(&self) -> bool {
        matches!(self.kind, LinkKind::Bond { .. })
    }

    pub fn is_vxlan(&self) -> bool {
        matches!(self.kind, LinkKind::Vxlan { .. })
    }

    pub fn vni(&self) -> Option<u32> {
        match self.kind {
            LinkKind::Vxlan { vni, .. } => Some(vni),
            _ => None,
        }
    }

    pub fn vrf_table(&self) -> Option<u32> {
        match self.kind {
            LinkKind::Vrf { table } => Some(table),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addr {
    pub ifindex: u32,
    /// Local address with its prefix length, host bits kept.
    pub prefix: IpPrefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    #[default]
    Unicast,
    Local,
    Broadcast,
    Multicast,
    Blackhole,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteScope {
    #[default]
    Universe,
    Link,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NextHop {
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    pub ifindex: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default = "default_table")]
    pub table: u32,
    pub dst: IpPrefix,
    #[serde(default)]
    pub kind: RouteKind,
    #[serde(default)]
    pub scope: RouteScope,
    #[serde(default)]
    pub next_hops: Vec<NextHop>,
}

fn default_table() -> u32 {
    RT_TABLE_MAIN
}

impl Route {
    pub fn vrf(&self) -> u32 {
        vrf_of_table(self.table)
    }

    /// Connected route for the subnet of `ifindex`.
    pub fn is_link_scope_on(&self, ifindex: u32) -> bool {
        self.scope == RouteScope::Link && self.next_hops.iter().any(|nh| nh.ifindex == ifindex)
    }
}

/// Longest-prefix match over `routes` in the main table.
pub fn longest_match<'a>(
    routes: impl IntoIterator<Item = &'a Route>,
    dst: &IpAddr,
) -> Option<&'a Route> {
    routes
        .into_iter()
        .filter(|r| r.table == RT_TABLE_MAIN && r.kind == RouteKind::Unicast)
        .filter(|r| r.dst.contains(dst))
        .max_by_key(|r| r.dst.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighState {
    Incomplete,
    #[default]
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    NoArp,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neigh {
    pub ifindex: u32,
    pub dst: IpAddr,
    #[serde(default)]
    pub lladdr: Option<MacAddress>,
    #[serde(default)]
    pub state: NeighState,
}

impl Neigh {
    /// Has a usable link-layer address.
    pub fn is_resolved(&self) -> bool {
        self.lladdr.is_some()
            && !matches!(self.state, NeighState::Incomplete | NeighState::Failed)
    }
}

/// Bridge forwarding database entry (AF_BRIDGE neighbour).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdbEntry {
    /// Bridge port the entry points at.
    pub ifindex: u32,
    pub mac: MacAddress,
    #[serde(default)]
    pub vlan: Option<VlanId>,
    /// Remote VTEP for entries on a VXLAN link.
    #[serde(default)]
    pub dst: Option<IpAddr>,
    /// Bridge the port belongs to.
    #[serde(default)]
    pub master: Option<u32>,
    /// Set on entries added on behalf of the data path.
    #[serde(default)]
    pub ext_learned: bool,
}

/// Bridge multicast database entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdbEntry {
    pub bridge: u32,
    pub ifindex: u32,
    #[serde(default)]
    pub vid: Option<VlanId>,
    pub group: IpAddr,
}

/// Per-VLAN spanning-tree state of a bridge port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeVlanState {
    pub ifindex: u32,
    pub vid: VlanId,
    pub state: StpState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn route(dst: &str, table: u32) -> Route {
        Route {
            table,
            dst: dst.parse().unwrap(),
            kind: RouteKind::Unicast,
            scope: RouteScope::Universe,
            next_hops: vec![],
        }
    }

    #[test]
    fn test_longest_match() {
        let routes = vec![
            route("0.0.0.0/0", RT_TABLE_MAIN),
            route("203.0.113.0/24", RT_TABLE_MAIN),
            route("203.0.113.0/28", 10),
        ];
        let dst = "203.0.113.5".parse().unwrap();
        let hit = longest_match(&routes, &dst).unwrap();
        assert_eq!(hit.dst.to_string(), "203.0.113.0/24");

        let other = "198.51.100.1".parse().unwrap();
        assert!(longest_match(&routes, &other).unwrap().dst.is_default());
    }

    #[test]
    fn test_vrf_of_table() {
        assert_eq!(vrf_of_table(RT_TABLE_MAIN), 0);
        assert_eq!(vrf_of_table(10), 10);
    }

    #[test]
    fn test_link_from_json() {
        let link: Link = serde_json::from_str(
            r#"{"ifindex":7,"name":"swp3","kind":{"type":"switch_port","port":3},
                "mac":"02:00:00:00:00:03","master":20,
                "bridge":{"state":"forwarding","vlans":{"members":[10],"untagged":[],"pvid":10}}}"#,
        )
        .unwrap();
        assert_eq!(link.kind, LinkKind::SwitchPort { port: 3 });
        let bridge = link.bridge.unwrap();
        assert!(bridge.flood_unicast);
        assert_eq!(bridge.vlans.pvid(), Some(VlanId::new(10).unwrap()));
    }

    #[test]
    fn test_neigh_resolution() {
        let mut n = Neigh {
            ifindex: 1,
            dst: "10.0.0.2".parse().unwrap(),
            lladdr: None,
            state: NeighState::Incomplete,
        };
        assert!(!n.is_resolved());
        n.lladdr = Some("aa:bb:cc:dd:ee:ff".parse().unwrap());
        n.state = NeighState::Stale;
        assert!(n.is_resolved());
    }
}
