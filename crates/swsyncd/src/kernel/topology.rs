//! Read-only view over the mirrored links: which hardware port a link maps to
//! and how routed traffic on it is bound.

use super::cache::KernelCache;
use super::objects::{vrf_of_table, Link, LinkKind};
use crate::bond::BondManager;
use swsync_types::{PortId, VlanId};

/// How a routed link is bound to the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum L3Port {
    /// Front-panel port or LAG, or an 802.1Q sub-interface on one.
    Port {
        port: PortId,
        vid: VlanId,
        tagged: bool,
    },
    /// 802.1Q sub-interface on an 802.1ad link.
    Stacked {
        port: PortId,
        outer: VlanId,
        inner: VlanId,
    },
    /// VLAN interface of the managed bridge, or the bridge itself.
    Svi { bridge: u32, vid: VlanId },
}

impl L3Port {
    /// VLAN routed frames are classified into.
    pub fn vid(&self) -> VlanId {
        match *self {
            L3Port::Port { vid, .. } => vid,
            L3Port::Stacked { outer, .. } => outer,
            L3Port::Svi { vid, .. } => vid,
        }
    }

    /// Hardware port, `None` for an SVI.
    pub fn port(&self) -> Option<PortId> {
        match *self {
            L3Port::Port { port, .. } | L3Port::Stacked { port, .. } => Some(port),
            L3Port::Svi { .. } => None,
        }
    }
}

#[derive(Clone, Copy)]
pub struct Topology<'a> {
    pub cache: &'a KernelCache,
    pub bonds: &'a BondManager,
    /// Managed bridge, if any.
    pub bridge: Option<u32>,
}

impl<'a> Topology<'a> {
    pub fn new(cache: &'a KernelCache, bonds: &'a BondManager, bridge: Option<u32>) -> Self {
        Self {
            cache,
            bonds,
            bridge,
        }
    }

    pub fn link(&self, ifindex: u32) -> Option<&'a Link> {
        self.cache.link(ifindex)
    }

    /// Hardware port of a switch port or bond link.
    pub fn port_of(&self, ifindex: u32) -> Option<PortId> {
        let link = self.cache.link(ifindex)?;
        match link.kind {
            LinkKind::SwitchPort { port } => PortId::physical(port).ok(),
            LinkKind::Bond { .. } => self.bonds.lag_of(ifindex),
            _ => None,
        }
    }

    /// Link backing a hardware port.
    pub fn ifindex_of(&self, port: PortId) -> Option<u32> {
        if port.is_lag() {
            return self.bonds.bond_of_lag(port);
        }
        self.cache
            .links()
            .find(|l| matches!(l.kind, LinkKind::SwitchPort { port: p } if p == port.index()))
            .map(|l| l.ifindex)
    }

    pub fn is_managed_bridge(&self, ifindex: u32) -> bool {
        self.bridge == Some(ifindex)
    }

    /// True if the link is enslaved to a bond or bridge and so carries no
    /// routing of its own.
    fn is_enslaved_l2(&self, link: &Link) -> bool {
        link.master
            .and_then(|m| self.cache.link(m))
            .is_some_and(|m| m.is_bond() || m.is_bridge())
    }

    /// Routed binding of `ifindex`, `None` if the link is not switch-managed.
    pub fn l3_port(&self, ifindex: u32) -> Option<L3Port> {
        let link = self.cache.link(ifindex)?;
        match link.kind {
            LinkKind::SwitchPort { .. } | LinkKind::Bond { .. } => {
                if self.is_enslaved_l2(link) {
                    return None;
                }
                Some(L3Port::Port {
                    port: self.port_of(ifindex)?,
                    vid: VlanId::DEFAULT,
                    tagged: false,
                })
            }
            LinkKind::Bridge { .. } if self.is_managed_bridge(ifindex) => Some(L3Port::Svi {
                bridge: ifindex,
                vid: VlanId::DEFAULT,
            }),
            LinkKind::Vlan { id, .. } => {
                let lower = self.cache.link(link.lower?)?;
                match lower.kind {
                    LinkKind::SwitchPort { .. } | LinkKind::Bond { .. } => Some(L3Port::Port {
                        port: self.port_of(lower.ifindex)?,
                        vid: id,
                        tagged: true,
                    }),
                    LinkKind::Bridge { .. } if self.is_managed_bridge(lower.ifindex) => {
                        Some(L3Port::Svi {
                            bridge: lower.ifindex,
                            vid: id,
                        })
                    }
                    LinkKind::Vlan { id: outer, qinq: true } => {
                        let port = self.port_of(lower.lower?)?;
                        Some(L3Port::Stacked {
                            port,
                            outer,
                            inner: id,
                        })
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Hardware VRF of the link: its VRF master's table, 0 otherwise.
    pub fn vrf_of(&self, ifindex: u32) -> u32 {
        self.cache
            .link(ifindex)
            .and_then(|l| l.master)
            .and_then(|m| self.cache.link(m))
            .and_then(Link::vrf_table)
            .map_or(0, vrf_of_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use swsync_types::MacAddress;

    fn link(ifindex: u32, kind: LinkKind) -> Link {
        Link {
            ifindex,
            name: format!("if{}", ifindex),
            kind,
            mac: MacAddress::new([2, 0, 0, 0, 0, ifindex as u8]),
            master: None,
            lower: None,
            admin_up: true,
            mtu: None,
            slave: None,
            bridge: None,
        }
    }

    #[test]
    fn test_l3_port_bindings() {
        let mut cache = KernelCache::new();
        let bonds = BondManager::new();
        cache.upsert(link(1, LinkKind::SwitchPort { port: 1 }));
        cache.upsert(link(20, LinkKind::Bridge { vlan_filtering: true }));
        let mut vlan = link(30, LinkKind::Vlan { id: VlanId::new(10).unwrap(), qinq: false });
        vlan.lower = Some(1);
        cache.upsert(vlan);
        let mut svi = link(31, LinkKind::Vlan { id: VlanId::new(50).unwrap(), qinq: false });
        svi.lower = Some(20);
        cache.upsert(svi);
        let mut outer = link(32, LinkKind::Vlan { id: VlanId::new(100).unwrap(), qinq: true });
        outer.lower = Some(1);
        cache.upsert(outer);
        let mut inner = link(33, LinkKind::Vlan { id: VlanId::new(7).unwrap(), qinq: false });
        inner.lower = Some(32);
        cache.upsert(inner);

        let topo = Topology::new(&cache, &bonds, Some(20));
        let p1 = PortId::physical(1).unwrap();
        assert_eq!(
            topo.l3_port(1),
            Some(L3Port::Port { port: p1, vid: VlanId::DEFAULT, tagged: false })
        );
        assert_eq!(
            topo.l3_port(30),
            Some(L3Port::Port { port: p1, vid: VlanId::new(10).unwrap(), tagged: true })
        );
        assert_eq!(
            topo.l3_port(31),
            Some(L3Port::Svi { bridge: 20, vid: VlanId::new(50).unwrap() })
        );
        assert_eq!(
            topo.l3_port(33),
            Some(L3Port::Stacked {
                port: p1,
                outer: VlanId::new(100).unwrap(),
                inner: VlanId::new(7).unwrap()
            })
        );
        assert_eq!(topo.ifindex_of(p1), Some(1));

        let unmanaged = Topology::new(&cache, &bonds, None);
        assert_eq!(unmanaged.l3_port(31), None);
    }

    #[test]
    fn test_bridge_port_is_not_routed() {
        let mut cache = KernelCache::new();
        let bonds = BondManager::new();
        cache.upsert(link(20, LinkKind::Bridge { vlan_filtering: true }));
        let mut port = link(2, LinkKind::SwitchPort { port: 2 });
        port.master = Some(20);
        cache.upsert(port);
        let topo = Topology::new(&cache, &bonds, Some(20));
        assert_eq!(topo.l3_port(2), None);
        assert_eq!(topo.port_of(2), Some(PortId::physical(2).unwrap()));
    }

    #[test]
    fn test_vrf_of() {
        let mut cache = KernelCache::new();
        let bonds = BondManager::new();
        cache.upsert(link(40, LinkKind::Vrf { table: 10 }));
        let mut port = link(3, LinkKind::SwitchPort { port: 3 });
        port.master = Some(40);
        cache.upsert(port);
        cache.upsert(link(4, LinkKind::SwitchPort { port: 4 }));
        let topo = Topology::new(&cache, &bonds, None);
        assert_eq!(topo.vrf_of(3), 10);
        assert_eq!(topo.vrf_of(4), 0);
        assert!(topo.l3_port(3).is_some());
    }
}
