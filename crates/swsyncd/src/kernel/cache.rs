//! Mirrored kernel collections.
//!
//! The sync engine is the only writer. Engines get shared access to answer
//! questions such as "which bridge port carries this MAC" or "is there a
//! connected route for this neighbour".

use super::event::Change;
use super::objects::{
    longest_match, Addr, BridgeVlanState, FdbEntry, Link, MdbEntry, Neigh, Route,
};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::net::IpAddr;
use swsync_types::{AddrFamily, IpPrefix, MacAddress, VlanId};

pub type FdbKey = (u32, Option<VlanId>, MacAddress, Option<IpAddr>);
pub type MdbKey = (u32, Option<VlanId>, IpAddr);

/// A kernel object type with its own mirrored collection.
pub trait Mirrored: Clone + Debug {
    type Key: Ord + Clone + Debug;

    fn key(&self) -> Self::Key;
    fn table(cache: &KernelCache) -> &BTreeMap<Self::Key, Self>;
    fn table_mut(cache: &mut KernelCache) -> &mut BTreeMap<Self::Key, Self>;
}

macro_rules! mirrored {
    ($ty:ty, $field:ident, $key:ty, |$o:ident| $k:expr) => {
        impl Mirrored for $ty {
            type Key = $key;

            fn key(&self) -> Self::Key {
                let $o = self;
                $k
            }

            fn table(cache: &KernelCache) -> &BTreeMap<Self::Key, Self> {
                &cache.$field
            }

            fn table_mut(cache: &mut KernelCache) -> &mut BTreeMap<Self::Key, Self> {
                &mut cache.$field
            }
        }
    };
}

mirrored!(Link, links, u32, |o| o.ifindex);
mirrored!(Addr, addrs, (u32, IpPrefix), |o| (o.ifindex, o.prefix));
mirrored!(Route, routes, (u32, IpPrefix), |o| (o.table, o.dst));
mirrored!(Neigh, neighs, (u32, IpAddr), |o| (o.ifindex, o.dst));
mirrored!(FdbEntry, fdb, FdbKey, |o| (o.ifindex, o.vlan, o.mac, o.dst));
mirrored!(MdbEntry, mdb, MdbKey, |o| (o.ifindex, o.vid, o.group));
mirrored!(BridgeVlanState, bridge_vlans, (u32, VlanId), |o| (o.ifindex, o.vid));

#[derive(Debug, Default, Clone)]
pub struct KernelCache {
    links: BTreeMap<u32, Link>,
    addrs: BTreeMap<(u32, IpPrefix), Addr>,
    routes: BTreeMap<(u32, IpPrefix), Route>,
    neighs: BTreeMap<(u32, IpAddr), Neigh>,
    fdb: BTreeMap<FdbKey, FdbEntry>,
    mdb: BTreeMap<MdbKey, MdbEntry>,
    bridge_vlans: BTreeMap<(u32, VlanId), BridgeVlanState>,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: Mirrored>(&self, key: &T::Key) -> Option<&T> {
        T::table(self).get(key)
    }

    /// Stores `obj`, returning the change record: `New` if the key was not
    /// mirrored yet, `Change` otherwise.
    pub fn upsert<T: Mirrored>(&mut self, obj: T) -> Change<T> {
        match T::table_mut(self).insert(obj.key(), obj.clone()) {
            Some(old) => Change::changed(old, obj),
            None => Change::created(obj),
        }
    }

    /// Deletion record for `obj` without touching the cache. The mirrored
    /// copy wins over the notification's copy when both exist.
    pub fn deletion<T: Mirrored>(&self, obj: T) -> Change<T> {
        let old = T::table(self).get(&obj.key()).cloned().unwrap_or(obj);
        Change::deleted(old)
    }

    pub fn remove<T: Mirrored>(&mut self, key: &T::Key) -> Option<T> {
        T::table_mut(self).remove(key)
    }

    pub fn len<T: Mirrored>(&self) -> usize {
        T::table(self).len()
    }

    pub fn clear(&mut self) {
        *self = KernelCache::default();
    }

    pub fn link(&self, ifindex: u32) -> Option<&Link> {
        self.links.get(&ifindex)
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Links enslaved to `master`.
    pub fn slaves_of(&self, master: u32) -> impl Iterator<Item = &Link> {
        self.links.values().filter(move |l| l.master == Some(master))
    }

    /// VLAN sub-interfaces stacked on `lower`.
    pub fn uppers_of(&self, lower: u32) -> impl Iterator<Item = &Link> {
        self.links.values().filter(move |l| l.lower == Some(lower))
    }

    pub fn addrs_of(&self, ifindex: u32) -> impl Iterator<Item = &Addr> {
        self.addrs.values().filter(move |a| a.ifindex == ifindex)
    }

    pub fn has_addr_family(&self, ifindex: u32, family: AddrFamily) -> bool {
        self.addrs_of(ifindex).any(|a| a.prefix.family() == family)
    }

    /// True if `addr` is one of the link's own addresses.
    pub fn is_local_addr(&self, ifindex: u32, addr: &IpAddr) -> bool {
        self.addrs_of(ifindex).any(|a| a.prefix.addr() == *addr)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    pub fn lookup_route(&self, dst: &IpAddr) -> Option<&Route> {
        longest_match(self.routes.values(), dst)
    }

    /// True if a link-scope route on `ifindex` covers `addr`.
    pub fn link_route_covers(&self, ifindex: u32, addr: &IpAddr) -> bool {
        self.routes
            .values()
            .any(|r| r.is_link_scope_on(ifindex) && r.dst.contains(addr))
    }

    pub fn neigh(&self, ifindex: u32, addr: &IpAddr) -> Option<&Neigh> {
        self.neighs.get(&(ifindex, *addr))
    }

    pub fn neighs_on(&self, ifindex: u32) -> impl Iterator<Item = &Neigh> {
        self.neighs.values().filter(move |n| n.ifindex == ifindex)
    }

    pub fn neighs(&self) -> impl Iterator<Item = &Neigh> {
        self.neighs.values()
    }

    /// FDB entries of one bridge port, optionally restricted to a VLAN.
    pub fn fdb_of(&self, ifindex: u32, vlan: Option<VlanId>) -> impl Iterator<Item = &FdbEntry> {
        self.fdb
            .values()
            .filter(move |e| e.ifindex == ifindex && (vlan.is_none() || e.vlan == vlan))
    }

    /// Non-zero MAC entries on `ifindex` pointing at remote VTEP `dst`.
    pub fn fdb_towards(&self, ifindex: u32, dst: IpAddr) -> impl Iterator<Item = &FdbEntry> {
        self.fdb.values().filter(move |e| {
            e.ifindex == ifindex && e.dst == Some(dst) && !e.mac.is_zero()
        })
    }

    /// Bridge port holding `mac` in `vlan`.
    pub fn fdb_lookup(&self, vlan: VlanId, mac: MacAddress) -> Option<&FdbEntry> {
        self.fdb
            .values()
            .find(|e| e.vlan == Some(vlan) && e.mac == mac)
    }

    pub fn fdb_entries(&self) -> impl Iterator<Item = &FdbEntry> {
        self.fdb.values()
    }

    pub fn mdb_of(&self, ifindex: u32, vid: Option<VlanId>) -> impl Iterator<Item = &MdbEntry> {
        self.mdb
            .values()
            .filter(move |m| m.ifindex == ifindex && m.vid == vid)
    }

    pub fn bridge_vlan_state(&self, ifindex: u32, vid: VlanId) -> Option<&BridgeVlanState> {
        self.bridge_vlans.get(&(ifindex, vid))
    }
}
