//! Mirror of the bridging entries programmed in hardware, plus the kernel
//! writes the bridge engine still owes.

use crate::kernel::FdbEntry;
use std::collections::{BTreeMap, BTreeSet};
use swsync_types::{MacAddress, PortId, VlanId};

pub type L2Key = (PortId, VlanId, MacAddress);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2Entry {
    /// Bridge port link the kernel reported the entry on.
    pub ifindex: u32,
    pub permanent: bool,
}

/// A write the kernel feed has to perform on behalf of the data path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FdbWrite {
    Add(FdbEntry),
    Del(FdbEntry),
}

#[derive(Debug, Default)]
pub struct FdbMirror {
    entries: BTreeMap<L2Key, L2Entry>,
    /// Entries this engine asked the kernel to add for data-path learning.
    learned: BTreeSet<L2Key>,
    mcast: BTreeSet<L2Key>,
    outbox: Vec<FdbWrite>,
}

impl FdbMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &L2Key) -> Option<&L2Entry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &L2Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: L2Key, entry: L2Entry) -> Option<L2Entry> {
        self.entries.insert(key, entry)
    }

    pub fn remove(&mut self, key: &L2Key) -> Option<L2Entry> {
        self.learned.remove(key);
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_learned(&self, key: &L2Key) -> bool {
        self.learned.contains(key)
    }

    pub fn mark_learned(&mut self, key: L2Key) -> bool {
        self.learned.insert(key)
    }

    /// Drops every entry of (port, vid), returning the keys.
    pub fn flush(&mut self, port: PortId, vid: VlanId) -> Vec<L2Key> {
        let keys: Vec<L2Key> = self
            .entries
            .keys()
            .filter(|(p, v, _)| *p == port && *v == vid)
            .copied()
            .collect();
        for key in &keys {
            self.entries.remove(key);
            self.learned.remove(key);
        }
        keys
    }

    pub fn mcast_join(&mut self, key: L2Key) -> bool {
        self.mcast.insert(key)
    }

    pub fn mcast_leave(&mut self, key: &L2Key) -> bool {
        self.mcast.remove(key)
    }

    pub fn is_mcast_member(&self, key: &L2Key) -> bool {
        self.mcast.contains(key)
    }

    /// Multicast groups joined by (port, vid).
    pub fn mcast_of(&self, port: PortId, vid: VlanId) -> Vec<MacAddress> {
        self.mcast
            .iter()
            .filter(|(p, v, _)| *p == port && *v == vid)
            .map(|(_, _, g)| *g)
            .collect()
    }

    pub fn push_write(&mut self, write: FdbWrite) {
        self.outbox.push(write);
    }

    pub fn take_writes(&mut self) -> Vec<FdbWrite> {
        std::mem::take(&mut self.outbox)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.learned.clear();
        self.mcast.clear();
        self.outbox.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flush_is_scoped_to_port_and_vlan() {
        let mut fdb = FdbMirror::new();
        let p1 = PortId::physical(1).unwrap();
        let p2 = PortId::physical(2).unwrap();
        let v10 = VlanId::new(10).unwrap();
        let mac = MacAddress::new([2, 0, 0, 0, 0, 1]);
        let entry = L2Entry { ifindex: 1, permanent: false };
        fdb.insert((p1, v10, mac), entry);
        fdb.insert((p2, v10, mac), entry);
        fdb.mark_learned((p1, v10, mac));

        assert_eq!(fdb.flush(p1, v10), vec![(p1, v10, mac)]);
        assert!(!fdb.is_learned(&(p1, v10, mac)));
        assert_eq!(fdb.len(), 1);
    }
}
