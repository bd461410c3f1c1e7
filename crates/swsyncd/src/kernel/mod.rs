//! Kernel side of the synchronizer: the object model, the owned change
//! records, the mirrored cache and the feed interface.

mod cache;
mod event;
mod feed;
mod objects;
mod topology;

pub use cache::{FdbKey, KernelCache, MdbKey, Mirrored};
pub use event::{Action, Change, KernelEvent, KernelObject};
pub use feed::{parse_events, FeedError, KernelFeed, ReplayFeed};
pub use objects::{
    longest_match, vrf_of_table, Addr, BondSlave, BridgePortInfo, BridgeVlanState, FdbEntry,
    Link, LinkKind, MdbEntry, Neigh, NeighState, NextHop, Route, RouteKind, RouteScope,
    RT_TABLE_MAIN,
};
pub use topology::{L3Port, Topology};
