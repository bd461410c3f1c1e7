//! Managed bridge: VLAN membership, spanning tree, FDB and multicast
//! mirroring, and the VXLAN access-port wiring of mapped VLANs.

mod engine;
mod fdb;
mod stp;

pub use engine::{BridgeCtx, BridgeEngine, BridgeStats};
pub use fdb::{FdbMirror, FdbWrite, L2Entry, L2Key};
pub use stp::StpTable;
