//! VLAN programming shared by the bridge, L3 and bond engines.

mod programmer;

pub use programmer::{BridgeVlan, PortVlan, VlanProgrammer};
