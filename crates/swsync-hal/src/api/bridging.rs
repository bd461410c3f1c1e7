//! Bridging capability group.

use crate::HalResult;
use swsync_types::{MacAddress, PortId, StpState, VlanId};

pub trait BridgingApi {
    /// Installs a bridging entry. `filtered` drops frames from the port back
    /// out of it; `permanent` exempts the entry from hardware aging.
    fn l2_addr_add(
        &mut self,
        port: PortId,
        vid: VlanId,
        mac: MacAddress,
        filtered: bool,
        permanent: bool,
    ) -> HalResult<()>;

    fn l2_addr_remove(&mut self, port: PortId, vid: VlanId, mac: MacAddress) -> HalResult<()>;

    /// Flushes every bridging entry of `port` in `vid`.
    fn l2_addr_remove_all_in_vlan(&mut self, port: PortId, vid: VlanId) -> HalResult<()>;

    fn l2_mcast_group_join(&mut self, port: PortId, vid: VlanId, group: MacAddress)
        -> HalResult<()>;

    fn l2_mcast_group_leave(
        &mut self,
        port: PortId,
        vid: VlanId,
        group: MacAddress,
    ) -> HalResult<()>;

    /// Port-global spanning-tree state.
    fn stp_port_state_set(&mut self, port: PortId, state: StpState) -> HalResult<()>;

    /// Effective spanning-tree state of one (port, VLAN) pair.
    fn stp_port_vlan_state_set(
        &mut self,
        port: PortId,
        vid: VlanId,
        state: StpState,
    ) -> HalResult<()>;
}
