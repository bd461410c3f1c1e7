//! VLAN capability group.

use crate::HalResult;
use swsync_types::{PortId, VlanId};

pub trait VlanApi {
    /// Ingress VLAN filter. `pvid` also classifies untagged frames into `vid`.
    fn ingress_port_vlan_add(
        &mut self,
        port: PortId,
        vid: VlanId,
        pvid: bool,
        vrf: u32,
    ) -> HalResult<()>;

    fn ingress_port_vlan_remove(
        &mut self,
        port: PortId,
        vid: VlanId,
        pvid: bool,
        vrf: u32,
    ) -> HalResult<()>;

    fn ingress_port_pvid_add(&mut self, port: PortId, vid: VlanId) -> HalResult<()>;

    fn ingress_port_pvid_remove(&mut self, port: PortId, vid: VlanId) -> HalResult<()>;

    /// Routed-port egress membership.
    fn egress_port_vlan_add(&mut self, port: PortId, vid: VlanId, untagged: bool)
        -> HalResult<()>;

    fn egress_port_vlan_remove(&mut self, port: PortId, vid: VlanId) -> HalResult<()>;

    /// Bridged-port egress membership.
    fn egress_bridge_port_vlan_add(
        &mut self,
        port: PortId,
        vid: VlanId,
        untagged: bool,
    ) -> HalResult<()>;

    fn egress_bridge_port_vlan_remove(&mut self, port: PortId, vid: VlanId) -> HalResult<()>;

    /// QinQ: push `outer` on frames arriving with `inner`.
    fn ingress_port_vlan_push_add(
        &mut self,
        port: PortId,
        outer: VlanId,
        inner: VlanId,
    ) -> HalResult<()>;

    fn ingress_port_vlan_push_remove(
        &mut self,
        port: PortId,
        outer: VlanId,
        inner: VlanId,
    ) -> HalResult<()>;

    /// QinQ: pop `outer` on the way out of `port`.
    fn egress_port_vlan_pop_add(&mut self, port: PortId, outer: VlanId) -> HalResult<()>;

    fn egress_port_vlan_pop_remove(&mut self, port: PortId, outer: VlanId) -> HalResult<()>;
}
