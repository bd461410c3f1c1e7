//! Tunnel (VXLAN) capability group.

use crate::{HalResult, TenantId, TunnelNextHopId};
use std::net::Ipv4Addr;
use swsync_types::{MacAddress, PortId, VlanId};

/// Parameters of a VXLAN tunnel endpoint port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub lport: PortId,
    pub name: String,
    pub remote: Ipv4Addr,
    pub local: Ipv4Addr,
    pub ttl: u8,
    pub next_hop: TunnelNextHopId,
    pub udp_dst_port: u16,
}

/// Parameters of a tunnel access port bridging (port, vid) into a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPortSpec {
    pub lport: PortId,
    pub name: String,
    pub port: PortId,
    pub vid: VlanId,
    pub untagged: bool,
}

pub trait TunnelApi {
    fn tunnel_tenant_create(&mut self, tenant: TenantId, vni: u32) -> HalResult<()>;

    fn tunnel_tenant_delete(&mut self, tenant: TenantId) -> HalResult<()>;

    fn tunnel_next_hop_create(
        &mut self,
        src: MacAddress,
        dst: MacAddress,
        port: PortId,
        vid: VlanId,
    ) -> HalResult<TunnelNextHopId>;

    fn tunnel_next_hop_modify(
        &mut self,
        next_hop: TunnelNextHopId,
        src: MacAddress,
        dst: MacAddress,
        port: PortId,
        vid: VlanId,
    ) -> HalResult<()>;

    fn tunnel_next_hop_delete(&mut self, next_hop: TunnelNextHopId) -> HalResult<()>;

    fn tunnel_endpoint_create(&mut self, spec: &EndpointSpec) -> HalResult<()>;

    fn tunnel_access_port_create(&mut self, spec: &AccessPortSpec) -> HalResult<()>;

    fn tunnel_port_tenant_add(&mut self, lport: PortId, tenant: TenantId) -> HalResult<()>;

    fn tunnel_port_tenant_remove(&mut self, lport: PortId, tenant: TenantId) -> HalResult<()>;

    /// Deletes an endpoint or access port.
    fn tunnel_port_delete(&mut self, lport: PortId) -> HalResult<()>;

    fn tunnel_flood_add(&mut self, tenant: TenantId, lport: PortId) -> HalResult<()>;

    fn tunnel_flood_remove(&mut self, tenant: TenantId, lport: PortId) -> HalResult<()>;

    fn l2_overlay_addr_add(
        &mut self,
        tenant: TenantId,
        lport: PortId,
        mac: MacAddress,
        permanent: bool,
    ) -> HalResult<()>;

    fn l2_overlay_addr_remove(
        &mut self,
        tenant: TenantId,
        lport: PortId,
        mac: MacAddress,
    ) -> HalResult<()>;
}
