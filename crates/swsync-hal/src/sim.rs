//! In-memory forwarding plane.
//!
//! [`SimulatedSwitch`] implements every capability trait against plain maps:
//! it allocates ids, keeps the set of live objects, records each successful
//! call in order and rejects calls a real driver would reject (duplicate
//! creates, removal of unknown objects). Failures can be injected per
//! operation, and the whole switch can be marked unavailable.

use crate::api::{
    AccessPortSpec, BridgingApi, EndpointSpec, L3Api, LagApi, LagMode, PortApi, PortConfig,
    PortStats, RouteTarget, TunnelApi, VlanApi,
};
use crate::{EcmpId, EgressId, HalError, HalResult, HalStatus, TenantId, TunnelNextHopId};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use swsync_types::{AddrFamily, IpPrefix, MacAddress, PortId, StpState, VlanId};

/// One successful call into the simulated forwarding plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalCall {
    L2AddrAdd { port: PortId, vid: VlanId, mac: MacAddress, filtered: bool, permanent: bool },
    L2AddrRemove { port: PortId, vid: VlanId, mac: MacAddress },
    L2AddrRemoveAllInVlan { port: PortId, vid: VlanId },
    McastJoin { port: PortId, vid: VlanId, group: MacAddress },
    McastLeave { port: PortId, vid: VlanId, group: MacAddress },
    StpPortState { port: PortId, state: StpState },
    StpPortVlanState { port: PortId, vid: VlanId, state: StpState },
    TerminationAdd { port: Option<PortId>, vid: VlanId, mac: MacAddress, family: AddrFamily },
    TerminationRemove { port: Option<PortId>, vid: VlanId, mac: MacAddress, family: AddrFamily },
    EgressCreate { id: EgressId, port: PortId, vid: VlanId, src: MacAddress, dst: MacAddress },
    EgressUpdate { id: EgressId, port: PortId, vid: VlanId, src: MacAddress, dst: MacAddress },
    EgressRemove { id: EgressId },
    HostAdd { addr: IpAddr, target: RouteTarget, update: bool, vrf: u32 },
    HostRemove { addr: IpAddr, vrf: u32 },
    RouteAdd { prefix: IpPrefix, target: RouteTarget, update: bool, vrf: u32 },
    RouteRemove { prefix: IpPrefix, vrf: u32 },
    EcmpAdd { id: EcmpId, members: Vec<EgressId> },
    EcmpUpdate { id: EcmpId, members: Vec<EgressId> },
    EcmpRemove { id: EcmpId },
    IngressVlanAdd { port: PortId, vid: VlanId, pvid: bool, vrf: u32 },
    IngressVlanRemove { port: PortId, vid: VlanId, pvid: bool, vrf: u32 },
    PvidAdd { port: PortId, vid: VlanId },
    PvidRemove { port: PortId, vid: VlanId },
    EgressVlanAdd { port: PortId, vid: VlanId, untagged: bool },
    EgressVlanRemove { port: PortId, vid: VlanId },
    EgressBridgeVlanAdd { port: PortId, vid: VlanId, untagged: bool },
    EgressBridgeVlanRemove { port: PortId, vid: VlanId },
    VlanPushAdd { port: PortId, outer: VlanId, inner: VlanId },
    VlanPushRemove { port: PortId, outer: VlanId, inner: VlanId },
    VlanPopAdd { port: PortId, outer: VlanId },
    VlanPopRemove { port: PortId, outer: VlanId },
    TenantCreate { tenant: TenantId, vni: u32 },
    TenantDelete { tenant: TenantId },
    TunnelNextHopCreate { id: TunnelNextHopId, src: MacAddress, dst: MacAddress, port: PortId, vid: VlanId },
    TunnelNextHopModify { id: TunnelNextHopId, src: MacAddress, dst: MacAddress, port: PortId, vid: VlanId },
    TunnelNextHopDelete { id: TunnelNextHopId },
    EndpointCreate(EndpointSpec),
    AccessPortCreate(AccessPortSpec),
    PortTenantAdd { lport: PortId, tenant: TenantId },
    PortTenantRemove { lport: PortId, tenant: TenantId },
    TunnelPortDelete { lport: PortId },
    FloodAdd { tenant: TenantId, lport: PortId },
    FloodRemove { tenant: TenantId, lport: PortId },
    OverlayAddrAdd { tenant: TenantId, lport: PortId, mac: MacAddress, permanent: bool },
    OverlayAddrRemove { tenant: TenantId, lport: PortId, mac: MacAddress },
    LagCreate { lag: PortId, name: String, mode: LagMode },
    LagRemove { lag: PortId },
    LagAddMember { lag: PortId, member: PortId },
    LagRemoveMember { lag: PortId, member: PortId },
    LagSetMemberActive { lag: PortId, member: PortId, active: bool },
    LagSetMode { lag: PortId, mode: LagMode },
    PortSetConfig { port: PortId, config: PortConfig },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimEgress {
    pub port: PortId,
    pub vid: VlanId,
    pub src: MacAddress,
    pub dst: MacAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimTunnelPort {
    Endpoint(EndpointSpec),
    Access(AccessPortSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimLag {
    pub name: String,
    pub mode: LagMode,
    /// member -> active
    pub members: BTreeMap<PortId, bool>,
}

const EGRESS_BASE: u32 = 0x2000_0000;
const ECMP_BASE: u32 = 0x7000_0000;

/// Simulated forwarding plane. See the module docs.
#[derive(Debug, Default)]
pub struct SimulatedSwitch {
    calls: Vec<HalCall>,
    failures: Vec<&'static str>,
    unavailable: bool,
    next_egress: u32,
    next_ecmp: u32,
    next_tunnel_nh: u32,
    next_lag: u16,

    pub l2_addrs: BTreeMap<(PortId, VlanId, MacAddress), bool>,
    pub mcast: BTreeSet<(PortId, VlanId, MacAddress)>,
    pub stp_port: BTreeMap<PortId, StpState>,
    pub stp_vlan: BTreeMap<(PortId, VlanId), StpState>,
    pub terminations: BTreeSet<(Option<PortId>, VlanId, MacAddress, AddrFamily)>,
    pub egresses: BTreeMap<EgressId, SimEgress>,
    pub ecmps: BTreeMap<EcmpId, Vec<EgressId>>,
    pub hosts: BTreeMap<(u32, IpAddr), RouteTarget>,
    pub routes: BTreeMap<(u32, IpPrefix), RouteTarget>,
    /// (port, vid) -> (pvid, vrf)
    pub ingress_vlans: BTreeMap<(PortId, VlanId), (bool, u32)>,
    pub pvids: BTreeSet<(PortId, VlanId)>,
    /// (port, vid) -> untagged
    pub egress_vlans: BTreeMap<(PortId, VlanId), bool>,
    pub bridge_egress_vlans: BTreeMap<(PortId, VlanId), bool>,
    pub vlan_push: BTreeSet<(PortId, VlanId, VlanId)>,
    pub vlan_pop: BTreeSet<(PortId, VlanId)>,
    pub tenants: BTreeMap<TenantId, u32>,
    pub tunnel_next_hops: BTreeMap<TunnelNextHopId, SimEgress>,
    pub tunnel_ports: BTreeMap<PortId, SimTunnelPort>,
    pub port_tenants: BTreeSet<(PortId, TenantId)>,
    pub floods: BTreeSet<(TenantId, PortId)>,
    /// (tenant, lport, mac) -> permanent
    pub overlay_addrs: BTreeMap<(TenantId, PortId, MacAddress), bool>,
    pub lags: BTreeMap<PortId, SimLag>,
    pub port_configs: BTreeMap<PortId, PortConfig>,
}

impl SimulatedSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful calls in the order they were made.
    pub fn calls(&self) -> &[HalCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<HalCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn count_calls(&self, pred: impl Fn(&HalCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    /// Makes the next call of operation `op` (the trait method name) fail.
    pub fn fail_next(&mut self, op: &'static str) {
        self.failures.push(op);
    }

    /// Every call fails with [`HalError::Unavailable`] while set.
    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.unavailable = unavailable;
    }

    /// Forgets every object, as a driver reset would. Call history is kept.
    pub fn reset(&mut self) {
        let calls = std::mem::take(&mut self.calls);
        *self = SimulatedSwitch {
            calls,
            ..SimulatedSwitch::default()
        };
    }

    fn check(&mut self, op: &'static str) -> HalResult<()> {
        if self.unavailable {
            return Err(HalError::Unavailable);
        }
        if let Some(pos) = self.failures.iter().position(|f| *f == op) {
            self.failures.remove(pos);
            warn!("SimulatedSwitch: injected failure for {}", op);
            return Err(HalError::Status {
                status: HalStatus::Failure,
            });
        }
        Ok(())
    }

    fn record(&mut self, call: HalCall) {
        debug!("SimulatedSwitch: {:?}", call);
        self.calls.push(call);
    }
}

fn missing(what: impl std::fmt::Display) -> HalError {
    HalError::not_found(what.to_string())
}

fn duplicate(what: impl std::fmt::Display) -> HalError {
    HalError::already_exists(what.to_string())
}

impl BridgingApi for SimulatedSwitch {
    fn l2_addr_add(
        &mut self,
        port: PortId,
        vid: VlanId,
        mac: MacAddress,
        filtered: bool,
        permanent: bool,
    ) -> HalResult<()> {
        self.check("l2_addr_add")?;
        self.l2_addrs.insert((port, vid, mac), permanent);
        self.record(HalCall::L2AddrAdd { port, vid, mac, filtered, permanent });
        Ok(())
    }

    fn l2_addr_remove(&mut self, port: PortId, vid: VlanId, mac: MacAddress) -> HalResult<()> {
        self.check("l2_addr_remove")?;
        self.l2_addrs
            .remove(&(port, vid, mac))
            .ok_or_else(|| missing(format!("l2 {} vlan {} {}", port, vid, mac)))?;
        self.record(HalCall::L2AddrRemove { port, vid, mac });
        Ok(())
    }

    fn l2_addr_remove_all_in_vlan(&mut self, port: PortId, vid: VlanId) -> HalResult<()> {
        self.check("l2_addr_remove_all_in_vlan")?;
        self.l2_addrs.retain(|(p, v, _), _| !(*p == port && *v == vid));
        self.record(HalCall::L2AddrRemoveAllInVlan { port, vid });
        Ok(())
    }

    fn l2_mcast_group_join(
        &mut self,
        port: PortId,
        vid: VlanId,
        group: MacAddress,
    ) -> HalResult<()> {
        self.check("l2_mcast_group_join")?;
        if !self.mcast.insert((port, vid, group)) {
            return Err(duplicate(format!("mcast {} vlan {} {}", port, vid, group)));
        }
        self.record(HalCall::McastJoin { port, vid, group });
        Ok(())
    }

    fn l2_mcast_group_leave(
        &mut self,
        port: PortId,
        vid: VlanId,
        group: MacAddress,
    ) -> HalResult<()> {
        self.check("l2_mcast_group_leave")?;
        if !self.mcast.remove(&(port, vid, group)) {
            return Err(missing(format!("mcast {} vlan {} {}", port, vid, group)));
        }
        self.record(HalCall::McastLeave { port, vid, group });
        Ok(())
    }

    fn stp_port_state_set(&mut self, port: PortId, state: StpState) -> HalResult<()> {
        self.check("stp_port_state_set")?;
        self.stp_port.insert(port, state);
        self.record(HalCall::StpPortState { port, state });
        Ok(())
    }

    fn stp_port_vlan_state_set(
        &mut self,
        port: PortId,
        vid: VlanId,
        state: StpState,
    ) -> HalResult<()> {
        self.check("stp_port_vlan_state_set")?;
        self.stp_vlan.insert((port, vid), state);
        self.record(HalCall::StpPortVlanState { port, vid, state });
        Ok(())
    }
}

impl L3Api for SimulatedSwitch {
    fn l3_termination_add(
        &mut self,
        port: Option<PortId>,
        vid: VlanId,
        mac: MacAddress,
        family: AddrFamily,
    ) -> HalResult<()> {
        self.check("l3_termination_add")?;
        if !self.terminations.insert((port, vid, mac, family)) {
            return Err(duplicate(format!("termination {:?} vlan {} {}", port, vid, mac)));
        }
        self.record(HalCall::TerminationAdd { port, vid, mac, family });
        Ok(())
    }

    fn l3_termination_remove(
        &mut self,
        port: Option<PortId>,
        vid: VlanId,
        mac: MacAddress,
        family: AddrFamily,
    ) -> HalResult<()> {
        self.check("l3_termination_remove")?;
        if !self.terminations.remove(&(port, vid, mac, family)) {
            return Err(missing(format!("termination {:?} vlan {} {}", port, vid, mac)));
        }
        self.record(HalCall::TerminationRemove { port, vid, mac, family });
        Ok(())
    }

    fn l3_egress_create(
        &mut self,
        port: PortId,
        vid: VlanId,
        src: MacAddress,
        dst: MacAddress,
    ) -> HalResult<EgressId> {
        self.check("l3_egress_create")?;
        self.next_egress += 1;
        let id = EgressId::from_raw(EGRESS_BASE | self.next_egress)
            .ok_or_else(|| HalError::table_full("egress"))?;
        self.egresses.insert(id, SimEgress { port, vid, src, dst });
        self.record(HalCall::EgressCreate { id, port, vid, src, dst });
        Ok(id)
    }

    fn l3_egress_update(
        &mut self,
        id: EgressId,
        port: PortId,
        vid: VlanId,
        src: MacAddress,
        dst: MacAddress,
    ) -> HalResult<()> {
        self.check("l3_egress_update")?;
        let entry = self.egresses.get_mut(&id).ok_or_else(|| missing(id))?;
        *entry = SimEgress { port, vid, src, dst };
        self.record(HalCall::EgressUpdate { id, port, vid, src, dst });
        Ok(())
    }

    fn l3_egress_remove(&mut self, id: EgressId) -> HalResult<()> {
        self.check("l3_egress_remove")?;
        if self.ecmps.values().any(|m| m.contains(&id)) {
            return Err(HalError::invalid_parameter(format!("egress {} in use by ecmp", id)));
        }
        self.egresses.remove(&id).ok_or_else(|| missing(id))?;
        self.record(HalCall::EgressRemove { id });
        Ok(())
    }

    fn l3_unicast_host_add(
        &mut self,
        addr: IpAddr,
        target: RouteTarget,
        update: bool,
        vrf: u32,
    ) -> HalResult<()> {
        self.check("l3_unicast_host_add")?;
        let exists = self.hosts.contains_key(&(vrf, addr));
        if exists && !update {
            return Err(duplicate(format!("host {} vrf {}", addr, vrf)));
        }
        self.hosts.insert((vrf, addr), target);
        self.record(HalCall::HostAdd { addr, target, update, vrf });
        Ok(())
    }

    fn l3_unicast_host_remove(&mut self, addr: IpAddr, vrf: u32) -> HalResult<()> {
        self.check("l3_unicast_host_remove")?;
        self.hosts
            .remove(&(vrf, addr))
            .ok_or_else(|| missing(format!("host {} vrf {}", addr, vrf)))?;
        self.record(HalCall::HostRemove { addr, vrf });
        Ok(())
    }

    fn l3_unicast_route_add(
        &mut self,
        prefix: IpPrefix,
        target: RouteTarget,
        update: bool,
        vrf: u32,
    ) -> HalResult<()> {
        self.check("l3_unicast_route_add")?;
        let exists = self.routes.contains_key(&(vrf, prefix));
        if exists && !update {
            return Err(duplicate(format!("route {} vrf {}", prefix, vrf)));
        }
        self.routes.insert((vrf, prefix), target);
        self.record(HalCall::RouteAdd { prefix, target, update, vrf });
        Ok(())
    }

    fn l3_unicast_route_remove(&mut self, prefix: IpPrefix, vrf: u32) -> HalResult<()> {
        self.check("l3_unicast_route_remove")?;
        self.routes
            .remove(&(vrf, prefix))
            .ok_or_else(|| missing(format!("route {} vrf {}", prefix, vrf)))?;
        self.record(HalCall::RouteRemove { prefix, vrf });
        Ok(())
    }

    fn l3_ecmp_add(&mut self, members: &[EgressId]) -> HalResult<EcmpId> {
        self.check("l3_ecmp_add")?;
        self.next_ecmp += 1;
        let id = EcmpId::from_raw(ECMP_BASE | self.next_ecmp)
            .ok_or_else(|| HalError::table_full("ecmp"))?;
        self.ecmps.insert(id, members.to_vec());
        self.record(HalCall::EcmpAdd { id, members: members.to_vec() });
        Ok(id)
    }

    fn l3_ecmp_update(&mut self, id: EcmpId, members: &[EgressId]) -> HalResult<()> {
        self.check("l3_ecmp_update")?;
        let entry = self.ecmps.get_mut(&id).ok_or_else(|| missing(id))?;
        *entry = members.to_vec();
        self.record(HalCall::EcmpUpdate { id, members: members.to_vec() });
        Ok(())
    }

    fn l3_ecmp_remove(&mut self, id: EcmpId) -> HalResult<()> {
        self.check("l3_ecmp_remove")?;
        self.ecmps.remove(&id).ok_or_else(|| missing(id))?;
        self.record(HalCall::EcmpRemove { id });
        Ok(())
    }
}

impl VlanApi for SimulatedSwitch {
    fn ingress_port_vlan_add(
        &mut self,
        port: PortId,
        vid: VlanId,
        pvid: bool,
        vrf: u32,
    ) -> HalResult<()> {
        self.check("ingress_port_vlan_add")?;
        // re-adding with a new VRF rebinds the entry
        if let Some((old_pvid, old_vrf)) = self.ingress_vlans.get(&(port, vid)) {
            if *old_pvid == pvid && *old_vrf == vrf {
                return Err(duplicate(format!("ingress {} vlan {}", port, vid)));
            }
        }
        self.ingress_vlans.insert((port, vid), (pvid, vrf));
        self.record(HalCall::IngressVlanAdd { port, vid, pvid, vrf });
        Ok(())
    }

    fn ingress_port_vlan_remove(
        &mut self,
        port: PortId,
        vid: VlanId,
        pvid: bool,
        vrf: u32,
    ) -> HalResult<()> {
        self.check("ingress_port_vlan_remove")?;
        self.ingress_vlans
            .remove(&(port, vid))
            .ok_or_else(|| missing(format!("ingress {} vlan {}", port, vid)))?;
        self.record(HalCall::IngressVlanRemove { port, vid, pvid, vrf });
        Ok(())
    }

    fn ingress_port_pvid_add(&mut self, port: PortId, vid: VlanId) -> HalResult<()> {
        self.check("ingress_port_pvid_add")?;
        if !self.pvids.insert((port, vid)) {
            return Err(duplicate(format!("pvid {} vlan {}", port, vid)));
        }
        self.record(HalCall::PvidAdd { port, vid });
        Ok(())
    }

    fn ingress_port_pvid_remove(&mut self, port: PortId, vid: VlanId) -> HalResult<()> {
        self.check("ingress_port_pvid_remove")?;
        if !self.pvids.remove(&(port, vid)) {
            return Err(missing(format!("pvid {} vlan {}", port, vid)));
        }
        self.record(HalCall::PvidRemove { port, vid });
        Ok(())
    }

    fn egress_port_vlan_add(
        &mut self,
        port: PortId,
        vid: VlanId,
        untagged: bool,
    ) -> HalResult<()> {
        self.check("egress_port_vlan_add")?;
        if self.egress_vlans.insert((port, vid), untagged).is_some() {
            return Err(duplicate(format!("egress {} vlan {}", port, vid)));
        }
        self.record(HalCall::EgressVlanAdd { port, vid, untagged });
        Ok(())
    }

    fn egress_port_vlan_remove(&mut self, port: PortId, vid: VlanId) -> HalResult<()> {
        self.check("egress_port_vlan_remove")?;
        self.egress_vlans
            .remove(&(port, vid))
            .ok_or_else(|| missing(format!("egress {} vlan {}", port, vid)))?;
        self.record(HalCall::EgressVlanRemove { port, vid });
        Ok(())
    }

    fn egress_bridge_port_vlan_add(
        &mut self,
        port: PortId,
        vid: VlanId,
        untagged: bool,
    ) -> HalResult<()> {
        self.check("egress_bridge_port_vlan_add")?;
        if self.bridge_egress_vlans.insert((port, vid), untagged) == Some(untagged) {
            return Err(duplicate(format!("bridge egress {} vlan {}", port, vid)));
        }
        self.record(HalCall::EgressBridgeVlanAdd { port, vid, untagged });
        Ok(())
    }

    fn egress_bridge_port_vlan_remove(&mut self, port: PortId, vid: VlanId) -> HalResult<()> {
        self.check("egress_bridge_port_vlan_remove")?;
        self.bridge_egress_vlans
            .remove(&(port, vid))
            .ok_or_else(|| missing(format!("bridge egress {} vlan {}", port, vid)))?;
        self.record(HalCall::EgressBridgeVlanRemove { port, vid });
        Ok(())
    }

    fn ingress_port_vlan_push_add(
        &mut self,
        port: PortId,
        outer: VlanId,
        inner: VlanId,
    ) -> HalResult<()> {
        self.check("ingress_port_vlan_push_add")?;
        if !self.vlan_push.insert((port, outer, inner)) {
            return Err(duplicate(format!("push {} {}/{}", port, outer, inner)));
        }
        self.record(HalCall::VlanPushAdd { port, outer, inner });
        Ok(())
    }

    fn ingress_port_vlan_push_remove(
        &mut self,
        port: PortId,
        outer: VlanId,
        inner: VlanId,
    ) -> HalResult<()> {
        self.check("ingress_port_vlan_push_remove")?;
        if !self.vlan_push.remove(&(port, outer, inner)) {
            return Err(missing(format!("push {} {}/{}", port, outer, inner)));
        }
        self.record(HalCall::VlanPushRemove { port, outer, inner });
        Ok(())
    }

    fn egress_port_vlan_pop_add(&mut self, port: PortId, outer: VlanId) -> HalResult<()> {
        self.check("egress_port_vlan_pop_add")?;
        if !self.vlan_pop.insert((port, outer)) {
            return Err(duplicate(format!("pop {} {}", port, outer)));
        }
        self.record(HalCall::VlanPopAdd { port, outer });
        Ok(())
    }

    fn egress_port_vlan_pop_remove(&mut self, port: PortId, outer: VlanId) -> HalResult<()> {
        self.check("egress_port_vlan_pop_remove")?;
        if !self.vlan_pop.remove(&(port, outer)) {
            return Err(missing(format!("pop {} {}", port, outer)));
        }
        self.record(HalCall::VlanPopRemove { port, outer });
        Ok(())
    }
}

impl TunnelApi for SimulatedSwitch {
    fn tunnel_tenant_create(&mut self, tenant: TenantId, vni: u32) -> HalResult<()> {
        self.check("tunnel_tenant_create")?;
        if self.tenants.contains_key(&tenant) {
            return Err(duplicate(tenant));
        }
        self.tenants.insert(tenant, vni);
        self.record(HalCall::TenantCreate { tenant, vni });
        Ok(())
    }

    fn tunnel_tenant_delete(&mut self, tenant: TenantId) -> HalResult<()> {
        self.check("tunnel_tenant_delete")?;
        self.tenants.remove(&tenant).ok_or_else(|| missing(tenant))?;
        self.record(HalCall::TenantDelete { tenant });
        Ok(())
    }

    fn tunnel_next_hop_create(
        &mut self,
        src: MacAddress,
        dst: MacAddress,
        port: PortId,
        vid: VlanId,
    ) -> HalResult<TunnelNextHopId> {
        self.check("tunnel_next_hop_create")?;
        self.next_tunnel_nh += 1;
        let id = TunnelNextHopId::from_raw(self.next_tunnel_nh)
            .ok_or_else(|| HalError::table_full("tunnel next hop"))?;
        self.tunnel_next_hops.insert(id, SimEgress { port, vid, src, dst });
        self.record(HalCall::TunnelNextHopCreate { id, src, dst, port, vid });
        Ok(id)
    }

    fn tunnel_next_hop_modify(
        &mut self,
        id: TunnelNextHopId,
        src: MacAddress,
        dst: MacAddress,
        port: PortId,
        vid: VlanId,
    ) -> HalResult<()> {
        self.check("tunnel_next_hop_modify")?;
        let entry = self.tunnel_next_hops.get_mut(&id).ok_or_else(|| missing(id))?;
        *entry = SimEgress { port, vid, src, dst };
        self.record(HalCall::TunnelNextHopModify { id, src, dst, port, vid });
        Ok(())
    }

    fn tunnel_next_hop_delete(&mut self, id: TunnelNextHopId) -> HalResult<()> {
        self.check("tunnel_next_hop_delete")?;
        let in_use = self.tunnel_ports.values().any(|p| match p {
            SimTunnelPort::Endpoint(spec) => spec.next_hop == id,
            SimTunnelPort::Access(_) => false,
        });
        if in_use {
            return Err(HalError::invalid_parameter(format!("next hop {} in use", id)));
        }
        self.tunnel_next_hops.remove(&id).ok_or_else(|| missing(id))?;
        self.record(HalCall::TunnelNextHopDelete { id });
        Ok(())
    }

    fn tunnel_endpoint_create(&mut self, spec: &EndpointSpec) -> HalResult<()> {
        self.check("tunnel_endpoint_create")?;
        if !self.tunnel_next_hops.contains_key(&spec.next_hop) {
            return Err(missing(spec.next_hop));
        }
        if self.tunnel_ports.contains_key(&spec.lport) {
            return Err(duplicate(spec.lport));
        }
        self.tunnel_ports
            .insert(spec.lport, SimTunnelPort::Endpoint(spec.clone()));
        self.record(HalCall::EndpointCreate(spec.clone()));
        Ok(())
    }

    fn tunnel_access_port_create(&mut self, spec: &AccessPortSpec) -> HalResult<()> {
        self.check("tunnel_access_port_create")?;
        if self.tunnel_ports.contains_key(&spec.lport) {
            return Err(duplicate(spec.lport));
        }
        self.tunnel_ports
            .insert(spec.lport, SimTunnelPort::Access(spec.clone()));
        self.record(HalCall::AccessPortCreate(spec.clone()));
        Ok(())
    }

    fn tunnel_port_tenant_add(&mut self, lport: PortId, tenant: TenantId) -> HalResult<()> {
        self.check("tunnel_port_tenant_add")?;
        if !self.tunnel_ports.contains_key(&lport) {
            return Err(missing(lport));
        }
        if !self.port_tenants.insert((lport, tenant)) {
            return Err(duplicate(format!("{} in {}", lport, tenant)));
        }
        self.record(HalCall::PortTenantAdd { lport, tenant });
        Ok(())
    }

    fn tunnel_port_tenant_remove(&mut self, lport: PortId, tenant: TenantId) -> HalResult<()> {
        self.check("tunnel_port_tenant_remove")?;
        if !self.port_tenants.remove(&(lport, tenant)) {
            return Err(missing(format!("{} in {}", lport, tenant)));
        }
        self.record(HalCall::PortTenantRemove { lport, tenant });
        Ok(())
    }

    fn tunnel_port_delete(&mut self, lport: PortId) -> HalResult<()> {
        self.check("tunnel_port_delete")?;
        self.tunnel_ports.remove(&lport).ok_or_else(|| missing(lport))?;
        self.record(HalCall::TunnelPortDelete { lport });
        Ok(())
    }

    fn tunnel_flood_add(&mut self, tenant: TenantId, lport: PortId) -> HalResult<()> {
        self.check("tunnel_flood_add")?;
        if !self.floods.insert((tenant, lport)) {
            return Err(duplicate(format!("flood {} {}", tenant, lport)));
        }
        self.record(HalCall::FloodAdd { tenant, lport });
        Ok(())
    }

    fn tunnel_flood_remove(&mut self, tenant: TenantId, lport: PortId) -> HalResult<()> {
        self.check("tunnel_flood_remove")?;
        if !self.floods.remove(&(tenant, lport)) {
            return Err(missing(format!("flood {} {}", tenant, lport)));
        }
        self.record(HalCall::FloodRemove { tenant, lport });
        Ok(())
    }

    fn l2_overlay_addr_add(
        &mut self,
        tenant: TenantId,
        lport: PortId,
        mac: MacAddress,
        permanent: bool,
    ) -> HalResult<()> {
        self.check("l2_overlay_addr_add")?;
        self.overlay_addrs.insert((tenant, lport, mac), permanent);
        self.record(HalCall::OverlayAddrAdd { tenant, lport, mac, permanent });
        Ok(())
    }

    fn l2_overlay_addr_remove(
        &mut self,
        tenant: TenantId,
        lport: PortId,
        mac: MacAddress,
    ) -> HalResult<()> {
        self.check("l2_overlay_addr_remove")?;
        if mac.is_broadcast() {
            // broadcast wipes every address the port holds in the tenant
            self.overlay_addrs
                .retain(|(t, p, _), _| !(*t == tenant && *p == lport));
        } else {
            self.overlay_addrs
                .remove(&(tenant, lport, mac))
                .ok_or_else(|| missing(format!("overlay {} {} {}", tenant, lport, mac)))?;
        }
        self.record(HalCall::OverlayAddrRemove { tenant, lport, mac });
        Ok(())
    }
}

impl LagApi for SimulatedSwitch {
    fn lag_create(&mut self, name: &str, mode: LagMode) -> HalResult<PortId> {
        self.check("lag_create")?;
        self.next_lag += 1;
        let lag = PortId::lag(self.next_lag)
            .map_err(|e| HalError::invalid_parameter(e.to_string()))?;
        self.lags.insert(
            lag,
            SimLag {
                name: name.to_string(),
                mode,
                members: BTreeMap::new(),
            },
        );
        self.record(HalCall::LagCreate { lag, name: name.to_string(), mode });
        Ok(lag)
    }

    fn lag_remove(&mut self, lag: PortId) -> HalResult<()> {
        self.check("lag_remove")?;
        self.lags.remove(&lag).ok_or_else(|| missing(lag))?;
        self.record(HalCall::LagRemove { lag });
        Ok(())
    }

    fn lag_add_member(&mut self, lag: PortId, member: PortId) -> HalResult<()> {
        self.check("lag_add_member")?;
        let entry = self.lags.get_mut(&lag).ok_or_else(|| missing(lag))?;
        if entry.members.insert(member, false).is_some() {
            return Err(duplicate(format!("{} in {}", member, lag)));
        }
        self.record(HalCall::LagAddMember { lag, member });
        Ok(())
    }

    fn lag_remove_member(&mut self, lag: PortId, member: PortId) -> HalResult<()> {
        self.check("lag_remove_member")?;
        let entry = self.lags.get_mut(&lag).ok_or_else(|| missing(lag))?;
        entry
            .members
            .remove(&member)
            .ok_or_else(|| missing(format!("{} in {}", member, lag)))?;
        self.record(HalCall::LagRemoveMember { lag, member });
        Ok(())
    }

    fn lag_set_member_active(
        &mut self,
        lag: PortId,
        member: PortId,
        active: bool,
    ) -> HalResult<()> {
        self.check("lag_set_member_active")?;
        let entry = self.lags.get_mut(&lag).ok_or_else(|| missing(lag))?;
        let state = entry
            .members
            .get_mut(&member)
            .ok_or_else(|| missing(format!("{} in {}", member, lag)))?;
        *state = active;
        self.record(HalCall::LagSetMemberActive { lag, member, active });
        Ok(())
    }

    fn lag_set_mode(&mut self, lag: PortId, mode: LagMode) -> HalResult<()> {
        self.check("lag_set_mode")?;
        let entry = self.lags.get_mut(&lag).ok_or_else(|| missing(lag))?;
        entry.mode = mode;
        self.record(HalCall::LagSetMode { lag, mode });
        Ok(())
    }
}

impl PortApi for SimulatedSwitch {
    fn port_set_config(&mut self, port: PortId, config: PortConfig) -> HalResult<()> {
        self.check("port_set_config")?;
        self.port_configs.insert(port, config);
        self.record(HalCall::PortSetConfig { port, config });
        Ok(())
    }

    fn port_stats(&mut self, port: PortId) -> HalResult<PortStats> {
        self.check("port_stats")?;
        if !self.port_configs.contains_key(&port) {
            return Err(missing(port));
        }
        Ok(PortStats::default())
    }
}
