//! L3 capability group.

use crate::{EcmpId, EgressId, HalResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use swsync_types::{AddrFamily, IpPrefix, MacAddress, PortId, VlanId};

/// Where a host or route entry sends matching traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteTarget {
    /// Punt to the control plane (unresolved or locally terminated).
    Controller,
    Egress(EgressId),
    Ecmp(EcmpId),
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Controller => write!(f, "controller"),
            RouteTarget::Egress(id) => write!(f, "egress {}", id),
            RouteTarget::Ecmp(id) => write!(f, "ecmp {}", id),
        }
    }
}

pub trait L3Api {
    /// Termination MAC: frames to `mac` on (port, vid) enter routing for
    /// `family`. `port` is `None` for a bridge SVI, which terminates on every
    /// port carrying `vid`.
    fn l3_termination_add(
        &mut self,
        port: Option<PortId>,
        vid: VlanId,
        mac: MacAddress,
        family: AddrFamily,
    ) -> HalResult<()>;

    fn l3_termination_remove(
        &mut self,
        port: Option<PortId>,
        vid: VlanId,
        mac: MacAddress,
        family: AddrFamily,
    ) -> HalResult<()>;

    /// Egress rewrite toward one neighbour.
    fn l3_egress_create(
        &mut self,
        port: PortId,
        vid: VlanId,
        src: MacAddress,
        dst: MacAddress,
    ) -> HalResult<EgressId>;

    fn l3_egress_update(
        &mut self,
        egress: EgressId,
        port: PortId,
        vid: VlanId,
        src: MacAddress,
        dst: MacAddress,
    ) -> HalResult<()>;

    fn l3_egress_remove(&mut self, egress: EgressId) -> HalResult<()>;

    /// `update` replaces an existing entry in place.
    fn l3_unicast_host_add(
        &mut self,
        addr: IpAddr,
        target: RouteTarget,
        update: bool,
        vrf: u32,
    ) -> HalResult<()>;

    fn l3_unicast_host_remove(&mut self, addr: IpAddr, vrf: u32) -> HalResult<()>;

    fn l3_unicast_route_add(
        &mut self,
        prefix: IpPrefix,
        target: RouteTarget,
        update: bool,
        vrf: u32,
    ) -> HalResult<()>;

    fn l3_unicast_route_remove(&mut self, prefix: IpPrefix, vrf: u32) -> HalResult<()>;

    fn l3_ecmp_add(&mut self, members: &[EgressId]) -> HalResult<EcmpId>;

    /// Replaces the member set of a live group.
    fn l3_ecmp_update(&mut self, ecmp: EcmpId, members: &[EgressId]) -> HalResult<()>;

    fn l3_ecmp_remove(&mut self, ecmp: EcmpId) -> HalResult<()>;
}
