//! VXLAN engine types.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use swsync_hal::TenantId;
use swsync_types::{MacAddress, PortId, VlanId};

/// UDP destination port used when a VXLAN link does not name one.
pub const DEFAULT_UDP_PORT: u16 = 4789;

/// Tenant ids below this are reserved by the forwarding plane.
pub const FIRST_TENANT_ID: u32 = 10;

/// Identifies a tunnel endpoint: one per (local, remote, UDP port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub local: Ipv4Addr,
    pub remote: Ipv4Addr,
    pub udp_port: u16,
}

/// Underlay rewrite a tunnel endpoint sends through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelNhKey {
    pub src: MacAddress,
    pub dst: MacAddress,
    pub port: PortId,
    pub vid: VlanId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub lport: PortId,
    pub next_hop: TunnelNhKey,
}

/// A VXLAN link the engine manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanLink {
    pub vni: u32,
    pub tenant: TenantId,
    pub local: Option<Ipv4Addr>,
    pub udp_port: u16,
    /// Unknown unicast floods to the link's endpoints.
    pub flood: bool,
}

/// A (bridge port, VLAN) converted into a tunnel access port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPort {
    pub lport: PortId,
    pub tenant: TenantId,
    pub untagged: bool,
    pub flood: bool,
    pub macs: BTreeSet<MacAddress>,
}

/// What [`VxlanEngine::create_access_port`](super::VxlanEngine::create_access_port)
/// needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPortRequest {
    pub port: PortId,
    /// Name of the bridge port link; the access port is named `<name>.<vid>`.
    pub name: String,
    pub vid: VlanId,
    pub tenant: TenantId,
    pub untagged: bool,
    pub flood: bool,
    /// Mirrored FDB entries of (port, vid) to replay, with their permanent flag.
    pub replay: Vec<(MacAddress, bool)>,
}

/// An overlay address learned behind a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OverlayRef {
    pub tenant: TenantId,
    pub endpoint: EndpointKey,
    pub permanent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VxlanStats {
    pub tenants_created: u64,
    pub endpoints_created: u64,
    pub endpoints_removed: u64,
    pub access_ports_created: u64,
    pub access_ports_removed: u64,
    pub lookups_issued: u64,
}
