//! VXLAN tenants, tunnel endpoints, overlay addresses and access ports.

use super::types::{
    AccessPort, AccessPortRequest, Endpoint, EndpointKey, OverlayRef, TunnelNhKey, VxlanLink,
    VxlanStats, DEFAULT_UDP_PORT, FIRST_TENANT_ID,
};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::bond::BondManager;
use crate::kernel::{FdbEntry, KernelCache, L3Port, Link, LinkKind, Route, Topology};
use crate::vlan::VlanProgrammer;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use swsync_common::{
    HalResultExt, ReachTarget, ReachabilityRegistry, ResourcePool, SyncError, SyncResult,
};
use swsync_hal::{AccessPortSpec, EndpointSpec, SwitchHal, TenantId, TunnelNextHopId};
use swsync_types::{IpPrefix, MacAddress, PortId, VlanId};

fn first_error(first: &mut Option<SyncError>, result: SyncResult<()>) {
    if let Err(e) = result {
        warn!("VxlanEngine: {}", e);
        first.get_or_insert(e);
    }
}

/// A rollback step failed; the caller still reports the error that started
/// the rollback.
fn unwind_failed<T, E: std::fmt::Display>(step: &str, result: Result<T, E>) {
    if let Err(e) = result {
        warn!("VxlanEngine: unwinding {} failed: {}", step, e);
    }
}

#[derive(Debug)]
pub struct VxlanEngine {
    default_udp_port: u16,
    ttl: u8,
    links: BTreeMap<u32, VxlanLink>,
    tenants: ResourcePool<u32, TenantId>,
    next_tenant: u32,
    next_lport: u16,
    next_hops: ResourcePool<TunnelNhKey, TunnelNextHopId>,
    endpoints: ResourcePool<EndpointKey, Endpoint>,
    /// Zero-MAC references per (endpoint, VNI); the tenant membership of the
    /// endpoint port lives while this is non-zero.
    vni_refs: BTreeMap<(EndpointKey, u32), u32>,
    /// Zero-MAC FDB entries (vxlan link, remote) holding or awaiting one
    /// endpoint reference each.
    holders: BTreeSet<(u32, Ipv4Addr)>,
    /// Endpoint requests waiting for the underlay route, one VNI per request.
    pending: BTreeMap<EndpointKey, Vec<u32>>,
    in_flight: BTreeSet<Ipv4Addr>,
    lookups: Vec<IpAddr>,
    route_waits: ReachabilityRegistry<Ipv4Addr>,
    overlay: BTreeMap<(u32, MacAddress, Ipv4Addr), OverlayRef>,
    access: BTreeMap<(PortId, VlanId), AccessPort>,
    floods: BTreeSet<(TenantId, PortId)>,
    stats: VxlanStats,
}

impl Default for VxlanEngine {
    fn default() -> Self {
        Self::new(DEFAULT_UDP_PORT, 45)
    }
}

impl VxlanEngine {
    pub fn new(default_udp_port: u16, ttl: u8) -> Self {
        Self {
            default_udp_port,
            ttl,
            links: BTreeMap::new(),
            tenants: ResourcePool::new("vxlan_tenant"),
            next_tenant: FIRST_TENANT_ID,
            next_lport: 1,
            next_hops: ResourcePool::new("tunnel_next_hop"),
            endpoints: ResourcePool::new("tunnel_endpoint"),
            vni_refs: BTreeMap::new(),
            holders: BTreeSet::new(),
            pending: BTreeMap::new(),
            in_flight: BTreeSet::new(),
            lookups: Vec::new(),
            route_waits: ReachabilityRegistry::new("vxlan_route_waits"),
            overlay: BTreeMap::new(),
            access: BTreeMap::new(),
            floods: BTreeSet::new(),
            stats: VxlanStats::default(),
        }
    }

    pub fn stats(&self) -> &VxlanStats {
        &self.stats
    }

    pub fn link(&self, ifindex: u32) -> Option<&VxlanLink> {
        self.links.get(&ifindex)
    }

    pub fn is_vxlan_link(&self, ifindex: u32) -> bool {
        self.links.contains_key(&ifindex)
    }

    pub fn tenant_of_vni(&self, vni: u32) -> Option<TenantId> {
        self.tenants.get(&vni).copied()
    }

    pub fn endpoint(&self, key: &EndpointKey) -> Option<Endpoint> {
        self.endpoints.get(key).copied()
    }

    pub fn endpoint_refcount(&self, key: &EndpointKey) -> u32 {
        self.endpoints.refcount(key)
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn next_hop_count(&self) -> usize {
        self.next_hops.len()
    }

    pub fn is_pending(&self, key: &EndpointKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn access_port(&self, port: PortId, vid: VlanId) -> Option<&AccessPort> {
        self.access.get(&(port, vid))
    }

    pub fn is_access_port(&self, port: PortId, vid: VlanId) -> bool {
        self.access.contains_key(&(port, vid))
    }

    fn allocate_lport(&mut self) -> SyncResult<PortId> {
        let lport = PortId::tunnel(self.next_lport)
            .map_err(|e| SyncError::inconsistent(format!("tunnel port space exhausted: {}", e)))?;
        self.next_lport = self.next_lport.wrapping_add(1);
        Ok(lport)
    }

    fn flood_add(&mut self, hal: &mut dyn SwitchHal, tenant: TenantId, lport: PortId) -> SyncResult<()> {
        if !self.floods.insert((tenant, lport)) {
            return Ok(());
        }
        if let Err(e) = hal.tunnel_flood_add(tenant, lport) {
            self.floods.remove(&(tenant, lport));
            return Err(SyncError::hardware("tunnel_flood_add", e));
        }
        Ok(())
    }

    fn flood_remove(&mut self, hal: &mut dyn SwitchHal, tenant: TenantId, lport: PortId) -> SyncResult<()> {
        if !self.floods.remove(&(tenant, lport)) {
            return Ok(());
        }
        hal.tunnel_flood_remove(tenant, lport).hal("tunnel_flood_remove")
    }

    /// Starts managing a VXLAN link: the tenant of its VNI is created on the
    /// first link carrying that VNI.
    pub fn add_link(&mut self, hal: &mut dyn SwitchHal, link: &Link) -> SyncResult<()> {
        let LinkKind::Vxlan { vni, local, dst_port, .. } = link.kind else {
            return Err(SyncError::inconsistent(format!("{} is not a vxlan link", link.name)));
        };
        let flood = link.bridge.as_ref().map_or(true, |b| b.flood_unicast);

        if let Some(known) = self.links.get(&link.ifindex) {
            if known.vni != vni {
                return Err(SyncError::unsupported(format!(
                    "{}: vni change {} -> {}",
                    link.name, known.vni, vni
                )));
            }
            return Ok(());
        }

        let local = match local {
            Some(IpAddr::V4(v4)) => Some(v4),
            Some(IpAddr::V6(_)) => {
                return Err(SyncError::unsupported(format!(
                    "{}: IPv6 tunnel endpoints",
                    link.name
                )))
            }
            None => None,
        };

        let candidate = self.next_tenant;
        let tenant = self.tenants.acquire(&vni, |vni| {
            let id = TenantId::from_raw(candidate)
                .ok_or_else(|| SyncError::inconsistent("tenant id space exhausted"))?;
            hal.tunnel_tenant_create(id, *vni).hal("tunnel_tenant_create")?;
            Ok::<_, SyncError>(id)
        })?;
        if tenant.as_raw() == candidate {
            self.next_tenant += 1;
            self.stats.tenants_created += 1;
            audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "VxlanEngine", "create_tenant")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(tenant.to_string())
                .with_object_type("tunnel_tenant")
                .with_details(serde_json::json!({ "vni": vni, "link": link.name })));
        }

        self.links.insert(
            link.ifindex,
            VxlanLink {
                vni,
                tenant,
                local,
                udp_port: dst_port.unwrap_or(self.default_udp_port),
                flood,
            },
        );
        info!("VxlanEngine: {} carries vni {} as {}", link.name, vni, tenant);
        Ok(())
    }

    /// Stops managing a VXLAN link; the tenant goes with the last link of its
    /// VNI.
    pub fn remove_link(&mut self, hal: &mut dyn SwitchHal, ifindex: u32) -> SyncResult<()> {
        let Some(link) = self.links.remove(&ifindex) else {
            return Ok(());
        };
        let mut first = None;

        let overlays: Vec<(MacAddress, Ipv4Addr)> = self
            .overlay
            .keys()
            .filter(|(i, _, _)| *i == ifindex)
            .map(|(_, mac, remote)| (*mac, *remote))
            .collect();
        for (mac, remote) in overlays {
            first_error(&mut first, self.remove_overlay(hal, ifindex, mac, remote));
        }

        let refs: Vec<EndpointKey> = self
            .vni_refs
            .iter()
            .filter(|((_, vni), _)| *vni == link.vni)
            .flat_map(|((key, _), count)| std::iter::repeat(*key).take(*count as usize))
            .collect();
        for key in refs {
            first_error(&mut first, self.remove_endpoint_ref(hal, key, link.vni));
        }
        self.holders.retain(|(i, _)| *i != ifindex);
        for requests in self.pending.values_mut() {
            requests.retain(|vni| *vni != link.vni);
        }
        self.pending.retain(|_, requests| !requests.is_empty());

        let released = self.tenants.release(&link.vni, |_, tenant| {
            hal.tunnel_tenant_delete(*tenant).hal("tunnel_tenant_delete")
        });
        match released {
            Ok(r) if r.is_destroyed() => {
                audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "VxlanEngine", "remove_tenant")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(link.tenant.to_string())
                    .with_object_type("tunnel_tenant")
                    .with_details(serde_json::json!({ "vni": link.vni })));
            }
            Ok(_) => {}
            Err(e) => first_error(&mut first, Err(e)),
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Applies a VXLAN link's unknown-unicast flood flag to its endpoints.
    pub fn set_link_flooding(&mut self, hal: &mut dyn SwitchHal, ifindex: u32, flood: bool) -> SyncResult<()> {
        let Some(link) = self.links.get_mut(&ifindex) else {
            return Ok(());
        };
        if link.flood == flood {
            return Ok(());
        }
        link.flood = flood;
        let (vni, tenant) = (link.vni, link.tenant);
        let lports: Vec<PortId> = self
            .vni_refs
            .keys()
            .filter(|(_, v)| *v == vni)
            .filter_map(|(key, _)| self.endpoints.get(key).map(|e| e.lport))
            .collect();
        for lport in lports {
            if flood {
                self.flood_add(hal, tenant, lport)?;
            } else {
                self.flood_remove(hal, tenant, lport)?;
            }
        }
        Ok(())
    }

    /// Applies a bridge port's flood flag to its access ports.
    pub fn set_access_flooding(&mut self, hal: &mut dyn SwitchHal, port: PortId, flood: bool) -> SyncResult<()> {
        let targets: Vec<(VlanId, TenantId, PortId)> = self
            .access
            .iter()
            .filter(|((p, _), a)| *p == port && a.flood != flood)
            .map(|((_, v), a)| (*v, a.tenant, a.lport))
            .collect();
        for (vid, tenant, lport) in targets {
            if flood {
                self.flood_add(hal, tenant, lport)?;
            } else {
                self.flood_remove(hal, tenant, lport)?;
            }
            if let Some(a) = self.access.get_mut(&(port, vid)) {
                a.flood = flood;
            }
        }
        Ok(())
    }

    fn endpoint_key(&self, entry: &FdbEntry) -> SyncResult<(EndpointKey, u32)> {
        let link = self
            .links
            .get(&entry.ifindex)
            .ok_or_else(|| SyncError::unresolved(format!("vxlan link ifindex {}", entry.ifindex)))?;
        let remote = match entry.dst {
            Some(IpAddr::V4(v4)) => v4,
            Some(IpAddr::V6(v6)) => {
                return Err(SyncError::unsupported(format!("IPv6 tunnel endpoint {}", v6)))
            }
            None => {
                return Err(SyncError::inconsistent(format!(
                    "vxlan fdb {} without remote",
                    entry.mac
                )))
            }
        };
        let local = link.local.ok_or_else(|| {
            SyncError::unsupported(format!("vxlan link ifindex {} without local address", entry.ifindex))
        })?;
        Ok((
            EndpointKey {
                local,
                remote,
                udp_port: link.udp_port,
            },
            link.vni,
        ))
    }

    /// FDB entry on a VXLAN link: a zero MAC requests an endpoint for the
    /// link's VNI, any other MAC is an overlay address behind the remote.
    pub fn add_fdb(&mut self, hal: &mut dyn SwitchHal, entry: &FdbEntry) -> SyncResult<()> {
        let (key, vni) = self.endpoint_key(entry)?;
        if entry.mac.is_zero() {
            let holder = (entry.ifindex, key.remote);
            if self.holders.contains(&holder) {
                debug!("VxlanEngine: ifindex {} already holds endpoint {}", entry.ifindex, key.remote);
                return Ok(());
            }
            let result = self.add_endpoint_ref(hal, key, vni);
            if matches!(result, Ok(()) | Err(SyncError::Unresolved { .. })) {
                self.holders.insert(holder);
            }
            result
        } else {
            self.add_overlay(hal, entry.ifindex, key, entry.mac, !entry.ext_learned)
        }
    }

    pub fn remove_fdb(&mut self, hal: &mut dyn SwitchHal, entry: &FdbEntry) -> SyncResult<()> {
        let (key, vni) = self.endpoint_key(entry)?;
        if entry.mac.is_zero() {
            if !self.holders.remove(&(entry.ifindex, key.remote)) {
                debug!("VxlanEngine: ifindex {} holds no endpoint {}", entry.ifindex, key.remote);
                return Ok(());
            }
            self.remove_endpoint_ref(hal, key, vni)
        } else {
            self.remove_overlay(hal, entry.ifindex, entry.mac, key.remote)
        }
    }

    fn add_endpoint_ref(&mut self, hal: &mut dyn SwitchHal, key: EndpointKey, vni: u32) -> SyncResult<()> {
        if let Some(endpoint) = self.endpoints.get(&key).copied() {
            self.endpoints.acquire(&key, |_| Ok::<_, SyncError>(endpoint))?;
            if let Err(e) = self.attach_vni(hal, key, endpoint.lport, vni) {
                self.release_endpoint(hal, key)?;
                return Err(e);
            }
            return Ok(());
        }

        self.pending.entry(key).or_default().push(vni);
        if self.in_flight.insert(key.remote) {
            debug!("VxlanEngine: looking up route to {}", key.remote);
            self.lookups.push(IpAddr::V4(key.remote));
            self.stats.lookups_issued += 1;
        }
        Err(SyncError::unresolved(format!("route to tunnel remote {}", key.remote)))
    }

    fn remove_endpoint_ref(&mut self, hal: &mut dyn SwitchHal, key: EndpointKey, vni: u32) -> SyncResult<()> {
        if let Some(requests) = self.pending.get_mut(&key) {
            if let Some(pos) = requests.iter().position(|v| *v == vni) {
                requests.remove(pos);
                if requests.is_empty() {
                    self.pending.remove(&key);
                }
                if !self.pending.keys().any(|k| k.remote == key.remote) {
                    self.route_waits.cancel_where(|r| *r == key.remote);
                    self.in_flight.remove(&key.remote);
                }
                debug!("VxlanEngine: cancelled pending endpoint {} vni {}", key.remote, vni);
                return Ok(());
            }
        }

        let Some(endpoint) = self.endpoints.get(&key).copied() else {
            debug!("VxlanEngine: no endpoint for {}", key.remote);
            return Ok(());
        };
        let detached = self.detach_vni(hal, key, endpoint.lport, vni);
        let released = self.release_endpoint(hal, key);
        detached.and(released)
    }

    fn attach_vni(&mut self, hal: &mut dyn SwitchHal, key: EndpointKey, lport: PortId, vni: u32) -> SyncResult<()> {
        let count = self.vni_refs.get(&(key, vni)).copied().unwrap_or(0);
        if count == 0 {
            let (tenant, flood) = self
                .links
                .values()
                .find(|l| l.vni == vni)
                .map(|l| (l.tenant, l.flood))
                .ok_or_else(|| SyncError::unresolved(format!("vxlan link for vni {}", vni)))?;
            hal.tunnel_port_tenant_add(lport, tenant)
                .hal("tunnel_port_tenant_add")?;
            if flood {
                if let Err(e) = self.flood_add(hal, tenant, lport) {
                    unwind_failed(
                        "tunnel_port_tenant_remove",
                        hal.tunnel_port_tenant_remove(lport, tenant),
                    );
                    return Err(e);
                }
            }
        }
        self.vni_refs.insert((key, vni), count + 1);
        Ok(())
    }

    fn detach_vni(&mut self, hal: &mut dyn SwitchHal, key: EndpointKey, lport: PortId, vni: u32) -> SyncResult<()> {
        let Some(count) = self.vni_refs.get_mut(&(key, vni)) else {
            return Ok(());
        };
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }
        self.vni_refs.remove(&(key, vni));
        let Some(tenant) = self.tenants.get(&vni).copied() else {
            return Ok(());
        };
        let flood = self.flood_remove(hal, tenant, lport);
        let membership = hal
            .tunnel_port_tenant_remove(lport, tenant)
            .hal("tunnel_port_tenant_remove");
        flood.and(membership)
    }

    /// Drops one endpoint reference; the last one deletes the tunnel port and
    /// releases its next hop.
    fn release_endpoint(&mut self, hal: &mut dyn SwitchHal, key: EndpointKey) -> SyncResult<()> {
        let mut gone = None;
        let released = self.endpoints.release(&key, |_, endpoint| {
            gone = Some(*endpoint);
            hal.tunnel_port_delete(endpoint.lport).hal("tunnel_port_delete")
        });
        if let Some(endpoint) = gone {
            self.vni_refs.retain(|(k, _), _| *k != key);
            self.floods.retain(|(_, lport)| *lport != endpoint.lport);
            self.release_next_hop(hal, &endpoint.next_hop)?;
            self.stats.endpoints_removed += 1;
            audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "VxlanEngine", "remove_endpoint")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(endpoint.lport.to_string())
                .with_object_type("tunnel_endpoint")
                .with_details(serde_json::json!({
                    "remote": key.remote.to_string(),
                    "local": key.local.to_string(),
                })));
        }
        released.map(|_| ())
    }

    fn release_next_hop(&mut self, hal: &mut dyn SwitchHal, key: &TunnelNhKey) -> SyncResult<()> {
        self.next_hops
            .release(key, |_, id| {
                hal.tunnel_next_hop_delete(*id).hal("tunnel_next_hop_delete")
            })
            .map(|_| ())
    }

    /// Route lookups issued since the last call.
    pub fn take_lookups(&mut self) -> Vec<IpAddr> {
        std::mem::take(&mut self.lookups)
    }

    /// Re-issues the lookups whose route or neighbour became available.
    pub fn fire_route_waits(&mut self) -> usize {
        let mut issued = 0;
        for sub in self.route_waits.take_ready() {
            let remote = sub.payload;
            if self.pending.keys().any(|k| k.remote == remote) && self.in_flight.insert(remote) {
                self.lookups.push(IpAddr::V4(remote));
                self.stats.lookups_issued += 1;
                issued += 1;
            }
        }
        issued
    }

    pub fn has_ready_waits(&self) -> bool {
        self.route_waits.has_ready()
    }

    pub fn satisfy_route(&mut self, prefix: &IpPrefix) -> usize {
        self.route_waits.satisfy_route(prefix)
    }

    pub fn satisfy_neighbor(&mut self, addr: IpAddr, ifindex: u32) -> usize {
        self.route_waits
            .satisfy(&ReachTarget::Neighbor { addr, ifindex })
    }

    fn wait_for(&mut self, target: ReachTarget, remote: Ipv4Addr) {
        if !self.route_waits.waiting().any(|s| s.payload == remote && s.target == target) {
            self.route_waits.subscribe(target, remote);
        }
    }

    /// Answer to a route lookup for a tunnel remote.
    pub fn on_route_resolved(
        &mut self,
        hal: &mut dyn SwitchHal,
        topo: Topology<'_>,
        dst: IpAddr,
        route: Option<&Route>,
    ) -> SyncResult<()> {
        let IpAddr::V4(remote) = dst else {
            return Ok(());
        };
        self.in_flight.remove(&remote);
        let keys: Vec<EndpointKey> = self
            .pending
            .keys()
            .filter(|k| k.remote == remote)
            .copied()
            .collect();
        if keys.is_empty() {
            debug!("VxlanEngine: stale lookup result for {}", remote);
            return Ok(());
        }

        // the lookup can miss a route the kernel already announced
        let route = route.or_else(|| topo.cache.lookup_route(&dst));
        let Some(nh) = route.and_then(|r| r.next_hops.first()) else {
            self.wait_for(ReachTarget::Route { dst }, remote);
            return Err(SyncError::unresolved(format!("route to tunnel remote {}", remote)));
        };
        let gateway = nh.gateway.unwrap_or(dst);
        let lladdr = topo
            .cache
            .neigh(nh.ifindex, &gateway)
            .filter(|n| n.is_resolved())
            .and_then(|n| n.lladdr);
        let Some(lladdr) = lladdr else {
            self.wait_for(
                ReachTarget::Neighbor {
                    addr: gateway,
                    ifindex: nh.ifindex,
                },
                remote,
            );
            return Err(SyncError::unresolved(format!(
                "neighbor {} for tunnel remote {}",
                gateway, remote
            )));
        };
        let link = topo
            .link(nh.ifindex)
            .ok_or_else(|| SyncError::unresolved(format!("link ifindex {}", nh.ifindex)))?;
        let port = match topo.l3_port(nh.ifindex) {
            Some(L3Port::Port { port, .. }) => port,
            Some(L3Port::Svi { vid, .. }) => topo
                .cache
                .fdb_lookup(vid, lladdr)
                .and_then(|e| topo.port_of(e.ifindex))
                .ok_or_else(|| SyncError::unresolved(format!("bridge port of {}", lladdr)))?,
            Some(L3Port::Stacked { .. }) => {
                return Err(SyncError::unsupported(format!(
                    "tunnel underlay over stacked vlan {}",
                    link.name
                )))
            }
            None => {
                return Err(SyncError::unsupported(format!(
                    "tunnel underlay over {} which is not switch-managed",
                    link.name
                )))
            }
        };
        let nh_key = TunnelNhKey {
            src: link.mac,
            dst: lladdr,
            port,
            vid: VlanId::DEFAULT,
        };

        let mut first = None;
        for key in keys {
            let Some(vnis) = self.pending.remove(&key) else {
                continue;
            };
            let result = self.create_endpoint(hal, topo.cache, key, nh_key, vnis.clone());
            if !self.endpoints.contains(&key) {
                self.forget_holders(remote, &vnis);
            }
            first_error(&mut first, result);
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drops the holders of requests that ended without an endpoint.
    fn forget_holders(&mut self, remote: Ipv4Addr, vnis: &[u32]) {
        let links: BTreeSet<u32> = self
            .links
            .iter()
            .filter(|(_, l)| vnis.contains(&l.vni))
            .map(|(ifindex, _)| *ifindex)
            .collect();
        self.holders
            .retain(|(ifindex, r)| *r != remote || !links.contains(ifindex));
    }

    fn create_endpoint(
        &mut self,
        hal: &mut dyn SwitchHal,
        cache: &KernelCache,
        key: EndpointKey,
        nh_key: TunnelNhKey,
        vnis: Vec<u32>,
    ) -> SyncResult<()> {
        let next_hop = self.next_hops.acquire(&nh_key, |k| {
            hal.tunnel_next_hop_create(k.src, k.dst, k.port, k.vid)
                .hal("tunnel_next_hop_create")
        })?;
        let lport = match self.allocate_lport() {
            Ok(lport) => lport,
            Err(e) => {
                unwind_failed("release_next_hop", self.release_next_hop(hal, &nh_key));
                return Err(e);
            }
        };
        let spec = EndpointSpec {
            lport,
            name: format!("vxlan-{}", key.remote),
            remote: key.remote,
            local: key.local,
            ttl: self.ttl,
            next_hop,
            udp_dst_port: key.udp_port,
        };
        if let Err(e) = hal.tunnel_endpoint_create(&spec) {
            unwind_failed("release_next_hop", self.release_next_hop(hal, &nh_key));
            return Err(SyncError::hardware("tunnel_endpoint_create", e));
        }

        let endpoint = Endpoint { lport, next_hop: nh_key };
        for (i, vni) in vnis.iter().enumerate() {
            self.endpoints.acquire(&key, |_| Ok::<_, SyncError>(endpoint))?;
            if let Err(e) = self.attach_vni(hal, key, lport, *vni) {
                // unwind: drop every reference taken so far, the last one
                // deletes the port and the next hop
                for v in &vnis[..i] {
                    unwind_failed("detach_vni", self.detach_vni(hal, key, lport, *v));
                }
                for _ in 0..=i {
                    unwind_failed("release_endpoint", self.release_endpoint(hal, key));
                }
                return Err(e);
            }
        }
        self.stats.endpoints_created += 1;
        info!(
            "VxlanEngine: endpoint {} -> {} on {} ({} vni refs)",
            key.local,
            key.remote,
            lport,
            vnis.len()
        );
        audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "VxlanEngine", "create_endpoint")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(lport.to_string())
            .with_object_type("tunnel_endpoint")
            .with_details(serde_json::json!({
                "remote": key.remote.to_string(),
                "local": key.local.to_string(),
                "udp_port": key.udp_port,
                "next_hop": next_hop.as_raw(),
            })));

        // overlay addresses that arrived before the endpoint existed
        let links: Vec<u32> = self
            .links
            .iter()
            .filter(|(_, l)| vnis.contains(&l.vni))
            .map(|(ifindex, _)| *ifindex)
            .collect();
        let mut first = None;
        for ifindex in links {
            let replay: Vec<FdbEntry> = cache
                .fdb_towards(ifindex, IpAddr::V4(key.remote))
                .cloned()
                .collect();
            for entry in replay {
                first_error(
                    &mut first,
                    self.add_overlay(hal, ifindex, key, entry.mac, !entry.ext_learned),
                );
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn add_overlay(
        &mut self,
        hal: &mut dyn SwitchHal,
        ifindex: u32,
        key: EndpointKey,
        mac: MacAddress,
        permanent: bool,
    ) -> SyncResult<()> {
        let tenant = self
            .links
            .get(&ifindex)
            .map(|l| l.tenant)
            .ok_or_else(|| SyncError::unresolved(format!("vxlan link ifindex {}", ifindex)))?;
        let Some(endpoint) = self.endpoints.get(&key).copied() else {
            return Err(SyncError::unresolved(format!("endpoint for {}", key.remote)));
        };

        let overlay_key = (ifindex, mac, key.remote);
        if let Some(existing) = self.overlay.get(&overlay_key).copied() {
            if existing.permanent == permanent {
                debug!("VxlanEngine: overlay {} via {} already programmed", mac, key.remote);
                return Ok(());
            }
            hal.l2_overlay_addr_add(tenant, endpoint.lport, mac, permanent)
                .hal("l2_overlay_addr_add")?;
            self.overlay.insert(overlay_key, OverlayRef { permanent, ..existing });
            return Ok(());
        }

        self.endpoints.acquire(&key, |_| Ok::<_, SyncError>(endpoint))?;
        if let Err(e) = hal.l2_overlay_addr_add(tenant, endpoint.lport, mac, permanent) {
            self.release_endpoint(hal, key)?;
            return Err(SyncError::hardware("l2_overlay_addr_add", e));
        }
        self.overlay.insert(
            overlay_key,
            OverlayRef {
                tenant,
                endpoint: key,
                permanent,
            },
        );
        Ok(())
    }

    fn remove_overlay(
        &mut self,
        hal: &mut dyn SwitchHal,
        ifindex: u32,
        mac: MacAddress,
        remote: Ipv4Addr,
    ) -> SyncResult<()> {
        let Some(overlay) = self.overlay.remove(&(ifindex, mac, remote)) else {
            debug!("VxlanEngine: overlay {} via {} not programmed", mac, remote);
            return Ok(());
        };
        let removed = match self.endpoints.get(&overlay.endpoint) {
            Some(endpoint) => hal
                .l2_overlay_addr_remove(overlay.tenant, endpoint.lport, mac)
                .hal("l2_overlay_addr_remove"),
            None => Ok(()),
        };
        let released = self.release_endpoint(hal, overlay.endpoint);
        removed.and(released)
    }

    /// Converts (port, vid) into a tunnel access port of `req.tenant`.
    pub fn create_access_port(
        &mut self,
        hal: &mut dyn SwitchHal,
        vlans: &mut VlanProgrammer,
        bonds: &BondManager,
        req: AccessPortRequest,
    ) -> SyncResult<()> {
        if self.access.contains_key(&(req.port, req.vid)) {
            return Err(SyncError::inconsistent(format!(
                "access port for {} vlan {} already exists",
                req.port, req.vid
            )));
        }
        vlans.remove_bridge_vlan(hal, bonds, req.port, req.vid)?;

        let lport = self.allocate_lport()?;
        let spec = AccessPortSpec {
            lport,
            name: format!("{}.{}", req.name, req.vid),
            port: req.port,
            vid: req.vid,
            untagged: req.untagged,
        };
        hal.tunnel_access_port_create(&spec)
            .hal("tunnel_access_port_create")?;
        if let Err(e) = hal.tunnel_port_tenant_add(lport, req.tenant) {
            unwind_failed("tunnel_port_delete", hal.tunnel_port_delete(lport));
            return Err(SyncError::hardware("tunnel_port_tenant_add", e));
        }
        if req.flood {
            if let Err(e) = self.flood_add(hal, req.tenant, lport) {
                unwind_failed(
                    "tunnel_port_tenant_remove",
                    hal.tunnel_port_tenant_remove(lport, req.tenant),
                );
                unwind_failed("tunnel_port_delete", hal.tunnel_port_delete(lport));
                return Err(e);
            }
        }

        let mut access = AccessPort {
            lport,
            tenant: req.tenant,
            untagged: req.untagged,
            flood: req.flood,
            macs: BTreeSet::new(),
        };
        for (mac, permanent) in &req.replay {
            match hal.l2_overlay_addr_add(req.tenant, lport, *mac, *permanent) {
                Ok(()) => {
                    access.macs.insert(*mac);
                }
                Err(e) => warn!("VxlanEngine: cannot replay {} onto {}: {}", mac, lport, e),
            }
        }
        self.access.insert((req.port, req.vid), access);
        self.stats.access_ports_created += 1;
        info!(
            "VxlanEngine: {} vlan {} is access port {} of {}",
            req.port, req.vid, lport, req.tenant
        );
        audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "VxlanEngine", "create_access_port")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(lport.to_string())
            .with_object_type("tunnel_access_port")
            .with_details(serde_json::json!({
                "port": req.port.to_string(),
                "vid": req.vid.as_u16(),
                "tenant": req.tenant.as_raw(),
                "untagged": req.untagged,
                "replayed": req.replay.len(),
            })));
        Ok(())
    }

    /// Tears down the access port of (port, vid). With `wipe` every overlay
    /// address it holds is removed in one call.
    pub fn delete_access_port(
        &mut self,
        hal: &mut dyn SwitchHal,
        port: PortId,
        vid: VlanId,
        wipe: bool,
    ) -> SyncResult<()> {
        let Some(access) = self.access.remove(&(port, vid)) else {
            return Ok(());
        };
        let mut first = None;
        if wipe {
            first_error(
                &mut first,
                hal.l2_overlay_addr_remove(access.tenant, access.lport, MacAddress::BROADCAST)
                    .hal("l2_overlay_addr_remove"),
            );
        }
        let flood = self.flood_remove(hal, access.tenant, access.lport);
        first_error(&mut first, flood);
        first_error(
            &mut first,
            hal.tunnel_port_tenant_remove(access.lport, access.tenant)
                .hal("tunnel_port_tenant_remove"),
        );
        first_error(
            &mut first,
            hal.tunnel_port_delete(access.lport).hal("tunnel_port_delete"),
        );
        self.stats.access_ports_removed += 1;
        info!("VxlanEngine: removed access port {} ({} vlan {})", access.lport, port, vid);
        audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "VxlanEngine", "remove_access_port")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(access.lport.to_string())
            .with_object_type("tunnel_access_port"));
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Bridge FDB entry on an access port. Returns `false` when (port, vid)
    /// is not an access port.
    pub fn add_access_overlay(
        &mut self,
        hal: &mut dyn SwitchHal,
        port: PortId,
        vid: VlanId,
        mac: MacAddress,
        permanent: bool,
    ) -> SyncResult<bool> {
        let Some(access) = self.access.get_mut(&(port, vid)) else {
            return Ok(false);
        };
        if access.macs.contains(&mac) {
            return Ok(true);
        }
        hal.l2_overlay_addr_add(access.tenant, access.lport, mac, permanent)
            .hal("l2_overlay_addr_add")?;
        access.macs.insert(mac);
        Ok(true)
    }

    pub fn remove_access_overlay(
        &mut self,
        hal: &mut dyn SwitchHal,
        port: PortId,
        vid: VlanId,
        mac: MacAddress,
    ) -> SyncResult<bool> {
        let Some(access) = self.access.get_mut(&(port, vid)) else {
            return Ok(false);
        };
        if access.macs.remove(&mac) {
            hal.l2_overlay_addr_remove(access.tenant, access.lport, mac)
                .hal("l2_overlay_addr_remove")?;
        }
        Ok(true)
    }

    /// Re-points tunnel next hops through `port` whose neighbour moved from
    /// `old` to `new`.
    pub fn neigh_changed(
        &mut self,
        hal: &mut dyn SwitchHal,
        port: PortId,
        old: MacAddress,
        new: MacAddress,
    ) -> SyncResult<()> {
        for key in self.next_hops.keys_where(|k, _| k.port == port && k.dst == old) {
            let Some(id) = self.next_hops.get(&key).copied() else {
                continue;
            };
            let moved = TunnelNhKey { dst: new, ..key };
            hal.tunnel_next_hop_modify(id, moved.src, moved.dst, moved.port, moved.vid)
                .hal("tunnel_next_hop_modify")?;
            if !self.next_hops.rekey(&key, moved) {
                warn!("VxlanEngine: next hop {:?} already live, keeping old key", moved);
                continue;
            }
            for endpoint in self.endpoints.keys_where(|_, e| e.next_hop == key) {
                if let Some(e) = self.endpoints.get_mut(&endpoint) {
                    e.next_hop = moved;
                }
            }
        }
        Ok(())
    }

    /// Forgets all state without touching the hardware.
    pub fn clear(&mut self) {
        self.links.clear();
        self.tenants.drain();
        self.next_tenant = FIRST_TENANT_ID;
        self.next_lport = 1;
        self.next_hops.drain();
        self.endpoints.drain();
        self.vni_refs.clear();
        self.holders.clear();
        self.pending.clear();
        self.in_flight.clear();
        self.lookups.clear();
        self.route_waits.clear();
        self.overlay.clear();
        self.access.clear();
        self.floods.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{BridgePortInfo, Neigh, NeighState, NextHop, RouteKind, RouteScope};
    use pretty_assertions::assert_eq;
    use swsync_hal::{HalCall, SimTunnelPort, SimulatedSwitch};

    const REMOTE: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 5);
    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

    fn link(ifindex: u32, kind: LinkKind) -> Link {
        Link {
            ifindex,
            name: format!("if{}", ifindex),
            kind,
            mac: MacAddress::new([2, 0, 0, 0, 0, ifindex as u8]),
            master: None,
            lower: None,
            admin_up: true,
            mtu: None,
            slave: None,
            bridge: None,
        }
    }

    fn vxlan(ifindex: u32, vni: u32) -> Link {
        let mut l = link(
            ifindex,
            LinkKind::Vxlan {
                vni,
                local: Some(IpAddr::V4(LOCAL)),
                group: None,
                dst_port: None,
            },
        );
        l.bridge = Some(BridgePortInfo::default());
        l
    }

    fn fdb(ifindex: u32, mac: MacAddress) -> FdbEntry {
        FdbEntry {
            ifindex,
            mac,
            vlan: None,
            dst: Some(IpAddr::V4(REMOTE)),
            master: None,
            ext_learned: false,
        }
    }

    /// Underlay: swp1 (ifindex 1) with a resolved gateway 10.0.0.1.
    fn underlay() -> (KernelCache, Route) {
        let mut cache = KernelCache::new();
        cache.upsert(link(1, LinkKind::SwitchPort { port: 1 }));
        cache.upsert(Neigh {
            ifindex: 1,
            dst: "10.0.0.1".parse().unwrap(),
            lladdr: Some("aa:bb:cc:dd:ee:01".parse().unwrap()),
            state: NeighState::Reachable,
        });
        let route = Route {
            table: 254,
            dst: "203.0.113.0/24".parse().unwrap(),
            kind: RouteKind::Unicast,
            scope: RouteScope::Universe,
            next_hops: vec![NextHop {
                gateway: Some("10.0.0.1".parse().unwrap()),
                ifindex: 1,
            }],
        };
        (cache, route)
    }

    fn key() -> EndpointKey {
        EndpointKey {
            local: LOCAL,
            remote: REMOTE,
            udp_port: DEFAULT_UDP_PORT,
        }
    }

    #[test]
    fn test_endpoint_shared_by_two_vnis() {
        let mut sw = SimulatedSwitch::new();
        let mut vx = VxlanEngine::default();
        let bonds = BondManager::new();
        let (cache, route) = underlay();

        vx.add_link(&mut sw, &vxlan(100, 100)).unwrap();
        vx.add_link(&mut sw, &vxlan(200, 200)).unwrap();
        assert_eq!(vx.tenant_of_vni(100).unwrap().as_raw(), 10);
        assert_eq!(vx.tenant_of_vni(200).unwrap().as_raw(), 11);

        let e1 = vx.add_fdb(&mut sw, &fdb(100, MacAddress::ZERO)).unwrap_err();
        assert!(matches!(e1, SyncError::Unresolved { .. }));
        let _ = vx.add_fdb(&mut sw, &fdb(200, MacAddress::ZERO));
        // one lookup serves both VNIs
        assert_eq!(vx.take_lookups(), vec![IpAddr::V4(REMOTE)]);

        let topo = Topology::new(&cache, &bonds, None);
        vx.on_route_resolved(&mut sw, topo, IpAddr::V4(REMOTE), Some(&route))
            .unwrap();

        assert_eq!(vx.endpoint_count(), 1);
        assert_eq!(vx.next_hop_count(), 1);
        assert_eq!(vx.endpoint_refcount(&key()), 2);
        let lport = vx.endpoint(&key()).unwrap().lport;
        assert_eq!(lport.as_raw(), (1 << 16) | 1);
        match sw.tunnel_ports.get(&lport) {
            Some(SimTunnelPort::Endpoint(spec)) => {
                assert_eq!(spec.ttl, 45);
                assert_eq!(spec.udp_dst_port, 4789);
                assert_eq!(spec.remote, REMOTE);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sw.port_tenants.len(), 2);
        assert_eq!(sw.floods.len(), 2);

        vx.remove_fdb(&mut sw, &fdb(100, MacAddress::ZERO)).unwrap();
        assert_eq!(vx.endpoint_refcount(&key()), 1);
        assert_eq!(sw.port_tenants.len(), 1);
        assert!(sw.tunnel_ports.contains_key(&lport));

        vx.remove_fdb(&mut sw, &fdb(200, MacAddress::ZERO)).unwrap();
        assert!(sw.tunnel_ports.is_empty());
        assert!(sw.tunnel_next_hops.is_empty());
        assert_eq!(vx.endpoint_count(), 0);
    }

    #[test]
    fn test_no_route_subscribes_and_retries() {
        let mut sw = SimulatedSwitch::new();
        let mut vx = VxlanEngine::default();
        let bonds = BondManager::new();
        let (cache, route) = underlay();
        vx.add_link(&mut sw, &vxlan(100, 100)).unwrap();
        let _ = vx.add_fdb(&mut sw, &fdb(100, MacAddress::ZERO));
        vx.take_lookups();

        let topo = Topology::new(&cache, &bonds, None);
        let err = vx
            .on_route_resolved(&mut sw, topo, IpAddr::V4(REMOTE), None)
            .unwrap_err();
        assert!(matches!(err, SyncError::Unresolved { .. }));
        assert!(vx.is_pending(&key()));

        assert_eq!(vx.satisfy_route(&route.dst), 1);
        assert_eq!(vx.fire_route_waits(), 1);
        assert_eq!(vx.take_lookups(), vec![IpAddr::V4(REMOTE)]);
        vx.on_route_resolved(&mut sw, topo, IpAddr::V4(REMOTE), Some(&route))
            .unwrap();
        assert!(!vx.is_pending(&key()));
        assert_eq!(vx.endpoint_count(), 1);
    }

    #[test]
    fn test_repeated_tunnel_entry_holds_one_reference() {
        let mut sw = SimulatedSwitch::new();
        let mut vx = VxlanEngine::default();
        let bonds = BondManager::new();
        let (cache, route) = underlay();
        vx.add_link(&mut sw, &vxlan(100, 100)).unwrap();

        // repeated while the lookup is outstanding
        let _ = vx.add_fdb(&mut sw, &fdb(100, MacAddress::ZERO));
        vx.add_fdb(&mut sw, &fdb(100, MacAddress::ZERO)).unwrap();
        assert_eq!(vx.take_lookups().len(), 1);

        let topo = Topology::new(&cache, &bonds, None);
        vx.on_route_resolved(&mut sw, topo, IpAddr::V4(REMOTE), Some(&route))
            .unwrap();
        assert_eq!(vx.endpoint_refcount(&key()), 1);

        // and again once the endpoint exists
        let calls = sw.calls().len();
        vx.add_fdb(&mut sw, &fdb(100, MacAddress::ZERO)).unwrap();
        assert_eq!(vx.endpoint_refcount(&key()), 1);
        assert_eq!(sw.calls().len(), calls);

        vx.remove_fdb(&mut sw, &fdb(100, MacAddress::ZERO)).unwrap();
        assert_eq!(vx.endpoint_count(), 0);
        assert_eq!(vx.next_hop_count(), 0);
        assert!(sw.tunnel_ports.is_empty());
        assert!(sw.port_tenants.is_empty());

        // a second delete has nothing left to release
        vx.remove_fdb(&mut sw, &fdb(100, MacAddress::ZERO)).unwrap();
        assert_eq!(
            sw.count_calls(|c| matches!(c, HalCall::TunnelPortDelete { .. })),
            1
        );
    }

    #[test]
    fn test_missed_lookup_uses_mirrored_route() {
        let mut sw = SimulatedSwitch::new();
        let mut vx = VxlanEngine::default();
        let bonds = BondManager::new();
        let (mut cache, route) = underlay();
        cache.upsert(route);
        vx.add_link(&mut sw, &vxlan(100, 100)).unwrap();
        let _ = vx.add_fdb(&mut sw, &fdb(100, MacAddress::ZERO));
        vx.take_lookups();

        let topo = Topology::new(&cache, &bonds, None);
        vx.on_route_resolved(&mut sw, topo, IpAddr::V4(REMOTE), None)
            .unwrap();
        assert!(!vx.is_pending(&key()));
        assert_eq!(vx.endpoint_count(), 1);
        assert!(!vx.has_ready_waits());
    }

    #[test]
    fn test_pending_request_is_cancelled() {
        let mut sw = SimulatedSwitch::new();
        let mut vx = VxlanEngine::default();
        vx.add_link(&mut sw, &vxlan(100, 100)).unwrap();
        let _ = vx.add_fdb(&mut sw, &fdb(100, MacAddress::ZERO));
        vx.remove_fdb(&mut sw, &fdb(100, MacAddress::ZERO)).unwrap();
        assert!(!vx.is_pending(&key()));
        assert_eq!(
            sw.count_calls(|c| matches!(c, HalCall::EndpointCreate(_))),
            0
        );
    }

    #[test]
    fn test_overlay_holds_endpoint_and_is_replayed() {
        let mut sw = SimulatedSwitch::new();
        let mut vx = VxlanEngine::default();
        let bonds = BondManager::new();
        let (mut cache, route) = underlay();
        vx.add_link(&mut sw, &vxlan(100, 100)).unwrap();

        let mac: MacAddress = "02:aa:00:00:00:01".parse().unwrap();
        // overlay before the endpoint exists
        cache.upsert(fdb(100, mac));
        assert!(vx.add_fdb(&mut sw, &fdb(100, mac)).is_err());
        let _ = vx.add_fdb(&mut sw, &fdb(100, MacAddress::ZERO));

        let topo = Topology::new(&cache, &bonds, None);
        vx.on_route_resolved(&mut sw, topo, IpAddr::V4(REMOTE), Some(&route))
            .unwrap();
        let lport = vx.endpoint(&key()).unwrap().lport;
        let tenant = vx.tenant_of_vni(100).unwrap();
        assert_eq!(sw.overlay_addrs.get(&(tenant, lport, mac)), Some(&true));
        assert_eq!(vx.endpoint_refcount(&key()), 2);

        // the zero entry goes first; the overlay keeps the endpoint alive
        vx.remove_fdb(&mut sw, &fdb(100, MacAddress::ZERO)).unwrap();
        assert!(sw.tunnel_ports.contains_key(&lport));
        vx.remove_fdb(&mut sw, &fdb(100, mac)).unwrap();
        assert!(sw.tunnel_ports.is_empty());
        assert!(sw.overlay_addrs.is_empty());
    }

    #[test]
    fn test_access_port_lifecycle() {
        let mut sw = SimulatedSwitch::new();
        let mut vx = VxlanEngine::default();
        let mut vlans = VlanProgrammer::new();
        let bonds = BondManager::new();
        vx.add_link(&mut sw, &vxlan(100, 100)).unwrap();
        let tenant = vx.tenant_of_vni(100).unwrap();
        let port = PortId::physical(2).unwrap();
        let vid = VlanId::new(50).unwrap();
        vlans
            .add_bridge_vlan(&mut sw, &bonds, port, vid, false, false)
            .unwrap();

        let mac: MacAddress = "02:bb:00:00:00:01".parse().unwrap();
        let req = AccessPortRequest {
            port,
            name: "swp2".into(),
            vid,
            tenant,
            untagged: false,
            flood: true,
            replay: vec![(mac, false)],
        };
        vx.create_access_port(&mut sw, &mut vlans, &bonds, req.clone())
            .unwrap();
        assert!(sw.bridge_egress_vlans.is_empty());
        let lport = vx.access_port(port, vid).unwrap().lport;
        assert!(matches!(
            sw.tunnel_ports.get(&lport),
            Some(SimTunnelPort::Access(spec)) if spec.name == "swp2.50"
        ));
        assert_eq!(sw.overlay_addrs.get(&(tenant, lport, mac)), Some(&false));

        let dup = vx
            .create_access_port(&mut sw, &mut vlans, &bonds, req)
            .unwrap_err();
        assert!(matches!(dup, SyncError::Inconsistent { .. }));

        vx.delete_access_port(&mut sw, port, vid, true).unwrap();
        assert!(sw.tunnel_ports.is_empty());
        assert!(sw.overlay_addrs.is_empty());
        assert!(sw.floods.is_empty());
        assert!(sw.port_tenants.is_empty());
    }

    #[test]
    fn test_failed_rollback_step_keeps_first_error() {
        let mut sw = SimulatedSwitch::new();
        let mut vx = VxlanEngine::default();
        let mut vlans = VlanProgrammer::new();
        let bonds = BondManager::new();
        vx.add_link(&mut sw, &vxlan(100, 100)).unwrap();
        let tenant = vx.tenant_of_vni(100).unwrap();
        let port = PortId::physical(2).unwrap();
        let vid = VlanId::new(50).unwrap();
        let req = AccessPortRequest {
            port,
            name: "swp2".into(),
            vid,
            tenant,
            untagged: false,
            flood: true,
            replay: Vec::new(),
        };

        sw.fail_next("tunnel_flood_add");
        sw.fail_next("tunnel_port_tenant_remove");
        let err = vx
            .create_access_port(&mut sw, &mut vlans, &bonds, req)
            .unwrap_err();
        assert!(matches!(err, SyncError::Hardware { op: "tunnel_flood_add", .. }));
        // the rollback went on past the failed step
        assert_eq!(
            sw.count_calls(|c| matches!(c, HalCall::TunnelPortDelete { .. })),
            1
        );
        assert!(sw.tunnel_ports.is_empty());
        assert!(vx.access_port(port, vid).is_none());
        assert!(vx.floods.is_empty());
    }

    #[test]
    fn test_remove_link_deletes_tenant() {
        let mut sw = SimulatedSwitch::new();
        let mut vx = VxlanEngine::default();
        vx.add_link(&mut sw, &vxlan(100, 100)).unwrap();
        vx.remove_link(&mut sw, 100).unwrap();
        assert!(sw.tenants.is_empty());
        assert!(vx.tenant_of_vni(100).is_none());
    }
}
