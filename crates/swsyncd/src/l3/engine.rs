//! Routing: termination MACs, neighbour rewrites, unicast routes and ECMP.
//!
//! Every hardware object is reached through a [`ResourcePool`], so routes
//! and neighbours that share an egress rewrite or a next-hop set share one
//! hardware object. Routes whose next hops are not resolved yet point at the
//! controller and park a subscription in `reachable`; resolved hops park one
//! in `unreachable`. [`L3Engine::fire_ready`] re-provisions the routes whose
//! subscriptions fired.

use super::types::{
    AddrState, EcmpKey, EgressKey, InstalledRoute, L3Stats, NeighEntry, NextHopKey, RouteKey,
    TerminationKey,
};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::kernel::{Addr, L3Port, LinkKind, Neigh, NeighState, Route, RouteKind, RouteScope, Topology};
use crate::vlan::VlanProgrammer;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use swsync_common::{
    HalResultExt, ReachTarget, ReachabilityRegistry, Release, ResourcePool, SyncError, SyncResult,
};
use swsync_hal::{EcmpId, EgressId, RouteTarget, SwitchHal};
use swsync_types::{is_link_local, IpPrefix, MacAddress, PortId};

/// What the L3 engine touches besides its own state.
pub struct L3Ctx<'a> {
    pub hal: &'a mut dyn SwitchHal,
    pub topo: Topology<'a>,
    pub vlans: &'a mut VlanProgrammer,
}

fn keep_first(first: &mut Option<SyncError>, result: SyncResult<()>) {
    if let Err(e) = result {
        warn!("L3Engine: {}", e);
        first.get_or_insert(e);
    }
}

fn first_or_ok(first: Option<SyncError>) -> SyncResult<()> {
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn hold_vlan(ctx: &mut L3Ctx<'_>, binding: L3Port) -> SyncResult<()> {
    match binding {
        L3Port::Port { port, vid, tagged } => {
            ctx.vlans.add_vlan(ctx.hal, ctx.topo.bonds, port, vid, tagged)
        }
        L3Port::Stacked { port, outer, inner } => {
            ctx.vlans.add_vlan(ctx.hal, ctx.topo.bonds, port, outer, true)?;
            if let Err(e) = ctx
                .vlans
                .add_stacked_vlan(ctx.hal, ctx.topo.bonds, port, outer, inner)
            {
                if let Err(u) = ctx.vlans.remove_vlan(ctx.hal, ctx.topo.bonds, port, outer) {
                    warn!("L3Engine: unwinding vlan {} on {}: {}", outer, port, u);
                }
                return Err(e);
            }
            Ok(())
        }
        L3Port::Svi { .. } => Ok(()),
    }
}

fn release_vlan(ctx: &mut L3Ctx<'_>, binding: L3Port) -> SyncResult<()> {
    match binding {
        L3Port::Port { port, vid, .. } => ctx.vlans.remove_vlan(ctx.hal, ctx.topo.bonds, port, vid),
        L3Port::Stacked { port, outer, inner } => {
            let mut first = None;
            keep_first(
                &mut first,
                ctx.vlans
                    .remove_stacked_vlan(ctx.hal, ctx.topo.bonds, port, outer, inner),
            );
            keep_first(
                &mut first,
                ctx.vlans.remove_vlan(ctx.hal, ctx.topo.bonds, port, outer),
            );
            first_or_ok(first)
        }
        L3Port::Svi { .. } => Ok(()),
    }
}

/// Host prefixes go to the host table, everything else to the route table.
fn write_route(
    hal: &mut dyn SwitchHal,
    key: RouteKey,
    target: RouteTarget,
    update: bool,
) -> SyncResult<()> {
    if key.prefix.is_host() {
        hal.l3_unicast_host_add(key.prefix.addr(), target, update, key.vrf)
            .hal("l3_unicast_host_add")
    } else {
        hal.l3_unicast_route_add(key.prefix, target, update, key.vrf)
            .hal("l3_unicast_route_add")
    }
}

fn erase_route(hal: &mut dyn SwitchHal, key: RouteKey) -> SyncResult<()> {
    if key.prefix.is_host() {
        hal.l3_unicast_host_remove(key.prefix.addr(), key.vrf)
            .hal("l3_unicast_host_remove")
    } else {
        hal.l3_unicast_route_remove(key.prefix, key.vrf)
            .hal("l3_unicast_route_remove")
    }
}

fn neighbor_target(nh: NextHopKey) -> ReachTarget {
    ReachTarget::Neighbor {
        addr: nh.addr,
        ifindex: nh.ifindex,
    }
}

#[derive(Debug)]
pub struct L3Engine {
    addrs: BTreeMap<(u32, IpPrefix), AddrState>,
    terminations: ResourcePool<TerminationKey, ()>,
    egresses: ResourcePool<EgressKey, EgressId>,
    /// Routed binding whose VLAN a live egress holds.
    egress_bindings: BTreeMap<EgressKey, L3Port>,
    ecmps: ResourcePool<EcmpKey, EcmpId>,
    /// Members last written to each group.
    ecmp_members: BTreeMap<EcmpId, Vec<EgressId>>,
    neighs: BTreeMap<NextHopKey, NeighEntry>,
    /// Neighbours outside every link-scope route of their link.
    unroutable: BTreeSet<NextHopKey>,
    /// SVI neighbours whose bridge port is not known yet.
    pending_l2: BTreeSet<NextHopKey>,
    routes: BTreeMap<RouteKey, InstalledRoute>,
    reachable: ReachabilityRegistry<RouteKey>,
    unreachable: ReachabilityRegistry<RouteKey>,
    stats: L3Stats,
}

impl Default for L3Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl L3Engine {
    pub fn new() -> Self {
        Self {
            addrs: BTreeMap::new(),
            terminations: ResourcePool::new("l3_termination"),
            egresses: ResourcePool::new("l3_egress"),
            egress_bindings: BTreeMap::new(),
            ecmps: ResourcePool::new("l3_ecmp"),
            ecmp_members: BTreeMap::new(),
            neighs: BTreeMap::new(),
            unroutable: BTreeSet::new(),
            pending_l2: BTreeSet::new(),
            routes: BTreeMap::new(),
            reachable: ReachabilityRegistry::new("l3_nh_reachable"),
            unreachable: ReachabilityRegistry::new("l3_nh_unreachable"),
            stats: L3Stats::default(),
        }
    }

    pub fn stats(&self) -> &L3Stats {
        &self.stats
    }

    pub fn neigh(&self, ifindex: u32, addr: IpAddr) -> Option<&NeighEntry> {
        self.neighs.get(&NextHopKey { addr, ifindex })
    }

    pub fn is_unroutable(&self, ifindex: u32, addr: IpAddr) -> bool {
        self.unroutable.contains(&NextHopKey { addr, ifindex })
    }

    pub fn is_pending_l2(&self, ifindex: u32, addr: IpAddr) -> bool {
        self.pending_l2.contains(&NextHopKey { addr, ifindex })
    }

    pub fn has_addr(&self, ifindex: u32, prefix: &IpPrefix) -> bool {
        self.addrs.contains_key(&(ifindex, *prefix))
    }

    pub fn route_target(&self, vrf: u32, prefix: &IpPrefix) -> Option<RouteTarget> {
        self.routes
            .get(&RouteKey {
                vrf,
                prefix: *prefix,
            })
            .map(|r| r.target)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn egress(&self, key: &EgressKey) -> Option<EgressId> {
        self.egresses.get(key).copied()
    }

    pub fn egress_refcount(&self, key: &EgressKey) -> u32 {
        self.egresses.refcount(key)
    }

    pub fn egress_count(&self) -> usize {
        self.egresses.len()
    }

    pub fn ecmp_count(&self) -> usize {
        self.ecmps.len()
    }

    pub fn termination_refcount(&self, key: &TerminationKey) -> u32 {
        self.terminations.refcount(key)
    }

    /// Routes waiting for a next hop to resolve.
    pub fn waiting_routes(&self) -> usize {
        self.reachable.waiting_len()
    }

    pub fn has_ready(&self) -> bool {
        self.reachable.has_ready() || self.unreachable.has_ready()
    }

    // ---- addresses ----

    pub fn add_addr(&mut self, ctx: &mut L3Ctx<'_>, addr: &Addr) -> SyncResult<()> {
        let id = (addr.ifindex, addr.prefix);
        if self.addrs.contains_key(&id) {
            return Ok(());
        }
        let link = ctx.topo.link(addr.ifindex).ok_or_else(|| {
            SyncError::unresolved(format!("link {} of address {}", addr.ifindex, addr.prefix))
        })?;
        let ip = addr.prefix.addr();
        let vrf = ctx.topo.vrf_of(addr.ifindex);

        if matches!(link.kind, LinkKind::Loopback) {
            if ip.is_loopback() {
                return Ok(());
            }
            ctx.hal
                .l3_unicast_host_add(ip, RouteTarget::Controller, false, vrf)
                .hal("l3_unicast_host_add")?;
            self.addrs.insert(
                id,
                AddrState {
                    binding: None,
                    termination: None,
                    host: true,
                    vrf,
                },
            );
            debug!("L3Engine: loopback address {} -> controller", addr.prefix);
            return Ok(());
        }

        let Some(binding) = ctx.topo.l3_port(addr.ifindex) else {
            debug!("L3Engine: ignoring address {} on {}", addr.prefix, link.name);
            return Ok(());
        };
        let name = link.name.clone();
        let mac = link.mac;

        let mut state = AddrState {
            binding: None,
            termination: None,
            host: false,
            vrf,
        };
        if !link.is_bridge() && !matches!(binding, L3Port::Svi { .. }) {
            hold_vlan(ctx, binding)?;
            state.binding = Some(binding);
        }

        let term = TerminationKey {
            port: binding.port(),
            vid: binding.vid(),
            mac,
            family: addr.prefix.family(),
        };
        let fresh = !self.terminations.contains(&term);
        let hal = &mut *ctx.hal;
        let added = self.terminations.acquire(&term, |t| {
            hal.l3_termination_add(t.port, t.vid, t.mac, t.family)
                .hal("l3_termination_add")
        });
        if let Err(e) = added {
            self.unwind_addr(ctx, ip, state);
            return Err(e);
        }
        state.termination = Some(term);
        if fresh {
            self.stats.terminations_added += 1;
            audit_log!(AuditRecord::new(AuditCategory::NetworkConfig, "L3Engine", "add_termination")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(name.clone())
                .with_object_type("l3_termination")
                .with_details(serde_json::json!({
                    "vid": term.vid.as_u16(),
                    "mac": term.mac.to_string(),
                    "family": format!("{:?}", term.family),
                })));
        }

        if addr.prefix.is_host() {
            if let Err(e) = ctx
                .hal
                .l3_unicast_host_add(ip, RouteTarget::Controller, false, vrf)
                .hal("l3_unicast_host_add")
            {
                self.unwind_addr(ctx, ip, state);
                return Err(e);
            }
            state.host = true;
        }

        self.addrs.insert(id, state);
        info!("L3Engine: address {} on {}", addr.prefix, name);
        Ok(())
    }

    fn unwind_addr(&mut self, ctx: &mut L3Ctx<'_>, ip: IpAddr, state: AddrState) {
        if let Err(e) = self.release_addr(ctx, ip, state) {
            warn!("L3Engine: unwinding address {}: {}", ip, e);
        }
    }

    fn release_addr(&mut self, ctx: &mut L3Ctx<'_>, ip: IpAddr, state: AddrState) -> SyncResult<()> {
        let mut first = None;
        if state.host {
            keep_first(
                &mut first,
                ctx.hal
                    .l3_unicast_host_remove(ip, state.vrf)
                    .hal("l3_unicast_host_remove"),
            );
        }
        if let Some(term) = state.termination {
            let hal = &mut *ctx.hal;
            let released = self.terminations.release(&term, |t, _| {
                hal.l3_termination_remove(t.port, t.vid, t.mac, t.family)
                    .hal("l3_termination_remove")
            });
            if let Ok(Release::Destroyed(())) = released {
                audit_log!(AuditRecord::new(AuditCategory::NetworkConfig, "L3Engine", "remove_termination")
                    .with_outcome(AuditOutcome::Success)
                    .with_object_id(ip.to_string())
                    .with_object_type("l3_termination")
                    .with_details(serde_json::json!({
                        "vid": term.vid.as_u16(),
                        "mac": term.mac.to_string(),
                    })));
            }
            keep_first(&mut first, released.map(|_| ()));
        }
        if let Some(binding) = state.binding {
            keep_first(&mut first, release_vlan(ctx, binding));
        }
        first_or_ok(first)
    }

    pub fn remove_addr(&mut self, ctx: &mut L3Ctx<'_>, addr: &Addr) -> SyncResult<()> {
        let Some(state) = self.addrs.remove(&(addr.ifindex, addr.prefix)) else {
            return Ok(());
        };
        debug!("L3Engine: removing address {} from {}", addr.prefix, addr.ifindex);
        self.release_addr(ctx, addr.prefix.addr(), state)
    }

    /// Re-keys the terminations of `ifindex` and every egress rewrite
    /// sourced from its old MAC.
    pub fn change_link_mac(
        &mut self,
        ctx: &mut L3Ctx<'_>,
        ifindex: u32,
        old: MacAddress,
        new: MacAddress,
    ) -> SyncResult<()> {
        if old == new {
            return Ok(());
        }
        let mut first = None;

        let moved_terms: BTreeSet<TerminationKey> = self
            .addrs
            .iter()
            .filter(|((i, _), _)| *i == ifindex)
            .filter_map(|(_, s)| s.termination)
            .filter(|t| t.mac == old)
            .collect();
        for term in moved_terms {
            let moved = TerminationKey { mac: new, ..term };
            keep_first(
                &mut first,
                ctx.hal
                    .l3_termination_remove(term.port, term.vid, term.mac, term.family)
                    .hal("l3_termination_remove"),
            );
            keep_first(
                &mut first,
                ctx.hal
                    .l3_termination_add(moved.port, moved.vid, moved.mac, moved.family)
                    .hal("l3_termination_add"),
            );
            self.terminations.rekey(&term, moved);
            for ((i, _), state) in self.addrs.iter_mut() {
                if *i == ifindex && state.termination == Some(term) {
                    state.termination = Some(moved);
                }
            }
        }

        if let Some(binding) = ctx.topo.l3_port(ifindex) {
            let vid = binding.vid();
            for key in self.egresses.keys_where(|k, _| k.vid == vid && k.src == old) {
                let Some(id) = self.egresses.get(&key).copied() else {
                    continue;
                };
                let moved = EgressKey { src: new, ..key };
                keep_first(
                    &mut first,
                    ctx.hal
                        .l3_egress_update(id, moved.port, moved.vid, moved.src, moved.dst)
                        .hal("l3_egress_update"),
                );
                self.rekey_egress(&key, moved);
            }
        }
        info!("L3Engine: link {} mac {} -> {}", ifindex, old, new);
        first_or_ok(first)
    }

    // ---- egress rewrites ----

    fn acquire_egress(
        &mut self,
        ctx: &mut L3Ctx<'_>,
        key: EgressKey,
        binding: L3Port,
    ) -> SyncResult<EgressId> {
        let fresh = !self.egresses.contains(&key);
        if fresh {
            hold_vlan(ctx, binding)?;
        }
        let hal = &mut *ctx.hal;
        let created = self.egresses.acquire(&key, |k| {
            hal.l3_egress_create(k.port, k.vid, k.src, k.dst)
                .hal("l3_egress_create")
        });
        match created {
            Ok(id) => {
                if fresh {
                    self.egress_bindings.insert(key, binding);
                    self.stats.egresses_created += 1;
                    debug!(
                        "L3Engine: egress {} {} vlan {} {} -> {}",
                        id, key.port, key.vid, key.src, key.dst
                    );
                }
                Ok(id)
            }
            Err(e) => {
                if fresh {
                    if let Err(u) = release_vlan(ctx, binding) {
                        warn!("L3Engine: unwinding egress vlan: {}", u);
                    }
                }
                Err(e)
            }
        }
    }

    /// Takes another reference on a live rewrite.
    fn share_egress(&mut self, key: &EgressKey) -> SyncResult<EgressId> {
        self.egresses.acquire(key, |k| {
            Err(SyncError::inconsistent(format!("egress {:?} is not live", k)))
        })
    }

    fn release_egress(&mut self, ctx: &mut L3Ctx<'_>, key: &EgressKey) -> SyncResult<()> {
        let hal = &mut *ctx.hal;
        let released = self
            .egresses
            .release(key, |_, id| hal.l3_egress_remove(*id).hal("l3_egress_remove"));
        let mut first = None;
        keep_first(&mut first, released.map(|_| ()));
        if !self.egresses.contains(key) {
            if let Some(binding) = self.egress_bindings.remove(key) {
                self.stats.egresses_removed += 1;
                keep_first(&mut first, release_vlan(ctx, binding));
            }
        }
        first_or_ok(first)
    }

    fn rekey_egress(&mut self, from: &EgressKey, to: EgressKey) {
        if !self.egresses.rekey(from, to) {
            return;
        }
        if let Some(binding) = self.egress_bindings.remove(from) {
            self.egress_bindings.insert(to, binding);
        }
        for entry in self.neighs.values_mut() {
            if entry.egress == *from {
                entry.egress = to;
            }
        }
        for route in self.routes.values_mut() {
            for held in route.hops.values_mut() {
                if *held == Some(*from) {
                    *held = Some(to);
                }
            }
        }
    }

    // ---- neighbours ----

    fn egress_port(ctx: &L3Ctx<'_>, binding: L3Port, lladdr: MacAddress) -> Option<PortId> {
        match binding {
            L3Port::Svi { vid, .. } => ctx
                .topo
                .cache
                .fdb_lookup(vid, lladdr)
                .and_then(|e| ctx.topo.port_of(e.ifindex)),
            other => other.port(),
        }
    }

    /// Programs a new or changed neighbour.
    pub fn add_neigh(&mut self, ctx: &mut L3Ctx<'_>, neigh: &Neigh) -> SyncResult<()> {
        let nh = NextHopKey {
            addr: neigh.dst,
            ifindex: neigh.ifindex,
        };
        if neigh.state == NeighState::Failed {
            debug!("L3Engine: neighbour {} failed", nh);
            return self.forget_neigh(ctx, nh);
        }
        let Some(lladdr) = neigh.lladdr.filter(|_| neigh.state != NeighState::Incomplete) else {
            return Ok(());
        };
        let Some(binding) = ctx.topo.l3_port(nh.ifindex) else {
            return Ok(());
        };

        if !is_link_local(&nh.addr) && !ctx.topo.cache.link_route_covers(nh.ifindex, &nh.addr) {
            let mut result = Ok(());
            if let Some(entry) = self.neighs.remove(&nh) {
                result = self.unprogram_neigh(ctx, nh, entry);
            }
            if self.unroutable.insert(nh) {
                self.stats.neighbors_unroutable += 1;
                debug!("L3Engine: neighbour {} is not covered by a link route", nh);
            }
            return result;
        }
        self.unroutable.remove(&nh);

        if let Some(entry) = self.neighs.get(&nh).copied() {
            if entry.lladdr == lladdr {
                return Ok(());
            }
            return self.change_lladdr(ctx, neigh, nh, entry, binding, lladdr);
        }

        let link_mac = ctx
            .topo
            .link(nh.ifindex)
            .map(|l| l.mac)
            .ok_or_else(|| SyncError::unresolved(format!("link of neighbour {}", nh)))?;
        let Some(port) = Self::egress_port(ctx, binding, lladdr) else {
            self.pending_l2.insert(nh);
            return Err(SyncError::unresolved(format!(
                "bridge port of {} ({}) in vlan {}",
                nh,
                lladdr,
                binding.vid()
            )));
        };
        self.pending_l2.remove(&nh);

        let key = EgressKey {
            port,
            vid: binding.vid(),
            src: link_mac,
            dst: lladdr,
        };
        let egress = self.acquire_egress(ctx, key, binding)?;
        let vrf = ctx.topo.vrf_of(nh.ifindex);
        let host = !is_link_local(&nh.addr);
        if host {
            if let Err(e) = ctx
                .hal
                .l3_unicast_host_add(nh.addr, RouteTarget::Egress(egress), false, vrf)
                .hal("l3_unicast_host_add")
            {
                if let Err(u) = self.release_egress(ctx, &key) {
                    warn!("L3Engine: unwinding egress of {}: {}", nh, u);
                }
                return Err(e);
            }
        }
        self.neighs.insert(
            nh,
            NeighEntry {
                lladdr,
                egress: key,
                host,
                vrf,
            },
        );
        self.stats.neighbors_programmed += 1;
        let woken = self.reachable.satisfy(&neighbor_target(nh));
        debug!(
            "L3Engine: neighbour {} at {} via egress {} ({} routes woken)",
            nh, lladdr, egress, woken
        );
        Ok(())
    }

    fn change_lladdr(
        &mut self,
        ctx: &mut L3Ctx<'_>,
        neigh: &Neigh,
        nh: NextHopKey,
        entry: NeighEntry,
        binding: L3Port,
        lladdr: MacAddress,
    ) -> SyncResult<()> {
        let port = Self::egress_port(ctx, binding, lladdr).unwrap_or(entry.egress.port);
        let moved = EgressKey {
            port,
            dst: lladdr,
            ..entry.egress
        };
        let shared = self
            .neighs
            .iter()
            .any(|(other, e)| *other != nh && e.egress == entry.egress);
        let id = self.egresses.get(&entry.egress).copied();
        match id {
            Some(id) if !shared && !self.egresses.contains(&moved) => {
                ctx.hal
                    .l3_egress_update(id, moved.port, moved.vid, moved.src, moved.dst)
                    .hal("l3_egress_update")?;
                self.rekey_egress(&entry.egress, moved);
                if let Some(e) = self.neighs.get_mut(&nh) {
                    e.lladdr = lladdr;
                }
                debug!("L3Engine: neighbour {} moved to {}", nh, lladdr);
                Ok(())
            }
            _ => {
                // the old rewrite is not ours alone: start over on a new one
                self.forget_neigh(ctx, nh)?;
                self.add_neigh(ctx, neigh)
            }
        }
    }

    fn unprogram_neigh(
        &mut self,
        ctx: &mut L3Ctx<'_>,
        nh: NextHopKey,
        entry: NeighEntry,
    ) -> SyncResult<()> {
        let mut first = None;
        if entry.host && !ctx.topo.cache.is_local_addr(nh.ifindex, &nh.addr) {
            keep_first(
                &mut first,
                ctx.hal
                    .l3_unicast_host_remove(nh.addr, entry.vrf)
                    .hal("l3_unicast_host_remove"),
            );
        }
        keep_first(&mut first, self.release_egress(ctx, &entry.egress));
        let fired = self.unreachable.satisfy(&neighbor_target(nh));
        debug!("L3Engine: neighbour {} gone ({} routes to shrink)", nh, fired);
        first_or_ok(first)
    }

    fn forget_neigh(&mut self, ctx: &mut L3Ctx<'_>, nh: NextHopKey) -> SyncResult<()> {
        self.unroutable.remove(&nh);
        self.pending_l2.remove(&nh);
        match self.neighs.remove(&nh) {
            Some(entry) => self.unprogram_neigh(ctx, nh, entry),
            None => Ok(()),
        }
    }

    pub fn remove_neigh(&mut self, ctx: &mut L3Ctx<'_>, neigh: &Neigh) -> SyncResult<()> {
        self.forget_neigh(
            ctx,
            NextHopKey {
                addr: neigh.dst,
                ifindex: neigh.ifindex,
            },
        )
    }

    /// Retries SVI neighbours that were waiting for their bridge port.
    pub fn retry_pending_l2(&mut self, ctx: &mut L3Ctx<'_>) -> SyncResult<()> {
        let cache = ctx.topo.cache;
        let mut first = None;
        let pending: Vec<NextHopKey> = self.pending_l2.iter().copied().collect();
        for nh in pending {
            match cache.neigh(nh.ifindex, &nh.addr) {
                Some(neigh) => {
                    let neigh = neigh.clone();
                    match self.add_neigh(ctx, &neigh) {
                        Err(SyncError::Unresolved { .. }) => {}
                        other => keep_first(&mut first, other),
                    }
                }
                None => {
                    self.pending_l2.remove(&nh);
                }
            }
        }
        first_or_ok(first)
    }

    /// Link-scope route added: program the neighbours it makes routable.
    fn promote_covered(&mut self, ctx: &mut L3Ctx<'_>, route: &Route) -> SyncResult<()> {
        let covered: Vec<NextHopKey> = self
            .unroutable
            .iter()
            .filter(|nh| route.is_link_scope_on(nh.ifindex) && route.dst.contains(&nh.addr))
            .copied()
            .collect();
        let mut first = None;
        let cache = ctx.topo.cache;
        for nh in covered {
            self.unroutable.remove(&nh);
            let Some(neigh) = cache.neigh(nh.ifindex, &nh.addr).cloned() else {
                continue;
            };
            debug!("L3Engine: {} made {} routable", route.dst, nh);
            keep_first(&mut first, self.add_neigh(ctx, &neigh));
        }
        first_or_ok(first)
    }

    /// Link-scope route going away: neighbours no other link route covers
    /// become unroutable again.
    fn demote_covered(&mut self, ctx: &mut L3Ctx<'_>, route: &Route) -> SyncResult<()> {
        let cache = ctx.topo.cache;
        let covered: Vec<NextHopKey> = self
            .neighs
            .keys()
            .filter(|nh| {
                !is_link_local(&nh.addr)
                    && route.is_link_scope_on(nh.ifindex)
                    && route.dst.contains(&nh.addr)
            })
            .filter(|nh| {
                !cache.routes().any(|r| {
                    r != route && r.is_link_scope_on(nh.ifindex) && r.dst.contains(&nh.addr)
                })
            })
            .copied()
            .collect();
        let mut first = None;
        for nh in covered {
            if let Some(entry) = self.neighs.remove(&nh) {
                keep_first(&mut first, self.unprogram_neigh(ctx, nh, entry));
            }
            self.unroutable.insert(nh);
            self.stats.neighbors_unroutable += 1;
        }
        first_or_ok(first)
    }

    // ---- routes ----

    pub fn add_route(&mut self, ctx: &mut L3Ctx<'_>, route: &Route) -> SyncResult<()> {
        let key = RouteKey {
            vrf: route.vrf(),
            prefix: route.dst,
        };
        if route.kind != RouteKind::Unicast {
            return Err(SyncError::unsupported(format!("{:?} route {}", route.kind, key)));
        }
        if !route
            .next_hops
            .iter()
            .any(|nh| ctx.topo.l3_port(nh.ifindex).is_some())
        {
            if !self.routes.contains_key(&key) {
                debug!("L3Engine: route {} has no next hop on a switch link", key);
                return Ok(());
            }
            debug!("L3Engine: route {} left the switch", key);
            let mut first = None;
            let previous = self.routes.get(&key).map(|r| r.route.clone());
            if let Some(previous) = previous.filter(|r| r.scope == RouteScope::Link) {
                keep_first(&mut first, self.demote_covered(ctx, &previous));
            }
            keep_first(&mut first, self.uninstall_route(ctx, key));
            return first_or_ok(first);
        }

        let mut first = None;
        if route.scope == RouteScope::Link {
            keep_first(&mut first, self.promote_covered(ctx, route));
        }
        match self.routes.get(&key) {
            Some(installed) if installed.route == *route => {}
            Some(_) => keep_first(&mut first, self.replace_route(ctx, key, route)),
            None => keep_first(&mut first, self.install_route(ctx, key, route)),
        }
        first_or_ok(first)
    }

    fn install_route(&mut self, ctx: &mut L3Ctx<'_>, key: RouteKey, route: &Route) -> SyncResult<()> {
        let installed = self.provision(ctx, key, route)?;
        if let Err(e) = write_route(ctx.hal, key, installed.target, false) {
            self.unwind_route(ctx, key, &installed);
            return Err(e);
        }
        info!("L3Engine: route {} -> {}", key, installed.target);
        self.routes.insert(key, installed);
        self.subscribe_hops(key);
        self.stats.routes_added += 1;
        Ok(())
    }

    /// Next hop changed: install the new state over the old one in place and
    /// drop what the old one held.
    fn replace_route(&mut self, ctx: &mut L3Ctx<'_>, key: RouteKey, route: &Route) -> SyncResult<()> {
        let fresh = self.provision(ctx, key, route)?;
        if let Err(e) = write_route(ctx.hal, key, fresh.target, true) {
            self.unwind_route(ctx, key, &fresh);
            return Err(e);
        }
        let old = self.routes.insert(key, fresh);
        self.subscribe_hops(key);
        self.stats.routes_updated += 1;
        debug!("L3Engine: route {} updated", key);
        match old {
            Some(old) => self.unprovision(ctx, &old),
            None => Ok(()),
        }
    }

    pub fn remove_route(&mut self, ctx: &mut L3Ctx<'_>, route: &Route) -> SyncResult<()> {
        let key = RouteKey {
            vrf: route.vrf(),
            prefix: route.dst,
        };
        let mut first = None;
        if route.scope == RouteScope::Link {
            keep_first(&mut first, self.demote_covered(ctx, route));
        }
        keep_first(&mut first, self.uninstall_route(ctx, key));
        first_or_ok(first)
    }

    /// Erases the hardware route and drops everything the installed state
    /// holds.
    fn uninstall_route(&mut self, ctx: &mut L3Ctx<'_>, key: RouteKey) -> SyncResult<()> {
        let Some(installed) = self.routes.remove(&key) else {
            return Ok(());
        };
        let mut first = None;
        self.cancel_subscriptions(key);
        keep_first(&mut first, erase_route(ctx.hal, key));
        keep_first(&mut first, self.unprovision(ctx, &installed));
        self.stats.routes_removed += 1;
        info!("L3Engine: route {} removed", key);
        first_or_ok(first)
    }

    /// Takes the egress references and ECMP group a route needs and picks
    /// its target. Nothing is written for the route itself.
    fn provision(&mut self, ctx: &mut L3Ctx<'_>, key: RouteKey, route: &Route) -> SyncResult<InstalledRoute> {
        let hops = route
            .next_hops
            .iter()
            .filter(|nh| ctx.topo.l3_port(nh.ifindex).is_some())
            .filter_map(|nh| {
                nh.gateway.map(|addr| {
                    (
                        NextHopKey {
                            addr,
                            ifindex: nh.ifindex,
                        },
                        None,
                    )
                })
            })
            .collect();
        let mut installed = InstalledRoute {
            route: route.clone(),
            hops,
            ecmp: None,
            target: RouteTarget::Controller,
        };
        let resolved: Vec<(NextHopKey, EgressKey)> = installed
            .hops
            .keys()
            .filter_map(|nh| self.neighs.get(nh).map(|n| (*nh, n.egress)))
            .collect();
        for (nh, egress) in resolved {
            if let Err(e) = self.share_egress(&egress) {
                self.unwind_route(ctx, key, &installed);
                return Err(e);
            }
            installed.hops.insert(nh, Some(egress));
        }
        if let Err(e) = self.retarget(ctx, &mut installed) {
            self.unwind_route(ctx, key, &installed);
            return Err(e);
        }
        Ok(installed)
    }

    fn unwind_route(&mut self, ctx: &mut L3Ctx<'_>, key: RouteKey, installed: &InstalledRoute) {
        if let Err(e) = self.unprovision(ctx, installed) {
            warn!("L3Engine: unwinding route {}: {}", key, e);
        }
    }

    /// Recomputes the target from the hops' egress references; several hops
    /// go through the ECMP group of the next-hop set.
    fn retarget(&mut self, ctx: &mut L3Ctx<'_>, installed: &mut InstalledRoute) -> SyncResult<()> {
        let members: Vec<EgressId> = installed
            .hops
            .values()
            .flatten()
            .filter_map(|k| self.egresses.get(k).copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if installed.hops.len() <= 1 {
            installed.target = members
                .first()
                .map_or(RouteTarget::Controller, |id| RouteTarget::Egress(*id));
            return Ok(());
        }

        let id = match &installed.ecmp {
            Some(ecmp) => self
                .ecmps
                .get(ecmp)
                .copied()
                .ok_or_else(|| SyncError::inconsistent(format!("ecmp group {:?} not live", ecmp)))?,
            None => {
                let ecmp: EcmpKey = installed.hops.keys().copied().collect();
                let fresh = !self.ecmps.contains(&ecmp);
                let hal = &mut *ctx.hal;
                let initial = members.clone();
                let id = self
                    .ecmps
                    .acquire(&ecmp, |_| hal.l3_ecmp_add(&initial).hal("l3_ecmp_add"))?;
                if fresh {
                    self.ecmp_members.insert(id, members.clone());
                    self.stats.ecmp_created += 1;
                    debug!("L3Engine: ecmp {} for {} next hops", id, ecmp.len());
                }
                installed.ecmp = Some(ecmp);
                id
            }
        };
        if self.ecmp_members.get(&id) != Some(&members) {
            ctx.hal
                .l3_ecmp_update(id, &members)
                .hal("l3_ecmp_update")?;
            self.ecmp_members.insert(id, members.clone());
        }
        installed.target = if members.is_empty() {
            RouteTarget::Controller
        } else {
            RouteTarget::Ecmp(id)
        };
        Ok(())
    }

    fn unprovision(&mut self, ctx: &mut L3Ctx<'_>, installed: &InstalledRoute) -> SyncResult<()> {
        let mut first = None;
        if let Some(ecmp) = &installed.ecmp {
            let hal = &mut *ctx.hal;
            match self
                .ecmps
                .release(ecmp, |_, id| hal.l3_ecmp_remove(*id).hal("l3_ecmp_remove"))
            {
                Ok(Release::Destroyed(id)) => {
                    self.ecmp_members.remove(&id);
                }
                Ok(_) => {}
                Err(e) => keep_first(&mut first, Err(e)),
            }
        }
        for egress in installed.hops.values().flatten() {
            keep_first(&mut first, self.release_egress(ctx, egress));
        }
        first_or_ok(first)
    }

    fn cancel_subscriptions(&mut self, key: RouteKey) {
        self.reachable.cancel_where(|k| *k == key);
        self.unreachable.cancel_where(|k| *k == key);
    }

    /// One subscription per next hop: "reachable" while unresolved,
    /// "unreachable" while it holds an egress.
    fn subscribe_hops(&mut self, key: RouteKey) {
        self.cancel_subscriptions(key);
        let Some(installed) = self.routes.get(&key) else {
            return;
        };
        let dst = key.prefix.addr();
        let quiet = is_link_local(&dst) || dst.is_multicast();
        for (nh, held) in &installed.hops {
            match held {
                Some(_) => {
                    self.unreachable.subscribe(neighbor_target(*nh), key);
                }
                None if !quiet => {
                    self.reachable.subscribe(neighbor_target(*nh), key);
                }
                None => {}
            }
        }
    }

    /// Re-provisions every route whose subscription fired. Returns the
    /// number of routes touched.
    pub fn fire_ready(&mut self, ctx: &mut L3Ctx<'_>) -> SyncResult<usize> {
        let mut keys: BTreeSet<RouteKey> = self
            .reachable
            .take_ready()
            .into_iter()
            .map(|s| s.payload)
            .collect();
        keys.extend(self.unreachable.take_ready().into_iter().map(|s| s.payload));
        let mut first = None;
        for key in &keys {
            keep_first(&mut first, self.refresh_route(ctx, *key));
        }
        first_or_ok(first).map(|_| keys.len())
    }

    fn refresh_route(&mut self, ctx: &mut L3Ctx<'_>, key: RouteKey) -> SyncResult<()> {
        let Some(mut installed) = self.routes.remove(&key) else {
            return Ok(());
        };
        let before = installed.target;
        let mut first = None;
        let mut dropped = Vec::new();
        let hops: Vec<(NextHopKey, Option<EgressKey>)> =
            installed.hops.iter().map(|(nh, e)| (*nh, *e)).collect();
        for (nh, held) in hops {
            let want = self.neighs.get(&nh).map(|n| n.egress);
            if held == want {
                continue;
            }
            if let Some(old) = held {
                dropped.push(old);
                installed.hops.insert(nh, None);
            }
            if let Some(egress) = want {
                match self.share_egress(&egress) {
                    Ok(_) => {
                        installed.hops.insert(nh, Some(egress));
                    }
                    Err(e) => keep_first(&mut first, Err(e)),
                }
            }
        }
        // membership shrinks before the dropped rewrites go away
        match self.retarget(ctx, &mut installed) {
            Ok(()) if installed.target != before => {
                keep_first(&mut first, write_route(ctx.hal, key, installed.target, true));
                debug!("L3Engine: route {} now -> {}", key, installed.target);
            }
            Ok(()) => {}
            Err(e) => keep_first(&mut first, Err(e)),
        }
        for egress in dropped {
            keep_first(&mut first, self.release_egress(ctx, &egress));
        }
        self.routes.insert(key, installed);
        self.subscribe_hops(key);
        first_or_ok(first)
    }

    /// Drops every address and neighbour of a link that went away.
    pub fn forget_link(&mut self, ctx: &mut L3Ctx<'_>, ifindex: u32) -> SyncResult<()> {
        let mut first = None;
        let addrs: Vec<(u32, IpPrefix)> = self
            .addrs
            .keys()
            .filter(|(i, _)| *i == ifindex)
            .copied()
            .collect();
        for id in addrs {
            if let Some(state) = self.addrs.remove(&id) {
                keep_first(&mut first, self.release_addr(ctx, id.1.addr(), state));
            }
        }
        let neighs: Vec<NextHopKey> = self
            .neighs
            .keys()
            .chain(self.unroutable.iter())
            .chain(self.pending_l2.iter())
            .filter(|nh| nh.ifindex == ifindex)
            .copied()
            .collect();
        for nh in neighs {
            keep_first(&mut first, self.forget_neigh(ctx, nh));
        }
        first_or_ok(first)
    }

    /// Forgets all state without touching the hardware.
    pub fn clear(&mut self) {
        self.addrs.clear();
        self.terminations.drain();
        self.egresses.drain();
        self.egress_bindings.clear();
        self.ecmps.drain();
        self.ecmp_members.clear();
        self.neighs.clear();
        self.unroutable.clear();
        self.pending_l2.clear();
        self.routes.clear();
        self.reachable.clear();
        self.unreachable.clear();
    }
}
