//! Bridge engine: mirrors the managed VLAN-aware bridge into the hardware.

use super::fdb::{FdbMirror, FdbWrite, L2Entry, L2Key};
use super::stp::StpTable;
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::bond::BondManager;
use crate::daemon::{AgedFdb, LearnedMac};
use crate::kernel::{BridgeVlanState, FdbEntry, KernelCache, Link, LinkKind, MdbEntry, Topology};
use crate::vlan::VlanProgrammer;
use crate::vxlan::{AccessPortRequest, VxlanEngine};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use swsync_common::{HalResultExt, SyncError, SyncResult};
use swsync_hal::{SwitchHal, TenantId};
use swsync_types::{multicast_mac, MacAddress, PortId, StpState, VlanId, VlanMembership};

/// Everything outside the bridge engine it needs for one call.
pub struct BridgeCtx<'a> {
    pub hal: &'a mut dyn SwitchHal,
    pub cache: &'a KernelCache,
    pub bonds: &'a BondManager,
    pub vlans: &'a mut VlanProgrammer,
    pub vxlan: &'a mut VxlanEngine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ManagedBridge {
    ifindex: u32,
    name: String,
    mac: MacAddress,
}

/// Last bridge-port snapshot applied to the hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PortState {
    name: String,
    /// `None` for the VXLAN bridge port.
    port: Option<PortId>,
    vlans: VlanMembership,
    state: StpState,
    flood: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Domain {
    tenant: TenantId,
    vxlan_ifindex: u32,
}

#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    pub ports_added: u64,
    pub ports_removed: u64,
    pub fdb_programmed: u64,
    pub fdb_removed: u64,
    pub macs_learned: u64,
    pub macs_aged: u64,
}

fn keep_first(first: &mut Option<SyncError>, result: SyncResult<()>) {
    if let Err(e) = result {
        warn!("BridgeEngine: {}", e);
        first.get_or_insert(e);
    }
}

fn first_or_ok(first: Option<SyncError>) -> SyncResult<()> {
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[derive(Debug)]
pub struct BridgeEngine {
    bridge: Option<ManagedBridge>,
    /// Bridges refused once and ignored from then on.
    refused: BTreeSet<u32>,
    ports: BTreeMap<u32, PortState>,
    domains: BTreeMap<VlanId, Domain>,
    fdb: FdbMirror,
    stp: StpTable,
    stats: BridgeStats,
}

impl BridgeEngine {
    pub fn new(stp_enabled: bool) -> Self {
        Self {
            bridge: None,
            refused: BTreeSet::new(),
            ports: BTreeMap::new(),
            domains: BTreeMap::new(),
            fdb: FdbMirror::new(),
            stp: StpTable::new(stp_enabled),
            stats: BridgeStats::default(),
        }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Ifindex of the managed bridge.
    pub fn bridge(&self) -> Option<u32> {
        self.bridge.as_ref().map(|b| b.ifindex)
    }

    pub fn fdb(&self) -> &FdbMirror {
        &self.fdb
    }

    pub fn stp(&self) -> &StpTable {
        &self.stp
    }

    pub fn is_port(&self, ifindex: u32) -> bool {
        self.ports.contains_key(&ifindex)
    }

    /// Tenant a VLAN is mapped to through the VXLAN bridge port.
    pub fn domain(&self, vid: VlanId) -> Option<TenantId> {
        self.domains.get(&vid).map(|d| d.tenant)
    }

    /// STP state a bond's new members must take, `None` if the bond is not a
    /// port of the managed bridge.
    pub fn bridged_state(&self, ifindex: u32) -> Option<StpState> {
        self.ports.get(&ifindex).map(|p| p.state)
    }

    pub fn take_writes(&mut self) -> Vec<FdbWrite> {
        self.fdb.take_writes()
    }

    fn topology<'a>(&self, cache: &'a KernelCache, bonds: &'a BondManager) -> Topology<'a> {
        Topology::new(cache, bonds, self.bridge())
    }

    /// A bridge link appeared or changed. Only the first VLAN-aware bridge
    /// is managed.
    pub fn add_bridge(&mut self, link: &Link) -> SyncResult<()> {
        let LinkKind::Bridge { vlan_filtering } = link.kind else {
            return Err(SyncError::inconsistent(format!("{} is not a bridge", link.name)));
        };
        if let Some(managed) = self.bridge.as_mut() {
            if managed.ifindex == link.ifindex {
                if managed.mac != link.mac {
                    info!("BridgeEngine: {} mac {} -> {}", link.name, managed.mac, link.mac);
                }
                managed.mac = link.mac;
                managed.name.clone_from(&link.name);
                return Ok(());
            }
        }
        if self.refused.contains(&link.ifindex) {
            return Ok(());
        }
        if !vlan_filtering || self.bridge.is_some() {
            self.refused.insert(link.ifindex);
            return Err(SyncError::unsupported(if vlan_filtering {
                format!("second bridge {}", link.name)
            } else {
                format!("bridge {} without vlan filtering", link.name)
            }));
        }

        self.bridge = Some(ManagedBridge {
            ifindex: link.ifindex,
            name: link.name.clone(),
            mac: link.mac,
        });
        info!("BridgeEngine: managing bridge {} ({})", link.name, link.mac);
        audit_log!(AuditRecord::new(AuditCategory::NetworkConfig, "BridgeEngine", "manage_bridge")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(link.name.clone())
            .with_object_type("bridge")
            .with_details(serde_json::json!({ "ifindex": link.ifindex })));
        Ok(())
    }

    /// The bridge link went away; its ports are torn down with it.
    pub fn remove_bridge(&mut self, ctx: &mut BridgeCtx<'_>, ifindex: u32) -> SyncResult<()> {
        if self.refused.remove(&ifindex) || self.bridge() != Some(ifindex) {
            return Ok(());
        }
        let mut first = None;
        let ports: Vec<u32> = self.ports.keys().copied().collect();
        for port in ports {
            keep_first(&mut first, self.remove_port(ctx, port));
        }
        if let Some(bridge) = self.bridge.take() {
            info!("BridgeEngine: bridge {} removed", bridge.name);
            audit_log!(AuditRecord::new(AuditCategory::NetworkConfig, "BridgeEngine", "release_bridge")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(bridge.name)
                .with_object_type("bridge"));
        }
        self.domains.clear();
        self.fdb.clear();
        first_or_ok(first)
    }

    /// Applies a bridge port link: VLAN membership diff against the last
    /// snapshot, STP state and flooding flag. A link no longer enslaved to
    /// the managed bridge is removed.
    pub fn update_port(&mut self, ctx: &mut BridgeCtx<'_>, link: &Link) -> SyncResult<()> {
        let Some(bridge) = self.bridge() else {
            return Ok(());
        };
        if link.master != Some(bridge) {
            if self.ports.contains_key(&link.ifindex) {
                return self.remove_port(ctx, link.ifindex);
            }
            return Ok(());
        }

        let port = if link.is_vxlan() {
            if !ctx.vxlan.is_vxlan_link(link.ifindex) {
                return Err(SyncError::unresolved(format!("vxlan link {}", link.name)));
            }
            None
        } else {
            let topo = self.topology(ctx.cache, ctx.bonds);
            match topo.port_of(link.ifindex) {
                Some(port) => Some(port),
                None if link.is_bond() => {
                    return Err(SyncError::unresolved(format!("LAG of bond {}", link.name)))
                }
                None => {
                    return Err(SyncError::unsupported(format!(
                        "bridge port {} is not switch-managed",
                        link.name
                    )))
                }
            }
        };

        let info = link.bridge.clone().unwrap_or_default();
        let old = match self.ports.get(&link.ifindex) {
            Some(state) => state.clone(),
            None => {
                self.stats.ports_added += 1;
                info!("BridgeEngine: {} joined {}", link.name, bridge);
                PortState {
                    name: link.name.clone(),
                    port,
                    vlans: VlanMembership::new(),
                    state: StpState::Forwarding,
                    flood: true,
                }
            }
        };
        let new = PortState {
            name: link.name.clone(),
            port,
            vlans: info.vlans.clone(),
            state: info.state,
            flood: info.flood_unicast,
        };

        let result = match port {
            Some(port) => self.apply_port(ctx, link.ifindex, port, &old, &new),
            None => self.apply_vxlan_port(ctx, link.ifindex, &old, &new),
        };
        self.ports.insert(link.ifindex, new);
        result
    }

    fn apply_port(
        &mut self,
        ctx: &mut BridgeCtx<'_>,
        ifindex: u32,
        port: PortId,
        old: &PortState,
        new: &PortState,
    ) -> SyncResult<()> {
        let mut first = None;

        if old.state != new.state || !self.ports.contains_key(&ifindex) {
            keep_first(&mut first, self.stp.set_global(ctx.hal, ctx.bonds, port, new.state));
        }

        let diff = VlanMembership::diff(&old.vlans, &new.vlans);
        if !diff.is_empty() {
            debug!("BridgeEngine: {} vlan diff {:?}", new.name, diff);
        }
        for vid in diff.removed {
            keep_first(&mut first, self.leave_vlan(ctx, port, vid));
        }
        for vid in diff.added {
            keep_first(&mut first, self.join_vlan(ctx, ifindex, port, &new.name, &new.vlans, vid, new.flood));
        }
        for vid in diff.changed {
            let pvid = new.vlans.pvid() == Some(vid);
            let untagged = new.vlans.is_untagged(vid);
            if ctx.vxlan.is_access_port(port, vid) {
                // the access port carries the tagging mode, rebuild it
                keep_first(&mut first, ctx.vxlan.delete_access_port(ctx.hal, port, vid, true));
                keep_first(&mut first, self.join_vlan(ctx, ifindex, port, &new.name, &new.vlans, vid, new.flood));
            } else {
                keep_first(
                    &mut first,
                    ctx.vlans
                        .update_bridge_vlan(ctx.hal, ctx.bonds, port, vid, pvid, untagged),
                );
            }
        }

        if old.flood != new.flood {
            keep_first(&mut first, ctx.vxlan.set_access_flooding(ctx.hal, port, new.flood));
        }
        first_or_ok(first)
    }

    fn apply_vxlan_port(
        &mut self,
        ctx: &mut BridgeCtx<'_>,
        ifindex: u32,
        old: &PortState,
        new: &PortState,
    ) -> SyncResult<()> {
        let mut first = None;
        let diff = VlanMembership::diff(&old.vlans, &new.vlans);
        for vid in diff.removed {
            keep_first(&mut first, self.unmap_vlan(ctx, vid));
        }
        for vid in diff.added {
            keep_first(&mut first, self.map_vlan(ctx, ifindex, vid));
        }
        if old.flood != new.flood {
            keep_first(&mut first, ctx.vxlan.set_link_flooding(ctx.hal, ifindex, new.flood));
        }
        first_or_ok(first)
    }

    /// Mirrored FDB entries of (ifindex, vid) as (mac, permanent), without
    /// the bridge's own address.
    fn replay_of(&self, cache: &KernelCache, ifindex: u32, vid: VlanId) -> Vec<(MacAddress, bool)> {
        let bridge_mac = self.bridge.as_ref().map(|b| b.mac);
        cache
            .fdb_of(ifindex, Some(vid))
            .filter(|e| Some(e.mac) != bridge_mac && e.dst.is_none())
            .map(|e| (e.mac, !e.ext_learned))
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn join_vlan(
        &mut self,
        ctx: &mut BridgeCtx<'_>,
        ifindex: u32,
        port: PortId,
        name: &str,
        vlans: &VlanMembership,
        vid: VlanId,
        flood: bool,
    ) -> SyncResult<()> {
        let untagged = vlans.is_untagged(vid);
        if let Some(domain) = self.domains.get(&vid).copied() {
            let req = AccessPortRequest {
                port,
                name: name.to_string(),
                vid,
                tenant: domain.tenant,
                untagged,
                flood,
                replay: self.replay_of(ctx.cache, ifindex, vid),
            };
            return ctx.vxlan.create_access_port(ctx.hal, ctx.vlans, ctx.bonds, req);
        }

        let pvid = vlans.pvid() == Some(vid);
        ctx.vlans
            .add_bridge_vlan(ctx.hal, ctx.bonds, port, vid, pvid, untagged)?;
        self.stp.join(ctx.hal, port, vid)?;

        let mut first = None;
        let groups: Vec<MdbEntry> = ctx.cache.mdb_of(ifindex, Some(vid)).cloned().collect();
        for entry in groups {
            keep_first(&mut first, self.join_group(ctx.hal, port, vid, &entry));
        }
        first_or_ok(first)
    }

    /// Drops learned and multicast forwarding state of (port, vid) from the
    /// hardware and the mirror. Runs before the membership goes away.
    fn flush_port_vlan(&mut self, ctx: &mut BridgeCtx<'_>, port: PortId, vid: VlanId) -> SyncResult<()> {
        let mut first = None;
        keep_first(
            &mut first,
            ctx.hal
                .l2_addr_remove_all_in_vlan(port, vid)
                .hal("l2_addr_remove_all_in_vlan"),
        );
        let flushed = self.fdb.flush(port, vid);
        if !flushed.is_empty() {
            debug!("BridgeEngine: flushed {} entries of {} vlan {}", flushed.len(), port, vid);
        }
        for group in self.fdb.mcast_of(port, vid) {
            self.fdb.mcast_leave(&(port, vid, group));
            keep_first(
                &mut first,
                ctx.hal
                    .l2_mcast_group_leave(port, vid, group)
                    .hal("l2_mcast_group_leave"),
            );
        }
        first_or_ok(first)
    }

    fn leave_vlan(&mut self, ctx: &mut BridgeCtx<'_>, port: PortId, vid: VlanId) -> SyncResult<()> {
        let mut first = None;
        keep_first(&mut first, self.flush_port_vlan(ctx, port, vid));
        if ctx.vxlan.is_access_port(port, vid) {
            keep_first(&mut first, ctx.vxlan.delete_access_port(ctx.hal, port, vid, true));
        } else {
            keep_first(
                &mut first,
                ctx.vlans.remove_bridge_vlan(ctx.hal, ctx.bonds, port, vid),
            );
        }
        self.stp.leave(port, vid);
        first_or_ok(first)
    }

    /// The VXLAN bridge port joined `vid`: every other port carrying it
    /// becomes an access port of the link's tenant.
    fn map_vlan(&mut self, ctx: &mut BridgeCtx<'_>, vxlan_ifindex: u32, vid: VlanId) -> SyncResult<()> {
        let tenant = ctx
            .vxlan
            .link(vxlan_ifindex)
            .map(|l| l.tenant)
            .ok_or_else(|| SyncError::unresolved(format!("vxlan link ifindex {}", vxlan_ifindex)))?;
        if let Some(existing) = self.domains.get(&vid) {
            if existing.vxlan_ifindex != vxlan_ifindex {
                return Err(SyncError::inconsistent(format!(
                    "vlan {} already mapped through ifindex {}",
                    vid, existing.vxlan_ifindex
                )));
            }
            return Ok(());
        }
        self.domains.insert(vid, Domain { tenant, vxlan_ifindex });
        info!("BridgeEngine: vlan {} mapped to {}", vid, tenant);

        let mut first = None;
        for (ifindex, port, state) in self.members_of(vid) {
            if ctx.vxlan.is_access_port(port, vid) {
                continue;
            }
            // the port stops being a plain bridge member of vid
            keep_first(&mut first, self.flush_port_vlan(ctx, port, vid));
            self.stp.leave(port, vid);
            let req = AccessPortRequest {
                port,
                name: state.name.clone(),
                vid,
                tenant,
                untagged: state.vlans.is_untagged(vid),
                flood: state.flood,
                replay: self.replay_of(ctx.cache, ifindex, vid),
            };
            keep_first(
                &mut first,
                ctx.vxlan.create_access_port(ctx.hal, ctx.vlans, ctx.bonds, req),
            );
        }
        first_or_ok(first)
    }

    /// The VXLAN bridge port left `vid`: access ports turn back into plain
    /// bridge members and the mirrored FDB goes back to the underlay.
    fn unmap_vlan(&mut self, ctx: &mut BridgeCtx<'_>, vid: VlanId) -> SyncResult<()> {
        if self.domains.remove(&vid).is_none() {
            return Ok(());
        }
        info!("BridgeEngine: vlan {} unmapped", vid);

        let mut first = None;
        for (ifindex, port, state) in self.members_of(vid) {
            keep_first(&mut first, ctx.vxlan.delete_access_port(ctx.hal, port, vid, true));
            keep_first(
                &mut first,
                self.join_vlan(ctx, ifindex, port, &state.name, &state.vlans, vid, state.flood),
            );
            let entries: Vec<FdbEntry> = ctx
                .cache
                .fdb_of(ifindex, Some(vid))
                .filter(|e| e.dst.is_none())
                .cloned()
                .collect();
            for entry in entries {
                keep_first(&mut first, self.program_fdb(ctx, &entry));
            }
        }
        first_or_ok(first)
    }

    /// Plain bridge ports that are members of `vid`.
    fn members_of(&self, vid: VlanId) -> Vec<(u32, PortId, PortState)> {
        self.ports
            .iter()
            .filter_map(|(ifindex, s)| {
                let port = s.port?;
                s.vlans.is_member(vid).then(|| (*ifindex, port, s.clone()))
            })
            .collect()
    }

    /// Drops a bridge port and everything programmed for it.
    pub fn remove_port(&mut self, ctx: &mut BridgeCtx<'_>, ifindex: u32) -> SyncResult<()> {
        let Some(state) = self.ports.remove(&ifindex) else {
            return Ok(());
        };
        self.stats.ports_removed += 1;
        info!("BridgeEngine: {} left the bridge", state.name);

        let mut first = None;
        let vids: Vec<VlanId> = state.vlans.members().iter().collect();
        match state.port {
            Some(port) => {
                for vid in vids {
                    keep_first(&mut first, self.leave_vlan(ctx, port, vid));
                }
                if state.state != StpState::Forwarding {
                    keep_first(
                        &mut first,
                        self.stp
                            .set_global(ctx.hal, ctx.bonds, port, StpState::Forwarding),
                    );
                }
                self.stp.forget_port(port);
            }
            None => {
                for vid in vids {
                    keep_first(&mut first, self.unmap_vlan(ctx, vid));
                }
            }
        }
        first_or_ok(first)
    }

    /// Hardware port and VLAN of a bridge FDB entry on a plain bridge port;
    /// `None` for entries the hardware does not mirror.
    fn l2_key(&self, entry: &FdbEntry) -> Option<L2Key> {
        let bridge = self.bridge.as_ref()?;
        if entry.mac == bridge.mac || entry.mac.is_zero() {
            return None;
        }
        let state = self.ports.get(&entry.ifindex)?;
        let port = state.port?;
        let Some(vid) = entry.vlan else {
            debug!("BridgeEngine: ignoring vlan-less entry {} on {}", entry.mac, state.name);
            return None;
        };
        Some((port, vid, entry.mac))
    }

    fn program_fdb(&mut self, ctx: &mut BridgeCtx<'_>, entry: &FdbEntry) -> SyncResult<()> {
        let Some(key) = self.l2_key(entry) else {
            return Ok(());
        };
        let (port, vid, mac) = key;
        if ctx.vxlan.is_access_port(port, vid) {
            ctx.vxlan
                .add_access_overlay(ctx.hal, port, vid, mac, !entry.ext_learned)?;
            return Ok(());
        }

        let permanent = !(entry.ext_learned || self.fdb.is_learned(&key));
        let mirrored = L2Entry {
            ifindex: entry.ifindex,
            permanent,
        };
        if self.fdb.get(&key) == Some(&mirrored) {
            debug!("BridgeEngine: {} vlan {} on {} already programmed", mac, vid, port);
            return Ok(());
        }
        ctx.hal
            .l2_addr_add(port, vid, mac, true, permanent)
            .hal("l2_addr_add")?;
        self.fdb.insert(key, mirrored);
        self.stats.fdb_programmed += 1;
        debug!(
            "BridgeEngine: {} vlan {} on {} (permanent: {})",
            mac, vid, port, permanent
        );
        Ok(())
    }

    /// A bridge-family neighbour entry appeared. Entries on a VXLAN link that
    /// carry a remote go to the VXLAN engine.
    pub fn add_fdb(&mut self, ctx: &mut BridgeCtx<'_>, entry: &FdbEntry) -> SyncResult<()> {
        if ctx.vxlan.is_vxlan_link(entry.ifindex) {
            if entry.dst.is_some() {
                return ctx.vxlan.add_fdb(ctx.hal, entry);
            }
            return Ok(());
        }
        self.program_fdb(ctx, entry)
    }

    pub fn remove_fdb(&mut self, ctx: &mut BridgeCtx<'_>, entry: &FdbEntry) -> SyncResult<()> {
        if ctx.vxlan.is_vxlan_link(entry.ifindex) {
            if entry.dst.is_some() {
                return ctx.vxlan.remove_fdb(ctx.hal, entry);
            }
            return Ok(());
        }
        let Some(key) = self.l2_key(entry) else {
            return Ok(());
        };
        let (port, vid, mac) = key;
        if ctx.vxlan.is_access_port(port, vid) {
            ctx.vxlan.remove_access_overlay(ctx.hal, port, vid, mac)?;
            return Ok(());
        }
        if self.fdb.remove(&key).is_none() {
            debug!("BridgeEngine: {} vlan {} on {} not mirrored", mac, vid, port);
            return Ok(());
        }
        self.stats.fdb_removed += 1;
        ctx.hal.l2_addr_remove(port, vid, mac).hal("l2_addr_remove")
    }

    /// Resolves a data-path (port, vlan?) to the bridge port and VLAN.
    fn resolve_datapath(
        &self,
        ctx: &BridgeCtx<'_>,
        port: PortId,
        vlan: Option<VlanId>,
    ) -> SyncResult<(u32, VlanId)> {
        let topo = self.topology(ctx.cache, ctx.bonds);
        let (ifindex, state) = topo
            .ifindex_of(port)
            .and_then(|i| self.ports.get(&i).map(|s| (i, s)))
            .ok_or_else(|| SyncError::unsupported(format!("{} is not a bridge port", port)))?;
        let vid = match vlan.or_else(|| state.vlans.pvid()) {
            Some(vid) => vid,
            None => {
                return Err(SyncError::unsupported(format!(
                    "untagged frame on {} without pvid",
                    state.name
                )))
            }
        };
        if !state.vlans.is_member(vid) {
            return Err(SyncError::unsupported(format!(
                "{} is not a member of vlan {}",
                state.name, vid
            )));
        }
        Ok((ifindex, vid))
    }

    /// Data-path learning: asks the kernel to add the entry unless it is
    /// already mirrored.
    pub fn learn(&mut self, ctx: &BridgeCtx<'_>, learned: LearnedMac) -> SyncResult<()> {
        let (ifindex, vid) = self.resolve_datapath(ctx, learned.port, learned.vlan)?;
        let key = (learned.port, vid, learned.mac);
        if self.fdb.contains(&key) || self.fdb.is_learned(&key) {
            return Ok(());
        }
        self.fdb.mark_learned(key);
        self.fdb.push_write(FdbWrite::Add(FdbEntry {
            ifindex,
            mac: learned.mac,
            vlan: Some(vid),
            dst: None,
            master: self.bridge(),
            ext_learned: true,
        }));
        self.stats.macs_learned += 1;
        debug!("BridgeEngine: learned {} vlan {} on {}", learned.mac, vid, learned.port);
        Ok(())
    }

    /// Hardware aged an entry out: the kernel entry goes too.
    pub fn age(&mut self, ctx: &BridgeCtx<'_>, aged: AgedFdb) -> SyncResult<()> {
        let (ifindex, vid) = self.resolve_datapath(ctx, aged.port, aged.vlan)?;
        let key = (aged.port, vid, aged.mac);
        if !self.fdb.is_learned(&key) {
            debug!("BridgeEngine: {} vlan {} on {} was not learned here", aged.mac, vid, aged.port);
            return Ok(());
        }
        self.fdb.remove(&key);
        self.fdb.push_write(FdbWrite::Del(FdbEntry {
            ifindex,
            mac: aged.mac,
            vlan: Some(vid),
            dst: None,
            master: self.bridge(),
            ext_learned: true,
        }));
        self.stats.macs_aged += 1;
        Ok(())
    }

    fn join_group(
        &mut self,
        hal: &mut dyn SwitchHal,
        port: PortId,
        vid: VlanId,
        entry: &MdbEntry,
    ) -> SyncResult<()> {
        let group = multicast_mac(&entry.group).ok_or_else(|| {
            SyncError::unsupported(format!("multicast group {}", entry.group))
        })?;
        let key = (port, vid, group);
        if !self.fdb.mcast_join(key) {
            return Ok(());
        }
        if let Err(e) = hal.l2_mcast_group_join(port, vid, group) {
            self.fdb.mcast_leave(&key);
            return Err(SyncError::hardware("l2_mcast_group_join", e));
        }
        debug!("BridgeEngine: {} vlan {} joined {}", port, vid, group);
        Ok(())
    }

    fn mdb_target(&self, entry: &MdbEntry) -> Option<(PortId, VlanId)> {
        if self.bridge() != Some(entry.bridge) {
            return None;
        }
        let state = self.ports.get(&entry.ifindex)?;
        let port = state.port?;
        let vid = entry.vid.or_else(|| state.vlans.pvid())?;
        state.vlans.is_member(vid).then_some((port, vid))
    }

    /// Multicast membership. A port that is not yet in the VLAN is joined
    /// when it enters it.
    pub fn add_mdb(&mut self, ctx: &mut BridgeCtx<'_>, entry: &MdbEntry) -> SyncResult<()> {
        let Some((port, vid)) = self.mdb_target(entry) else {
            debug!("BridgeEngine: mdb {} on ifindex {} deferred", entry.group, entry.ifindex);
            return Ok(());
        };
        if ctx.vxlan.is_access_port(port, vid) {
            return Ok(());
        }
        self.join_group(ctx.hal, port, vid, entry)
    }

    pub fn remove_mdb(&mut self, ctx: &mut BridgeCtx<'_>, entry: &MdbEntry) -> SyncResult<()> {
        let Some((port, vid)) = self.mdb_target(entry) else {
            return Ok(());
        };
        let Some(group) = multicast_mac(&entry.group) else {
            return Ok(());
        };
        if !self.fdb.mcast_leave(&(port, vid, group)) {
            return Ok(());
        }
        ctx.hal
            .l2_mcast_group_leave(port, vid, group)
            .hal("l2_mcast_group_leave")
    }

    /// Per-VLAN STP override from the bridge-VLAN stream; `None` removes it.
    pub fn set_vlan_state(
        &mut self,
        ctx: &mut BridgeCtx<'_>,
        ifindex: u32,
        vid: VlanId,
        state: Option<StpState>,
    ) -> SyncResult<()> {
        let Some(port) = self.ports.get(&ifindex).and_then(|s| s.port) else {
            return Err(SyncError::unresolved(format!("bridge port ifindex {}", ifindex)));
        };
        self.stp.set_vlan(ctx.hal, port, vid, state)
    }

    pub fn add_vlan_state(&mut self, ctx: &mut BridgeCtx<'_>, state: &BridgeVlanState) -> SyncResult<()> {
        self.set_vlan_state(ctx, state.ifindex, state.vid, Some(state.state))
    }

    /// Forgets all state without touching the hardware.
    pub fn clear(&mut self) {
        self.bridge = None;
        self.refused.clear();
        self.ports.clear();
        self.domains.clear();
        self.fdb.clear();
        self.stp.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::BridgePortInfo;
    use pretty_assertions::assert_eq;
    use swsync_hal::{HalCall, SimulatedSwitch};

    const BRIDGE: u32 = 20;

    fn vid(n: u16) -> VlanId {
        VlanId::new(n).unwrap()
    }

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

    fn bridge_port(ifindex: u32, port: u16, vlans: &[(u16, bool)], pvid: Option<u16>) -> Link {
        let mut l = link(ifindex, LinkKind::SwitchPort { port });
        l.master = Some(BRIDGE);
        let mut membership = VlanMembership::new();
        for (v, untagged) in vlans {
            membership.add(vid(*v), *untagged, pvid == Some(*v));
        }
        l.bridge = Some(BridgePortInfo {
            vlans: membership,
            ..BridgePortInfo::default()
        });
        l
    }

    struct Harness {
        sw: SimulatedSwitch,
        cache: KernelCache,
        bonds: BondManager,
        vlans: VlanProgrammer,
        vxlan: VxlanEngine,
        bridge: BridgeEngine,
    }

    impl Harness {
        fn new() -> Self {
            let mut cache = KernelCache::new();
            let br = link(BRIDGE, LinkKind::Bridge { vlan_filtering: true });
            cache.upsert(br.clone());
            let mut bridge = BridgeEngine::new(true);
            bridge.add_bridge(&br).unwrap();
            Self {
                sw: SimulatedSwitch::new(),
                cache,
                bonds: BondManager::new(),
                vlans: VlanProgrammer::new(),
                vxlan: VxlanEngine::default(),
                bridge,
            }
        }

        fn run<R>(&mut self, f: impl FnOnce(&mut BridgeEngine, &mut BridgeCtx<'_>) -> R) -> R {
            let mut ctx = BridgeCtx {
                hal: &mut self.sw,
                cache: &self.cache,
                bonds: &self.bonds,
                vlans: &mut self.vlans,
                vxlan: &mut self.vxlan,
            };
            f(&mut self.bridge, &mut ctx)
        }

        fn port(&mut self, link: Link) -> SyncResult<()> {
            self.cache.upsert(link.clone());
            self.run(|b, ctx| b.update_port(ctx, &link))
        }
    }

    #[test]
    fn test_second_bridge_is_refused_once() {
        let mut bridge = BridgeEngine::new(true);
        bridge
            .add_bridge(&link(1, LinkKind::Bridge { vlan_filtering: true }))
            .unwrap();
        let other = link(2, LinkKind::Bridge { vlan_filtering: true });
        assert!(matches!(
            bridge.add_bridge(&other),
            Err(SyncError::Unsupported { .. })
        ));
        assert!(bridge.add_bridge(&other).is_ok());
        assert_eq!(bridge.bridge(), Some(1));
    }

    #[test]
    fn test_vlan_diff_programs_membership() {
        let mut h = Harness::new();
        let p = PortId::physical(1).unwrap();
        h.port(bridge_port(1, 1, &[(10, true), (20, false)], Some(10)))
            .unwrap();
        assert_eq!(h.sw.bridge_egress_vlans.get(&(p, vid(10))), Some(&true));
        assert_eq!(h.sw.bridge_egress_vlans.get(&(p, vid(20))), Some(&false));
        assert_eq!(h.sw.ingress_vlans.get(&(p, vid(10))), Some(&(true, 0)));

        // replaying the same snapshot touches nothing
        let before = h.sw.calls().len();
        h.port(bridge_port(1, 1, &[(10, true), (20, false)], Some(10)))
            .unwrap();
        assert_eq!(h.sw.calls().len(), before);

        h.port(bridge_port(1, 1, &[(10, true)], Some(10))).unwrap();
        assert!(!h.sw.bridge_egress_vlans.contains_key(&(p, vid(20))));
        assert_eq!(
            h.sw.count_calls(|c| matches!(c, HalCall::L2AddrRemoveAllInVlan { vid: v, .. } if *v == vid(20))),
            1
        );
    }

    #[test]
    fn test_fdb_mirror_and_learning() {
        let mut h = Harness::new();
        let p = PortId::physical(1).unwrap();
        h.port(bridge_port(1, 1, &[(10, true)], Some(10))).unwrap();
        let mac: MacAddress = "02:00:00:00:aa:01".parse().unwrap();

        h.run(|b, ctx| {
            b.learn(ctx, LearnedMac { port: p, vlan: None, mac })
        })
        .unwrap();
        let writes = h.bridge.take_writes();
        let FdbWrite::Add(echo) = &writes[0] else {
            panic!("expected an add, got {:?}", writes);
        };
        assert_eq!(echo.vlan, Some(vid(10)));

        h.run(|b, ctx| b.add_fdb(ctx, echo)).unwrap();
        assert_eq!(h.sw.l2_addrs.get(&(p, vid(10), mac)), Some(&false));

        h.run(|b, ctx| {
            b.age(ctx, AgedFdb { port: p, vlan: Some(vid(10)), mac })
        })
        .unwrap();
        assert!(matches!(h.bridge.take_writes()[0], FdbWrite::Del(_)));
        assert!(h.bridge.fdb().is_empty());

        // a static entry is permanent
        let fixed = FdbEntry {
            ifindex: 1,
            mac,
            vlan: Some(vid(10)),
            dst: None,
            master: Some(BRIDGE),
            ext_learned: false,
        };
        h.run(|b, ctx| b.add_fdb(ctx, &fixed)).unwrap();
        assert_eq!(h.sw.l2_addrs.get(&(p, vid(10), mac)), Some(&true));
        h.run(|b, ctx| b.remove_fdb(ctx, &fixed)).unwrap();
        assert!(h.sw.l2_addrs.is_empty());
    }

    #[test]
    fn test_learning_requires_membership() {
        let mut h = Harness::new();
        let p = PortId::physical(1).unwrap();
        h.port(bridge_port(1, 1, &[(10, false)], None)).unwrap();
        let mac = MacAddress::new([2, 0, 0, 0, 0, 9]);
        let untagged = h.run(|b, ctx| b.learn(ctx, LearnedMac { port: p, vlan: None, mac }));
        assert!(matches!(untagged, Err(SyncError::Unsupported { .. })));
        let foreign = h.run(|b, ctx| {
            b.learn(ctx, LearnedMac { port: p, vlan: Some(vid(30)), mac })
        });
        assert!(matches!(foreign, Err(SyncError::Unsupported { .. })));
    }

    #[test]
    fn test_multicast_restored_on_join() {
        let mut h = Harness::new();
        let p = PortId::physical(1).unwrap();
        let mdb = MdbEntry {
            bridge: BRIDGE,
            ifindex: 1,
            vid: Some(vid(10)),
            group: "239.1.1.1".parse().unwrap(),
        };
        h.cache.upsert(mdb.clone());
        h.port(bridge_port(1, 1, &[(10, false)], None)).unwrap();
        let group: MacAddress = "01:00:5e:01:01:01".parse().unwrap();
        assert!(h.sw.mcast.contains(&(p, vid(10), group)));

        h.port(bridge_port(1, 1, &[], None)).unwrap();
        assert!(h.sw.mcast.is_empty());
        h.run(|b, ctx| b.remove_mdb(ctx, &mdb)).unwrap();
    }

    #[test]
    fn test_stp_global_and_vlan_override() {
        let mut h = Harness::new();
        let p = PortId::physical(1).unwrap();
        let mut l = bridge_port(1, 1, &[(10, false)], None);
        h.port(l.clone()).unwrap();
        h.run(|b, ctx| b.set_vlan_state(ctx, 1, vid(10), Some(StpState::Blocking)))
            .unwrap();
        assert_eq!(h.sw.stp_vlan.get(&(p, vid(10))), Some(&StpState::Blocking));

        if let Some(info) = l.bridge.as_mut() {
            info.state = StpState::Learning;
        }
        h.port(l).unwrap();
        assert_eq!(h.sw.stp_port.get(&p), Some(&StpState::Learning));
        assert_eq!(h.bridge.stp().effective(p, vid(10)), StpState::Blocking);
        assert_eq!(h.bridge.bridged_state(1), Some(StpState::Learning));
    }

    #[test]
    fn test_vxlan_mapping_converts_ports() {
        let mut h = Harness::new();
        let p = PortId::physical(1).unwrap();
        let mut vx = link(
            100,
            LinkKind::Vxlan {
                vni: 100,
                local: Some("192.0.2.1".parse().unwrap()),
                group: None,
                dst_port: None,
            },
        );
        vx.master = Some(BRIDGE);
        h.vxlan.add_link(&mut h.sw, &vx).unwrap();
        h.port(bridge_port(1, 1, &[(50, false)], None)).unwrap();
        assert!(h.sw.bridge_egress_vlans.contains_key(&(p, vid(50))));

        let mut membership = VlanMembership::new();
        membership.add(vid(50), false, false);
        vx.bridge = Some(BridgePortInfo {
            vlans: membership,
            ..BridgePortInfo::default()
        });
        h.cache.upsert(vx.clone());
        h.run(|b, ctx| b.update_port(ctx, &vx)).unwrap();
        assert!(h.bridge.domain(vid(50)).is_some());
        assert!(h.vxlan.is_access_port(p, vid(50)));
        assert!(!h.sw.bridge_egress_vlans.contains_key(&(p, vid(50))));

        // the VXLAN port leaves: the port is a plain member again
        vx.bridge = Some(BridgePortInfo::default());
        h.run(|b, ctx| b.update_port(ctx, &vx)).unwrap();
        assert!(!h.vxlan.is_access_port(p, vid(50)));
        assert!(h.sw.bridge_egress_vlans.contains_key(&(p, vid(50))));
        assert!(h.sw.tunnel_ports.is_empty());
    }

    fn position(sw: &SimulatedSwitch, pred: impl Fn(&HalCall) -> bool) -> usize {
        sw.calls()
            .iter()
            .position(pred)
            .unwrap_or_else(|| panic!("call missing from {:?}", sw.calls()))
    }

    #[test]
    fn test_leaving_vlan_flushes_before_release() {
        let mut h = Harness::new();
        let p = PortId::physical(1).unwrap();
        h.port(bridge_port(1, 1, &[(10, false), (20, false)], None))
            .unwrap();
        let mac: MacAddress = "02:00:00:00:aa:02".parse().unwrap();
        let fixed = FdbEntry {
            ifindex: 1,
            mac,
            vlan: Some(vid(20)),
            dst: None,
            master: Some(BRIDGE),
            ext_learned: false,
        };
        h.run(|b, ctx| b.add_fdb(ctx, &fixed)).unwrap();
        let mdb = MdbEntry {
            bridge: BRIDGE,
            ifindex: 1,
            vid: Some(vid(20)),
            group: "239.1.1.2".parse().unwrap(),
        };
        h.run(|b, ctx| b.add_mdb(ctx, &mdb)).unwrap();
        assert_eq!(h.sw.mcast.len(), 1);

        h.port(bridge_port(1, 1, &[(10, false)], None)).unwrap();
        assert!(h.sw.l2_addrs.keys().all(|(_, v, _)| *v != vid(20)));
        assert!(h.sw.mcast.is_empty());
        assert!(h.bridge.fdb().is_empty());

        let flush = position(&h.sw, |c| {
            matches!(c, HalCall::L2AddrRemoveAllInVlan { port, vid: v } if *port == p && *v == vid(20))
        });
        let leave = position(&h.sw, |c| matches!(c, HalCall::McastLeave { port, .. } if *port == p));
        let release = position(&h.sw, |c| {
            matches!(c, HalCall::EgressBridgeVlanRemove { port, vid: v } if *port == p && *v == vid(20))
        });
        assert!(flush < release);
        assert!(leave < release);
    }

    #[test]
    fn test_access_port_flushed_before_delete() {
        let mut h = Harness::new();
        let p = PortId::physical(1).unwrap();
        let mut vx = link(
            100,
            LinkKind::Vxlan {
                vni: 100,
                local: Some("192.0.2.1".parse().unwrap()),
                group: None,
                dst_port: None,
            },
        );
        vx.master = Some(BRIDGE);
        let mut membership = VlanMembership::new();
        membership.add(vid(50), false, false);
        vx.bridge = Some(BridgePortInfo {
            vlans: membership,
            ..BridgePortInfo::default()
        });
        h.vxlan.add_link(&mut h.sw, &vx).unwrap();
        h.cache.upsert(vx.clone());
        h.run(|b, ctx| b.update_port(ctx, &vx)).unwrap();
        h.port(bridge_port(1, 1, &[(50, false)], None)).unwrap();
        assert!(h.vxlan.is_access_port(p, vid(50)));

        h.port(bridge_port(1, 1, &[], None)).unwrap();
        assert!(!h.vxlan.is_access_port(p, vid(50)));
        let flush = position(&h.sw, |c| {
            matches!(c, HalCall::L2AddrRemoveAllInVlan { port, vid: v } if *port == p && *v == vid(50))
        });
        let delete = position(&h.sw, |c| matches!(c, HalCall::TunnelPortDelete { .. }));
        assert!(flush < delete);
    }

    #[test]
    fn test_remove_port_cleans_up() {
        let mut h = Harness::new();
        let p = PortId::physical(1).unwrap();
        h.port(bridge_port(1, 1, &[(10, false), (11, true)], Some(11)))
            .unwrap();
        h.run(|b, ctx| b.remove_port(ctx, 1)).unwrap();
        assert!(h.sw.bridge_egress_vlans.is_empty());
        assert!(h.sw.ingress_vlans.is_empty());
        assert!(!h.bridge.is_port(1));
        assert!(h.sw.pvids.is_empty());
        assert!(h.bridge.stp().programmed(p, vid(10)).is_none());
    }
}
