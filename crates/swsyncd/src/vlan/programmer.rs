//! Per-port VLAN programming.

use crate::bond::BondManager;
use crate::kernel::vrf_of_table;
use log::{debug, error, warn};
use std::collections::BTreeMap;
use swsync_common::{HalResultExt, Release, ResourcePool, SyncError, SyncResult};
use swsync_hal::SwitchHal;
use swsync_types::{PortId, VlanId};

/// A routed port's binding to one VLAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortVlan {
    pub tagged: bool,
    pub vrf: u32,
}

/// Bridge membership of one (port, VLAN).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeVlan {
    /// Current PVID role.
    pub pvid: bool,
    pub untagged: bool,
    pub vrf: u32,
    /// PVID flag the ingress filter was programmed with; a PVID gained later
    /// goes through `ingress_port_pvid_add` instead.
    ingress_pvid: bool,
}

/// Refcounted VLAN programming for routed and bridged ports.
///
/// LAG ports fan every call out to the LAG itself and each of its members.
#[derive(Debug)]
pub struct VlanProgrammer {
    bindings: ResourcePool<(PortId, VlanId), PortVlan>,
    bridge_vlans: BTreeMap<(PortId, VlanId), BridgeVlan>,
    pushes: ResourcePool<(PortId, VlanId, VlanId), ()>,
    pops: ResourcePool<(PortId, VlanId), ()>,
    /// VRF of a routed (port, VLAN), or of a bridge VLAN when the port is
    /// `None`.
    vrfs: BTreeMap<(Option<PortId>, VlanId), u32>,
}

impl Default for VlanProgrammer {
    fn default() -> Self {
        Self::new()
    }
}

fn fan_out(bonds: &BondManager, port: PortId) -> Vec<PortId> {
    let mut out = vec![port];
    if port.is_lag() {
        out.extend(bonds.members_of(port));
    }
    out
}

/// Keeps the first error while the remaining steps still run.
fn keep_first(first: &mut Option<SyncError>, result: SyncResult<()>) {
    if let Err(e) = result {
        error!("VlanProgrammer: {}", e);
        first.get_or_insert(e);
    }
}

/// A rollback step failed; the caller still reports the error that started
/// the rollback.
fn unwind_failed<T, E: std::fmt::Display>(step: &str, result: Result<T, E>) {
    if let Err(e) = result {
        warn!("VlanProgrammer: unwinding {} failed: {}", step, e);
    }
}

fn first_or_ok(first: Option<SyncError>) -> SyncResult<()> {
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

impl VlanProgrammer {
    pub fn new() -> Self {
        Self {
            bindings: ResourcePool::new("port_vlan"),
            bridge_vlans: BTreeMap::new(),
            pushes: ResourcePool::new("vlan_push"),
            pops: ResourcePool::new("vlan_pop"),
            vrfs: BTreeMap::new(),
        }
    }

    fn vrf_for(&self, port: Option<PortId>, vid: VlanId) -> u32 {
        self.vrfs.get(&(port, vid)).copied().unwrap_or(0)
    }

    pub fn binding(&self, port: PortId, vid: VlanId) -> Option<PortVlan> {
        self.bindings.get(&(port, vid)).copied()
    }

    pub fn binding_refcount(&self, port: PortId, vid: VlanId) -> u32 {
        self.bindings.refcount(&(port, vid))
    }

    pub fn bridge_vlan(&self, port: PortId, vid: VlanId) -> Option<BridgeVlan> {
        self.bridge_vlans.get(&(port, vid)).copied()
    }

    /// Takes a reference on the routed (port, VLAN) binding. The first
    /// reference programs ingress then egress on every target.
    pub fn add_vlan(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: PortId,
        vid: VlanId,
        tagged: bool,
    ) -> SyncResult<()> {
        let vrf = self.vrf_for(Some(port), vid);
        let targets = fan_out(bonds, port);
        let binding = self.bindings.acquire(&(port, vid), |_| {
            enable_vlan(hal, &targets, vid, tagged, vrf)?;
            debug!("VlanProgrammer: bound {} to vlan {} (tagged: {})", port, vid, tagged);
            Ok::<_, SyncError>(PortVlan { tagged, vrf })
        })?;
        if binding.tagged != tagged {
            warn!(
                "VlanProgrammer: {} vlan {} already bound with tagged={}, keeping it",
                port, vid, binding.tagged
            );
        }
        Ok(())
    }

    /// Drops a reference; the last one removes ingress, flushes L2 and
    /// removes egress.
    pub fn remove_vlan(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: PortId,
        vid: VlanId,
    ) -> SyncResult<()> {
        let targets = fan_out(bonds, port);
        let released = self.bindings.release(&(port, vid), |_, binding| {
            disable_vlan(hal, &targets, vid, binding.tagged, binding.vrf)
        })?;
        if let Release::Destroyed(_) = released {
            debug!("VlanProgrammer: unbound {} from vlan {}", port, vid);
        }
        Ok(())
    }

    pub fn add_ingress_vlan(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: PortId,
        vid: VlanId,
        pvid: bool,
    ) -> SyncResult<()> {
        let vrf = self.vrf_for(Some(port), vid);
        for t in fan_out(bonds, port) {
            hal.ingress_port_vlan_add(t, vid, pvid, vrf)
                .hal("ingress_port_vlan_add")?;
        }
        Ok(())
    }

    pub fn remove_ingress_vlan(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: PortId,
        vid: VlanId,
        pvid: bool,
    ) -> SyncResult<()> {
        let vrf = self.vrf_for(Some(port), vid);
        let mut first = None;
        for t in fan_out(bonds, port) {
            keep_first(
                &mut first,
                hal.ingress_port_vlan_remove(t, vid, pvid, vrf)
                    .hal("ingress_port_vlan_remove"),
            );
        }
        first_or_ok(first)
    }

    pub fn add_pvid(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: PortId,
        vid: VlanId,
    ) -> SyncResult<()> {
        for t in fan_out(bonds, port) {
            hal.ingress_port_pvid_add(t, vid).hal("ingress_port_pvid_add")?;
        }
        Ok(())
    }

    pub fn remove_pvid(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: PortId,
        vid: VlanId,
    ) -> SyncResult<()> {
        let mut first = None;
        for t in fan_out(bonds, port) {
            keep_first(
                &mut first,
                hal.ingress_port_pvid_remove(t, vid).hal("ingress_port_pvid_remove"),
            );
        }
        first_or_ok(first)
    }

    /// Makes `port` a bridge member of `vid`. Re-adding with the same flags
    /// is a no-op; different flags re-program the membership.
    pub fn add_bridge_vlan(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: PortId,
        vid: VlanId,
        pvid: bool,
        untagged: bool,
    ) -> SyncResult<()> {
        if let Some(existing) = self.bridge_vlans.get(&(port, vid)) {
            if existing.pvid == pvid && existing.untagged == untagged {
                debug!("VlanProgrammer: {} already in bridge vlan {}", port, vid);
                return Ok(());
            }
            return self.update_bridge_vlan(hal, bonds, port, vid, pvid, untagged);
        }

        let vrf = self.vrf_for(None, vid);
        let targets = fan_out(bonds, port);
        for (i, &t) in targets.iter().enumerate() {
            if let Err(e) = add_bridge_membership(hal, t, vid, pvid, untagged, vrf) {
                for &d in targets[..i].iter().rev() {
                    unwind_failed(
                        "ingress_port_vlan_remove",
                        hal.ingress_port_vlan_remove(d, vid, pvid, vrf),
                    );
                    unwind_failed(
                        "egress_bridge_port_vlan_remove",
                        hal.egress_bridge_port_vlan_remove(d, vid),
                    );
                }
                return Err(e);
            }
        }

        self.bridge_vlans.insert(
            (port, vid),
            BridgeVlan {
                pvid,
                untagged,
                vrf,
                ingress_pvid: pvid,
            },
        );
        debug!(
            "VlanProgrammer: {} joined bridge vlan {} (pvid: {}, untagged: {})",
            port, vid, pvid, untagged
        );
        Ok(())
    }

    /// Re-programs the untagged flag and PVID role of an existing bridge
    /// membership in place.
    pub fn update_bridge_vlan(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: PortId,
        vid: VlanId,
        pvid: bool,
        untagged: bool,
    ) -> SyncResult<()> {
        let Some(mut entry) = self.bridge_vlans.get(&(port, vid)).copied() else {
            return self.add_bridge_vlan(hal, bonds, port, vid, pvid, untagged);
        };
        let targets = fan_out(bonds, port);

        if entry.untagged != untagged {
            for &t in &targets {
                hal.egress_bridge_port_vlan_add(t, vid, untagged)
                    .hal("egress_bridge_port_vlan_add")?;
            }
            entry.untagged = untagged;
        }

        if entry.pvid != pvid {
            if pvid {
                self.add_pvid(hal, bonds, port, vid)?;
            } else if entry.ingress_pvid {
                for &t in &targets {
                    hal.ingress_port_vlan_add(t, vid, false, entry.vrf)
                        .hal("ingress_port_vlan_add")?;
                }
                entry.ingress_pvid = false;
            } else {
                self.remove_pvid(hal, bonds, port, vid)?;
            }
            entry.pvid = pvid;
        }

        self.bridge_vlans.insert((port, vid), entry);
        Ok(())
    }

    /// Removes a bridge membership. Unknown memberships are ignored.
    pub fn remove_bridge_vlan(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: PortId,
        vid: VlanId,
    ) -> SyncResult<()> {
        let Some(entry) = self.bridge_vlans.remove(&(port, vid)) else {
            debug!("VlanProgrammer: {} not in bridge vlan {}", port, vid);
            return Ok(());
        };
        let mut first = None;
        for t in fan_out(bonds, port) {
            remove_bridge_membership(hal, t, vid, &entry, &mut first);
        }
        first_or_ok(first)
    }

    /// QinQ: frames with `inner` entering `port` get `outer` pushed, and
    /// `outer` is popped on the way out.
    pub fn add_stacked_vlan(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: PortId,
        outer: VlanId,
        inner: VlanId,
    ) -> SyncResult<()> {
        let targets = fan_out(bonds, port);
        self.pops.acquire(&(port, outer), |_| {
            for &t in &targets {
                hal.egress_port_vlan_pop_add(t, outer)
                    .hal("egress_port_vlan_pop_add")?;
            }
            Ok::<_, SyncError>(())
        })?;
        let pushed = self.pushes.acquire(&(port, outer, inner), |_| {
            for &t in &targets {
                hal.ingress_port_vlan_push_add(t, outer, inner)
                    .hal("ingress_port_vlan_push_add")?;
            }
            Ok::<_, SyncError>(())
        });
        if let Err(e) = pushed {
            let popped = self.pops.release(&(port, outer), |_, _| {
                for &t in &targets {
                    hal.egress_port_vlan_pop_remove(t, outer)
                        .hal("egress_port_vlan_pop_remove")?;
                }
                Ok::<_, SyncError>(())
            });
            unwind_failed("egress_port_vlan_pop_remove", popped);
            return Err(e);
        }
        Ok(())
    }

    pub fn remove_stacked_vlan(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: PortId,
        outer: VlanId,
        inner: VlanId,
    ) -> SyncResult<()> {
        let targets = fan_out(bonds, port);
        let mut first = None;
        keep_first(
            &mut first,
            self.pushes
                .release(&(port, outer, inner), |_, _| {
                    for &t in &targets {
                        hal.ingress_port_vlan_push_remove(t, outer, inner)
                            .hal("ingress_port_vlan_push_remove")?;
                    }
                    Ok::<_, SyncError>(())
                })
                .map(|_| ()),
        );
        keep_first(
            &mut first,
            self.pops
                .release(&(port, outer), |_, _| {
                    for &t in &targets {
                        hal.egress_port_vlan_pop_remove(t, outer)
                            .hal("egress_port_vlan_pop_remove")?;
                    }
                    Ok::<_, SyncError>(())
                })
                .map(|_| ()),
        );
        first_or_ok(first)
    }

    /// Binds `vid` to the VRF of kernel table `table` and re-programs the
    /// ingress filters already carrying it. `port` selects one routed port;
    /// `None` binds the bridge VLAN.
    pub fn vrf_attach(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: Option<PortId>,
        vid: VlanId,
        table: u32,
    ) -> SyncResult<()> {
        let vrf = vrf_of_table(table);
        if self.vrfs.insert((port, vid), vrf) == Some(vrf) {
            return Ok(());
        }
        debug!("VlanProgrammer: vlan {} on {:?} -> vrf {}", vid, port, vrf);
        self.rebind(hal, bonds, port, vid)
    }

    pub fn vrf_detach(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: Option<PortId>,
        vid: VlanId,
    ) -> SyncResult<()> {
        if self.vrfs.remove(&(port, vid)).is_none() {
            return Ok(());
        }
        debug!("VlanProgrammer: vlan {} on {:?} back to default vrf", vid, port);
        self.rebind(hal, bonds, port, vid)
    }

    fn rebind(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: Option<PortId>,
        vid: VlanId,
    ) -> SyncResult<()> {
        let mut first = None;
        match port {
            Some(p) => {
                let vrf = self.vrf_for(Some(p), vid);
                if let Some(binding) = self.bindings.get_mut(&(p, vid)) {
                    for t in fan_out(bonds, p) {
                        keep_first(
                            &mut first,
                            rebind_ingress(hal, t, vid, !binding.tagged, binding.vrf, vrf),
                        );
                    }
                    binding.vrf = vrf;
                }
            }
            None => {
                let vrf = self.vrf_for(None, vid);
                for (&(p, v), entry) in self.bridge_vlans.iter_mut() {
                    if v != vid {
                        continue;
                    }
                    for t in fan_out(bonds, p) {
                        keep_first(
                            &mut first,
                            rebind_ingress(hal, t, vid, entry.ingress_pvid, entry.vrf, vrf),
                        );
                    }
                    entry.vrf = vrf;
                }
            }
        }
        first_or_ok(first)
    }

    /// Replays everything programmed on `lag` onto a joining member.
    pub fn enable_member_vlans(
        &mut self,
        hal: &mut dyn SwitchHal,
        lag: PortId,
        member: PortId,
    ) -> SyncResult<()> {
        let mut first = None;
        for (port, vid) in self.bindings.keys_where(|k, _| k.0 == lag) {
            if let Some(b) = self.bindings.get(&(port, vid)) {
                keep_first(&mut first, enable_vlan(hal, &[member], vid, b.tagged, b.vrf));
            }
        }
        for ((_, vid), entry) in self.bridge_vlans.iter().filter(|((p, _), _)| *p == lag) {
            keep_first(
                &mut first,
                add_bridge_membership(hal, member, *vid, entry.pvid, entry.untagged, entry.vrf),
            );
        }
        for (_, outer) in self.pops.keys_where(|k, _| k.0 == lag) {
            keep_first(
                &mut first,
                hal.egress_port_vlan_pop_add(member, outer)
                    .hal("egress_port_vlan_pop_add"),
            );
        }
        for (_, outer, inner) in self.pushes.keys_where(|k, _| k.0 == lag) {
            keep_first(
                &mut first,
                hal.ingress_port_vlan_push_add(member, outer, inner)
                    .hal("ingress_port_vlan_push_add"),
            );
        }
        first_or_ok(first)
    }

    /// Removes everything programmed on `lag` from a leaving member.
    pub fn disable_member_vlans(
        &mut self,
        hal: &mut dyn SwitchHal,
        lag: PortId,
        member: PortId,
    ) -> SyncResult<()> {
        let mut first = None;
        for (port, vid) in self.bindings.keys_where(|k, _| k.0 == lag) {
            if let Some(b) = self.bindings.get(&(port, vid)) {
                keep_first(&mut first, disable_vlan(hal, &[member], vid, b.tagged, b.vrf));
            }
        }
        let lag_vlans: Vec<(VlanId, BridgeVlan)> = self
            .bridge_vlans
            .iter()
            .filter(|((p, _), _)| *p == lag)
            .map(|((_, v), e)| (*v, *e))
            .collect();
        for (vid, entry) in lag_vlans {
            let member_entry = BridgeVlan {
                ingress_pvid: entry.pvid,
                ..entry
            };
            remove_bridge_membership(hal, member, vid, &member_entry, &mut first);
        }
        for (_, outer, inner) in self.pushes.keys_where(|k, _| k.0 == lag) {
            keep_first(
                &mut first,
                hal.ingress_port_vlan_push_remove(member, outer, inner)
                    .hal("ingress_port_vlan_push_remove"),
            );
        }
        for (_, outer) in self.pops.keys_where(|k, _| k.0 == lag) {
            keep_first(
                &mut first,
                hal.egress_port_vlan_pop_remove(member, outer)
                    .hal("egress_port_vlan_pop_remove"),
            );
        }
        first_or_ok(first)
    }

    /// Forgets all state without touching the hardware.
    pub fn clear(&mut self) {
        self.bindings.drain();
        self.bridge_vlans.clear();
        self.pushes.drain();
        self.pops.drain();
        self.vrfs.clear();
    }
}

fn enable_vlan(
    hal: &mut dyn SwitchHal,
    targets: &[PortId],
    vid: VlanId,
    tagged: bool,
    vrf: u32,
) -> SyncResult<()> {
    let pvid = !tagged;
    for (i, &t) in targets.iter().enumerate() {
        if let Err(e) = hal.ingress_port_vlan_add(t, vid, pvid, vrf) {
            for &d in &targets[..i] {
                unwind_failed(
                    "ingress_port_vlan_remove",
                    hal.ingress_port_vlan_remove(d, vid, pvid, vrf),
                );
            }
            return Err(SyncError::hardware("ingress_port_vlan_add", e));
        }
    }
    for (i, &t) in targets.iter().enumerate() {
        if let Err(e) = hal.egress_port_vlan_add(t, vid, !tagged) {
            for &d in &targets[..i] {
                unwind_failed("egress_port_vlan_remove", hal.egress_port_vlan_remove(d, vid));
            }
            for &d in targets {
                unwind_failed(
                    "ingress_port_vlan_remove",
                    hal.ingress_port_vlan_remove(d, vid, pvid, vrf),
                );
            }
            return Err(SyncError::hardware("egress_port_vlan_add", e));
        }
    }
    Ok(())
}

fn disable_vlan(
    hal: &mut dyn SwitchHal,
    targets: &[PortId],
    vid: VlanId,
    tagged: bool,
    vrf: u32,
) -> SyncResult<()> {
    let mut first = None;
    for &t in targets {
        keep_first(
            &mut first,
            hal.ingress_port_vlan_remove(t, vid, !tagged, vrf)
                .hal("ingress_port_vlan_remove"),
        );
    }
    for &t in targets {
        keep_first(
            &mut first,
            hal.l2_addr_remove_all_in_vlan(t, vid)
                .hal("l2_addr_remove_all_in_vlan"),
        );
    }
    for &t in targets {
        keep_first(
            &mut first,
            hal.egress_port_vlan_remove(t, vid).hal("egress_port_vlan_remove"),
        );
    }
    first_or_ok(first)
}

fn add_bridge_membership(
    hal: &mut dyn SwitchHal,
    port: PortId,
    vid: VlanId,
    pvid: bool,
    untagged: bool,
    vrf: u32,
) -> SyncResult<()> {
    hal.egress_bridge_port_vlan_add(port, vid, untagged)
        .hal("egress_bridge_port_vlan_add")?;
    if let Err(e) = hal.ingress_port_vlan_add(port, vid, pvid, vrf) {
        unwind_failed(
            "egress_bridge_port_vlan_remove",
            hal.egress_bridge_port_vlan_remove(port, vid),
        );
        return Err(SyncError::hardware("ingress_port_vlan_add", e));
    }
    Ok(())
}

fn remove_bridge_membership(
    hal: &mut dyn SwitchHal,
    port: PortId,
    vid: VlanId,
    entry: &BridgeVlan,
    first: &mut Option<SyncError>,
) {
    if entry.pvid && !entry.ingress_pvid {
        keep_first(
            first,
            hal.ingress_port_pvid_remove(port, vid).hal("ingress_port_pvid_remove"),
        );
    }
    keep_first(
        first,
        hal.ingress_port_vlan_remove(port, vid, entry.ingress_pvid, entry.vrf)
            .hal("ingress_port_vlan_remove"),
    );
    keep_first(
        first,
        hal.egress_bridge_port_vlan_remove(port, vid)
            .hal("egress_bridge_port_vlan_remove"),
    );
}

fn rebind_ingress(
    hal: &mut dyn SwitchHal,
    port: PortId,
    vid: VlanId,
    pvid: bool,
    old_vrf: u32,
    vrf: u32,
) -> SyncResult<()> {
    hal.ingress_port_vlan_remove(port, vid, pvid, old_vrf)
        .hal("ingress_port_vlan_remove")?;
    hal.ingress_port_vlan_add(port, vid, pvid, vrf)
        .hal("ingress_port_vlan_add")
}
