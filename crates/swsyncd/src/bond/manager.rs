//! Bond to LAG mapping.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::kernel::{Link, LinkKind};
use crate::vlan::VlanProgrammer;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use swsync_common::{HalResultExt, SyncError, SyncResult};
use swsync_hal::{LagMode, SwitchHal};
use swsync_types::{PortId, StpState};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Member {
    port: PortId,
    active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Lag {
    id: PortId,
    name: String,
    mode: LagMode,
    /// member ifindex -> member
    members: BTreeMap<u32, Member>,
}

#[derive(Debug, Clone, Default)]
pub struct BondStats {
    pub lags_created: u64,
    pub lags_removed: u64,
    pub members_added: u64,
    pub members_removed: u64,
}

/// Tracks every bond the hardware knows as a LAG, keyed by the bond's
/// ifindex.
#[derive(Debug, Default)]
pub struct BondManager {
    lags: BTreeMap<u32, Lag>,
    stats: BondStats,
}

fn lag_mode(bond: &Link) -> LagMode {
    match bond.kind {
        LinkKind::Bond { mode } => LagMode::from_kernel(mode).unwrap_or_else(|| {
            warn!("BondManager: {} has unknown bond mode {}, using default", bond.name, mode);
            LagMode::default()
        }),
        _ => LagMode::default(),
    }
}

fn member_port(member: &Link) -> SyncResult<PortId> {
    match member.kind {
        LinkKind::SwitchPort { port } => PortId::physical(port)
            .map_err(|e| SyncError::inconsistent(format!("{}: {}", member.name, e))),
        _ => Err(SyncError::unsupported(format!(
            "bond member {} is not a switch port",
            member.name
        ))),
    }
}

impl BondManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &BondStats {
        &self.stats
    }

    /// LAG id of bond `ifindex`.
    pub fn lag_of(&self, ifindex: u32) -> Option<PortId> {
        self.lags.get(&ifindex).map(|l| l.id)
    }

    pub fn bond_of_lag(&self, lag: PortId) -> Option<u32> {
        self.lags
            .iter()
            .find(|(_, l)| l.id == lag)
            .map(|(ifindex, _)| *ifindex)
    }

    /// Hardware ports currently in `lag`.
    pub fn members_of(&self, lag: PortId) -> Vec<PortId> {
        self.lags
            .values()
            .find(|l| l.id == lag)
            .map(|l| l.members.values().map(|m| m.port).collect())
            .unwrap_or_default()
    }

    /// Bond a member link is enslaved to, as the hardware sees it.
    pub fn bond_of_member(&self, member: u32) -> Option<u32> {
        self.lags
            .iter()
            .find(|(_, l)| l.members.contains_key(&member))
            .map(|(ifindex, _)| *ifindex)
    }

    pub fn is_member(&self, member: u32) -> bool {
        self.bond_of_member(member).is_some()
    }

    pub fn len(&self) -> usize {
        self.lags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lags.is_empty()
    }

    /// Creates the LAG for `bond`. A bond that already has one keeps it.
    pub fn add_lag(&mut self, hal: &mut dyn SwitchHal, bond: &Link) -> SyncResult<PortId> {
        if let Some(lag) = self.lags.get(&bond.ifindex) {
            debug!("BondManager: {} already mapped to {}", bond.name, lag.id);
            return Ok(lag.id);
        }

        let mode = lag_mode(bond);
        let id = match hal.lag_create(&bond.name, mode).hal("lag_create") {
            Ok(id) => id,
            Err(e) => {
                audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "BondManager", "create_lag")
                    .with_object_id(bond.name.clone())
                    .with_object_type("lag")
                    .with_error(e.to_string()));
                return Err(e);
            }
        };

        self.lags.insert(
            bond.ifindex,
            Lag {
                id,
                name: bond.name.clone(),
                mode,
                members: BTreeMap::new(),
            },
        );
        self.stats.lags_created += 1;
        info!("BondManager: created {} for {} ({})", id, bond.name, mode);

        audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, "BondManager", "create_lag")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(id.to_string())
            .with_object_type("lag")
            .with_details(serde_json::json!({
                "bond": bond.name,
                "ifindex": bond.ifindex,
                "mode": mode.to_string(),
            })));

        Ok(id)
    }

    /// Applies a bond mode change.
    pub fn update_lag(&mut self, hal: &mut dyn SwitchHal, bond: &Link) -> SyncResult<()> {
        let Some(lag) = self.lags.get_mut(&bond.ifindex) else {
            return self.add_lag(hal, bond).map(|_| ());
        };
        let mode = lag_mode(bond);
        if lag.mode != mode {
            hal.lag_set_mode(lag.id, mode).hal("lag_set_mode")?;
            info!("BondManager: {} mode {} -> {}", lag.id, lag.mode, mode);
            lag.mode = mode;
        }
        lag.name.clone_from(&bond.name);
        Ok(())
    }

    /// Removes the LAG of bond `ifindex`, detaching any member still in it.
    pub fn remove_lag(&mut self, hal: &mut dyn SwitchHal, ifindex: u32) -> SyncResult<()> {
        let Some(lag) = self.lags.remove(&ifindex) else {
            debug!("BondManager: ifindex {} has no LAG", ifindex);
            return Ok(());
        };

        for member in lag.members.values() {
            if let Err(e) = hal.lag_remove_member(lag.id, member.port) {
                warn!("BondManager: cannot detach {} from {}: {}", member.port, lag.id, e);
            }
        }
        hal.lag_remove(lag.id).hal("lag_remove")?;
        self.stats.lags_removed += 1;
        info!("BondManager: removed {} ({})", lag.id, lag.name);

        audit_log!(AuditRecord::new(AuditCategory::ResourceDelete, "BondManager", "remove_lag")
            .with_outcome(AuditOutcome::Success)
            .with_object_id(lag.id.to_string())
            .with_object_type("lag")
            .with_details(serde_json::json!({
                "bond": lag.name,
                "ifindex": ifindex,
            })));
        Ok(())
    }

    /// Enslaves `member` to `bond` in hardware, creating the LAG if needed,
    /// then replays the LAG's VLANs onto it. `bridge_state` is the LAG's STP
    /// state when the bond is a bridge port.
    pub fn add_member(
        &mut self,
        hal: &mut dyn SwitchHal,
        vlans: &mut VlanProgrammer,
        bond: &Link,
        member: &Link,
        bridge_state: Option<StpState>,
    ) -> SyncResult<()> {
        if self.bond_of_member(member.ifindex) == Some(bond.ifindex) {
            return self.update_member(hal, bond.ifindex, member);
        }
        let port = member_port(member)?;
        let lag = self.add_lag(hal, bond)?;
        let active = member.slave.map_or(true, |s| s.active);

        hal.lag_add_member(lag, port).hal("lag_add_member")?;
        if let Err(e) = hal.lag_set_member_active(lag, port, active) {
            let _ = hal.lag_remove_member(lag, port);
            return Err(SyncError::hardware("lag_set_member_active", e));
        }

        if let Some(entry) = self.lags.get_mut(&bond.ifindex) {
            entry.members.insert(member.ifindex, Member { port, active });
        }
        self.stats.members_added += 1;
        info!("BondManager: {} joined {} (active: {})", member.name, lag, active);

        vlans.enable_member_vlans(hal, lag, port)?;
        if let Some(state) = bridge_state {
            hal.stp_port_state_set(port, state).hal("stp_port_state_set")?;
        }
        Ok(())
    }

    /// Applies a member's active flag.
    pub fn update_member(
        &mut self,
        hal: &mut dyn SwitchHal,
        bond: u32,
        member: &Link,
    ) -> SyncResult<()> {
        let Some(lag) = self.lags.get_mut(&bond) else {
            return Err(SyncError::unresolved(format!("LAG for bond ifindex {}", bond)));
        };
        let Some(entry) = lag.members.get_mut(&member.ifindex) else {
            return Err(SyncError::inconsistent(format!(
                "{} is not a member of {}",
                member.name, lag.id
            )));
        };
        let active = member.slave.map_or(true, |s| s.active);
        if entry.active != active {
            hal.lag_set_member_active(lag.id, entry.port, active)
                .hal("lag_set_member_active")?;
            debug!("BondManager: {} in {} active -> {}", entry.port, lag.id, active);
            entry.active = active;
        }
        Ok(())
    }

    /// Detaches a member. The LAG stays even when this was the last member.
    pub fn remove_member(
        &mut self,
        hal: &mut dyn SwitchHal,
        vlans: &mut VlanProgrammer,
        member: u32,
        bridged: bool,
    ) -> SyncResult<()> {
        let Some(bond) = self.bond_of_member(member) else {
            debug!("BondManager: ifindex {} is not a LAG member", member);
            return Ok(());
        };
        let Some(lag) = self.lags.get_mut(&bond) else {
            return Ok(());
        };
        let Some(entry) = lag.members.remove(&member) else {
            return Ok(());
        };
        let lag_id = lag.id;
        hal.lag_remove_member(lag_id, entry.port)
            .hal("lag_remove_member")?;
        self.stats.members_removed += 1;
        info!("BondManager: {} left {}", entry.port, lag_id);

        if bridged {
            hal.stp_port_state_set(entry.port, StpState::Forwarding)
                .hal("stp_port_state_set")?;
        }
        vlans.disable_member_vlans(hal, lag_id, entry.port)
    }

    /// Forgets every LAG without touching the hardware.
    pub fn clear(&mut self) {
        self.lags.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::BondSlave;
    use pretty_assertions::assert_eq;
    use swsync_hal::SimulatedSwitch;
    use swsync_types::{MacAddress, VlanId};

    fn bond(ifindex: u32, mode: u8) -> Link {
        Link {
            ifindex,
            name: format!("bond{}", ifindex),
            kind: LinkKind::Bond { mode },
            mac: MacAddress::new([2, 0, 0, 0, 1, ifindex as u8]),
            master: None,
            lower: None,
            admin_up: true,
            mtu: None,
            slave: None,
            bridge: None,
        }
    }

    fn swp(ifindex: u32, port: u16, master: u32, active: bool) -> Link {
        Link {
            ifindex,
            name: format!("swp{}", port),
            kind: LinkKind::SwitchPort { port },
            mac: MacAddress::new([2, 0, 0, 0, 0, port as u8]),
            master: Some(master),
            lower: None,
            admin_up: true,
            mtu: None,
            slave: Some(BondSlave { active }),
            bridge: None,
        }
    }

    #[test]
    fn test_add_lag_is_idempotent() {
        let mut sw = SimulatedSwitch::new();
        let mut bonds = BondManager::new();
        let b = bond(10, 4);
        let first = bonds.add_lag(&mut sw, &b).unwrap();
        let second = bonds.add_lag(&mut sw, &b).unwrap();
        assert_eq!(first, second);
        assert_eq!(sw.lags.len(), 1);
        assert_eq!(sw.lags[&first].mode, LagMode::Lacp);
        assert_eq!(bonds.bond_of_lag(first), Some(10));
    }

    #[test]
    fn test_mode_change() {
        let mut sw = SimulatedSwitch::new();
        let mut bonds = BondManager::new();
        let lag = bonds.add_lag(&mut sw, &bond(10, 0)).unwrap();
        bonds.update_lag(&mut sw, &bond(10, 1)).unwrap();
        assert_eq!(sw.lags[&lag].mode, LagMode::ActiveBackup);
    }

    #[test]
    fn test_member_creates_lag_and_replays_vlans() {
        let mut sw = SimulatedSwitch::new();
        let mut bonds = BondManager::new();
        let mut vlans = VlanProgrammer::new();
        let b = bond(10, 4);
        let lag = bonds.add_lag(&mut sw, &b).unwrap();
        let vid = VlanId::new(10).unwrap();
        vlans.add_vlan(&mut sw, &bonds, lag, vid, true).unwrap();

        let member = swp(3, 3, 10, true);
        bonds
            .add_member(&mut sw, &mut vlans, &b, &member, Some(StpState::Learning))
            .unwrap();
        let p3 = PortId::physical(3).unwrap();
        assert_eq!(sw.lags[&lag].members.get(&p3), Some(&true));
        assert_eq!(sw.egress_vlans.get(&(p3, vid)), Some(&false));
        assert_eq!(sw.stp_port.get(&p3), Some(&StpState::Learning));
        assert_eq!(bonds.members_of(lag), vec![p3]);

        bonds
            .update_member(&mut sw, 10, &swp(3, 3, 10, false))
            .unwrap();
        assert_eq!(sw.lags[&lag].members.get(&p3), Some(&false));

        bonds.remove_member(&mut sw, &mut vlans, 3, true).unwrap();
        assert!(sw.lags[&lag].members.is_empty());
        assert!(!sw.egress_vlans.contains_key(&(p3, vid)));
        assert_eq!(sw.stp_port.get(&p3), Some(&StpState::Forwarding));
        // the LAG outlives its last member
        assert_eq!(bonds.lag_of(10), Some(lag));
    }

    #[test]
    fn test_member_of_unknown_bond_creates_lag() {
        let mut sw = SimulatedSwitch::new();
        let mut bonds = BondManager::new();
        let mut vlans = VlanProgrammer::new();
        bonds
            .add_member(&mut sw, &mut vlans, &bond(11, 0), &swp(4, 4, 11, true), None)
            .unwrap();
        assert!(bonds.lag_of(11).is_some());
        assert!(bonds.is_member(4));
    }

    #[test]
    fn test_non_switch_member_is_unsupported() {
        let mut sw = SimulatedSwitch::new();
        let mut bonds = BondManager::new();
        let mut vlans = VlanProgrammer::new();
        let mut other = swp(5, 5, 10, true);
        other.kind = LinkKind::Other;
        let err = bonds
            .add_member(&mut sw, &mut vlans, &bond(10, 0), &other, None)
            .unwrap_err();
        assert!(matches!(err, SyncError::Unsupported { .. }));
    }
}
