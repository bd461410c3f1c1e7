//! Spanning-tree state merge.
//!
//! Each bridge port has a global state (from the bridge port link) and may
//! have per-VLAN overrides (from the bridge-VLAN stream). The hardware gets
//! the global state per port and, for every joined (port, VLAN) with an
//! override, the effective per-VLAN state. Only deltas are pushed.

use crate::bond::BondManager;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use swsync_common::{HalResultExt, SyncResult};
use swsync_hal::SwitchHal;
use swsync_types::{PortId, StpState, VlanId};

#[derive(Debug)]
pub struct StpTable {
    enabled: bool,
    global: BTreeMap<PortId, StpState>,
    overrides: BTreeMap<(PortId, VlanId), StpState>,
    joined: BTreeSet<(PortId, VlanId)>,
    /// Per-VLAN state last pushed to the hardware.
    programmed: BTreeMap<(PortId, VlanId), StpState>,
}

impl StpTable {
    /// A disabled table tracks state but never touches the hardware.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            global: BTreeMap::new(),
            overrides: BTreeMap::new(),
            joined: BTreeSet::new(),
            programmed: BTreeMap::new(),
        }
    }

    pub fn global(&self, port: PortId) -> StpState {
        self.global.get(&port).copied().unwrap_or_default()
    }

    pub fn effective(&self, port: PortId, vid: VlanId) -> StpState {
        StpState::effective(self.global(port), self.overrides.get(&(port, vid)).copied())
    }

    pub fn programmed(&self, port: PortId, vid: VlanId) -> Option<StpState> {
        self.programmed.get(&(port, vid)).copied()
    }

    /// Pushes the effective state of (port, vid) if it differs from what the
    /// hardware has. Without an override the port-global state applies and
    /// nothing per-VLAN is needed.
    fn sync(&mut self, hal: &mut dyn SwitchHal, port: PortId, vid: VlanId) -> SyncResult<()> {
        if !self.enabled || !self.joined.contains(&(port, vid)) {
            return Ok(());
        }
        let target = if self.overrides.contains_key(&(port, vid)) {
            self.effective(port, vid)
        } else if self.programmed.contains_key(&(port, vid)) {
            // override just went away: fall back to the global state
            self.global(port)
        } else {
            return Ok(());
        };
        if self.programmed.get(&(port, vid)) == Some(&target) {
            return Ok(());
        }
        hal.stp_port_vlan_state_set(port, vid, target)
            .hal("stp_port_vlan_state_set")?;
        debug!("StpTable: {} vlan {} -> {}", port, vid, target);
        if self.overrides.contains_key(&(port, vid)) {
            self.programmed.insert((port, vid), target);
        } else {
            self.programmed.remove(&(port, vid));
        }
        Ok(())
    }

    pub fn join(&mut self, hal: &mut dyn SwitchHal, port: PortId, vid: VlanId) -> SyncResult<()> {
        self.joined.insert((port, vid));
        self.sync(hal, port, vid)
    }

    /// Drops (port, vid); the override goes with it.
    pub fn leave(&mut self, port: PortId, vid: VlanId) {
        self.joined.remove(&(port, vid));
        self.overrides.remove(&(port, vid));
        self.programmed.remove(&(port, vid));
    }

    /// Sets the port-global state of `port` (and of its members when it is a
    /// LAG), then re-evaluates every overridden VLAN of the port.
    pub fn set_global(
        &mut self,
        hal: &mut dyn SwitchHal,
        bonds: &BondManager,
        port: PortId,
        state: StpState,
    ) -> SyncResult<()> {
        if self.global.get(&port) == Some(&state) {
            return Ok(());
        }
        if self.enabled {
            hal.stp_port_state_set(port, state).hal("stp_port_state_set")?;
            if port.is_lag() {
                for member in bonds.members_of(port) {
                    hal.stp_port_state_set(member, state).hal("stp_port_state_set")?;
                }
            }
        }
        debug!("StpTable: {} global -> {}", port, state);
        self.global.insert(port, state);

        let vids: Vec<VlanId> = self
            .overrides
            .keys()
            .filter(|(p, _)| *p == port)
            .map(|(_, v)| *v)
            .collect();
        for vid in vids {
            self.sync(hal, port, vid)?;
        }
        Ok(())
    }

    /// Sets or, with `None`, removes the per-VLAN override of (port, vid).
    pub fn set_vlan(
        &mut self,
        hal: &mut dyn SwitchHal,
        port: PortId,
        vid: VlanId,
        state: Option<StpState>,
    ) -> SyncResult<()> {
        match state {
            Some(s) => {
                if self.overrides.insert((port, vid), s) == Some(s) {
                    return Ok(());
                }
            }
            None => {
                if self.overrides.remove(&(port, vid)).is_none() {
                    return Ok(());
                }
            }
        }
        self.sync(hal, port, vid)
    }

    /// Forgets everything about `port`.
    pub fn forget_port(&mut self, port: PortId) {
        self.global.remove(&port);
        self.overrides.retain(|(p, _), _| *p != port);
        self.joined.retain(|(p, _)| *p != port);
        self.programmed.retain(|(p, _), _| *p != port);
    }

    pub fn clear(&mut self) {
        self.global.clear();
        self.overrides.clear();
        self.joined.clear();
        self.programmed.clear();
    }
}
