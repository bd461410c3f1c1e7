//! LAG capability group.

use crate::HalResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use swsync_types::PortId;

/// Bond mode, numbered like the kernel's `BOND_MODE_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LagMode {
    RoundRobin,
    ActiveBackup,
    Xor,
    Broadcast,
    #[serde(rename = "802.3ad")]
    Lacp,
    Tlb,
    Alb,
}

impl LagMode {
    pub fn from_kernel(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(LagMode::RoundRobin),
            1 => Some(LagMode::ActiveBackup),
            2 => Some(LagMode::Xor),
            3 => Some(LagMode::Broadcast),
            4 => Some(LagMode::Lacp),
            5 => Some(LagMode::Tlb),
            6 => Some(LagMode::Alb),
            _ => None,
        }
    }
}

impl Default for LagMode {
    fn default() -> Self {
        LagMode::RoundRobin
    }
}

impl fmt::Display for LagMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LagMode::RoundRobin => "balance-rr",
            LagMode::ActiveBackup => "active-backup",
            LagMode::Xor => "balance-xor",
            LagMode::Broadcast => "broadcast",
            LagMode::Lacp => "802.3ad",
            LagMode::Tlb => "balance-tlb",
            LagMode::Alb => "balance-alb",
        };
        f.write_str(s)
    }
}

pub trait LagApi {
    /// Returns the LAG's port handle (kind [`swsync_types::PortKind::Lag`]).
    fn lag_create(&mut self, name: &str, mode: LagMode) -> HalResult<PortId>;

    fn lag_remove(&mut self, lag: PortId) -> HalResult<()>;

    fn lag_add_member(&mut self, lag: PortId, member: PortId) -> HalResult<()>;

    fn lag_remove_member(&mut self, lag: PortId, member: PortId) -> HalResult<()>;

    fn lag_set_member_active(&mut self, lag: PortId, member: PortId, active: bool)
        -> HalResult<()>;

    fn lag_set_mode(&mut self, lag: PortId, mode: LagMode) -> HalResult<()>;
}
