//! Spanning-tree port state.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bridge port STP state, numbered like the kernel's `BR_STATE_*`.
///
/// The non-blocking states are ordered by how much traffic they let through,
/// so `min` picks the more restrictive of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StpState {
    Disabled = 0,
    Listening = 1,
    Learning = 2,
    Forwarding = 3,
    Blocking = 4,
}

impl StpState {
    pub fn from_kernel(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(StpState::Disabled),
            1 => Some(StpState::Listening),
            2 => Some(StpState::Learning),
            3 => Some(StpState::Forwarding),
            4 => Some(StpState::Blocking),
            _ => None,
        }
    }

    /// Effective state of a (port, VLAN) pair: blocking wins, otherwise the
    /// more restrictive of the port-global and per-VLAN state.
    pub fn effective(global: StpState, vlan: Option<StpState>) -> StpState {
        match vlan {
            None => global,
            Some(StpState::Blocking) => StpState::Blocking,
            Some(_) if global == StpState::Blocking => StpState::Blocking,
            Some(v) => v.min(global),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            StpState::Disabled => "disable",
            StpState::Listening => "listen",
            StpState::Learning => "learn",
            StpState::Forwarding => "forward",
            StpState::Blocking => "block",
        }
    }
}

impl Default for StpState {
    fn default() -> Self {
        StpState::Forwarding
    }
}

impl fmt::Display for StpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StpState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" | "disabled" => Ok(StpState::Disabled),
            "listen" | "listening" => Ok(StpState::Listening),
            "learn" | "learning" => Ok(StpState::Learning),
            "forward" | "forwarding" => Ok(StpState::Forwarding),
            "block" | "blocking" => Ok(StpState::Blocking),
            _ => Err(ParseError::InvalidStpState(s.to_string())),
        }
    }
}
