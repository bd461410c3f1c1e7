//! Tagged hardware port handle.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of port a [`PortId`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Physical,
    /// VXLAN logical port (tunnel endpoint or access port).
    Tunnel,
    Lag,
}

impl PortKind {
    const fn tag(&self) -> u32 {
        match self {
            PortKind::Physical => 0,
            PortKind::Tunnel => 1,
            PortKind::Lag => 2,
        }
    }
}

/// Opaque port handle: kind tag in the upper 16 bits, index in the lower 16.
///
/// Index 0 is never valid, so a `PortId` never aliases "no port" and ids of
/// different kinds never compare equal.
///
/// ```
/// use swsync_types::{PortId, PortKind};
///
/// let lag = PortId::lag(3).unwrap();
/// assert_eq!(lag.kind(), PortKind::Lag);
/// assert_ne!(lag, PortId::physical(3).unwrap());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct PortId(u32);

impl PortId {
    const SHIFT: u32 = 16;
    const INDEX_MASK: u32 = (1 << Self::SHIFT) - 1;

    pub fn new(kind: PortKind, index: u16) -> Result<Self, ParseError> {
        let raw = (kind.tag() << Self::SHIFT) | u32::from(index);
        if index == 0 {
            return Err(ParseError::InvalidPortId(raw));
        }
        Ok(PortId(raw))
    }

    pub fn physical(index: u16) -> Result<Self, ParseError> {
        Self::new(PortKind::Physical, index)
    }

    pub fn tunnel(index: u16) -> Result<Self, ParseError> {
        Self::new(PortKind::Tunnel, index)
    }

    pub fn lag(index: u16) -> Result<Self, ParseError> {
        Self::new(PortKind::Lag, index)
    }

    /// Decodes a raw handle as handed out by the hardware layer.
    pub fn from_raw(raw: u32) -> Result<Self, ParseError> {
        let kind_ok = matches!(raw >> Self::SHIFT, 0..=2);
        if !kind_ok || raw & Self::INDEX_MASK == 0 {
            return Err(ParseError::InvalidPortId(raw));
        }
        Ok(PortId(raw))
    }

    pub const fn as_raw(&self) -> u32 {
        self.0
    }

    pub fn kind(&self) -> PortKind {
        match self.0 >> Self::SHIFT {
            1 => PortKind::Tunnel,
            2 => PortKind::Lag,
            _ => PortKind::Physical,
        }
    }

    pub const fn index(&self) -> u16 {
        (self.0 & Self::INDEX_MASK) as u16
    }

    pub fn is_lag(&self) -> bool {
        self.kind() == PortKind::Lag
    }
}

impl fmt::Debug for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortId({}, 0x{:08x})", self, self.0)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            PortKind::Physical => write!(f, "port{}", self.index()),
            PortKind::Tunnel => write!(f, "tunnel{}", self.index()),
            PortKind::Lag => write!(f, "lag{}", self.index()),
        }
    }
}

impl TryFrom<u32> for PortId {
    type Error = ParseError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        PortId::from_raw(raw)
    }
}

impl From<PortId> for u32 {
    fn from(port: PortId) -> u32 {
        port.0
    }
}
