//! Typed hardware object ids.
//!
//! Ids handed out by the forwarding plane are plain integers on the wire; the
//! phantom kind keeps an egress id from being passed where an ECMP group id is
//! expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

pub type RawHalId = u32;

/// Marker trait for hardware object kinds.
pub trait HalObjectKind: Send + Sync + 'static {
    fn type_name() -> &'static str;
}

/// A hardware object id tagged with its kind.
pub struct HalObjectId<T: HalObjectKind> {
    raw: RawHalId,
    _marker: PhantomData<T>,
}

impl<T: HalObjectKind> HalObjectId<T> {
    /// Returns `None` for 0, which the forwarding plane never allocates.
    pub fn from_raw(raw: RawHalId) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self {
                raw,
                _marker: PhantomData,
            })
        }
    }

    pub const fn as_raw(&self) -> RawHalId {
        self.raw
    }
}

impl<T: HalObjectKind> Clone for HalObjectId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: HalObjectKind> Copy for HalObjectId<T> {}

impl<T: HalObjectKind> fmt::Debug for HalObjectId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:08x})", T::type_name(), self.raw)
    }
}

impl<T: HalObjectKind> fmt::Display for HalObjectId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.raw)
    }
}

impl<T: HalObjectKind> PartialEq for HalObjectId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: HalObjectKind> Eq for HalObjectId<T> {}

impl<T: HalObjectKind> PartialOrd for HalObjectId<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: HalObjectKind> Ord for HalObjectId<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<T: HalObjectKind> Hash for HalObjectId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T: HalObjectKind> Serialize for HalObjectId<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.raw)
    }
}

impl<'de, T: HalObjectKind> Deserialize<'de> for HalObjectId<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u32::deserialize(deserializer)?;
        Self::from_raw(raw).ok_or_else(|| serde::de::Error::custom("object id 0 is reserved"))
    }
}

macro_rules! define_object_kind {
    ($name:ident, $type_name:literal, $alias:ident) => {
        #[doc = concat!("Marker type for ", $type_name, " objects.")]
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl HalObjectKind for $name {
            fn type_name() -> &'static str {
                $type_name
            }
        }

        #[doc = concat!("Id of a hardware ", $type_name, ".")]
        pub type $alias = HalObjectId<$name>;
    };
}

define_object_kind!(EgressKind, "L3Egress", EgressId);
define_object_kind!(EcmpKind, "L3Ecmp", EcmpId);
define_object_kind!(TunnelNextHopKind, "TunnelNextHop", TunnelNextHopId);
define_object_kind!(TenantKind, "TunnelTenant", TenantId);

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_zero_is_reserved() {
        assert!(EgressId::from_raw(0).is_none());
        assert_eq!(EgressId::from_raw(7).unwrap().as_raw(), 7);
    }

    #[test]
    fn test_debug_shows_kind() {
        let id = EcmpId::from_raw(0x2000_0001).unwrap();
        assert_eq!(format!("{:?}", id), "L3Ecmp(0x20000001)");
        assert_eq!(id.to_string(), "0x20000001");
    }
}
