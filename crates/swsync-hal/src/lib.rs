//! Vendor-neutral switch forwarding-plane API.
//!
//! The synchronization engines drive the ASIC only through the traits in
//! [`api`]; a driver implements them once per platform.
//!
//! # Architecture
//!
//! - [`ids`]: kind-tagged hardware ids so egress, ECMP, tunnel next-hop and
//!   tenant ids cannot be mixed up
//! - [`error`]: driver status codes and [`HalError`]
//! - [`api`]: the six capability groups and the [`SwitchHal`] umbrella trait
//! - [`sim`]: [`SimulatedSwitch`], an in-memory implementation used for dry
//!   runs and tests
//!
//! ```
//! use swsync_hal::{L3Api, SimulatedSwitch};
//! use swsync_types::{MacAddress, PortId, VlanId};
//!
//! let mut sw = SimulatedSwitch::new();
//! let egress = sw
//!     .l3_egress_create(
//!         PortId::physical(3).unwrap(),
//!         VlanId::new(10).unwrap(),
//!         MacAddress::new([2, 0, 0, 0, 0, 1]),
//!         "aa:bb:cc:dd:ee:ff".parse().unwrap(),
//!     )
//!     .unwrap();
//! assert!(sw.egresses.contains_key(&egress));
//! ```

pub mod api;
pub mod error;
pub mod ids;
pub mod sim;

pub use api::{
    AccessPortSpec, BridgingApi, EndpointSpec, L3Api, LagApi, LagMode, PortApi, PortConfig,
    PortStats, RouteTarget, SwitchHal, TunnelApi, VlanApi,
};
pub use error::{HalError, HalResult, HalStatus, HalStatusExt};
pub use ids::{
    EcmpId, EcmpKind, EgressId, EgressKind, HalObjectId, HalObjectKind, RawHalId, TenantId,
    TenantKind, TunnelNextHopId, TunnelNextHopKind,
};
pub use sim::{HalCall, SimEgress, SimLag, SimTunnelPort, SimulatedSwitch};
