//! Forwarding-plane API, one trait per capability group.
//!
//! - [`bridging`]: L2 addresses, multicast membership, STP state
//! - [`l3`]: termination MACs, egress rewrites, host/route entries, ECMP
//! - [`vlan`]: ingress/egress VLAN filters, PVID, QinQ push/pop
//! - [`tunnel`]: VXLAN tenants, next hops, endpoints and access ports
//! - [`lag`]: link aggregation groups
//! - [`port`]: port configuration and counters
//!
//! No call is idempotent on the hardware side; deduplication belongs to the
//! caller.

pub mod bridging;
pub mod l3;
pub mod lag;
pub mod port;
pub mod tunnel;
pub mod vlan;

pub use bridging::BridgingApi;
pub use l3::{L3Api, RouteTarget};
pub use lag::{LagApi, LagMode};
pub use port::{PortApi, PortConfig, PortStats};
pub use tunnel::{AccessPortSpec, EndpointSpec, TunnelApi};
pub use vlan::VlanApi;

/// The complete forwarding-plane API.
pub trait SwitchHal: BridgingApi + L3Api + VlanApi + TunnelApi + LagApi + PortApi + Send {}

impl<T> SwitchHal for T where T: BridgingApi + L3Api + VlanApi + TunnelApi + LagApi + PortApi + Send {}
