//! VXLAN overlay: tenants per VNI, refcounted tunnel endpoints resolved
//! through the underlay, and bridge access ports converted into tunnel ports.

mod engine;
mod types;

pub use engine::VxlanEngine;
pub use types::{
    AccessPort, AccessPortRequest, Endpoint, EndpointKey, TunnelNhKey, VxlanLink, VxlanStats,
    DEFAULT_UDP_PORT, FIRST_TENANT_ID,
};
