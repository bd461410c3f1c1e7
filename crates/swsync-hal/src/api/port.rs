//! Port capability group.

use crate::HalResult;
use serde::{Deserialize, Serialize};
use swsync_types::PortId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortConfig {
    pub admin_up: bool,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

pub trait PortApi {
    fn port_set_config(&mut self, port: PortId, config: PortConfig) -> HalResult<()>;

    fn port_stats(&mut self, port: PortId) -> HalResult<PortStats>;
}
