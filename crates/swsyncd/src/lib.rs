//! swsyncd - mirrors Linux kernel network state into a switch forwarding
//! plane.
//!
//! # Architecture
//!
//! ```text
//! [kernel feed] ──> SyncHandle ──> [SyncEngine] ──> [SwitchHal] ──> [ASIC]
//! [data path] ────┘       │
//!                         ├─ BondManager / VlanProgrammer
//!                         ├─ BridgeEngine
//!                         ├─ L3Engine
//!                         └─ VxlanEngine
//! ```
//!
//! Producers push owned change records through a [`daemon::SyncHandle`].
//! A single dispatch loop in [`daemon::SyncEngine`] applies them to the
//! mirrored kernel state and to the engines, which program the hardware
//! through pooled, reference-counted objects.

#[macro_use]
pub mod audit;

pub mod bond;
pub mod bridge;
pub mod daemon;
pub mod kernel;
pub mod l3;
pub mod vlan;
pub mod vxlan;
