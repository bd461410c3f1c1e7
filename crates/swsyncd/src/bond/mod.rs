//! Bond interfaces and the hardware LAGs backing them.

mod manager;

pub use manager::{BondManager, BondStats};
