//! Routing engine.

mod engine;
mod types;

pub use engine::{L3Ctx, L3Engine};
pub use types::{EcmpKey, EgressKey, L3Stats, NeighEntry, NextHopKey, RouteKey, TerminationKey};
