//! Sync engine, its producer handle and its configuration.

mod config;
mod engine;
mod handle;

pub use config::{ConfigError, SyncConfig};
pub use engine::{EngineError, EngineState, EngineStats, SyncEngine};
pub use handle::{AgedFdb, LearnedMac, QueueItem, SyncHandle};
