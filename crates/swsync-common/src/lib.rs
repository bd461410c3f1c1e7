//! Building blocks shared by the synchronization engines.
//!
//! - [`ResourcePool`]: dedup + refcount map from a structural key to a
//!   hardware resource, creating on the first reference and destroying on the
//!   last
//! - [`ReachabilityRegistry`]: fire-once subscriptions waiting for a route or
//!   neighbour to become resolvable
//! - [`BoundedQueue`]: mutex-protected producer queue drained by the dispatch
//!   loop
//! - [`SyncError`]: the error taxonomy every engine reports through
//!
//! # Architecture
//!
//! 1. Producers push owned events into a [`BoundedQueue`] and wake the loop
//! 2. The loop drains a bounded batch and hands each event to an engine
//! 3. Engines acquire and release hardware resources through pools
//! 4. Work blocked on an unresolved neighbour or route registers a
//!    subscription; resolution moves it to the ready list
//! 5. The loop fires ready subscriptions on its next cycle

mod error;
mod pool;
mod queue;
mod reachability;

pub use error::{ErrorClass, HalResultExt, SyncError, SyncResult, SyncResultExt};
pub use pool::{HasRefCount, PoolEntry, Release, ResourcePool};
pub use queue::{BoundedQueue, QueueError};
pub use reachability::{ReachTarget, ReachabilityRegistry, Subscription, SubscriptionId};
