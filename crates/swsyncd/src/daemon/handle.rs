//! Producer side of the sync engine.
//!
//! A [`SyncHandle`] is all a producer ever sees: it pushes an owned item into
//! one of the three queues and wakes the dispatch loop. No engine code runs on
//! the producer's side.

use crate::kernel::{KernelEvent, Route};
use std::net::IpAddr;
use std::sync::Arc;
use swsync_common::{BoundedQueue, QueueError};
use swsync_types::{MacAddress, PortId, VlanId};
use tokio::sync::Notify;

/// Item on the kernel queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    Kernel(KernelEvent),
    /// Answer to a route lookup the VXLAN engine asked for; `None` when no
    /// route covers `dst` or the lookup timed out.
    RouteResolved { dst: IpAddr, route: Option<Route> },
    /// The kernel feed is gone; the engine shuts down.
    FeedLost { reason: String },
}

/// A source MAC the data path saw on `port`. `vlan` is `None` for untagged
/// frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearnedMac {
    pub port: PortId,
    pub vlan: Option<VlanId>,
    pub mac: MacAddress,
}

/// A bridging entry the hardware aged out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgedFdb {
    pub port: PortId,
    pub vlan: Option<VlanId>,
    pub mac: MacAddress,
}

#[derive(Debug)]
pub(crate) struct Queues {
    pub(crate) kernel: BoundedQueue<QueueItem>,
    pub(crate) learned: BoundedQueue<LearnedMac>,
    pub(crate) aged: BoundedQueue<AgedFdb>,
    wakeup: Notify,
}

/// Cloneable producer handle.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    queues: Arc<Queues>,
}

impl SyncHandle {
    /// The kernel queue is unbounded; the auxiliary queues hold at most
    /// `aux_capacity` items each.
    pub(crate) fn new(aux_capacity: usize) -> Self {
        Self {
            queues: Arc::new(Queues {
                kernel: BoundedQueue::new("kernel", 0),
                learned: BoundedQueue::new("learned_mac", aux_capacity),
                aged: BoundedQueue::new("fdb_aging", aux_capacity),
                wakeup: Notify::new(),
            }),
        }
    }

    pub(crate) fn queues(&self) -> &Queues {
        &self.queues
    }

    pub fn push_kernel(&self, event: KernelEvent) -> Result<(), QueueError> {
        self.push_item(QueueItem::Kernel(event))
    }

    pub fn post_route(&self, dst: IpAddr, route: Option<Route>) -> Result<(), QueueError> {
        self.push_item(QueueItem::RouteResolved { dst, route })
    }

    pub fn feed_lost(&self, reason: impl Into<String>) -> Result<(), QueueError> {
        self.push_item(QueueItem::FeedLost {
            reason: reason.into(),
        })
    }

    pub fn learned_mac(&self, learned: LearnedMac) -> Result<(), QueueError> {
        self.queues.learned.push(learned)?;
        self.wake();
        Ok(())
    }

    pub fn fdb_aged(&self, aged: AgedFdb) -> Result<(), QueueError> {
        self.queues.aged.push(aged)?;
        self.wake();
        Ok(())
    }

    fn push_item(&self, item: QueueItem) -> Result<(), QueueError> {
        self.queues.kernel.push(item)?;
        self.wake();
        Ok(())
    }

    /// Schedules a dispatch cycle. A wakeup with nobody waiting is kept, so
    /// it is never lost.
    pub fn wake(&self) {
        self.queues.wakeup.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.queues.wakeup.notified().await;
    }

    /// Items waiting across all three queues.
    pub fn pending(&self) -> usize {
        self.queues.kernel.len() + self.queues.learned.len() + self.queues.aged.len()
    }

    pub(crate) fn close(&self) {
        self.queues.kernel.close();
        self.queues.learned.close();
        self.queues.aged.close();
        self.queues.kernel.clear();
        self.queues.learned.clear();
        self.queues.aged.clear();
    }

    pub(crate) fn reopen(&self) {
        self.queues.kernel.reopen();
        self.queues.learned.reopen();
        self.queues.aged.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Action, KernelObject, Neigh, NeighState};
    use pretty_assertions::assert_eq;

    fn neigh_event() -> KernelEvent {
        KernelEvent::new(
            Action::New,
            KernelObject::Neigh(Neigh {
                ifindex: 1,
                dst: "10.0.0.2".parse().unwrap(),
                lladdr: None,
                state: NeighState::Incomplete,
            }),
        )
    }

    #[test]
    fn test_push_counts_pending() {
        let handle = SyncHandle::new(2);
        handle.push_kernel(neigh_event()).unwrap();
        let mac = LearnedMac {
            port: PortId::physical(1).unwrap(),
            vlan: None,
            mac: MacAddress::new([2, 0, 0, 0, 0, 1]),
        };
        handle.learned_mac(mac).unwrap();
        handle.learned_mac(mac).unwrap();
        assert!(matches!(handle.learned_mac(mac), Err(QueueError::Full { .. })));
        assert_eq!(handle.pending(), 3);
    }

    #[test]
    fn test_closed_handle_rejects_and_clears() {
        let handle = SyncHandle::new(8);
        handle.push_kernel(neigh_event()).unwrap();
        handle.close();
        assert_eq!(handle.pending(), 0);
        assert!(matches!(
            handle.feed_lost("gone"),
            Err(QueueError::Closed { name: "kernel" })
        ));
        handle.reopen();
        handle.push_kernel(neigh_event()).unwrap();
        assert_eq!(handle.pending(), 1);
    }

    #[tokio::test]
    async fn test_wakeup_is_not_lost() {
        let handle = SyncHandle::new(8);
        handle.push_kernel(neigh_event()).unwrap();
        // the permit stored by the push completes this immediately
        tokio::time::timeout(std::time::Duration::from_secs(1), handle.woken())
            .await
            .unwrap();
    }
}
