//! Fire-once reachability subscriptions.
//!
//! Work that cannot proceed because a neighbour is unresolved or no route
//! covers a destination parks a payload here keyed by what it waits for.
//! Resolution events call [`ReachabilityRegistry::satisfy`] (exact neighbour)
//! or [`ReachabilityRegistry::satisfy_route`] (route prefix); matching
//! subscriptions move to the ready list and the dispatch loop collects them
//! with [`ReachabilityRegistry::take_ready`] on its next cycle. A
//! subscription leaves the registry when it is taken, so it fires at most
//! once.

use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use swsync_types::IpPrefix;

/// What a subscription waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReachTarget {
    /// Any route whose prefix contains `dst`.
    Route { dst: IpAddr },
    /// A resolved neighbour entry for `addr` on `ifindex`.
    Neighbor { addr: IpAddr, ifindex: u32 },
}

impl fmt::Display for ReachTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReachTarget::Route { dst } => write!(f, "route to {}", dst),
            ReachTarget::Neighbor { addr, ifindex } => {
                write!(f, "neighbor {} on ifindex {}", addr, ifindex)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription<T> {
    pub id: SubscriptionId,
    pub target: ReachTarget,
    pub payload: T,
}

/// Subscription registry. See the module docs.
#[derive(Debug)]
pub struct ReachabilityRegistry<T> {
    name: &'static str,
    next_id: u64,
    waiting: BTreeMap<SubscriptionId, Subscription<T>>,
    by_target: HashMap<ReachTarget, BTreeSet<SubscriptionId>>,
    ready: VecDeque<Subscription<T>>,
}

impl<T> ReachabilityRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: 0,
            waiting: BTreeMap::new(),
            by_target: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    fn allocate(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    /// Parks `payload` until `target` is satisfied.
    pub fn subscribe(&mut self, target: ReachTarget, payload: T) -> SubscriptionId {
        let id = self.allocate();
        debug!("{}: subscription {:?} waits for {}", self.name, id, target);
        self.by_target.entry(target).or_default().insert(id);
        self.waiting.insert(
            id,
            Subscription {
                id,
                target,
                payload,
            },
        );
        id
    }

    /// Registers a subscription whose target is already resolvable. It is
    /// delivered by the next [`take_ready`](Self::take_ready).
    pub fn subscribe_resolved(&mut self, target: ReachTarget, payload: T) -> SubscriptionId {
        let id = self.allocate();
        debug!("{}: subscription {:?} for {} is ready", self.name, id, target);
        self.ready.push_back(Subscription {
            id,
            target,
            payload,
        });
        id
    }

    /// Marks every subscription waiting on exactly `target` as ready.
    pub fn satisfy(&mut self, target: &ReachTarget) -> usize {
        let Some(ids) = self.by_target.remove(target) else {
            return 0;
        };
        let mut fired = 0;
        for id in ids {
            if let Some(sub) = self.waiting.remove(&id) {
                self.ready.push_back(sub);
                fired += 1;
            }
        }
        if fired > 0 {
            debug!("{}: {} subscription(s) ready for {}", self.name, fired, target);
        }
        fired
    }

    /// Marks every route-destination subscription covered by `prefix` as
    /// ready.
    pub fn satisfy_route(&mut self, prefix: &IpPrefix) -> usize {
        let targets: Vec<ReachTarget> = self
            .by_target
            .keys()
            .filter(|t| matches!(t, ReachTarget::Route { dst } if prefix.contains(dst)))
            .copied()
            .collect();
        targets.iter().map(|t| self.satisfy(t)).sum()
    }

    /// Removes a subscription wherever it is. Returns its payload.
    pub fn cancel(&mut self, id: SubscriptionId) -> Option<T> {
        if let Some(sub) = self.waiting.remove(&id) {
            self.unindex(&sub.target, id);
            return Some(sub.payload);
        }
        let pos = self.ready.iter().position(|s| s.id == id)?;
        self.ready.remove(pos).map(|s| s.payload)
    }

    /// Removes the oldest waiting subscription on `target` whose payload
    /// matches `pred`.
    pub fn cancel_first(&mut self, target: &ReachTarget, pred: impl Fn(&T) -> bool) -> Option<T> {
        let id = self
            .by_target
            .get(target)?
            .iter()
            .copied()
            .find(|id| self.waiting.get(id).is_some_and(|s| pred(&s.payload)))?;
        self.cancel(id)
    }

    /// Removes every subscription (waiting or ready) whose payload matches.
    pub fn cancel_where(&mut self, pred: impl Fn(&T) -> bool) -> usize {
        let ids: Vec<SubscriptionId> = self
            .waiting
            .values()
            .filter(|s| pred(&s.payload))
            .map(|s| s.id)
            .collect();
        for id in &ids {
            self.cancel(*id);
        }
        let before = self.ready.len();
        self.ready.retain(|s| !pred(&s.payload));
        ids.len() + before - self.ready.len()
    }

    fn unindex(&mut self, target: &ReachTarget, id: SubscriptionId) {
        if let Some(ids) = self.by_target.get_mut(target) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_target.remove(target);
            }
        }
    }

    /// Hands out every ready subscription, oldest first, removing them.
    pub fn take_ready(&mut self) -> Vec<Subscription<T>> {
        self.ready.drain(..).collect()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn is_waiting_on(&self, target: &ReachTarget) -> bool {
        self.by_target.contains_key(target)
    }

    pub fn waiting(&self) -> impl Iterator<Item = &Subscription<T>> {
        self.waiting.values()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Waiting plus ready.
    pub fn len(&self) -> usize {
        self.waiting.len() + self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.waiting.clear();
        self.by_target.clear();
        self.ready.clear();
    }
}
