//! Kernel notifications and the owned change records built from them.

use super::objects::{Addr, BridgeVlanState, FdbEntry, Link, MdbEntry, Neigh, Route};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    New,
    Change,
    Del,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::New => write!(f, "new"),
            Action::Change => write!(f, "change"),
            Action::Del => write!(f, "del"),
        }
    }
}

/// Any object the kernel feed reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelObject {
    Link(Link),
    Addr(Addr),
    Route(Route),
    Neigh(Neigh),
    Fdb(FdbEntry),
    Mdb(MdbEntry),
    BridgeVlan(BridgeVlanState),
}

impl KernelObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            KernelObject::Link(_) => "link",
            KernelObject::Addr(_) => "addr",
            KernelObject::Route(_) => "route",
            KernelObject::Neigh(_) => "neigh",
            KernelObject::Fdb(_) => "fdb",
            KernelObject::Mdb(_) => "mdb",
            KernelObject::BridgeVlan(_) => "bridge_vlan",
        }
    }
}

/// One notification from the kernel feed, as queued.
///
/// One JSON object per line in replay files:
/// `{"action":"new","object":{"neigh":{"ifindex":5,"dst":"10.0.0.2",...}}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelEvent {
    pub action: Action,
    pub object: KernelObject,
}

impl KernelEvent {
    pub fn new(action: Action, object: KernelObject) -> Self {
        Self { action, object }
    }
}

/// An owned change to one mirrored object.
///
/// `old` is the mirrored copy before the change, `new` the copy after; a
/// creation has no `old`, a deletion no `new`. Both are owned by the record,
/// so they stay valid for as long as the engines need them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<T> {
    pub action: Action,
    pub old: Option<T>,
    pub new: Option<T>,
}

impl<T> Change<T> {
    pub fn created(new: T) -> Self {
        Self {
            action: Action::New,
            old: None,
            new: Some(new),
        }
    }

    pub fn changed(old: T, new: T) -> Self {
        Self {
            action: Action::Change,
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn deleted(old: T) -> Self {
        Self {
            action: Action::Del,
            old: Some(old),
            new: None,
        }
    }

    /// The object as it is after the change, or as it was before a deletion.
    pub fn current(&self) -> Option<&T> {
        self.new.as_ref().or(self.old.as_ref())
    }
}
