//! Kernel feed interface and the JSON-lines replay feed.

use super::event::{Action, KernelEvent, KernelObject};
use super::objects::{longest_match, FdbEntry, Route};
use crate::daemon::SyncHandle;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use swsync_types::IpPrefix;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("kernel feed disconnected")]
    Disconnected,

    #[error("kernel rejected request: {0}")]
    Rejected(String),
}

/// Requests the engines make toward the kernel.
///
/// Notifications flow the other way, through a
/// [`SyncHandle`](crate::daemon::SyncHandle).
#[async_trait]
pub trait KernelFeed: Send + Sync {
    /// Longest-prefix match in the main table.
    async fn lookup_route(&self, dst: IpAddr) -> Result<Option<Route>, FeedError>;

    /// Adds a bridge FDB entry on behalf of the data path.
    async fn add_fdb(&self, entry: FdbEntry) -> Result<(), FeedError>;

    async fn del_fdb(&self, entry: FdbEntry) -> Result<(), FeedError>;
}

/// Parses one [`KernelEvent`] per line. Blank lines and lines starting with
/// `#` are skipped.
pub fn parse_events(reader: impl BufRead) -> Result<Vec<KernelEvent>, FeedError> {
    let mut events = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(trimmed).map_err(|e| FeedError::Parse {
            line: n + 1,
            message: e.to_string(),
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Feed backed by a recorded event stream.
///
/// Route lookups are answered from the routes replayed so far; FDB writes
/// are echoed back as kernel notifications, the way the kernel would report
/// them.
pub struct ReplayFeed {
    handle: SyncHandle,
    routes: Mutex<BTreeMap<(u32, IpPrefix), Route>>,
}

impl ReplayFeed {
    pub fn new(handle: SyncHandle) -> Self {
        Self {
            handle,
            routes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Pushes `events` to the engine, recording routes for later lookups.
    /// Returns how many were queued.
    pub fn replay(&self, events: impl IntoIterator<Item = KernelEvent>) -> Result<usize, FeedError> {
        let mut queued = 0;
        for event in events {
            if let KernelObject::Route(route) = &event.object {
                let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
                let key = (route.table, route.dst);
                match event.action {
                    Action::Del => {
                        routes.remove(&key);
                    }
                    Action::New | Action::Change => {
                        routes.insert(key, route.clone());
                    }
                }
            }
            self.handle
                .push_kernel(event)
                .map_err(|_| FeedError::Disconnected)?;
            queued += 1;
        }
        info!("ReplayFeed: queued {} events", queued);
        Ok(queued)
    }

    fn echo(&self, action: Action, entry: FdbEntry) -> Result<(), FeedError> {
        debug!("ReplayFeed: echo {} fdb {} on ifindex {}", action, entry.mac, entry.ifindex);
        self.handle
            .push_kernel(KernelEvent::new(action, KernelObject::Fdb(entry)))
            .map_err(|e| {
                warn!("ReplayFeed: cannot echo fdb write: {}", e);
                FeedError::Disconnected
            })
    }
}

#[async_trait]
impl KernelFeed for ReplayFeed {
    async fn lookup_route(&self, dst: IpAddr) -> Result<Option<Route>, FeedError> {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(longest_match(routes.values(), &dst).cloned())
    }

    async fn add_fdb(&self, mut entry: FdbEntry) -> Result<(), FeedError> {
        entry.ext_learned = true;
        self.echo(Action::New, entry)
    }

    async fn del_fdb(&self, entry: FdbEntry) -> Result<(), FeedError> {
        self.echo(Action::Del, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{RouteKind, RouteScope};
    use pretty_assertions::assert_eq;

    const EVENTS: &str = r#"
# two routes and a neighbour
{"action":"new","object":{"route":{"dst":"0.0.0.0/0","next_hops":[{"gateway":"10.0.0.1","ifindex":5}]}}}
{"action":"new","object":{"route":{"dst":"203.0.113.0/24","next_hops":[{"gateway":"10.0.0.2","ifindex":5}]}}}

{"action":"new","object":{"neigh":{"ifindex":5,"dst":"10.0.0.2","lladdr":"aa:bb:cc:dd:ee:ff"}}}
"#;

    #[test]
    fn test_parse_events_skips_comments() {
        let events = parse_events(EVENTS.as_bytes()).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].object.type_name(), "neigh");
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = parse_events("\n{\"action\":\"bogus\"}\n".as_bytes()).unwrap_err();
        assert!(matches!(err, FeedError::Parse { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_lookup_uses_replayed_routes() {
        let handle = SyncHandle::new(16);
        let feed = ReplayFeed::new(handle.clone());
        let events = parse_events(EVENTS.as_bytes()).unwrap();
        assert_eq!(feed.replay(events).unwrap(), 3);
        assert_eq!(handle.pending(), 3);

        let route = feed
            .lookup_route("203.0.113.5".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(route.dst.to_string(), "203.0.113.0/24");
        assert_eq!(route.kind, RouteKind::Unicast);
        assert_eq!(route.scope, RouteScope::Universe);

        feed.replay(vec![KernelEvent::new(Action::Del, KernelObject::Route(route))])
            .unwrap();
        let fallback = feed
            .lookup_route("203.0.113.5".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(fallback.dst.is_default());
    }

    #[tokio::test]
    async fn test_fdb_writes_are_echoed() {
        let handle = SyncHandle::new(16);
        let feed = ReplayFeed::new(handle.clone());
        let entry = FdbEntry {
            ifindex: 3,
            mac: "02:00:00:00:00:09".parse().unwrap(),
            vlan: None,
            dst: None,
            master: Some(20),
            ext_learned: false,
        };
        feed.add_fdb(entry.clone()).await.unwrap();
        let items = handle.queues().kernel.take(8);
        match &items[..] {
            [crate::daemon::QueueItem::Kernel(ev)] => {
                assert_eq!(ev.action, Action::New);
                assert!(matches!(&ev.object, KernelObject::Fdb(e) if e.ext_learned));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
