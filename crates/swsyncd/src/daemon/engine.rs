//! The sync engine: owns the mirrored kernel state and every engine, and
//! drives them from the producer queues in bounded dispatch cycles.
//!
//! Producers only ever touch a [`SyncHandle`]. Everything else lives here and
//! is only reached from [`SyncEngine::dispatch_once`], so the engines never
//! need locks of their own.

use super::config::SyncConfig;
use super::handle::{AgedFdb, LearnedMac, QueueItem, SyncHandle};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::bond::BondManager;
use crate::bridge::{BridgeCtx, BridgeEngine, FdbWrite};
use crate::kernel::{
    Action, Addr, BridgeVlanState, FdbEntry, FeedError, KernelCache, KernelEvent, KernelFeed,
    KernelObject, Link, LinkKind, MdbEntry, Mirrored, Neigh, Route, Topology,
};
use crate::l3::{L3Ctx, L3Engine};
use crate::vlan::VlanProgrammer;
use crate::vxlan::VxlanEngine;
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use swsync_common::{ErrorClass, HalResultExt, SyncError, SyncResult};
use swsync_hal::{PortConfig, SwitchHal};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Borrows the pieces of the engine the bridge engine works against. The
/// borrows are field-disjoint from `bridge` itself.
macro_rules! bridge_ctx {
    ($engine:ident) => {
        BridgeCtx {
            hal: &mut $engine.hal,
            cache: &$engine.cache,
            bonds: &$engine.bonds,
            vlans: &mut $engine.vlans,
            vxlan: &mut $engine.vxlan,
        }
    };
}

macro_rules! l3_ctx {
    ($engine:ident) => {
        L3Ctx {
            hal: &mut $engine.hal,
            topo: Topology::new(&$engine.cache, &$engine.bonds, $engine.bridge.bridge()),
            vlans: &mut $engine.vlans,
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Running,
    Shutdown,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Init => write!(f, "init"),
            EngineState::Running => write!(f, "running"),
            EngineState::Shutdown => write!(f, "shutdown"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("operation not valid in state {0}")]
    InvalidState(EngineState),

    #[error("engine stopped")]
    Stopped,
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub cycles: u64,
    pub kernel_items: u64,
    pub learned: u64,
    pub aged: u64,
    pub transient_errors: u64,
    pub inconsistencies: u64,
    pub hardware_errors: u64,
    pub unsupported: u64,
    pub lookups_spawned: u64,
    pub fdb_writes: u64,
}

fn note(errors: &mut Vec<SyncError>, result: SyncResult<()>) {
    if let Err(e) = result {
        errors.push(e);
    }
}

fn object_key(object: &KernelObject) -> String {
    match object {
        KernelObject::Link(l) => format!("link {} ({})", l.name, l.ifindex),
        KernelObject::Addr(a) => format!("addr {} on {}", a.prefix, a.ifindex),
        KernelObject::Route(r) => format!("route {} table {}", r.dst, r.table),
        KernelObject::Neigh(n) => format!("neigh {} on {}", n.dst, n.ifindex),
        KernelObject::Fdb(e) => format!("fdb {} on {}", e.mac, e.ifindex),
        KernelObject::Mdb(m) => format!("mdb {} on {}", m.group, m.ifindex),
        KernelObject::BridgeVlan(v) => format!("bridge vlan {} on {}", v.vid, v.ifindex),
    }
}

/// Splits `items` after `max` entries; the tail is returned.
fn split_batch<T>(items: &mut VecDeque<T>, max: usize) -> VecDeque<T> {
    let at = max.min(items.len());
    items.split_off(at)
}

pub struct SyncEngine<H: SwitchHal> {
    config: SyncConfig,
    hal: H,
    cache: KernelCache,
    bonds: BondManager,
    vlans: VlanProgrammer,
    bridge: BridgeEngine,
    l3: L3Engine,
    vxlan: VxlanEngine,
    handle: SyncHandle,
    feed: Option<Arc<dyn KernelFeed>>,
    tasks: JoinSet<()>,
    state: EngineState,
    /// Objects already reported as unsupported.
    unsupported: BTreeSet<String>,
    stats: EngineStats,
}

impl<H: SwitchHal> SyncEngine<H> {
    pub fn new(config: SyncConfig, hal: H) -> Self {
        Self {
            handle: SyncHandle::new(config.queue_capacity),
            bridge: BridgeEngine::new(config.stp_enabled),
            vxlan: VxlanEngine::new(config.vxlan_udp_port, config.tunnel_ttl),
            config,
            hal,
            cache: KernelCache::new(),
            bonds: BondManager::new(),
            vlans: VlanProgrammer::new(),
            l3: L3Engine::new(),
            feed: None,
            tasks: JoinSet::new(),
            state: EngineState::Init,
            unsupported: BTreeSet::new(),
            stats: EngineStats::default(),
        }
    }

    /// Route lookups and FDB write-backs go to `feed`. Without one, lookups
    /// answer "no route" and writes are dropped.
    pub fn attach_feed(&mut self, feed: Arc<dyn KernelFeed>) {
        self.feed = Some(feed);
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn cache(&self) -> &KernelCache {
        &self.cache
    }

    pub fn l3(&self) -> &L3Engine {
        &self.l3
    }

    pub fn vxlan(&self) -> &VxlanEngine {
        &self.vxlan
    }

    pub fn bridge(&self) -> &BridgeEngine {
        &self.bridge
    }

    pub fn bonds(&self) -> &BondManager {
        &self.bonds
    }

    pub fn vlans(&self) -> &VlanProgrammer {
        &self.vlans
    }

    /// Nothing queued, nothing ready to fire and no task in flight.
    pub fn is_idle(&self) -> bool {
        self.handle.pending() == 0
            && !self.l3.has_ready()
            && !self.vxlan.has_ready_waits()
            && self.tasks.is_empty()
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Init {
            return Err(EngineError::InvalidState(self.state));
        }
        self.state = EngineState::Running;
        info!("SyncEngine: running (batch size {})", self.config.batch_size);
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "SyncEngine", "start")
            .with_outcome(AuditOutcome::Success)
            .with_object_type("sync_engine")
            .with_details(serde_json::json!({
                "batch_size": self.config.batch_size,
                "queue_capacity": self.config.queue_capacity,
                "stp_enabled": self.config.stp_enabled,
            })));
        Ok(())
    }

    /// `Stopped -> Running` with empty state and open queues.
    pub fn restart(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Stopped {
            return Err(EngineError::InvalidState(self.state));
        }
        self.handle.reopen();
        self.state = EngineState::Running;
        info!("SyncEngine: restarted");
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "SyncEngine", "restart")
            .with_outcome(AuditOutcome::Success)
            .with_object_type("sync_engine"));
        Ok(())
    }

    /// Tears everything down and lands in `Stopped`. The hardware is not
    /// touched: shutdown follows a lost HAL or a lost feed.
    pub fn shutdown(&mut self, reason: &str) {
        if matches!(self.state, EngineState::Shutdown | EngineState::Stopped) {
            return;
        }
        self.state = EngineState::Shutdown;
        error!("SyncEngine: shutting down: {}", reason);
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "SyncEngine", "shutdown")
            .with_outcome(AuditOutcome::Failure)
            .with_object_type("sync_engine")
            .with_error(reason));

        self.handle.close();
        self.tasks.abort_all();
        self.l3.clear();
        self.vxlan.clear();
        self.bridge.clear();
        self.bonds.clear();
        self.vlans.clear();
        self.cache.clear();
        self.unsupported.clear();

        self.state = EngineState::Stopped;
        info!("SyncEngine: stopped");
        audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "SyncEngine", "stopped")
            .with_outcome(AuditOutcome::Success)
            .with_object_type("sync_engine"));
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Running => Ok(()),
            EngineState::Stopped => Err(EngineError::Stopped),
            state => Err(EngineError::InvalidState(state)),
        }
    }

    /// One dispatch cycle. Returns the number of queue items handled.
    pub fn dispatch_once(&mut self) -> Result<usize, EngineError> {
        self.ensure_running()?;
        self.stats.cycles += 1;
        self.reap_tasks();
        self.fire_ready();

        let batch = self.config.batch_size;
        let mut handled = 0;

        let items = self.handle.queues().kernel.take(batch);
        for item in items {
            handled += 1;
            self.stats.kernel_items += 1;
            self.handle_item(item);
            if self.state != EngineState::Running {
                return Ok(handled);
            }
        }

        let mut learned = self.handle.queues().learned.take_all();
        let rest = split_batch(&mut learned, batch);
        self.handle.queues().learned.requeue_front(rest);
        for mac in learned {
            handled += 1;
            self.stats.learned += 1;
            self.handle_learned(mac);
        }

        let mut aged = self.handle.queues().aged.take_all();
        let rest = split_batch(&mut aged, batch);
        self.handle.queues().aged.requeue_front(rest);
        for entry in aged {
            handled += 1;
            self.stats.aged += 1;
            self.handle_aged(entry);
        }

        if self.state != EngineState::Running {
            return Ok(handled);
        }
        self.spawn_work();

        if self.handle.pending() > 0 || self.l3.has_ready() || self.vxlan.has_ready_waits() {
            self.handle.wake();
        }
        Ok(handled)
    }

    /// Waits on the wakeup and dispatches until `cancel` fires or the engine
    /// stops.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), EngineError> {
        if self.state == EngineState::Init {
            self.start()?;
        }
        self.ensure_running()?;
        let handle = self.handle.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("SyncEngine: cancelled");
                    return Ok(());
                }
                _ = handle.woken() => {}
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("SyncEngine: feed task failed: {}", e);
                    }
                }
            }
            self.dispatch_once()?;
            if self.state == EngineState::Stopped {
                return Ok(());
            }
        }
    }

    /// Dispatches until nothing is queued, ready or in flight. Returns early
    /// if the engine shuts down on the way.
    pub async fn run_until_idle(&mut self) -> Result<(), EngineError> {
        if self.state == EngineState::Init {
            self.start()?;
        }
        self.ensure_running()?;
        loop {
            self.dispatch_once()?;
            if self.state != EngineState::Running {
                return Ok(());
            }
            if self.handle.pending() > 0 || self.l3.has_ready() || self.vxlan.has_ready_waits() {
                tokio::task::yield_now().await;
                continue;
            }
            match self.tasks.join_next().await {
                Some(Err(e)) => warn!("SyncEngine: feed task failed: {}", e),
                Some(Ok(())) => {}
                None => return Ok(()),
            }
        }
    }

    fn reap_tasks(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                warn!("SyncEngine: feed task failed: {}", e);
            }
        }
    }

    fn fire_ready(&mut self) {
        let fired = self.l3.fire_ready(&mut l3_ctx!(self));
        match fired {
            Ok(0) => {}
            Ok(n) => debug!("SyncEngine: {} route subscriptions fired", n),
            Err(e) => self.report("route subscriptions", e),
        }
        let issued = self.vxlan.fire_route_waits();
        if issued > 0 {
            debug!("SyncEngine: {} tunnel route lookups re-issued", issued);
        }
    }

    /// Classifies an engine error. Nothing propagates past one event.
    fn report(&mut self, what: &str, err: SyncError) {
        if self.state != EngineState::Running {
            return;
        }
        match err.class() {
            ErrorClass::Transient => {
                self.stats.transient_errors += 1;
                debug!("SyncEngine: {}: {}", what, err);
            }
            ErrorClass::Inconsistency => {
                self.stats.inconsistencies += 1;
                warn!("SyncEngine: {}: {}", what, err);
            }
            ErrorClass::Hardware => {
                self.stats.hardware_errors += 1;
                error!("SyncEngine: {}: {}", what, err);
                audit_log!(AuditRecord::new(AuditCategory::ErrorCondition, "SyncEngine", "hardware_error")
                    .with_outcome(AuditOutcome::Failure)
                    .with_object_id(what)
                    .with_error(err.to_string()));
            }
            ErrorClass::Unsupported => {
                self.stats.unsupported += 1;
                if self.unsupported.insert(what.to_string()) {
                    warn!("SyncEngine: {} ignored: {}", what, err);
                }
            }
            ErrorClass::Fatal => {
                let reason = format!("{}: {}", what, err);
                self.shutdown(&reason);
            }
        }
    }

    fn settle(&mut self, what: &str, errors: Vec<SyncError>) {
        for err in errors {
            self.report(what, err);
        }
    }

    fn handle_item(&mut self, item: QueueItem) {
        match item {
            QueueItem::Kernel(event) => self.handle_event(event),
            QueueItem::RouteResolved { dst, route } => {
                let result = self.vxlan.on_route_resolved(
                    &mut self.hal,
                    Topology::new(&self.cache, &self.bonds, self.bridge.bridge()),
                    dst,
                    route.as_ref(),
                );
                if let Err(e) = result {
                    self.report(&format!("route lookup {}", dst), e);
                }
            }
            QueueItem::FeedLost { reason } => {
                self.shutdown(&format!("kernel feed lost: {}", reason));
            }
        }
    }

    fn handle_event(&mut self, event: KernelEvent) {
        let what = object_key(&event.object);
        debug!("SyncEngine: {} {}", event.action, what);
        let action = event.action;
        let errors = match event.object {
            KernelObject::Link(link) => self.on_link(action, link),
            KernelObject::Addr(addr) => self.on_addr(action, addr),
            KernelObject::Route(route) => self.on_route(action, route),
            KernelObject::Neigh(neigh) => self.on_neigh(action, neigh),
            KernelObject::Fdb(entry) => self.on_fdb(action, entry),
            KernelObject::Mdb(entry) => self.on_mdb(action, entry),
            KernelObject::BridgeVlan(state) => self.on_bridge_vlan(action, state),
        };
        self.settle(&what, errors);
    }

    fn on_link(&mut self, action: Action, link: Link) -> Vec<SyncError> {
        match action {
            Action::New | Action::Change => self.link_changed(link),
            Action::Del => self.link_removed(link.ifindex),
        }
    }

    /// Kernel table of the VRF `link` is enslaved to.
    fn vrf_table_of(&self, link: &Link) -> Option<u32> {
        link.master
            .and_then(|m| self.cache.link(m))
            .and_then(Link::vrf_table)
    }

    fn bond_master(&self, link: &Link) -> Option<u32> {
        link.master
            .filter(|m| self.cache.link(*m).is_some_and(Link::is_bond))
    }

    fn link_changed(&mut self, link: Link) -> Vec<SyncError> {
        let change = self.cache.upsert(link.clone());
        let old = change.old;
        let ifindex = link.ifindex;
        let mut errors = Vec::new();
        let mut replay = old.is_none();

        // bond membership
        let old_bond = self.bonds.bond_of_member(ifindex);
        let new_bond = self.bond_master(&link);
        if old_bond.is_some() && old_bond == new_bond {
            if let Some(bond) = new_bond {
                note(&mut errors, self.bonds.update_member(&mut self.hal, bond, &link));
            }
        } else {
            if let Some(bond) = old_bond {
                let bridged = self.bridge.is_port(bond);
                note(
                    &mut errors,
                    self.bonds.remove_member(&mut self.hal, &mut self.vlans, ifindex, bridged),
                );
            }
            if let Some(bond) = new_bond.and_then(|b| self.cache.link(b).cloned()) {
                let state = self.bridge.bridged_state(bond.ifindex);
                note(
                    &mut errors,
                    self.bonds
                        .add_member(&mut self.hal, &mut self.vlans, &bond, &link, state),
                );
            }
        }

        match link.kind {
            LinkKind::Bond { .. } => {
                if self.bonds.lag_of(ifindex).is_none() {
                    note(&mut errors, self.bonds.add_lag(&mut self.hal, &link).map(|_| ()));
                    let state = self.bridge.bridged_state(ifindex);
                    let slaves: Vec<Link> = self
                        .cache
                        .slaves_of(ifindex)
                        .filter(|s| !self.bonds.is_member(s.ifindex))
                        .cloned()
                        .collect();
                    for slave in slaves {
                        note(
                            &mut errors,
                            self.bonds
                                .add_member(&mut self.hal, &mut self.vlans, &link, &slave, state),
                        );
                    }
                    replay = true;
                } else {
                    note(&mut errors, self.bonds.update_lag(&mut self.hal, &link));
                }
            }
            LinkKind::Bridge { .. } => note(&mut errors, self.bridge.add_bridge(&link)),
            LinkKind::Vxlan { .. } => note(&mut errors, self.vxlan.add_link(&mut self.hal, &link)),
            LinkKind::SwitchPort { .. } => {
                let dirty = old
                    .as_ref()
                    .map_or(true, |o| o.admin_up != link.admin_up || o.mtu != link.mtu);
                if dirty {
                    note(&mut errors, self.apply_port_config(&link));
                }
            }
            _ => {}
        }

        if link.bridge.is_some() || self.bridge.is_port(ifindex) {
            note(&mut errors, self.bridge.update_port(&mut bridge_ctx!(self), &link));
        }

        if let Some(old) = &old {
            if old.mac != link.mac {
                note(
                    &mut errors,
                    self.l3.change_link_mac(&mut l3_ctx!(self), ifindex, old.mac, link.mac),
                );
            }
        }

        let old_vrf = old.as_ref().and_then(|o| self.vrf_table_of(o));
        let new_vrf = self.vrf_table_of(&link);
        if old_vrf != new_vrf {
            errors.extend(self.move_vrf(ifindex, old_vrf, new_vrf));
            replay = true;
        }

        if replay {
            errors.extend(self.replay_l3(ifindex));
        }
        errors
    }

    fn apply_port_config(&mut self, link: &Link) -> SyncResult<()> {
        let topo = Topology::new(&self.cache, &self.bonds, self.bridge.bridge());
        let Some(port) = topo.port_of(link.ifindex) else {
            return Err(SyncError::unsupported(format!("{}: no hardware port", link.name)));
        };
        let config = PortConfig {
            admin_up: link.admin_up,
            mtu: link.mtu,
        };
        self.hal
            .port_set_config(port, config)
            .hal("port_set_config")?;
        debug!("SyncEngine: {} admin {} mtu {:?}", port, link.admin_up, link.mtu);
        Ok(())
    }

    /// Re-binds the link's VLAN to its new VRF. Addresses and neighbours are
    /// dropped here and replayed by the caller in the new VRF.
    fn move_vrf(&mut self, ifindex: u32, old: Option<u32>, new: Option<u32>) -> Vec<SyncError> {
        let mut errors = Vec::new();
        note(&mut errors, self.l3.forget_link(&mut l3_ctx!(self), ifindex));

        let topo = Topology::new(&self.cache, &self.bonds, self.bridge.bridge());
        let Some(binding) = topo.l3_port(ifindex) else {
            return errors;
        };
        let port = binding.port();
        let vid = binding.vid();
        if old.is_some() {
            note(
                &mut errors,
                self.vlans.vrf_detach(&mut self.hal, &self.bonds, port, vid),
            );
        }
        if let Some(table) = new {
            info!("SyncEngine: ifindex {} enslaved to vrf table {}", ifindex, table);
            note(
                &mut errors,
                self.vlans
                    .vrf_attach(&mut self.hal, &self.bonds, port, vid, table),
            );
        }
        errors
    }

    /// Replays the mirrored addresses, routes and neighbours of a link and
    /// of the links stacked on it. The L3 engine treats a repeat as a no-op.
    fn replay_l3(&mut self, ifindex: u32) -> Vec<SyncError> {
        let mut links = vec![ifindex];
        links.extend(self.cache.uppers_of(ifindex).map(|l| l.ifindex));

        let addrs: Vec<Addr> = links
            .iter()
            .flat_map(|i| self.cache.addrs_of(*i))
            .cloned()
            .collect();
        let neighs: Vec<Neigh> = links
            .iter()
            .flat_map(|i| self.cache.neighs_on(*i))
            .cloned()
            .collect();
        let routes: Vec<Route> = self
            .cache
            .routes()
            .filter(|r| r.next_hops.iter().any(|nh| links.contains(&nh.ifindex)))
            .cloned()
            .collect();

        let mut errors = Vec::new();
        for addr in &addrs {
            note(&mut errors, self.l3.add_addr(&mut l3_ctx!(self), addr));
        }
        for route in &routes {
            note(&mut errors, self.l3.add_route(&mut l3_ctx!(self), route));
        }
        for neigh in &neighs {
            note(&mut errors, self.l3.add_neigh(&mut l3_ctx!(self), neigh));
        }
        errors
    }

    fn link_removed(&mut self, ifindex: u32) -> Vec<SyncError> {
        let Some(old) = self.cache.link(ifindex).cloned() else {
            debug!("SyncEngine: ifindex {} not mirrored", ifindex);
            return Vec::new();
        };
        let mut errors = Vec::new();

        if self.bridge.is_port(ifindex) {
            note(&mut errors, self.bridge.remove_port(&mut bridge_ctx!(self), ifindex));
        }
        if let Some(bond) = self.bonds.bond_of_member(ifindex) {
            let bridged = self.bridge.is_port(bond);
            note(
                &mut errors,
                self.bonds.remove_member(&mut self.hal, &mut self.vlans, ifindex, bridged),
            );
        }
        let vrf = self.vrf_table_of(&old);
        if vrf.is_some() {
            errors.extend(self.move_vrf(ifindex, vrf, None));
        } else {
            note(&mut errors, self.l3.forget_link(&mut l3_ctx!(self), ifindex));
        }

        match old.kind {
            LinkKind::Bond { .. } => note(&mut errors, self.bonds.remove_lag(&mut self.hal, ifindex)),
            LinkKind::Bridge { .. } => {
                note(&mut errors, self.bridge.remove_bridge(&mut bridge_ctx!(self), ifindex))
            }
            LinkKind::Vxlan { .. } => note(&mut errors, self.vxlan.remove_link(&mut self.hal, ifindex)),
            _ => {}
        }

        self.cache.remove::<Link>(&ifindex);
        info!("SyncEngine: link {} removed", old.name);
        errors
    }

    fn on_addr(&mut self, action: Action, addr: Addr) -> Vec<SyncError> {
        let mut errors = Vec::new();
        match action {
            Action::New | Action::Change => {
                self.cache.upsert(addr.clone());
                note(&mut errors, self.l3.add_addr(&mut l3_ctx!(self), &addr));
            }
            Action::Del => {
                note(&mut errors, self.l3.remove_addr(&mut l3_ctx!(self), &addr));
                self.cache.remove::<Addr>(&addr.key());
            }
        }
        errors
    }

    fn on_route(&mut self, action: Action, route: Route) -> Vec<SyncError> {
        let mut errors = Vec::new();
        match action {
            Action::New | Action::Change => {
                let change = self.cache.upsert(route.clone());
                note(&mut errors, self.l3.add_route(&mut l3_ctx!(self), &route));
                if change.old.is_none() {
                    let satisfied = self.vxlan.satisfy_route(&route.dst);
                    if satisfied > 0 {
                        debug!("SyncEngine: route {} satisfied {} tunnel waits", route.dst, satisfied);
                    }
                }
            }
            Action::Del => {
                note(&mut errors, self.l3.remove_route(&mut l3_ctx!(self), &route));
                self.cache.remove::<Route>(&route.key());
            }
        }
        errors
    }

    fn on_neigh(&mut self, action: Action, neigh: Neigh) -> Vec<SyncError> {
        let mut errors = Vec::new();
        match action {
            Action::New | Action::Change => {
                let change = self.cache.upsert(neigh.clone());
                let moved = change
                    .old
                    .as_ref()
                    .and_then(|o| o.lladdr)
                    .zip(neigh.lladdr)
                    .filter(|(old, new)| old != new);
                if let Some((old, new)) = moved {
                    let topo = Topology::new(&self.cache, &self.bonds, self.bridge.bridge());
                    if let Some(port) = topo.port_of(neigh.ifindex) {
                        note(&mut errors, self.vxlan.neigh_changed(&mut self.hal, port, old, new));
                    }
                }
                note(&mut errors, self.l3.add_neigh(&mut l3_ctx!(self), &neigh));
                if neigh.is_resolved() {
                    self.vxlan.satisfy_neighbor(neigh.dst, neigh.ifindex);
                }
            }
            Action::Del => {
                note(&mut errors, self.l3.remove_neigh(&mut l3_ctx!(self), &neigh));
                self.cache.remove::<Neigh>(&neigh.key());
            }
        }
        errors
    }

    fn on_fdb(&mut self, action: Action, entry: FdbEntry) -> Vec<SyncError> {
        let mut errors = Vec::new();
        match action {
            Action::New | Action::Change => {
                self.cache.upsert(entry.clone());
                note(&mut errors, self.bridge.add_fdb(&mut bridge_ctx!(self), &entry));
                // an SVI neighbour may have been waiting for this entry
                note(&mut errors, self.l3.retry_pending_l2(&mut l3_ctx!(self)));
            }
            Action::Del => {
                note(&mut errors, self.bridge.remove_fdb(&mut bridge_ctx!(self), &entry));
                self.cache.remove::<FdbEntry>(&entry.key());
            }
        }
        errors
    }

    fn on_mdb(&mut self, action: Action, entry: MdbEntry) -> Vec<SyncError> {
        let mut errors = Vec::new();
        match action {
            Action::New | Action::Change => {
                self.cache.upsert(entry.clone());
                note(&mut errors, self.bridge.add_mdb(&mut bridge_ctx!(self), &entry));
            }
            Action::Del => {
                note(&mut errors, self.bridge.remove_mdb(&mut bridge_ctx!(self), &entry));
                self.cache.remove::<MdbEntry>(&entry.key());
            }
        }
        errors
    }

    fn on_bridge_vlan(&mut self, action: Action, state: BridgeVlanState) -> Vec<SyncError> {
        let mut errors = Vec::new();
        match action {
            Action::New | Action::Change => {
                self.cache.upsert(state.clone());
                note(&mut errors, self.bridge.add_vlan_state(&mut bridge_ctx!(self), &state));
            }
            Action::Del => {
                note(
                    &mut errors,
                    self.bridge
                        .set_vlan_state(&mut bridge_ctx!(self), state.ifindex, state.vid, None),
                );
                self.cache.remove::<BridgeVlanState>(&state.key());
            }
        }
        errors
    }

    fn handle_learned(&mut self, learned: LearnedMac) {
        if let Err(e) = self.bridge.learn(&bridge_ctx!(self), learned) {
            self.report(&format!("learned {} on {}", learned.mac, learned.port), e);
        }
    }

    fn handle_aged(&mut self, aged: AgedFdb) {
        if let Err(e) = self.bridge.age(&bridge_ctx!(self), aged) {
            self.report(&format!("aged {} on {}", aged.mac, aged.port), e);
        }
    }

    /// Spawns the route lookups and FDB write-backs the cycle produced.
    fn spawn_work(&mut self) {
        for dst in self.vxlan.take_lookups() {
            self.spawn_lookup(dst);
        }
        for write in self.bridge.take_writes() {
            self.spawn_write(write);
        }
    }

    fn spawn_lookup(&mut self, dst: IpAddr) {
        let handle = self.handle.clone();
        let Some(feed) = self.feed.clone() else {
            if let Err(e) = handle.post_route(dst, None) {
                debug!("SyncEngine: dropping lookup answer for {}: {}", dst, e);
            }
            return;
        };
        let timeout = self.config.route_lookup_timeout();
        self.stats.lookups_spawned += 1;
        self.tasks.spawn(async move {
            let route = match tokio::time::timeout(timeout, feed.lookup_route(dst)).await {
                Ok(Ok(route)) => route,
                Ok(Err(e)) => {
                    warn!("SyncEngine: route lookup for {} failed: {}", dst, e);
                    if matches!(e, FeedError::Disconnected) {
                        let _ = handle.feed_lost(e.to_string());
                        return;
                    }
                    None
                }
                Err(_) => {
                    warn!("SyncEngine: route lookup for {} timed out", dst);
                    None
                }
            };
            if let Err(e) = handle.post_route(dst, route) {
                debug!("SyncEngine: dropping lookup answer for {}: {}", dst, e);
            }
        });
    }

    fn spawn_write(&mut self, write: FdbWrite) {
        let Some(feed) = self.feed.clone() else {
            debug!("SyncEngine: no kernel feed, dropping {:?}", write);
            return;
        };
        let handle = self.handle.clone();
        self.stats.fdb_writes += 1;
        self.tasks.spawn(async move {
            let result = match &write {
                FdbWrite::Add(entry) => feed.add_fdb(entry.clone()).await,
                FdbWrite::Del(entry) => feed.del_fdb(entry.clone()).await,
            };
            match result {
                Ok(()) => {}
                Err(FeedError::Disconnected) => {
                    let _ = handle.feed_lost("disconnected during fdb write");
                }
                Err(e) => warn!("SyncEngine: {:?} rejected: {}", write, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{NeighState, NextHop, RouteKind, RouteScope};
    use pretty_assertions::assert_eq;
    use swsync_hal::SimulatedSwitch;
    use swsync_types::{IpPrefix, MacAddress, PortId};

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn port_link(ifindex: u32, port: u16) -> Link {
        Link {
            ifindex,
            name: format!("swp{}", port),
            kind: LinkKind::SwitchPort { port },
            mac: mac("02:00:00:00:00:01"),
            master: None,
            lower: None,
            admin_up: true,
            mtu: Some(9100),
            slave: None,
            bridge: None,
        }
    }

    fn event(action: Action, object: KernelObject) -> KernelEvent {
        KernelEvent::new(action, object)
    }

    fn engine() -> SyncEngine<SimulatedSwitch> {
        SyncEngine::new(SyncConfig::default(), SimulatedSwitch::new())
    }

    #[test]
    fn test_dispatch_requires_running() {
        let mut engine = engine();
        assert!(matches!(
            engine.dispatch_once(),
            Err(EngineError::InvalidState(EngineState::Init))
        ));
        engine.start().unwrap();
        assert_eq!(engine.dispatch_once().unwrap(), 0);
        assert!(matches!(engine.start(), Err(EngineError::InvalidState(EngineState::Running))));
    }

    #[test]
    fn test_port_config_follows_link() {
        let mut engine = engine();
        engine.start().unwrap();
        let handle = engine.handle();
        let mut link = port_link(1, 1);
        handle.push_kernel(event(Action::New, KernelObject::Link(link.clone()))).unwrap();
        engine.dispatch_once().unwrap();

        let port = PortId::physical(1).unwrap();
        assert_eq!(
            engine.hal().port_configs.get(&port),
            Some(&PortConfig { admin_up: true, mtu: Some(9100) })
        );

        // unchanged attributes are not pushed again
        handle.push_kernel(event(Action::Change, KernelObject::Link(link.clone()))).unwrap();
        engine.dispatch_once().unwrap();
        let pushed = |e: &SyncEngine<SimulatedSwitch>| {
            e.hal().count_calls(|c| matches!(c, swsync_hal::HalCall::PortSetConfig { .. }))
        };
        assert_eq!(pushed(&engine), 1);

        link.admin_up = false;
        handle.push_kernel(event(Action::Change, KernelObject::Link(link))).unwrap();
        engine.dispatch_once().unwrap();
        assert_eq!(pushed(&engine), 2);
        assert!(!engine.hal().port_configs[&port].admin_up);
    }

    #[test]
    fn test_batch_leaves_rest_queued() {
        let mut engine = SyncEngine::new(
            SyncConfig {
                batch_size: 2,
                ..SyncConfig::default()
            },
            SimulatedSwitch::new(),
        );
        engine.start().unwrap();
        let handle = engine.handle();
        for i in 1..=5u16 {
            handle
                .push_kernel(event(Action::New, KernelObject::Link(port_link(u32::from(i), i))))
                .unwrap();
        }
        assert_eq!(engine.dispatch_once().unwrap(), 2);
        assert_eq!(handle.pending(), 3);
        assert_eq!(engine.dispatch_once().unwrap(), 2);
        assert_eq!(engine.dispatch_once().unwrap(), 1);
        assert_eq!(handle.pending(), 0);
        assert_eq!(engine.cache().len::<Link>(), 5);
    }

    #[test]
    fn test_auxiliary_leftovers_keep_order() {
        let mut engine = SyncEngine::new(
            SyncConfig {
                batch_size: 1,
                ..SyncConfig::default()
            },
            SimulatedSwitch::new(),
        );
        engine.start().unwrap();
        let handle = engine.handle();
        let port = PortId::physical(1).unwrap();
        for last in 1..=3u8 {
            handle
                .learned_mac(LearnedMac {
                    port,
                    vlan: None,
                    mac: MacAddress::new([2, 0, 0, 0, 0, last]),
                })
                .unwrap();
        }
        engine.dispatch_once().unwrap();
        let rest = handle.queues().learned.take_all();
        assert_eq!(
            rest.iter().map(|l| l.mac).collect::<Vec<_>>(),
            vec![MacAddress::new([2, 0, 0, 0, 0, 2]), MacAddress::new([2, 0, 0, 0, 0, 3])]
        );
        assert_eq!(engine.stats().learned, 1);
    }

    #[test]
    fn test_unavailable_hal_stops_engine() {
        let mut engine = engine();
        engine.start().unwrap();
        let handle = engine.handle();
        handle.push_kernel(event(Action::New, KernelObject::Link(port_link(1, 1)))).unwrap();
        engine.dispatch_once().unwrap();
        assert_eq!(engine.cache().len::<Link>(), 1);

        engine.hal_mut().set_unavailable(true);
        handle.push_kernel(event(Action::New, KernelObject::Link(port_link(2, 2)))).unwrap();
        handle.push_kernel(event(Action::New, KernelObject::Link(port_link(3, 3)))).unwrap();
        engine.dispatch_once().unwrap();

        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.cache().len::<Link>(), 0);
        assert_eq!(handle.pending(), 0);
        assert!(handle.push_kernel(event(Action::New, KernelObject::Link(port_link(4, 4)))).is_err());
        assert!(matches!(engine.dispatch_once(), Err(EngineError::Stopped)));

        engine.hal_mut().set_unavailable(false);
        engine.restart().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        handle.push_kernel(event(Action::New, KernelObject::Link(port_link(4, 4)))).unwrap();
        engine.dispatch_once().unwrap();
        assert_eq!(engine.cache().len::<Link>(), 1);
    }

    #[test]
    fn test_feed_lost_shuts_down() {
        let mut engine = engine();
        engine.start().unwrap();
        let handle = engine.handle();
        handle.push_kernel(event(Action::New, KernelObject::Link(port_link(1, 1)))).unwrap();
        handle.feed_lost("socket closed").unwrap();
        engine.dispatch_once().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(matches!(engine.restart(), Ok(())));
        assert!(matches!(engine.restart(), Err(EngineError::InvalidState(EngineState::Running))));
    }

    #[test]
    fn test_unsupported_object_reported_once() {
        let mut engine = engine();
        engine.start().unwrap();
        let handle = engine.handle();
        let multicast = Route {
            table: crate::kernel::RT_TABLE_MAIN,
            dst: "224.0.0.0/4".parse::<IpPrefix>().unwrap(),
            kind: RouteKind::Multicast,
            scope: RouteScope::Universe,
            next_hops: vec![NextHop {
                gateway: None,
                ifindex: 1,
            }],
        };
        for _ in 0..3 {
            handle
                .push_kernel(event(Action::Change, KernelObject::Route(multicast.clone())))
                .unwrap();
        }
        engine.dispatch_once().unwrap();
        assert_eq!(engine.stats().unsupported, 3);
        assert_eq!(engine.unsupported.len(), 1);
        assert_eq!(engine.state(), EngineState::Running);
    }

    #[test]
    fn test_removal_runs_engines_before_cache() {
        let mut engine = engine();
        engine.start().unwrap();
        let handle = engine.handle();
        handle.push_kernel(event(Action::New, KernelObject::Link(port_link(1, 1)))).unwrap();
        let addr = Addr {
            ifindex: 1,
            prefix: "10.0.0.1/24".parse().unwrap(),
        };
        handle.push_kernel(event(Action::New, KernelObject::Addr(addr.clone()))).unwrap();
        engine.dispatch_once().unwrap();
        assert!(engine.l3().has_addr(1, &addr.prefix));
        assert_eq!(engine.hal().terminations.len(), 1);

        handle.push_kernel(event(Action::Del, KernelObject::Link(port_link(1, 1)))).unwrap();
        engine.dispatch_once().unwrap();
        assert!(!engine.l3().has_addr(1, &addr.prefix));
        assert!(engine.hal().terminations.is_empty());
        assert!(engine.cache().link(1).is_none());
    }

    #[test]
    fn test_neighbour_replayed_when_link_appears() {
        let mut engine = engine();
        engine.start().unwrap();
        let handle = engine.handle();
        let neigh = Neigh {
            ifindex: 1,
            dst: "10.0.0.9".parse().unwrap(),
            lladdr: Some(mac("aa:bb:cc:dd:ee:01")),
            state: NeighState::Reachable,
        };
        handle.push_kernel(event(Action::New, KernelObject::Neigh(neigh.clone()))).unwrap();
        handle
            .push_kernel(event(
                Action::New,
                KernelObject::Addr(Addr {
                    ifindex: 1,
                    prefix: "10.0.0.1/24".parse().unwrap(),
                }),
            ))
            .unwrap();
        handle
            .push_kernel(event(
                Action::New,
                KernelObject::Route(Route {
                    table: crate::kernel::RT_TABLE_MAIN,
                    dst: "10.0.0.0/24".parse().unwrap(),
                    kind: RouteKind::Unicast,
                    scope: RouteScope::Link,
                    next_hops: vec![NextHop {
                        gateway: None,
                        ifindex: 1,
                    }],
                }),
            ))
            .unwrap();
        engine.dispatch_once().unwrap();
        assert!(engine.l3().neigh(1, neigh.dst).is_none());

        handle.push_kernel(event(Action::New, KernelObject::Link(port_link(1, 1)))).unwrap();
        engine.dispatch_once().unwrap();
        assert!(engine.l3().neigh(1, neigh.dst).is_some());
        assert_eq!(engine.hal().egresses.len(), 1);
    }
}
