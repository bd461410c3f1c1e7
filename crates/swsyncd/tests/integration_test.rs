//! End-to-end scenarios: kernel events go in through the replay feed, the
//! sync engine dispatches them and the simulated switch is checked.

use pretty_assertions::assert_eq;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use swsync_hal::{HalCall, RouteTarget, SimulatedSwitch};
use swsync_types::{AddrFamily, IpPrefix, MacAddress, PortId, StpState, VlanId, VlanMembership};
use swsyncd::daemon::{EngineState, SyncConfig, SyncEngine};
use swsyncd::kernel::{
    parse_events, Action, Addr, BondSlave, BridgePortInfo, BridgeVlanState, FdbEntry, KernelEvent, KernelObject,
    Link, LinkKind, MdbEntry, Neigh, NeighState, NextHop, ReplayFeed, Route, RouteKind, RouteScope,
    RT_TABLE_MAIN,
};
use swsyncd::l3::EgressKey;
use swsyncd::vxlan::EndpointKey;
use tokio_util::sync::CancellationToken;

const MAC_A: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x0a]);
const MAC_B: MacAddress = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
const MAC_C: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x0c]);

fn prefix(s: &str) -> IpPrefix {
    s.parse().unwrap()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn vid(id: u16) -> VlanId {
    VlanId::new(id).unwrap()
}

fn phys(index: u16) -> PortId {
    PortId::physical(index).unwrap()
}

fn link(ifindex: u32, name: &str, kind: LinkKind) -> Link {
    Link {
        ifindex,
        name: name.to_string(),
        kind,
        mac: MAC_A,
        master: None,
        lower: None,
        admin_up: true,
        mtu: None,
        slave: None,
        bridge: None,
    }
}

fn swp(ifindex: u32, port: u16) -> Link {
    link(ifindex, &format!("swp{}", port), LinkKind::SwitchPort { port })
}

fn vxlan_link(ifindex: u32, vni: u32) -> Link {
    link(
        ifindex,
        &format!("vxlan{}", vni),
        LinkKind::Vxlan {
            vni,
            local: Some(ip("192.0.2.1")),
            group: None,
            dst_port: None,
        },
    )
}

fn members(vids: &[u16]) -> VlanMembership {
    let mut m = VlanMembership::new();
    for v in vids {
        m.add(vid(*v), false, false);
    }
    m
}

fn addr(ifindex: u32, p: &str) -> Addr {
    Addr {
        ifindex,
        prefix: prefix(p),
    }
}

fn link_route(ifindex: u32, dst: &str) -> Route {
    Route {
        table: RT_TABLE_MAIN,
        dst: prefix(dst),
        kind: RouteKind::Unicast,
        scope: RouteScope::Link,
        next_hops: vec![NextHop {
            gateway: None,
            ifindex,
        }],
    }
}

fn gw_route(dst: &str, gateway: &str, ifindex: u32) -> Route {
    Route {
        table: RT_TABLE_MAIN,
        dst: prefix(dst),
        kind: RouteKind::Unicast,
        scope: RouteScope::Universe,
        next_hops: vec![NextHop {
            gateway: Some(ip(gateway)),
            ifindex,
        }],
    }
}

fn neigh(ifindex: u32, dst: &str, lladdr: MacAddress) -> Neigh {
    Neigh {
        ifindex,
        dst: ip(dst),
        lladdr: Some(lladdr),
        state: NeighState::Reachable,
    }
}

fn tunnel_fdb(ifindex: u32) -> FdbEntry {
    FdbEntry {
        ifindex,
        mac: MacAddress::ZERO,
        vlan: None,
        dst: Some(ip("203.0.113.5")),
        master: None,
        ext_learned: false,
    }
}

fn new(object: KernelObject) -> KernelEvent {
    KernelEvent::new(Action::New, object)
}

fn change(object: KernelObject) -> KernelEvent {
    KernelEvent::new(Action::Change, object)
}

fn del(object: KernelObject) -> KernelEvent {
    KernelEvent::new(Action::Del, object)
}

struct Setup {
    engine: SyncEngine<SimulatedSwitch>,
    feed: Arc<ReplayFeed>,
}

impl Setup {
    fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    fn with_config(config: SyncConfig) -> Self {
        let mut engine = SyncEngine::new(config, SimulatedSwitch::new());
        let feed = Arc::new(ReplayFeed::new(engine.handle()));
        engine.attach_feed(feed.clone());
        Self { engine, feed }
    }

    async fn apply(&mut self, events: Vec<KernelEvent>) {
        self.feed.replay(events).unwrap();
        self.engine.run_until_idle().await.unwrap();
    }

    fn sw(&self) -> &SimulatedSwitch {
        self.engine.hal()
    }
}

/// swp1 with 10.1.0.1/24 and its connected route.
fn routed_port() -> Vec<KernelEvent> {
    vec![
        new(KernelObject::Link(swp(1, 1))),
        new(KernelObject::Addr(addr(1, "10.1.0.1/24"))),
        new(KernelObject::Route(link_route(1, "10.1.0.0/24"))),
    ]
}

#[tokio::test]
async fn test_route_resolves_when_neighbour_appears() {
    let mut s = Setup::new();
    let mut events = routed_port();
    events.push(new(KernelObject::Route(gw_route("10.0.0.0/24", "10.1.0.2", 1))));
    s.apply(events).await;

    let dst = prefix("10.0.0.0/24");
    assert_eq!(s.sw().routes.get(&(0, dst)), Some(&RouteTarget::Controller));
    assert_eq!(s.engine.l3().waiting_routes(), 1);

    s.apply(vec![new(KernelObject::Neigh(neigh(1, "10.1.0.2", MAC_B)))])
        .await;

    let key = EgressKey {
        port: phys(1),
        vid: VlanId::DEFAULT,
        src: MAC_A,
        dst: MAC_B,
    };
    let id = s.engine.l3().egress(&key).unwrap();
    assert_eq!(s.sw().routes.get(&(0, dst)), Some(&RouteTarget::Egress(id)));
    assert_eq!(s.sw().hosts.get(&(0, ip("10.1.0.2"))), Some(&RouteTarget::Egress(id)));
    assert_eq!(s.sw().egresses[&id].dst, MAC_B);
    // the neighbour and the route each hold the rewrite
    assert_eq!(s.engine.l3().egress_refcount(&key), 2);
    assert_eq!(s.engine.l3().waiting_routes(), 0);
}

#[tokio::test]
async fn test_json_replay_stream() {
    const STREAM: &str = r#"
# swp1, its subnet and a gateway
{"action":"new","object":{"link":{"ifindex":1,"name":"swp1","kind":{"type":"switch_port","port":1},"mac":"02:00:00:00:00:0a","admin_up":true}}}
{"action":"new","object":{"addr":{"ifindex":1,"prefix":"10.1.0.1/24"}}}
{"action":"new","object":{"route":{"dst":"10.1.0.0/24","scope":"link","next_hops":[{"ifindex":1}]}}}
{"action":"new","object":{"neigh":{"ifindex":1,"dst":"10.1.0.2","lladdr":"aa:bb:cc:dd:ee:ff"}}}
{"action":"new","object":{"route":{"dst":"0.0.0.0/0","next_hops":[{"gateway":"10.1.0.2","ifindex":1}]}}}
"#;
    let mut s = Setup::new();
    let events = parse_events(STREAM.as_bytes()).unwrap();
    assert_eq!(events.len(), 5);
    s.apply(events).await;

    assert_eq!(s.engine.state(), EngineState::Running);
    assert_eq!(s.sw().egresses.len(), 1);
    assert!(matches!(
        s.sw().routes.get(&(0, prefix("0.0.0.0/0"))),
        Some(RouteTarget::Egress(_))
    ));
}

#[tokio::test]
async fn test_tunnel_endpoint_shared_by_two_vnis() {
    let mut s = Setup::new();
    s.apply(vec![
        new(KernelObject::Link(swp(1, 1))),
        new(KernelObject::Addr(addr(1, "10.0.0.2/24"))),
        new(KernelObject::Route(link_route(1, "10.0.0.0/24"))),
        new(KernelObject::Neigh(neigh(1, "10.0.0.1", MAC_B))),
        new(KernelObject::Route(gw_route("203.0.113.0/24", "10.0.0.1", 1))),
        new(KernelObject::Link(vxlan_link(100, 100))),
        new(KernelObject::Link(vxlan_link(200, 200))),
        new(KernelObject::Fdb(tunnel_fdb(100))),
        new(KernelObject::Fdb(tunnel_fdb(200))),
    ])
    .await;

    let key = EndpointKey {
        local: Ipv4Addr::new(192, 0, 2, 1),
        remote: Ipv4Addr::new(203, 0, 113, 5),
        udp_port: 4789,
    };
    assert_eq!(s.engine.vxlan().endpoint_count(), 1);
    assert_eq!(s.engine.vxlan().endpoint_refcount(&key), 2);
    assert_eq!(s.sw().tunnel_next_hops.len(), 1);
    assert_eq!(s.sw().port_tenants.len(), 2);
    // one lookup served both VNIs
    assert_eq!(s.engine.stats().lookups_spawned, 1);

    s.apply(vec![del(KernelObject::Fdb(tunnel_fdb(100)))]).await;
    assert_eq!(s.engine.vxlan().endpoint_refcount(&key), 1);
    assert_eq!(s.sw().port_tenants.len(), 1);

    s.apply(vec![del(KernelObject::Fdb(tunnel_fdb(200)))]).await;
    assert_eq!(s.engine.vxlan().endpoint_count(), 0);
    assert!(s.sw().tunnel_next_hops.is_empty());
}

#[tokio::test]
async fn test_tunnel_endpoint_waits_for_underlay_route() {
    let mut s = Setup::new();
    s.apply(vec![
        new(KernelObject::Link(swp(1, 1))),
        new(KernelObject::Addr(addr(1, "10.0.0.2/24"))),
        new(KernelObject::Route(link_route(1, "10.0.0.0/24"))),
        new(KernelObject::Neigh(neigh(1, "10.0.0.1", MAC_B))),
        new(KernelObject::Link(vxlan_link(100, 100))),
        new(KernelObject::Fdb(tunnel_fdb(100))),
    ])
    .await;
    assert_eq!(s.engine.vxlan().endpoint_count(), 0);

    s.apply(vec![new(KernelObject::Route(gw_route("203.0.113.0/24", "10.0.0.1", 1)))])
        .await;
    assert_eq!(s.engine.vxlan().endpoint_count(), 1);
    assert_eq!(s.engine.stats().lookups_spawned, 2);
}

#[tokio::test]
async fn test_shared_egress_refcount() {
    let mut s = Setup::new();
    let mut sub = link(30, "swp3.10", LinkKind::Vlan { id: vid(10), qinq: false });
    sub.lower = Some(3);
    s.apply(vec![
        new(KernelObject::Link(swp(3, 3))),
        new(KernelObject::Link(sub)),
        new(KernelObject::Addr(addr(30, "10.3.0.1/24"))),
        new(KernelObject::Route(link_route(30, "10.3.0.0/24"))),
        new(KernelObject::Neigh(neigh(30, "10.3.0.5", MAC_B))),
        new(KernelObject::Neigh(neigh(30, "10.3.0.6", MAC_B))),
    ])
    .await;

    let key = EgressKey {
        port: phys(3),
        vid: vid(10),
        src: MAC_A,
        dst: MAC_B,
    };
    assert_eq!(s.engine.l3().egress_refcount(&key), 2);
    assert_eq!(s.sw().egresses.len(), 1);

    s.apply(vec![new(KernelObject::Route(gw_route("172.16.0.0/16", "10.3.0.5", 30)))])
        .await;
    assert_eq!(s.engine.l3().egress_refcount(&key), 3);
    assert_eq!(
        s.engine.l3().route_target(0, &prefix("172.16.0.0/16")),
        Some(RouteTarget::Egress(s.engine.l3().egress(&key).unwrap()))
    );

    // the route follows its next hop back to the controller
    s.apply(vec![del(KernelObject::Neigh(neigh(30, "10.3.0.5", MAC_B)))])
        .await;
    assert_eq!(s.engine.l3().egress_refcount(&key), 1);
    assert_eq!(
        s.sw().routes.get(&(0, prefix("172.16.0.0/16"))),
        Some(&RouteTarget::Controller)
    );

    s.apply(vec![del(KernelObject::Neigh(neigh(30, "10.3.0.6", MAC_B)))])
        .await;
    assert_eq!(s.engine.l3().egress_refcount(&key), 0);
    assert!(s.sw().egresses.is_empty());
}

fn bridge_fdb(ifindex: u32, vlan: u16, mac: MacAddress) -> FdbEntry {
    FdbEntry {
        ifindex,
        mac,
        vlan: Some(vid(vlan)),
        dst: None,
        master: Some(10),
        ext_learned: false,
    }
}

fn call_index(sw: &SimulatedSwitch, pred: impl Fn(&HalCall) -> bool) -> usize {
    sw.calls()
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("call missing from {:?}", sw.calls()))
}

#[tokio::test]
async fn test_port_leaves_vxlan_mapped_vlan() {
    let mut s = Setup::new();
    let bridge = link(10, "br0", LinkKind::Bridge { vlan_filtering: true });
    let mut port = swp(1, 1);
    port.master = Some(10);
    port.bridge = Some(BridgePortInfo {
        vlans: members(&[50]),
        ..BridgePortInfo::default()
    });
    let mdb = MdbEntry {
        bridge: 10,
        ifindex: 1,
        vid: Some(vid(50)),
        group: ip("239.1.1.1"),
    };
    s.apply(vec![
        new(KernelObject::Link(bridge)),
        new(KernelObject::Link(port.clone())),
        new(KernelObject::Fdb(bridge_fdb(1, 50, MAC_B))),
        new(KernelObject::Mdb(mdb)),
    ])
    .await;

    let p1 = phys(1);
    let group: MacAddress = "01:00:5e:01:01:01".parse().unwrap();
    assert!(s.sw().l2_addrs.contains_key(&(p1, vid(50), MAC_B)));
    assert!(s.sw().mcast.contains(&(p1, vid(50), group)));

    let mut vx = vxlan_link(100, 100);
    vx.master = Some(10);
    vx.bridge = Some(BridgePortInfo {
        vlans: members(&[50]),
        ..BridgePortInfo::default()
    });
    s.apply(vec![new(KernelObject::Link(vx))]).await;

    assert!(s.engine.bridge().domain(vid(50)).is_some());
    assert!(s.engine.vxlan().is_access_port(p1, vid(50)));
    assert!(!s.sw().bridge_egress_vlans.contains_key(&(p1, vid(50))));
    // plain bridge state of (swp1, 50) is flushed before the access port exists
    assert!(s.sw().l2_addrs.keys().all(|(p, v, _)| (*p, *v) != (p1, vid(50))));
    assert!(s.sw().mcast.is_empty());
    let flush = call_index(s.sw(), |c| {
        matches!(c, HalCall::L2AddrRemoveAllInVlan { port, vid: v } if *port == p1 && *v == vid(50))
    });
    let leave = call_index(s.sw(), |c| matches!(c, HalCall::McastLeave { port, .. } if *port == p1));
    let access = call_index(s.sw(), |c| matches!(c, HalCall::AccessPortCreate(_)));
    assert!(flush < access);
    assert!(leave < access);

    // the mirrored entry moved to the overlay; a new one lands there too
    assert_eq!(s.sw().overlay_addrs.len(), 1);
    s.apply(vec![new(KernelObject::Fdb(bridge_fdb(1, 50, MAC_C)))])
        .await;
    assert_eq!(s.sw().overlay_addrs.len(), 2);

    port.bridge = Some(BridgePortInfo::default());
    s.apply(vec![change(KernelObject::Link(port))]).await;

    assert!(!s.engine.vxlan().is_access_port(p1, vid(50)));
    assert!(!s.sw().bridge_egress_vlans.contains_key(&(p1, vid(50))));
    assert!(s.sw().tunnel_ports.is_empty());
    assert!(s.sw().overlay_addrs.is_empty());
    assert!(s.sw().l2_addrs.is_empty());
    assert!(s.sw().mcast.is_empty());
    let delete = call_index(s.sw(), |c| matches!(c, HalCall::TunnelPortDelete { .. }));
    let last_flush = s.sw().calls()[..delete]
        .iter()
        .rposition(|c| {
            matches!(c, HalCall::L2AddrRemoveAllInVlan { port, vid: v } if *port == p1 && *v == vid(50))
        })
        .unwrap();
    assert!(last_flush > access);
    // the VLAN stays mapped to the VNI
    assert!(s.engine.bridge().domain(vid(50)).is_some());
}

#[tokio::test]
async fn test_replayed_events_change_nothing() {
    let mut s = Setup::new();
    let mut port = swp(2, 2);
    port.master = Some(10);
    port.bridge = Some(BridgePortInfo {
        vlans: members(&[20]),
        ..BridgePortInfo::default()
    });
    let mut events = routed_port();
    events.extend([
        new(KernelObject::Neigh(neigh(1, "10.1.0.2", MAC_B))),
        new(KernelObject::Route(gw_route("10.0.0.0/24", "10.1.0.2", 1))),
        new(KernelObject::Route(gw_route("203.0.113.0/24", "10.1.0.2", 1))),
        new(KernelObject::Link(vxlan_link(100, 100))),
        new(KernelObject::Fdb(tunnel_fdb(100))),
        new(KernelObject::Link(link(10, "br0", LinkKind::Bridge { vlan_filtering: true }))),
        new(KernelObject::Link(port)),
        new(KernelObject::BridgeVlan(BridgeVlanState {
            ifindex: 2,
            vid: vid(20),
            state: StpState::Blocking,
        })),
    ]);
    s.apply(events.clone()).await;

    let key = EndpointKey {
        local: Ipv4Addr::new(192, 0, 2, 1),
        remote: Ipv4Addr::new(203, 0, 113, 5),
        udp_port: 4789,
    };
    assert_eq!(s.engine.vxlan().endpoint_refcount(&key), 1);
    assert_eq!(s.sw().stp_vlan.get(&(phys(2), vid(20))), Some(&StpState::Blocking));

    let calls = s.sw().calls().len();
    let egresses = s.sw().egresses.clone();
    let routes = s.sw().routes.clone();
    let terminations = s.sw().terminations.clone();
    let lookups = s.engine.stats().lookups_spawned;

    s.apply(events).await;
    assert_eq!(s.sw().calls().len(), calls);
    assert_eq!(s.sw().egresses, egresses);
    assert_eq!(s.sw().routes, routes);
    assert_eq!(s.sw().terminations, terminations);
    assert_eq!(s.engine.stats().lookups_spawned, lookups);
    assert_eq!(s.engine.vxlan().endpoint_count(), 1);
    assert_eq!(s.engine.vxlan().endpoint_refcount(&key), 1);

    // one withdrawal undoes the replayed entry
    s.apply(vec![del(KernelObject::Fdb(tunnel_fdb(100)))]).await;
    assert_eq!(s.engine.vxlan().endpoint_count(), 0);
    assert!(s.sw().tunnel_next_hops.is_empty());
    assert!(s.sw().port_tenants.is_empty());
}

#[tokio::test]
async fn test_tunnel_entry_uses_route_already_mirrored() {
    // no feed: the underlay route only exists in the mirror
    let mut engine = SyncEngine::new(SyncConfig::default(), SimulatedSwitch::new());
    let handle = engine.handle();
    for event in [
        new(KernelObject::Link(swp(1, 1))),
        new(KernelObject::Addr(addr(1, "10.0.0.2/24"))),
        new(KernelObject::Route(link_route(1, "10.0.0.0/24"))),
        new(KernelObject::Neigh(neigh(1, "10.0.0.1", MAC_B))),
        new(KernelObject::Route(gw_route("203.0.113.0/24", "10.0.0.1", 1))),
        new(KernelObject::Link(vxlan_link(100, 100))),
        new(KernelObject::Fdb(tunnel_fdb(100))),
    ] {
        handle.push_kernel(event).unwrap();
    }
    engine.run_until_idle().await.unwrap();

    assert_eq!(engine.vxlan().endpoint_count(), 1);
    assert_eq!(engine.hal().tunnel_next_hops.len(), 1);
    assert_eq!(engine.hal().port_tenants.len(), 1);
}

#[tokio::test]
async fn test_run_drains_in_bounded_batches() {
    let mut s = Setup::with_config(SyncConfig {
        batch_size: 2,
        ..SyncConfig::default()
    });
    let events = (1..=5u16)
        .map(|i| new(KernelObject::Link(swp(u32::from(i), i))))
        .collect::<Vec<_>>();
    s.feed.replay(events).unwrap();

    let cancel = CancellationToken::new();
    let handle = s.engine.handle();
    let token = cancel.clone();
    let watcher = tokio::spawn(async move {
        while handle.pending() > 0 {
            tokio::task::yield_now().await;
        }
        token.cancel();
    });
    s.engine.run(cancel).await.unwrap();
    watcher.await.unwrap();

    assert_eq!(s.engine.cache().len::<Link>(), 5);
    assert!(s.engine.stats().cycles >= 3);
    assert_eq!(s.sw().port_configs.len(), 5);
}

#[tokio::test]
async fn test_shutdown_and_restart() {
    let mut s = Setup::new();
    s.apply(routed_port()).await;
    assert_eq!(s.sw().terminations.len(), 1);

    let handle = s.engine.handle();
    handle.feed_lost("netlink socket closed").unwrap();
    s.engine.run_until_idle().await.unwrap();
    assert_eq!(s.engine.state(), EngineState::Stopped);
    assert_eq!(s.engine.cache().len::<Link>(), 0);
    assert!(!s.engine.l3().has_addr(1, &prefix("10.1.0.1/24")));
    assert!(handle.push_kernel(new(KernelObject::Link(swp(2, 2)))).is_err());
    assert!(s.engine.run_until_idle().await.is_err());

    s.engine.restart().unwrap();
    s.engine.hal_mut().reset();
    s.apply(routed_port()).await;
    assert_eq!(s.engine.state(), EngineState::Running);
    assert!(s.engine.l3().has_addr(1, &prefix("10.1.0.1/24")));
    assert_eq!(s.sw().terminations.len(), 1);
}

#[tokio::test]
async fn test_hardware_loss_is_fatal() {
    let mut s = Setup::new();
    s.apply(routed_port()).await;
    s.engine.hal_mut().set_unavailable(true);
    s.apply(vec![new(KernelObject::Neigh(neigh(1, "10.1.0.2", MAC_B)))])
        .await;
    assert_eq!(s.engine.state(), EngineState::Stopped);
    assert_eq!(s.engine.l3().egress_count(), 0);
}

#[tokio::test]
async fn test_lag_member_gets_lag_vlans() {
    let mut s = Setup::new();
    let bond = link(20, "bond0", LinkKind::Bond { mode: 0 });
    let mut sub = link(21, "bond0.30", LinkKind::Vlan { id: vid(30), qinq: false });
    sub.lower = Some(20);
    let mut member = swp(5, 5);
    member.master = Some(20);
    member.slave = Some(BondSlave { active: true });

    s.apply(vec![
        new(KernelObject::Link(bond)),
        new(KernelObject::Link(sub)),
        new(KernelObject::Addr(addr(21, "10.30.0.1/24"))),
    ])
    .await;
    let lag = s.engine.bonds().lag_of(20).unwrap();
    assert_eq!(s.engine.vlans().binding_refcount(lag, vid(30)), 1);

    s.apply(vec![new(KernelObject::Link(member.clone()))]).await;
    let p5 = phys(5);
    assert_eq!(s.engine.bonds().members_of(lag), vec![p5]);
    assert!(s.sw().lags[&lag].members.contains_key(&p5));
    assert!(s.sw().egress_vlans.contains_key(&(p5, vid(30))));

    member.slave = Some(BondSlave { active: false });
    s.apply(vec![change(KernelObject::Link(member.clone()))]).await;
    assert_eq!(s.sw().lags[&lag].members.get(&p5), Some(&false));

    s.apply(vec![del(KernelObject::Link(member))]).await;
    assert!(s.sw().lags[&lag].members.is_empty());
    assert!(!s.sw().egress_vlans.contains_key(&(p5, vid(30))));
    assert_eq!(s.engine.bonds().lag_of(20), Some(lag));
}

#[tokio::test]
async fn test_bond_created_after_its_members() {
    let mut s = Setup::new();
    let mut member = swp(5, 5);
    member.master = Some(20);
    s.apply(vec![new(KernelObject::Link(member))]).await;
    assert!(s.engine.bonds().lag_of(20).is_none());

    s.apply(vec![new(KernelObject::Link(link(20, "bond0", LinkKind::Bond { mode: 0 })))])
        .await;
    let lag = s.engine.bonds().lag_of(20).unwrap();
    assert_eq!(s.engine.bonds().members_of(lag), vec![phys(5)]);
}

#[tokio::test]
async fn test_link_mac_change_moves_termination_and_egress() {
    let mut s = Setup::new();
    let mut events = routed_port();
    events.push(new(KernelObject::Neigh(neigh(1, "10.1.0.9", MAC_B))));
    s.apply(events).await;
    let p1 = phys(1);
    assert!(s
        .sw()
        .terminations
        .contains(&(Some(p1), VlanId::DEFAULT, MAC_A, AddrFamily::Inet)));

    let mut moved = swp(1, 1);
    moved.mac = MAC_C;
    s.apply(vec![change(KernelObject::Link(moved))]).await;

    assert!(s
        .sw()
        .terminations
        .contains(&(Some(p1), VlanId::DEFAULT, MAC_C, AddrFamily::Inet)));
    assert!(!s
        .sw()
        .terminations
        .contains(&(Some(p1), VlanId::DEFAULT, MAC_A, AddrFamily::Inet)));
    assert_eq!(s.sw().egresses.len(), 1);
    assert!(s.sw().egresses.values().all(|e| e.src == MAC_C));
    assert_eq!(
        s.engine.l3().neigh(1, ip("10.1.0.9")).map(|n| n.egress.src),
        Some(MAC_C)
    );
}

#[tokio::test]
async fn test_unroutable_neighbour_waits_for_link_route() {
    let mut s = Setup::new();
    s.apply(vec![
        new(KernelObject::Link(swp(1, 1))),
        new(KernelObject::Neigh(neigh(1, "192.168.99.9", MAC_B))),
    ])
    .await;
    assert!(s.engine.l3().is_unroutable(1, ip("192.168.99.9")));
    assert!(s.sw().egresses.is_empty());

    s.apply(vec![new(KernelObject::Route(link_route(1, "192.168.99.0/24")))])
        .await;
    assert!(!s.engine.l3().is_unroutable(1, ip("192.168.99.9")));
    assert!(s.engine.l3().neigh(1, ip("192.168.99.9")).is_some());
    assert_eq!(
        s.sw().count_calls(|c| matches!(c, HalCall::HostAdd { .. })),
        1
    );
}
