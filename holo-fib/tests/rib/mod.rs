//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use holo_fib::config::{Config, RibCfg};
use holo_fib::dplane::DplaneOp;
use holo_fib::resolve::NexthopFilter;
use holo_fib::rib::{Route, RouteFlags};
use holo_fib::southbound::{
    AddressFamily, Label, LabelInstallMsg, LabelUninstallMsg, LspFlags,
    Nexthop, NexthopAddr, NexthopFlags, Nhlfe, NhlfeFlags, Protocol,
    Pseudowire, PwStatus, VRF_DEFAULT,
};
use holo_fib::{FibMsg, Master};
use ipnetwork::IpNetwork;
use tokio::sync::mpsc;

use crate::common::{
    MockKernel, TestFib, addr, address_add, gateway, interface_down,
    interface_up, route_add, route_del,
};

// Rejects nexthops through the given gateway.
struct DenyGateway(IpAddr);

impl NexthopFilter for DenyGateway {
    fn permit(
        &self,
        _prefix: &IpNetwork,
        _route: &Route,
        nexthop: &Nexthop,
    ) -> bool {
        nexthop.gateway() != Some(self.0)
    }
}

//
// Helper functions.
//

fn rib_config(rib: RibCfg) -> Config {
    Config {
        rib,
        ..Default::default()
    }
}

fn pseudowire(ifname: &str, dest: &str) -> Pseudowire {
    Pseudowire {
        ifname: ifname.to_owned(),
        ifindex: 10,
        vrf_id: VRF_DEFAULT,
        pw_type: 5,
        addr_family: AddressFamily::Ipv4,
        dest: addr(dest),
        local_label: Label::new(1000),
        remote_label: Label::new(2000),
        flags: 0,
        status: PwStatus::Down,
        dplane_seq: 0,
    }
}

// Static route plus a BGP route resolving through it.
fn setup_recursive(fib: &mut TestFib) {
    fib.connect_eth0();
    fib.send(route_add(
        Protocol::STATIC,
        "172.16.0.0/24",
        vec![gateway("10.0.1.2")],
    ));
    fib.send(route_add(
        Protocol::BGP,
        "8.8.8.0/24",
        vec![gateway("172.16.0.5")],
    ));
}

//
// Tests.
//

#[test]
fn test_connected_resolution() {
    let mut fib = TestFib::new(Config::default());
    fib.connect_eth0();

    // Connected routes belong to the kernel.
    let direct = fib.route(Protocol::DIRECT, "10.0.1.0/24");
    assert!(direct.is_selected());
    assert!(direct.is_installed());
    assert_eq!(
        fib.kernel.route_count(DplaneOp::RouteInstall, "10.0.1.0/24"),
        0
    );

    fib.send(route_add(
        Protocol::STATIC,
        "192.168.0.0/16",
        vec![gateway("10.0.1.2")],
    ));
    let route = fib.route(Protocol::STATIC, "192.168.0.0/16");
    assert!(route.is_selected());
    assert!(route.is_installed());
    let nexthop = &route.nexthops[0];
    assert!(nexthop.is_active());
    assert!(!nexthop.is_recursive());
    assert!(nexthop.flags.contains(NexthopFlags::FIB));
    assert_eq!(nexthop.ifindex, Some(1));
    assert_eq!(nexthop.src, Some(addr("10.0.1.1")));
    assert_eq!(
        fib.kernel.route_count(DplaneOp::RouteInstall, "192.168.0.0/16"),
        1
    );
}

#[test]
fn test_recursive_resolution() {
    let mut fib = TestFib::new(Config::default());
    setup_recursive(&mut fib);

    let static_nhe = fib.route(Protocol::STATIC, "172.16.0.0/24").nhe_id;
    let route = fib.route(Protocol::BGP, "8.8.8.0/24");
    assert!(route.is_selected());
    assert!(route.is_installed());

    let nexthop = &route.nexthops[0];
    assert!(nexthop.is_active());
    assert!(nexthop.is_recursive());
    assert_eq!(nexthop.resolved_via, static_nhe);
    assert_eq!(nexthop.resolved.len(), 1);
    assert_eq!(
        nexthop.resolved[0].addr,
        NexthopAddr::Gateway(addr("10.0.1.2"))
    );
    assert_eq!(nexthop.resolved[0].output_ifindex(), Some(1));

    // The nexthop group mirrors the resolution.
    let bgp_nhe = route.nhe_id.unwrap();
    let nhe = fib.master.nhgs.get(bgp_nhe).unwrap();
    assert!(nhe.is_recursive());
    assert_eq!(fib.master.nhgs.resolve(bgp_nhe), static_nhe);
    assert_eq!(
        fib.kernel.route_count(DplaneOp::RouteInstall, "8.8.8.0/24"),
        1
    );
}

#[test]
fn test_recursive_reresolution() {
    let mut fib = TestFib::new(Config::default());
    setup_recursive(&mut fib);
    let bgp_nhe = fib.route(Protocol::BGP, "8.8.8.0/24").nhe_id.unwrap();
    let old_static_nhe = fib.route(Protocol::STATIC, "172.16.0.0/24").nhe_id;

    // A more specific route takes over the resolution.
    fib.send(route_add(
        Protocol::STATIC,
        "172.16.0.0/28",
        vec![gateway("10.0.1.3")],
    ));
    let new_static_nhe = fib.route(Protocol::STATIC, "172.16.0.0/28").nhe_id;
    let route = fib.route(Protocol::BGP, "8.8.8.0/24");
    let nexthop = &route.nexthops[0];
    assert_eq!(nexthop.resolved_via, new_static_nhe);
    assert_eq!(
        nexthop.resolved[0].addr,
        NexthopAddr::Gateway(addr("10.0.1.3"))
    );

    // The route keeps its entry, only the resolution edge moves.
    assert_eq!(route.nhe_id, Some(bgp_nhe));
    assert_eq!(fib.master.nhgs.resolve(bgp_nhe), new_static_nhe);
    let old_static = fib.master.nhgs.get(old_static_nhe.unwrap()).unwrap();
    assert!(!old_static.dependents.contains(&bgp_nhe));
}

#[test]
fn test_recursion_not_allowed() {
    let mut fib = TestFib::new(Config::default());
    setup_recursive(&mut fib);
    fib.send(route_add(
        Protocol::OSPFV2,
        "9.9.9.0/24",
        vec![gateway("172.16.0.5")],
    ));

    let route = fib.route(Protocol::OSPFV2, "9.9.9.0/24");
    assert!(!route.is_selected());
    assert!(!route.nexthops[0].is_active());
    assert_eq!(
        fib.kernel.route_count(DplaneOp::RouteInstall, "9.9.9.0/24"),
        0
    );
}

#[test]
fn test_self_resolution() {
    let mut fib = TestFib::new(Config::default());
    fib.connect_eth0();
    fib.send(route_add(
        Protocol::STATIC,
        "10.0.0.0/8",
        vec![gateway("10.0.1.2")],
    ));

    // The gateway falls inside the route's own prefix.
    fib.send(route_add(
        Protocol::STATIC,
        "10.9.0.0/16",
        vec![gateway("10.9.0.1")],
    ));
    assert!(fib.route(Protocol::STATIC, "10.0.0.0/8").is_selected());
    let route = fib.route(Protocol::STATIC, "10.9.0.0/16");
    assert!(!route.is_selected());
    assert!(!route.nexthops[0].is_active());
    assert_eq!(
        fib.kernel.route_count(DplaneOp::RouteInstall, "10.9.0.0/16"),
        0
    );
}

#[test]
fn test_default_route_resolution() {
    for resolve_via_default in [false, true] {
        let config = rib_config(RibCfg {
            resolve_via_default,
            ..Default::default()
        });
        let mut fib = TestFib::new(config);
        fib.connect_eth0();
        fib.send(route_add(
            Protocol::STATIC,
            "0.0.0.0/0",
            vec![gateway("10.0.1.254")],
        ));
        fib.send(route_add(
            Protocol::STATIC,
            "20.0.0.0/8",
            vec![gateway("30.0.0.1")],
        ));

        let default = fib.route(Protocol::STATIC, "0.0.0.0/0");
        assert!(default.is_installed());
        let route = fib.route(Protocol::STATIC, "20.0.0.0/8");
        assert_eq!(route.is_selected(), resolve_via_default);
        assert_eq!(route.nexthops[0].is_active(), resolve_via_default);
        if resolve_via_default {
            assert!(route.nexthops[0].is_recursive());
            assert_eq!(route.nexthops[0].resolved_via, default.nhe_id);
        }
    }
}

#[test]
fn test_multipath_limit() {
    let config = rib_config(RibCfg {
        multipath_num: 2,
        ..Default::default()
    });
    let mut fib = TestFib::new(config);
    fib.connect_eth0();
    fib.send(route_add(
        Protocol::STATIC,
        "50.0.0.0/8",
        vec![gateway("10.0.1.2"), gateway("10.0.1.3"), gateway("10.0.1.4")],
    ));

    let route = fib.route(Protocol::STATIC, "50.0.0.0/8");
    assert!(route.is_installed());
    assert_eq!(route.active_nexthop_count(), 2);
    assert!(route.nexthops[0].is_active());
    assert!(route.nexthops[1].is_active());
    assert!(!route.nexthops[2].is_active());
    assert!(!route.nexthops[2].flags.contains(NexthopFlags::FIB));
}

#[test]
fn test_interface_down() {
    let mut fib = TestFib::new(Config::default());
    setup_recursive(&mut fib);
    let static_nhe = fib
        .route(Protocol::STATIC, "172.16.0.0/24")
        .nhe_id
        .unwrap();
    let bgp_nhe = fib.route(Protocol::BGP, "8.8.8.0/24").nhe_id.unwrap();

    // Losing the interface takes down everything that depends on it.
    fib.send(interface_down("eth0", 1));
    assert!(!fib.route(Protocol::DIRECT, "10.0.1.0/24").is_selected());
    for (protocol, prefix) in
        [(Protocol::STATIC, "172.16.0.0/24"), (Protocol::BGP, "8.8.8.0/24")]
    {
        let route = fib.route(protocol, prefix);
        assert!(!route.is_selected());
        assert!(!route.is_installed());
        assert!(!route.nexthops[0].is_active());
        assert_eq!(fib.kernel.route_count(DplaneOp::RouteDelete, prefix), 1);
    }
    assert!(!fib.master.nhgs.get(static_nhe).unwrap().is_valid());
    assert!(!fib.master.nhgs.get(bgp_nhe).unwrap().is_valid());

    // And brings it all back once it recovers.
    fib.send(interface_up("eth0", 1));
    for (protocol, prefix) in
        [(Protocol::STATIC, "172.16.0.0/24"), (Protocol::BGP, "8.8.8.0/24")]
    {
        let route = fib.route(protocol, prefix);
        assert!(route.is_selected());
        assert!(route.is_installed());
        assert_eq!(fib.kernel.route_count(DplaneOp::RouteInstall, prefix), 2);
    }
    assert!(fib.master.nhgs.get(static_nhe).unwrap().is_valid());
}

#[test]
fn test_nexthop_filter() {
    let mut fib = TestFib::new(Config::default());
    fib.connect_eth0();
    let filter = DenyGateway(addr("10.0.1.3"));
    fib.master.register_filter(Protocol::STATIC, Arc::new(filter));
    fib.send(route_add(
        Protocol::STATIC,
        "192.168.0.0/16",
        vec![gateway("10.0.1.2"), gateway("10.0.1.3")],
    ));

    let route = fib.route(Protocol::STATIC, "192.168.0.0/16");
    assert!(route.is_installed());
    assert_eq!(route.active_nexthop_count(), 1);
    assert!(!route.nexthops[1].is_active());

    // Filters can't activate anything, so removal only adds nexthops back.
    fib.master.unregister_filter(Protocol::STATIC);
    fib.settle();
    let route = fib.route(Protocol::STATIC, "192.168.0.0/16");
    assert_eq!(route.active_nexthop_count(), 2);
    assert_eq!(
        fib.kernel.route_count(DplaneOp::RouteUpdate, "192.168.0.0/16"),
        1
    );
}

#[test]
fn test_route_selection() {
    let mut fib = TestFib::new(Config::default());
    fib.connect_eth0();
    fib.send(route_add(
        Protocol::OSPFV2,
        "192.168.0.0/16",
        vec![gateway("10.0.1.2")],
    ));
    assert!(fib.route(Protocol::OSPFV2, "192.168.0.0/16").is_installed());

    // A better route replaces the installed one in place.
    fib.send(route_add(
        Protocol::STATIC,
        "192.168.0.0/16",
        vec![gateway("10.0.1.3")],
    ));
    let route = fib.route(Protocol::STATIC, "192.168.0.0/16");
    assert!(route.is_selected());
    assert!(route.is_installed());
    let route = fib.route(Protocol::OSPFV2, "192.168.0.0/16");
    assert!(!route.is_selected());
    assert!(!route.is_installed());
    assert_eq!(
        fib.kernel.route_count(DplaneOp::RouteUpdate, "192.168.0.0/16"),
        1
    );
    assert_eq!(
        fib.kernel.route_count(DplaneOp::RouteDelete, "192.168.0.0/16"),
        0
    );

    // Withdrawing it falls back to the remaining one.
    fib.send(route_del(Protocol::STATIC, "192.168.0.0/16"));
    assert!(fib.try_route(Protocol::STATIC, "192.168.0.0/16").is_none());
    let route = fib.route(Protocol::OSPFV2, "192.168.0.0/16");
    assert!(route.is_selected());
    assert!(route.is_installed());
    assert_eq!(
        fib.kernel.route_count(DplaneOp::RouteUpdate, "192.168.0.0/16"),
        2
    );
}

#[test]
fn test_route_withdraw() {
    let mut fib = TestFib::new(Config::default());
    fib.connect_eth0();
    fib.send(route_add(
        Protocol::STATIC,
        "192.168.0.0/16",
        vec![gateway("10.0.1.2")],
    ));
    assert_eq!(fib.master.stats().routes, 2);

    fib.send(route_del(Protocol::STATIC, "192.168.0.0/16"));
    assert!(fib.try_route(Protocol::STATIC, "192.168.0.0/16").is_none());
    assert_eq!(
        fib.kernel.route_count(DplaneOp::RouteDelete, "192.168.0.0/16"),
        1
    );
    assert_eq!(fib.master.stats().routes, 1);
}

#[test]
fn test_install_failure() {
    let mut fib = TestFib::new(Config::default());
    fib.kernel.fail(DplaneOp::RouteInstall);
    fib.connect_eth0();
    fib.send(route_add(
        Protocol::STATIC,
        "192.168.0.0/16",
        vec![gateway("10.0.1.2")],
    ));

    let route = fib.route(Protocol::STATIC, "192.168.0.0/16");
    assert!(route.is_selected());
    assert!(!route.is_installed());
    assert!(route.flags.contains(RouteFlags::FAILED));
    assert!(!route.nexthops[0].flags.contains(NexthopFlags::FIB));
    assert_eq!(fib.master.dplane.stats().route_errors, 1);
}

#[test]
fn test_mpls_route() {
    let mut fib = TestFib::new(Config::default());
    fib.connect_eth0();
    let label = Label::new(100);
    fib.send(FibMsg::RouteMplsAdd(LabelInstallMsg {
        protocol: Protocol::LDP,
        label,
        addr_family: AddressFamily::Ipv4,
        nhlfes: vec![Nhlfe {
            protocol: Protocol::LDP,
            nexthop: Some(gateway("10.0.1.2")),
            out_labels: vec![Label::new(200)],
            flags: NhlfeFlags::empty(),
        }],
    }));

    let lsp = fib.master.rib.mpls.get(&label).unwrap();
    assert!(lsp.flags.contains(LspFlags::INSTALLED));
    assert_eq!(
        lsp.nhlfes[0].flags,
        NhlfeFlags::SELECTED | NhlfeFlags::INSTALLED
    );
    assert_eq!(fib.kernel.count(DplaneOp::LspInstall), 1);

    fib.send(FibMsg::RouteMplsDel(LabelUninstallMsg {
        protocol: Protocol::LDP,
        label,
    }));
    assert!(fib.master.rib.mpls.is_empty());
    assert_eq!(fib.kernel.count(DplaneOp::LspDelete), 1);
}

#[test]
fn test_pseudowire() {
    let mut fib = TestFib::new(Config::default());
    fib.connect_eth0();

    fib.send(FibMsg::PwInstall(pseudowire("pw0", "10.0.1.2")));
    assert_eq!(fib.master.pseudowires["pw0"].status, PwStatus::Up);
    assert_eq!(fib.kernel.count(DplaneOp::PwInstall), 1);

    // Unreachable destinations are kept down and never submitted.
    fib.send(FibMsg::PwInstall(pseudowire("pw1", "99.0.0.1")));
    assert_eq!(fib.master.pseudowires["pw1"].status, PwStatus::Down);
    assert_eq!(fib.kernel.count(DplaneOp::PwInstall), 1);

    fib.send(FibMsg::PwUninstall("pw0".to_owned()));
    fib.send(FibMsg::PwUninstall("pw1".to_owned()));
    assert!(fib.master.pseudowires.is_empty());
    assert_eq!(fib.kernel.count(DplaneOp::PwUninstall), 1);
}

#[tokio::test]
async fn test_shutdown_withdraws() {
    let kernel = MockKernel::default();
    let mut master = Master::new(Config::default(), Box::new(kernel.clone()));
    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    master
        .start(move |results| {
            let _ = results_tx.send(results);
        })
        .unwrap();

    master.process_msg(interface_up("eth0", 1));
    master.process_msg(address_add("eth0", "10.0.1.1/24"));
    master.process_msg(route_add(
        Protocol::STATIC,
        "192.168.0.0/16",
        vec![gateway("10.0.1.2")],
    ));
    loop {
        master.process_rib_update_queue();
        let timeout = Duration::from_millis(50);
        match tokio::time::timeout(timeout, results_rx.recv()).await {
            Ok(Some(results)) => master.process_dplane_results(results),
            _ if master.dplane.queue_len() == 0
                && master.rib.ip_update_queue.is_empty() =>
            {
                break;
            }
            _ => (),
        }
    }
    assert_eq!(
        kernel.route_count(DplaneOp::RouteInstall, "192.168.0.0/16"),
        1
    );

    master.shutdown(&mut results_rx).await;
    assert_eq!(
        kernel.route_count(DplaneOp::RouteDelete, "192.168.0.0/16"),
        1
    );

    // Every result was consumed before the pipeline stopped.
    assert!(results_rx.try_recv().is_err());
}
