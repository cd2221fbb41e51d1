//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use holo_fib::FibMsg;
use holo_fib::config::Config;
use holo_fib::dplane::DplaneOp;
use holo_fib::error::Error;
use holo_fib::nhg::{NheFlags, NhgTable};
use holo_fib::southbound::{
    AddressFamily, KernelNhgKind, KernelNhgMsg, Nexthop, Protocol,
    VRF_DEFAULT,
};
use maplit::btreeset;

use crate::common::{
    TestFib, gateway, interface_down, interface_up, route_add, route_del,
};

//
// Helper functions.
//

fn kernel_nexthop(id: u32, addr: &str) -> KernelNhgMsg {
    KernelNhgMsg {
        id,
        vrf_id: VRF_DEFAULT,
        addr_family: AddressFamily::Ipv4,
        kind: KernelNhgKind::Nexthop(gateway(addr)),
    }
}

fn kernel_group(id: u32, depends: Vec<u32>) -> KernelNhgMsg {
    KernelNhgMsg {
        id,
        vrf_id: VRF_DEFAULT,
        addr_family: AddressFamily::Ipv4,
        kind: KernelNhgKind::Group(depends),
    }
}

fn find_or_create(fib: &mut TestFib, nexthops: &[Nexthop]) -> u32 {
    let master = &mut fib.master;
    master
        .nhgs
        .find_or_create_nexthops(
            &master.dplane,
            &mut master.interfaces,
            nexthops,
            VRF_DEFAULT,
            AddressFamily::Ipv4,
        )
        .unwrap()
}

fn kernel_update(
    fib: &mut TestFib,
    msg: KernelNhgMsg,
) -> Result<u32, Error> {
    let master = &mut fib.master;
    master
        .nhgs
        .kernel_update(&master.dplane, &mut master.interfaces, msg)
}

// Checks that every dependency edge is mirrored by a dependent edge.
fn assert_symmetric(nhgs: &NhgTable) {
    for nhe in nhgs.iter() {
        for depend_id in &nhe.depends {
            let depend = nhgs.get(*depend_id).unwrap();
            assert!(depend.dependents.contains(&nhe.id));
        }
        for dependent_id in &nhe.dependents {
            let dependent = nhgs.get(*dependent_id).unwrap();
            assert!(dependent.depends.contains(&nhe.id));
        }
    }
}

//
// Tests.
//

#[test]
fn test_dedup() {
    let mut fib = TestFib::new(Config::default());
    let a = gateway("10.0.1.2");
    let b = gateway("10.0.1.3");

    let single1 = find_or_create(&mut fib, &[a.clone()]);
    let single2 = find_or_create(&mut fib, &[a.clone()]);
    assert_eq!(single1, single2);

    // Member order doesn't matter.
    let group1 = find_or_create(&mut fib, &[a.clone(), b.clone()]);
    let group2 = find_or_create(&mut fib, &[b.clone(), a.clone()]);
    assert_eq!(group1, group2);

    // One leaf per member plus the group itself.
    assert_eq!(fib.master.nhgs.len(), 3);
    let group = fib.master.nhgs.get(group1).unwrap();
    assert!(group.is_group());
    assert_eq!(group.depends.len(), 2);
    assert!(group.depends.contains(&single1));
    assert_symmetric(&fib.master.nhgs);

    // Resolution state isn't part of the identity.
    let mut resolved = a.clone();
    resolved.ifindex = Some(1);
    resolved.src = Some(crate::common::addr("10.0.1.1"));
    assert_eq!(
        fib.master.nhgs.find(&[resolved], VRF_DEFAULT, AddressFamily::Ipv4),
        Some(single1)
    );
}

#[test]
fn test_group_lifecycle() {
    let mut fib = TestFib::new(Config::default());
    fib.connect_eth0();

    fib.send(route_add(
        Protocol::STATIC,
        "192.168.0.0/16",
        vec![gateway("10.0.1.2"), gateway("10.0.1.3")],
    ));
    let route = fib.route(Protocol::STATIC, "192.168.0.0/16");
    let nhe_id = route.nhe_id.unwrap();
    let nhe = fib.master.nhgs.get(nhe_id).unwrap();
    assert_eq!(nhe.refcnt, 1);
    assert!(nhe.flags.contains(NheFlags::VALID | NheFlags::INSTALLED));
    let leaves = nhe.depends.clone();
    for leaf_id in &leaves {
        assert_eq!(fib.master.nhgs.get(*leaf_id).unwrap().refcnt, 1);
    }
    assert!(
        fib.kernel
            .calls()
            .iter()
            .any(|call| call.op == DplaneOp::NhInstall
                && call.nhe_id == Some(nhe_id))
    );

    // Withdrawing the last user removes the group from the kernel and then
    // from the table.
    fib.send(route_del(Protocol::STATIC, "192.168.0.0/16"));
    assert!(fib.master.nhgs.get(nhe_id).is_none());
    for leaf_id in &leaves {
        assert!(fib.master.nhgs.get(*leaf_id).is_none());
    }
    assert!(
        fib.kernel
            .calls()
            .iter()
            .any(|call| call.op == DplaneOp::NhDelete
                && call.nhe_id == Some(nhe_id))
    );
    assert_symmetric(&fib.master.nhgs);
}

#[test]
fn test_invalidated_release() {
    let mut fib = TestFib::new(Config::default());
    fib.connect_eth0();
    fib.send(route_add(
        Protocol::STATIC,
        "192.168.0.0/16",
        vec![gateway("10.0.1.2")],
    ));
    let nhe_id = fib.route(Protocol::STATIC, "192.168.0.0/16").nhe_id.unwrap();
    let nhe = fib.master.nhgs.get(nhe_id).unwrap();
    assert!(nhe.is_installed() && nhe.is_in_kernel());

    // Invalid entries are still present in the kernel.
    fib.send(interface_down("eth0", 1));
    let nhe = fib.master.nhgs.get(nhe_id).unwrap();
    assert!(!nhe.is_valid() && !nhe.is_installed());
    assert!(nhe.is_in_kernel());

    // Releasing the entry removes it from the kernel first.
    fib.send(route_del(Protocol::STATIC, "192.168.0.0/16"));
    assert_eq!(fib.kernel.nhe_count(DplaneOp::NhInstall, nhe_id), 1);
    assert_eq!(fib.kernel.nhe_count(DplaneOp::NhDelete, nhe_id), 1);
    assert!(fib.master.nhgs.get(nhe_id).is_none());
}

#[test]
fn test_invalidated_reinstall() {
    let mut fib = TestFib::new(Config::default());
    fib.connect_eth0();
    fib.send(route_add(
        Protocol::STATIC,
        "192.168.0.0/16",
        vec![gateway("10.0.1.2")],
    ));
    let nhe_id = fib.route(Protocol::STATIC, "192.168.0.0/16").nhe_id.unwrap();

    fib.send(interface_down("eth0", 1));
    fib.send(interface_up("eth0", 1));

    // The kernel copy is refreshed rather than installed twice.
    let nhe = fib.master.nhgs.get(nhe_id).unwrap();
    assert!(nhe.is_valid() && nhe.is_installed() && nhe.is_in_kernel());
    assert_eq!(fib.kernel.nhe_count(DplaneOp::NhInstall, nhe_id), 1);
    assert_eq!(fib.kernel.nhe_count(DplaneOp::NhUpdate, nhe_id), 1);
}

#[test]
fn test_refcnt_balance() {
    let mut fib = TestFib::new(Config::default());
    let id = find_or_create(&mut fib, &[gateway("10.0.1.2")]);
    fib.settle();

    let master = &mut fib.master;
    master.nhgs.increment_ref(&master.dplane, id);
    master.nhgs.increment_ref(&master.dplane, id);
    assert_eq!(master.nhgs.get(id).unwrap().refcnt, 2);
    master
        .nhgs
        .decrement_ref(&master.dplane, &mut master.interfaces, id);
    assert_eq!(master.nhgs.get(id).unwrap().refcnt, 1);
    assert_eq!(fib.kernel.count(DplaneOp::NhDelete), 0);

    let master = &mut fib.master;
    master
        .nhgs
        .decrement_ref(&master.dplane, &mut master.interfaces, id);
    fib.settle();
    assert_eq!(fib.kernel.count(DplaneOp::NhDelete), 1);
    assert!(fib.master.nhgs.is_empty());

    // Unknown entries are ignored.
    let master = &mut fib.master;
    master
        .nhgs
        .decrement_ref(&master.dplane, &mut master.interfaces, id);
    assert!(master.nhgs.is_empty());
}

#[test]
fn test_kernel_groups() {
    let mut fib = TestFib::new(Config::default());
    let result = kernel_update(&mut fib, kernel_nexthop(10, "10.0.1.2"));
    assert_eq!(result.unwrap(), 10);
    let result = kernel_update(&mut fib, kernel_nexthop(11, "10.0.1.3"));
    assert_eq!(result.unwrap(), 11);
    let result = kernel_update(&mut fib, kernel_group(50, vec![10, 11]));
    assert_eq!(result.unwrap(), 50);

    let group = fib.master.nhgs.get(50).unwrap();
    assert!(group.flags.contains(
        NheFlags::VALID | NheFlags::INSTALLED | NheFlags::KERNEL
    ));
    assert_eq!(group.depends, btreeset! {10, 11});
    assert_eq!(group.nexthops.len(), 2);
    assert_symmetric(&fib.master.nhgs);

    // Kernel entries are never pushed back to the kernel.
    fib.settle();
    assert!(fib.kernel.calls().is_empty());

    // Same content under another ID.
    let result = kernel_update(&mut fib, kernel_group(51, vec![10, 11]));
    assert!(matches!(result, Err(Error::NhgIdCollision(51, 50))));

    // Known ID with different content.
    let result = kernel_update(&mut fib, kernel_nexthop(10, "10.0.1.4"));
    assert!(matches!(result, Err(Error::NhgContentMismatch(10))));

    // Missing member.
    let result = kernel_update(&mut fib, kernel_group(60, vec![10, 99]));
    assert!(matches!(result, Err(Error::NhgDependNotFound(60, 99))));
    assert!(fib.master.nhgs.get(60).is_none());

    // Replays are accepted.
    let result = kernel_update(&mut fib, kernel_nexthop(10, "10.0.1.2"));
    assert_eq!(result.unwrap(), 10);
    assert_eq!(fib.master.nhgs.len(), 3);

    // Locally allocated IDs skip past the kernel's.
    let id = find_or_create(&mut fib, &[gateway("10.0.1.9")]);
    assert!(id > 50);
}

#[test]
fn test_kernel_delete() {
    let mut fib = TestFib::new(Config::default());
    fib.send(FibMsg::NhgKernelAdd(kernel_nexthop(10, "10.0.1.2")));
    fib.send(FibMsg::NhgKernelAdd(kernel_nexthop(11, "10.0.1.3")));
    fib.send(FibMsg::NhgKernelAdd(kernel_group(50, vec![10, 11])));

    // A referenced entry is kept, but can't be used.
    let master = &mut fib.master;
    master.nhgs.increment_ref(&master.dplane, 50);
    fib.send(FibMsg::NhgKernelDel(50));
    let group = fib.master.nhgs.get(50).unwrap();
    assert!(!group.is_valid());

    fib.send(FibMsg::NhgKernelDel(11));
    assert!(fib.master.nhgs.get(11).is_some());

    // Unreferenced entries go away.
    let master = &mut fib.master;
    master
        .nhgs
        .decrement_ref(&master.dplane, &mut master.interfaces, 50);
    fib.send(FibMsg::NhgKernelDel(50));
    assert!(fib.master.nhgs.get(50).is_none());
    fib.send(FibMsg::NhgKernelDel(11));
    assert!(fib.master.nhgs.get(11).is_none());
    assert!(fib.master.nhgs.get(10).is_some());
    assert_symmetric(&fib.master.nhgs);
}

#[test]
fn test_invalidate_cascade() {
    let mut fib = TestFib::new(Config::default());
    fib.send(FibMsg::NhgKernelAdd(kernel_nexthop(10, "10.0.1.2")));
    fib.send(FibMsg::NhgKernelAdd(kernel_nexthop(11, "10.0.1.3")));
    fib.send(FibMsg::NhgKernelAdd(kernel_group(50, vec![10, 11])));

    fib.master.nhgs.set_invalid(10);
    assert!(!fib.master.nhgs.get(10).unwrap().is_valid());
    assert!(!fib.master.nhgs.get(50).unwrap().is_valid());
    assert!(fib.master.nhgs.get(11).unwrap().is_valid());
}

#[test]
fn test_resolved_via() {
    let mut fib = TestFib::new(Config::default());
    let a = find_or_create(&mut fib, &[gateway("172.16.0.5")]);
    let b = find_or_create(&mut fib, &[gateway("10.0.1.2")]);
    let c = find_or_create(&mut fib, &[gateway("10.0.1.3")]);

    fib.master.nhgs.set_resolved_via(a, b);
    let nhe = fib.master.nhgs.get(a).unwrap();
    assert!(nhe.is_recursive());
    assert_eq!(nhe.depends, btreeset! {b});
    assert_eq!(fib.master.nhgs.resolve(a), Some(b));
    assert_eq!(fib.master.nhgs.resolve(b), Some(b));

    // Invalidation follows resolution edges.
    fib.master.nhgs.set_invalid(b);
    assert!(!fib.master.nhgs.get(a).unwrap().is_valid());

    // Edges closing a loop are refused.
    fib.master.nhgs.set_resolved_via(b, a);
    assert!(!fib.master.nhgs.get(b).unwrap().is_recursive());
    assert_eq!(fib.master.nhgs.resolve(b), Some(b));

    // Re-pointing replaces the previous edge.
    fib.master.nhgs.set_resolved_via(a, c);
    assert_eq!(fib.master.nhgs.get(a).unwrap().depends, btreeset! {c});
    assert!(fib.master.nhgs.get(b).unwrap().dependents.is_empty());
    assert_eq!(fib.master.nhgs.resolve(a), Some(c));

    fib.master.nhgs.clear_resolved_via(a);
    assert!(!fib.master.nhgs.get(a).unwrap().is_recursive());
    assert_eq!(fib.master.nhgs.resolve(a), Some(a));
    assert_symmetric(&fib.master.nhgs);
}
