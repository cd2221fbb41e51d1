//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::sync::Arc;

use ipnetwork::IpNetwork;

use crate::config::RibCfg;
use crate::debug::Debug;
use crate::dplane::Dplane;
use crate::interface::Interfaces;
use crate::ip::IpNetworkExt;
use crate::nhg::NhgTable;
use crate::rib::{Rib, Route, RouteFlags};
use crate::southbound::{
    AddressFamily, Nexthop, NexthopAddr, NexthopFlags, Protocol,
};

// Per-protocol nexthop filter.
//
// Filters run after the activation check and can only demote a nexthop that
// was found active.
pub trait NexthopFilter: Send + Sync {
    fn permit(
        &self,
        prefix: &IpNetwork,
        route: &Route,
        nexthop: &Nexthop,
    ) -> bool;
}

pub type NexthopFilters = BTreeMap<Protocol, Arc<dyn NexthopFilter>>;

// ===== global functions =====

// Recomputes which nexthops of the route are usable for forwarding.
//
// Returns the number of active nexthops. The route is marked as changed when
// the outcome differs from the previous computation.
pub(crate) fn update_active_set(
    rib: &Rib,
    interfaces: &mut Interfaces,
    nhgs: &mut NhgTable,
    dplane: &Dplane,
    config: &RibCfg,
    filters: &NexthopFilters,
    prefix: &IpNetwork,
    route: &mut Route,
) -> usize {
    let mut nexthops = std::mem::take(&mut route.nexthops);
    let old_nexthops = nexthops.clone();
    let old_nexthop_mtu = route.nexthop_mtu;
    let mut nexthop_mtu = 0;
    let mut active = 0;

    // Phase 1: per-nexthop activation.
    for nexthop in nexthops.iter_mut() {
        nexthop.reset_resolution();
        let mut status = nexthop_active(
            rib,
            interfaces,
            config,
            prefix,
            route,
            nexthop,
            &mut nexthop_mtu,
        );
        if status
            && let Some(filter) = filters.get(&route.protocol)
            && !filter.permit(prefix, route, nexthop)
        {
            status = false;
        }
        if status
            && config.multipath_num != 0
            && active >= config.multipath_num
        {
            status = false;
        }

        if status {
            nexthop.flags.insert(NexthopFlags::ACTIVE);
            active += 1;
        } else {
            nexthop.reset_resolution();
            nexthop.flags.remove(NexthopFlags::FIB);
            Debug::NexthopInactive(prefix, nexthop).log();
        }
    }

    let changed = old_nexthop_mtu != nexthop_mtu
        || old_nexthops.len() != nexthops.len()
        || old_nexthops
            .iter()
            .zip(nexthops.iter())
            .any(|(old, new)| resolution_changed(old, new));
    if changed {
        route
            .flags
            .insert(RouteFlags::CHANGED | RouteFlags::NEXTHOPS_CHANGED);
    }
    route.nexthop_mtu = nexthop_mtu;

    // Phase 2: mirror the outcome in the nexthop group table.
    //
    // Group identity ignores resolution state, so the route keeps its entry
    // and only the resolution edges of the members move.
    let af = AddressFamily::from_prefix(prefix);
    if route.nhe_id.is_none() && !nexthops.is_empty() {
        match nhgs.find_or_create_nexthops(
            dplane,
            interfaces,
            &nexthops,
            route.vrf_id,
            af,
        ) {
            Ok(nhe_id) => {
                nhgs.increment_ref(dplane, nhe_id);
                route.nhe_id = Some(nhe_id);
            }
            Err(error) => error.log(),
        }
    }
    if let Some(nhe_id) = route.nhe_id {
        for nexthop in nexthops.iter() {
            let leaf_id = if nexthops.len() == 1 {
                Some(nhe_id)
            } else {
                nhgs.find(std::slice::from_ref(nexthop), route.vrf_id, af)
            };
            let Some(leaf_id) = leaf_id else {
                continue;
            };

            match nexthop.resolved_via {
                Some(target) if nexthop.is_active() => {
                    nhgs.set_resolved_via(leaf_id, target)
                }
                _ => nhgs.clear_resolved_via(leaf_id),
            }
        }

        if active == 0 {
            nhgs.set_invalid(nhe_id);
        } else {
            nhgs.revalidate(dplane, nhe_id);
        }
    }

    route.nexthops = nexthops;
    active
}

// ===== helper functions =====

// Decides whether a single nexthop can forward traffic right now, filling in
// its output interface, source address and resolved children.
fn nexthop_active(
    rib: &Rib,
    interfaces: &Interfaces,
    config: &RibCfg,
    prefix: &IpNetwork,
    route: &Route,
    nexthop: &mut Nexthop,
    nexthop_mtu: &mut u32,
) -> bool {
    // Routes learned from the kernel are trusted as they are.
    if route.protocol == Protocol::KERNEL {
        return true;
    }

    match nexthop.addr {
        NexthopAddr::Special(_) => return true,
        NexthopAddr::Interface(ifindex) => {
            return interfaces
                .get_by_ifindex(ifindex)
                .is_some_and(|iface| iface.is_operative());
        }
        NexthopAddr::GatewayIfindex(_, ifindex) => {
            let Some(iface) = interfaces.get_by_ifindex(ifindex) else {
                return false;
            };
            if !iface.is_operative() {
                return false;
            }

            // Onlink gateways need no lookup.
            if nexthop.flags.contains(NexthopFlags::ONLINK)
                || iface.is_unnumbered()
            {
                return true;
            }
        }
        NexthopAddr::Gateway(_) => (),
    }

    let Some(gateway) = nexthop.gateway() else {
        return false;
    };
    let af = AddressFamily::from_addr(&gateway);
    for (match_prefix, node) in rib.lookup_covering(route.vrf_id, &gateway) {
        // A route can't resolve through itself.
        if match_prefix == *prefix {
            if match_prefix.is_host_prefix() {
                continue;
            }
            return false;
        }
        if match_prefix.is_default() && !config.resolve_via_default {
            return false;
        }

        let Some(resolving) = node.values().find(|route| {
            route.is_selected()
                && route.is_installed()
                && !route.flags.contains(RouteFlags::REMOVED)
                && route.protocol != Protocol::TABLE
        }) else {
            continue;
        };

        // Directly connected gateway.
        if resolving.protocol == Protocol::DIRECT {
            let ifindex = resolving
                .nexthops
                .iter()
                .find_map(|newhop| newhop.output_ifindex());
            nexthop.ifindex = ifindex;
            nexthop.src = ifindex
                .and_then(|ifindex| interfaces.get_by_ifindex(ifindex))
                .and_then(|iface| iface.source_address(af));
            return true;
        }

        if !route.flags.contains(RouteFlags::ALLOW_RECURSION)
            && route.protocol != Protocol::STATIC
        {
            return false;
        }

        // Recursive resolution through the installed nexthops of the
        // resolving route.
        let resolved = resolving
            .nexthops
            .iter()
            .filter(|newhop| {
                newhop.is_active() && newhop.flags.contains(NexthopFlags::FIB)
            })
            .flat_map(|newhop| {
                if newhop.is_recursive() {
                    newhop.resolved.clone()
                } else {
                    vec![newhop.clone()]
                }
            })
            .map(|newhop| resolved_nexthop(gateway, nexthop, &newhop))
            .collect::<Vec<_>>();
        if resolved.is_empty() {
            return false;
        }

        nexthop.flags.insert(NexthopFlags::RECURSIVE);
        nexthop.resolved = resolved;
        nexthop.resolved_via = resolving.nhe_id;
        if resolving.mtu != 0
            && (*nexthop_mtu == 0 || resolving.mtu < *nexthop_mtu)
        {
            *nexthop_mtu = resolving.mtu;
        }
        return true;
    }

    false
}

// Builds the child of a recursive nexthop from one nexthop of the resolving
// route.
fn resolved_nexthop(
    gateway: std::net::IpAddr,
    parent: &Nexthop,
    newhop: &Nexthop,
) -> Nexthop {
    let addr = match newhop.addr {
        NexthopAddr::Interface(ifindex) => {
            NexthopAddr::GatewayIfindex(gateway, ifindex)
        }
        addr => addr,
    };

    // Labels of the resolving route are pushed below the parent's labels.
    let mut labels = newhop.labels.clone();
    labels.extend(parent.labels.iter().copied());

    let mut child = Nexthop::new(addr, newhop.vrf_id).with_labels(labels);
    child.flags.insert(NexthopFlags::ACTIVE);
    child.ifindex = newhop.output_ifindex();
    child.src = newhop.src;
    child
}

// Compares the resolution outcome of two computations of the same nexthop.
fn resolution_changed(old: &Nexthop, new: &Nexthop) -> bool {
    old.is_active() != new.is_active()
        || old.ifindex != new.ifindex
        || old.src != new.src
        || old.resolved_via != new.resolved_via
        || old.resolved.len() != new.resolved.len()
        || old.resolved.iter().zip(new.resolved.iter()).any(|(old, new)| {
            !old.same(new) || old.output_ifindex() != new.output_ifindex()
        })
}
