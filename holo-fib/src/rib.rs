//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet, btree_map};
use std::net::IpAddr;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use prefix_trie::map::PrefixMap;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::RibCfg;
use crate::debug::Debug;
use crate::dplane::{Context, Dplane, DplaneOp, DplaneResult};
use crate::interface::Interfaces;
use crate::ip::{IpAddrExt, IpNetworkExt};
use crate::nhg::NhgTable;
use crate::resolve::{self, NexthopFilters};
use crate::southbound::{
    AddressFamily, AddressFlags, AddressMsg, Label, LabelInstallMsg,
    LabelUninstallMsg, Lsp, LspFlags, Nexthop, NexthopAddr, NexthopFlags,
    NhlfeFlags, Protocol, RouteKeyMsg, RouteMsg, VRF_DEFAULT, VrfId,
};

// Routes of a single prefix, keyed by their origin.
pub type RibNode = BTreeMap<Protocol, Route>;

#[derive(Debug)]
pub struct Rib {
    pub tables: BTreeMap<VrfId, RouteTables>,
    pub mpls: BTreeMap<Label, Lsp>,
    pub ip_update_queue: BTreeSet<(VrfId, IpNetwork)>,
    pub mpls_update_queue: BTreeSet<Label>,
    pub update_queue_tx: mpsc::UnboundedSender<()>,
    pub update_queue_rx: mpsc::UnboundedReceiver<()>,
}

#[derive(Debug, Default)]
pub struct RouteTables {
    pub ipv4: PrefixMap<Ipv4Network, RibNode>,
    pub ipv6: PrefixMap<Ipv6Network, RibNode>,
}

#[derive(Clone, Debug)]
pub struct Route {
    pub protocol: Protocol,
    pub vrf_id: VrfId,
    pub table_id: u32,
    pub distance: u32,
    pub metric: u32,
    pub tag: Option<u32>,
    pub instance: u16,
    pub mtu: u32,
    pub nexthop_mtu: u32,
    pub nexthops: Vec<Nexthop>,
    pub nhe_id: Option<u32>,
    pub flags: RouteFlags,
    pub dplane_seq: u32,
    pub last_updated: DateTime<Utc>,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RouteFlags: u16 {
        const SELECTED = 0x0001;
        const INSTALLED = 0x0002;
        const REMOVED = 0x0004;
        const CHANGED = 0x0008;
        const NEXTHOPS_CHANGED = 0x0010;
        const ALLOW_RECURSION = 0x0020;
        const QUEUED = 0x0040;
        const FAILED = 0x0080;
    }
}

// ===== impl Rib =====

impl Rib {
    // Adds connected route to the RIB.
    pub(crate) fn connected_route_add(
        &mut self,
        interfaces: &mut Interfaces,
        nhgs: &mut NhgTable,
        dplane: &Dplane,
        config: &RibCfg,
        msg: AddressMsg,
    ) {
        // Ignore unnumbered addresses.
        if msg.flags.contains(AddressFlags::UNNUMBERED) {
            return;
        }
        let Some(ifindex) =
            interfaces.get_by_name(&msg.ifname).map(|iface| iface.ifindex)
        else {
            return;
        };

        let msg = RouteMsg {
            protocol: Protocol::DIRECT,
            vrf_id: VRF_DEFAULT,
            table_id: 0,
            prefix: msg.addr.apply_mask(),
            distance: 0,
            metric: 0,
            tag: None,
            instance: 0,
            mtu: 0,
            nexthops: vec![Nexthop::new(
                NexthopAddr::Interface(ifindex),
                VRF_DEFAULT,
            )],
        };
        self.ip_route_add(interfaces, nhgs, dplane, config, msg);
    }

    // Removes connected route from the RIB.
    pub(crate) fn connected_route_del(&mut self, msg: AddressMsg) {
        // Ignore unnumbered addresses.
        if msg.flags.contains(AddressFlags::UNNUMBERED) {
            return;
        }

        self.ip_route_del(RouteKeyMsg::new(
            Protocol::DIRECT,
            VRF_DEFAULT,
            msg.addr.apply_mask(),
        ));
    }

    // Adds IP route to the RIB.
    //
    // The route holds a reference on its nexthop group for as long as it
    // stays in the RIB.
    pub(crate) fn ip_route_add(
        &mut self,
        interfaces: &mut Interfaces,
        nhgs: &mut NhgTable,
        dplane: &Dplane,
        config: &RibCfg,
        msg: RouteMsg,
    ) {
        let prefix = msg.prefix.apply_mask();
        let af = AddressFamily::from_prefix(&prefix);
        let nhe_id = if msg.nexthops.is_empty() {
            None
        } else {
            match nhgs.find_or_create_nexthops(
                dplane,
                interfaces,
                &msg.nexthops,
                msg.vrf_id,
                af,
            ) {
                Ok(nhe_id) => {
                    nhgs.increment_ref(dplane, nhe_id);
                    Some(nhe_id)
                }
                Err(error) => {
                    error.log();
                    None
                }
            }
        };

        let rib_prefix = self.prefix_entry(msg.vrf_id, prefix);
        let old_nhe_id = match rib_prefix.entry(msg.protocol) {
            btree_map::Entry::Vacant(v) => {
                // If the IP route does not exist, create a new entry.
                v.insert(Route::new(&msg, nhe_id, config));
                None
            }
            btree_map::Entry::Occupied(o) => {
                let route = o.into_mut();
                let old_nhe_id = route.nhe_id;

                // Update the existing IP route with the new information.
                route.table_id = msg.table_id;
                route.distance = msg.distance;
                route.metric = msg.metric;
                route.tag = msg.tag;
                route.instance = msg.instance;
                route.mtu = msg.mtu;
                route.nexthops = msg.nexthops;
                route.nhe_id = nhe_id;
                route.last_updated = Utc::now();
                route.flags.remove(RouteFlags::REMOVED);
                route
                    .flags
                    .insert(RouteFlags::CHANGED | RouteFlags::NEXTHOPS_CHANGED);
                old_nhe_id
            }
        };
        if let Some(old_nhe_id) = old_nhe_id {
            nhgs.decrement_ref(dplane, interfaces, old_nhe_id);
        }

        // Add IP route to the update queue.
        self.ip_update_queue_add(msg.vrf_id, prefix);
    }

    // Removes IP route from the RIB.
    pub(crate) fn ip_route_del(&mut self, msg: RouteKeyMsg) {
        let prefix = msg.prefix.apply_mask();
        let Some(rib_prefix) = self.get_mut(msg.vrf_id, &prefix) else {
            return;
        };

        // Find IP route entry from the same advertising protocol.
        if let Some(route) = rib_prefix.get_mut(&msg.protocol) {
            // Mark IP route as removed.
            route.flags.insert(RouteFlags::REMOVED);

            // Add IP route to the update queue.
            self.ip_update_queue_add(msg.vrf_id, prefix);
        }
    }

    // Adds MPLS route to the RIB.
    pub(crate) fn mpls_route_add(&mut self, msg: LabelInstallMsg) {
        let mut nhlfes = msg.nhlfes;
        for nhlfe in nhlfes.iter_mut() {
            nhlfe.protocol = msg.protocol;
            if nhlfe.nexthop.is_some() {
                nhlfe.flags.insert(NhlfeFlags::SELECTED);
            }
        }

        match self.mpls.entry(msg.label) {
            btree_map::Entry::Vacant(v) => {
                // If the MPLS route does not exist, create a new entry.
                v.insert(Lsp {
                    in_label: msg.label,
                    addr_family: msg.addr_family,
                    nhlfes,
                    flags: LspFlags::CHANGED,
                    dplane_seq: 0,
                });
            }
            btree_map::Entry::Occupied(o) => {
                let lsp = o.into_mut();

                // Update the existing MPLS route with the new information.
                lsp.addr_family = msg.addr_family;
                lsp.nhlfes = nhlfes;
                lsp.flags.remove(LspFlags::REMOVED);
                lsp.flags.insert(LspFlags::CHANGED);
            }
        }

        // Add MPLS route to the update queue.
        self.mpls_update_queue_add(msg.label);
    }

    // Removes MPLS route from the RIB.
    pub(crate) fn mpls_route_del(&mut self, msg: LabelUninstallMsg) {
        let Some(lsp) = self.mpls.get_mut(&msg.label) else {
            return;
        };
        if !lsp.nhlfes.iter().any(|nhlfe| nhlfe.protocol == msg.protocol) {
            return;
        }

        // Mark MPLS route as removed.
        lsp.flags.insert(LspFlags::REMOVED);

        // Add MPLS route to the update queue.
        self.mpls_update_queue_add(msg.label);
    }

    // Processes routes present in the update queue.
    pub(crate) fn process_rib_update_queue(
        &mut self,
        interfaces: &mut Interfaces,
        nhgs: &mut NhgTable,
        dplane: &Dplane,
        config: &RibCfg,
        filters: &NexthopFilters,
    ) {
        // Process IP update queue.
        while let Some((vrf_id, prefix)) = self.ip_update_queue.pop_first() {
            self.process_prefix(
                interfaces, nhgs, dplane, config, filters, vrf_id, prefix,
            );
        }

        // Process MPLS update queue.
        while let Some(label) = self.mpls_update_queue.pop_first() {
            self.process_lsp(dplane, label);
        }
    }

    // Recomputes the active nexthops of all routes of the given prefix and
    // (re)installs the best one.
    fn process_prefix(
        &mut self,
        interfaces: &mut Interfaces,
        nhgs: &mut NhgTable,
        dplane: &Dplane,
        config: &RibCfg,
        filters: &NexthopFilters,
        vrf_id: VrfId,
        prefix: IpNetwork,
    ) {
        let Some(rib_prefix) = self.get_mut(vrf_id, &prefix) else {
            return;
        };
        let mut routes = std::mem::take(rib_prefix);

        // Find the protocol of the old selected route, if one exists.
        let old_selected = routes
            .values()
            .find(|route| route.flags.contains(RouteFlags::SELECTED))
            .map(|route| route.protocol);

        // Update the active nexthop set of all remaining routes.
        for route in routes
            .values_mut()
            .filter(|route| !route.flags.contains(RouteFlags::REMOVED))
        {
            resolve::update_active_set(
                self, interfaces, nhgs, dplane, config, filters, &prefix, route,
            );
        }

        // Select the best usable route.
        let new_selected = routes
            .values()
            .filter(|route| {
                !route.flags.contains(RouteFlags::REMOVED) && route.is_usable()
            })
            .min_by_key(|route| (route.distance, route.metric, route.protocol))
            .map(|route| route.protocol);

        let mut selection_changed = old_selected != new_selected;
        match (old_selected, new_selected) {
            (Some(old), Some(new)) if old == new => {
                if let Some(route) = routes.get_mut(&new)
                    && route.flags.contains(RouteFlags::CHANGED)
                {
                    route_install(dplane, prefix, route, None);
                    selection_changed |= route.is_system();
                }
            }
            (old, Some(new)) => {
                let new_is_system =
                    routes.get(&new).is_some_and(Route::is_system);

                // An installed route of ours is replaced in place, unless
                // the kernel owns the new route.
                let mut old_route = None;
                if let Some(route) = old.and_then(|old| routes.get_mut(&old)) {
                    route.flags.remove(RouteFlags::SELECTED);
                    Debug::RouteUnselect(vrf_id, &prefix, route.protocol)
                        .log();
                    if route.is_system() || new_is_system {
                        route_uninstall(dplane, prefix, route);
                    } else if route.is_installed() {
                        old_route = Some(route.clone());
                    }
                }
                if let Some(route) = routes.get_mut(&new) {
                    route_install(dplane, prefix, route, old_route.as_ref());
                }
            }
            (Some(old), None) => {
                if let Some(route) = routes.get_mut(&old) {
                    route.flags.remove(RouteFlags::SELECTED);
                    Debug::RouteUnselect(vrf_id, &prefix, old).log();
                    route_uninstall(dplane, prefix, route);
                }
            }
            (None, None) => (),
        }

        // Remove routes marked with the REMOVED flag.
        let removed = routes
            .iter()
            .filter(|(_, route)| route.flags.contains(RouteFlags::REMOVED))
            .map(|(protocol, _)| *protocol)
            .collect::<Vec<_>>();
        for protocol in removed {
            if let Some(route) = routes.remove(&protocol)
                && let Some(nhe_id) = route.nhe_id
            {
                nhgs.decrement_ref(dplane, interfaces, nhe_id);
            }
        }

        for route in routes.values_mut() {
            route
                .flags
                .remove(RouteFlags::CHANGED | RouteFlags::NEXTHOPS_CHANGED);
        }

        // Put the prefix back, or remove it if no routes are left.
        if routes.is_empty() {
            self.remove_prefix(vrf_id, &prefix);
        } else {
            *self.prefix_entry(vrf_id, prefix) = routes;
        }

        // Routes resolving through this prefix need another look when the
        // selection changes without a kernel round trip.
        if selection_changed
            && self
                .selected_route(vrf_id, &prefix)
                .is_none_or(|route| route.is_system())
        {
            self.queue_dependents(vrf_id, &prefix);
        }
    }

    fn process_lsp(&mut self, dplane: &Dplane, label: Label) {
        let Some(lsp) = self.mpls.get_mut(&label) else {
            return;
        };

        // Check if the route was marked for removal.
        if lsp.flags.contains(LspFlags::REMOVED) {
            if lsp.flags.contains(LspFlags::INSTALLED) {
                dplane.submit_lsp(DplaneOp::LspDelete, lsp);
            }

            // Effectively remove the MPLS route.
            self.mpls.remove(&label);
            return;
        }

        if !lsp.flags.contains(LspFlags::CHANGED) {
            return;
        }
        lsp.flags.remove(LspFlags::CHANGED);

        let op = if lsp.flags.contains(LspFlags::INSTALLED) {
            DplaneOp::LspUpdate
        } else {
            DplaneOp::LspInstall
        };
        if dplane.submit_lsp(op, lsp) == DplaneResult::Failure {
            lsp.flags.insert(LspFlags::FAILED);
        }
    }

    // Processes the result of a route update.
    pub(crate) fn process_route_result(&mut self, ctx: &Context) {
        let Some(info) = ctx.route() else {
            return;
        };
        let vrf_id = ctx.vrf_id();
        let prefix = info.dest;
        let Some(rib_prefix) = self.get_mut(vrf_id, &prefix) else {
            Debug::ContextStale(ctx.op(), ctx.seq()).log();
            return;
        };

        // The replaced route of a successful update is no longer in the
        // kernel.
        if ctx.is_update()
            && ctx.status() == DplaneResult::Success
            && info.old_protocol != info.protocol
            && let Some(old_route) = rib_prefix.get_mut(&info.old_protocol)
            && old_route.dplane_seq == ctx.old_seq()
        {
            old_route.flags.remove(RouteFlags::INSTALLED);
            old_route.clear_fib();
        }

        let Some(route) = rib_prefix.get_mut(&info.protocol) else {
            Debug::ContextStale(ctx.op(), ctx.seq()).log();
            return;
        };
        if route.dplane_seq != ctx.seq() {
            Debug::ContextStale(ctx.op(), ctx.seq()).log();
            return;
        }
        Debug::ContextResult(ctx.op(), ctx.seq(), ctx.status()).log();

        route.flags.remove(RouteFlags::QUEUED);
        let requeue = match (ctx.op(), ctx.status()) {
            (
                DplaneOp::RouteInstall | DplaneOp::RouteUpdate,
                DplaneResult::Success,
            ) => {
                route.flags.insert(RouteFlags::INSTALLED);
                route.flags.remove(RouteFlags::FAILED);
                route.set_fib();
                true
            }
            (DplaneOp::RouteInstall | DplaneOp::RouteUpdate, _) => {
                warn!(
                    vrf = %vrf_id, %prefix, protocol = %route.protocol,
                    "failed to install route"
                );
                route.flags.remove(RouteFlags::INSTALLED);
                route.flags.insert(RouteFlags::FAILED);
                route.clear_fib();
                true
            }
            (DplaneOp::RouteDelete, DplaneResult::Success) => {
                route.flags.remove(RouteFlags::INSTALLED);
                route.clear_fib();
                false
            }
            (DplaneOp::RouteDelete, _) => {
                warn!(
                    vrf = %vrf_id, %prefix, protocol = %route.protocol,
                    "failed to uninstall route"
                );
                false
            }
            _ => false,
        };

        if requeue {
            self.queue_dependents(vrf_id, &prefix);
        }
    }

    // Processes the result of an LSP update.
    pub(crate) fn process_lsp_result(&mut self, ctx: &Context) {
        let Some(label) = ctx.in_label() else {
            return;
        };
        let Some(lsp) = self.mpls.get_mut(&label) else {
            Debug::ContextStale(ctx.op(), ctx.seq()).log();
            return;
        };
        if lsp.dplane_seq != ctx.seq() {
            Debug::ContextStale(ctx.op(), ctx.seq()).log();
            return;
        }
        Debug::ContextResult(ctx.op(), ctx.seq(), ctx.status()).log();

        let installed = ctx.status() == DplaneResult::Success
            && ctx.op() != DplaneOp::LspDelete;
        for nhlfe in lsp.nhlfes.iter_mut() {
            nhlfe.flags.set(
                NhlfeFlags::INSTALLED,
                installed && nhlfe.flags.contains(NhlfeFlags::SELECTED),
            );
        }
        lsp.flags.set(LspFlags::INSTALLED, installed);
        lsp.flags.set(
            LspFlags::FAILED,
            ctx.status() != DplaneResult::Success,
        );
        if ctx.status() != DplaneResult::Success {
            warn!(label = %label, op = %ctx.op(), "failed to update LSP");
        }
    }

    // Withdraws every route and LSP installed in the kernel.
    pub(crate) fn uninstall_all(&mut self, dplane: &Dplane) {
        for table in self.tables.values_mut() {
            let ipv4 = table
                .ipv4
                .iter_mut()
                .map(|(prefix, node)| (IpNetwork::V4(*prefix), node));
            let ipv6 = table
                .ipv6
                .iter_mut()
                .map(|(prefix, node)| (IpNetwork::V6(*prefix), node));
            for (prefix, node) in ipv4.chain(ipv6) {
                for route in node.values_mut() {
                    route_uninstall(dplane, prefix, route);
                }
            }
        }
        for lsp in self.mpls.values_mut() {
            if lsp.flags.contains(LspFlags::INSTALLED) {
                dplane.submit_lsp(DplaneOp::LspDelete, lsp);
                lsp.flags.remove(LspFlags::INSTALLED);
            }
        }
    }

    // Returns the RIB entry associated to the given IP prefix.
    pub fn get(&self, vrf_id: VrfId, prefix: &IpNetwork) -> Option<&RibNode> {
        let table = self.tables.get(&vrf_id)?;
        match prefix {
            IpNetwork::V4(prefix) => table.ipv4.get(prefix),
            IpNetwork::V6(prefix) => table.ipv6.get(prefix),
        }
    }

    fn get_mut(
        &mut self,
        vrf_id: VrfId,
        prefix: &IpNetwork,
    ) -> Option<&mut RibNode> {
        let table = self.tables.get_mut(&vrf_id)?;
        match prefix {
            IpNetwork::V4(prefix) => table.ipv4.get_mut(prefix),
            IpNetwork::V6(prefix) => table.ipv6.get_mut(prefix),
        }
    }

    // Returns the selected route of the given prefix.
    pub fn selected_route(
        &self,
        vrf_id: VrfId,
        prefix: &IpNetwork,
    ) -> Option<&Route> {
        self.get(vrf_id, prefix)?
            .values()
            .find(|route| route.flags.contains(RouteFlags::SELECTED))
    }

    // Returns all RIB entries covering the given address, longest prefix
    // first.
    pub fn lookup_covering(
        &self,
        vrf_id: VrfId,
        addr: &IpAddr,
    ) -> Vec<(IpNetwork, &RibNode)> {
        let mut entries = vec![];
        let mut lookup = addr.to_host_prefix();
        loop {
            let Some((prefix, node)) = self.lookup_lpm(vrf_id, &lookup) else {
                break;
            };
            entries.push((prefix, node));
            if prefix.prefix() == 0 {
                break;
            }
            lookup = lookup.supernet(prefix.prefix() - 1);
        }
        entries
    }

    fn lookup_lpm(
        &self,
        vrf_id: VrfId,
        prefix: &IpNetwork,
    ) -> Option<(IpNetwork, &RibNode)> {
        let table = self.tables.get(&vrf_id)?;
        match prefix {
            IpNetwork::V4(prefix) => table
                .ipv4
                .get_lpm(prefix)
                .map(|(prefix, node)| (IpNetwork::V4(*prefix), node)),
            IpNetwork::V6(prefix) => table
                .ipv6
                .get_lpm(prefix)
                .map(|(prefix, node)| (IpNetwork::V6(*prefix), node)),
        }
    }

    // Returns the active nexthops of the selected route covering the given
    // address.
    pub fn lookup_nexthops(
        &self,
        vrf_id: VrfId,
        addr: &IpAddr,
    ) -> Vec<Nexthop> {
        self.lookup_covering(vrf_id, addr)
            .into_iter()
            .find_map(|(_, node)| {
                node.values().find(|route| {
                    route.flags.contains(RouteFlags::SELECTED)
                        && !route.flags.contains(RouteFlags::REMOVED)
                })
            })
            .map(|route| {
                route
                    .nexthops
                    .iter()
                    .filter(|nexthop| nexthop.is_active())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // Adds every prefix of the RIB to the update queue.
    pub(crate) fn queue_all(&mut self) {
        let prefixes = self
            .tables
            .iter()
            .flat_map(|(vrf_id, table)| {
                let ipv4 = table
                    .ipv4
                    .iter()
                    .map(|(prefix, _)| (*vrf_id, IpNetwork::V4(*prefix)));
                let ipv6 = table
                    .ipv6
                    .iter()
                    .map(|(prefix, _)| (*vrf_id, IpNetwork::V6(*prefix)));
                ipv4.chain(ipv6)
            })
            .collect::<Vec<_>>();
        for (vrf_id, prefix) in prefixes {
            self.ip_update_queue_add(vrf_id, prefix);
        }
    }

    // Queues the prefixes whose routes have recursive or unresolved
    // nexthops.
    fn queue_dependents(&mut self, vrf_id: VrfId, prefix: &IpNetwork) {
        let Some(table) = self.tables.get(&vrf_id) else {
            return;
        };
        let needs_check = |node: &RibNode| {
            node.values()
                .filter(|route| !route.flags.contains(RouteFlags::REMOVED))
                .flat_map(|route| route.nexthops.iter())
                .any(|nexthop| {
                    nexthop.is_recursive()
                        || (!nexthop.is_active() && nexthop.gateway().is_some())
                })
        };
        let ipv4 = table
            .ipv4
            .iter()
            .filter(|(_, node)| needs_check(node))
            .map(|(dependent, _)| IpNetwork::V4(*dependent));
        let ipv6 = table
            .ipv6
            .iter()
            .filter(|(_, node)| needs_check(node))
            .map(|(dependent, _)| IpNetwork::V6(*dependent));
        let dependents = ipv4
            .chain(ipv6)
            .filter(|dependent| dependent != prefix)
            .collect::<Vec<_>>();
        for dependent in dependents {
            self.ip_update_queue_add(vrf_id, dependent);
        }
    }

    // Returns RIB entry associated to the given IP prefix.
    fn prefix_entry(
        &mut self,
        vrf_id: VrfId,
        prefix: IpNetwork,
    ) -> &mut RibNode {
        let table = self.tables.entry(vrf_id).or_default();
        match prefix {
            IpNetwork::V4(prefix) => table.ipv4.entry(prefix).or_default(),
            IpNetwork::V6(prefix) => table.ipv6.entry(prefix).or_default(),
        }
    }

    fn remove_prefix(&mut self, vrf_id: VrfId, prefix: &IpNetwork) {
        let Some(table) = self.tables.get_mut(&vrf_id) else {
            return;
        };
        match prefix {
            IpNetwork::V4(prefix) => {
                table.ipv4.remove(prefix);
            }
            IpNetwork::V6(prefix) => {
                table.ipv6.remove(prefix);
            }
        }
    }

    // Adds IP route to the update queue.
    pub(crate) fn ip_update_queue_add(
        &mut self,
        vrf_id: VrfId,
        prefix: IpNetwork,
    ) {
        self.ip_update_queue.insert((vrf_id, prefix));
        let _ = self.update_queue_tx.send(());
    }

    // Adds MPLS label to the update queue.
    fn mpls_update_queue_add(&mut self, label: Label) {
        self.mpls_update_queue.insert(label);
        let _ = self.update_queue_tx.send(());
    }
}

impl Default for Rib {
    fn default() -> Self {
        let (update_queue_tx, update_queue_rx) = mpsc::unbounded_channel();
        Self {
            tables: Default::default(),
            mpls: Default::default(),
            ip_update_queue: Default::default(),
            mpls_update_queue: Default::default(),
            update_queue_tx,
            update_queue_rx,
        }
    }
}

// ===== impl Route =====

impl Route {
    pub fn new(msg: &RouteMsg, nhe_id: Option<u32>, config: &RibCfg) -> Route {
        let mut flags = RouteFlags::CHANGED | RouteFlags::NEXTHOPS_CHANGED;
        if config.recursion_protocols.contains(&msg.protocol) {
            flags.insert(RouteFlags::ALLOW_RECURSION);
        }

        Route {
            protocol: msg.protocol,
            vrf_id: msg.vrf_id,
            table_id: msg.table_id,
            distance: msg.distance,
            metric: msg.metric,
            tag: msg.tag,
            instance: msg.instance,
            mtu: msg.mtu,
            nexthop_mtu: 0,
            nexthops: msg.nexthops.clone(),
            nhe_id,
            flags,
            dplane_seq: 0,
            last_updated: Utc::now(),
        }
    }

    // Routes owned by the kernel itself are never programmed by us.
    pub fn is_system(&self) -> bool {
        matches!(self.protocol, Protocol::KERNEL | Protocol::DIRECT)
    }

    pub fn is_installed(&self) -> bool {
        self.flags.contains(RouteFlags::INSTALLED)
    }

    pub fn is_selected(&self) -> bool {
        self.flags.contains(RouteFlags::SELECTED)
    }

    pub fn active_nexthop_count(&self) -> usize {
        self.nexthops
            .iter()
            .filter(|nexthop| nexthop.is_active())
            .count()
    }

    // Checks whether the route has at least one active nexthop.
    pub fn is_usable(&self) -> bool {
        self.active_nexthop_count() > 0
    }

    fn set_fib(&mut self) {
        for nexthop in self.nexthops.iter_mut() {
            let active = nexthop.is_active();
            nexthop.flags.set(NexthopFlags::FIB, active);
            for resolved in nexthop.resolved.iter_mut() {
                resolved.flags.set(NexthopFlags::FIB, active);
            }
        }
    }

    fn clear_fib(&mut self) {
        for nexthop in self.nexthops.iter_mut() {
            nexthop.flags.remove(NexthopFlags::FIB);
            for resolved in nexthop.resolved.iter_mut() {
                resolved.flags.remove(NexthopFlags::FIB);
            }
        }
    }
}

// ===== helper functions =====

// Marks the route as selected and programs it.
fn route_install(
    dplane: &Dplane,
    prefix: IpNetwork,
    route: &mut Route,
    old_route: Option<&Route>,
) {
    route.flags.insert(RouteFlags::SELECTED);
    Debug::RouteSelect(route.vrf_id, &prefix, route.protocol).log();

    // The kernel already knows about its own routes.
    if route.is_system() {
        route.flags.insert(RouteFlags::INSTALLED);
        route.set_fib();
        return;
    }

    let op = if route.is_installed() || old_route.is_some() {
        DplaneOp::RouteUpdate
    } else {
        DplaneOp::RouteInstall
    };
    match dplane.submit_route(op, prefix, route, old_route) {
        DplaneResult::Queued => route.flags.insert(RouteFlags::QUEUED),
        DplaneResult::Success => route.flags.insert(RouteFlags::INSTALLED),
        DplaneResult::Failure => route.flags.insert(RouteFlags::FAILED),
    }
}

// Withdraws the route from the kernel if we programmed it.
fn route_uninstall(dplane: &Dplane, prefix: IpNetwork, route: &mut Route) {
    if route.is_system() {
        route.flags.remove(RouteFlags::INSTALLED);
        route.clear_fib();
        return;
    }
    if !route
        .flags
        .intersects(RouteFlags::INSTALLED | RouteFlags::QUEUED)
    {
        return;
    }

    dplane.submit_route(DplaneOp::RouteDelete, prefix, route, None);
    route.flags.remove(RouteFlags::INSTALLED | RouteFlags::QUEUED);
}
