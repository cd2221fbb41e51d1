//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod config;
pub mod debug;
pub mod dplane;
pub mod error;
pub mod interface;
pub mod ip;
pub mod netlink;
pub mod nhg;
pub mod resolve;
pub mod rib;
pub mod southbound;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::debug::Debug;
use crate::dplane::{
    Context, ContextPayload, Dplane, DplaneOp, DplaneResult, DplaneStats,
    KernelOps,
};
use crate::error::Error;
use crate::interface::Interfaces;
use crate::nhg::NhgTable;
use crate::resolve::{NexthopFilter, NexthopFilters};
use crate::rib::Rib;
use crate::southbound::{
    AddressMsg, InterfaceUpdateMsg, KernelNhgMsg, LabelInstallMsg,
    LabelUninstallMsg, Protocol, Pseudowire, PwStatus, RouteKeyMsg, RouteMsg,
};

// Control-plane state owning every forwarding table.
pub struct Master {
    // Configuration.
    pub config: Config,
    // List of interfaces.
    pub interfaces: Interfaces,
    // RIB.
    pub rib: Rib,
    // Nexthop group table.
    pub nhgs: NhgTable,
    // Dataplane pipeline.
    pub dplane: Dplane,
    // Per-protocol nexthop filters.
    pub filters: NexthopFilters,
    // Pseudowires keyed by interface name.
    pub pseudowires: BTreeMap<String, Pseudowire>,
}

// Input messages.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum FibMsg {
    InterfaceUpd(InterfaceUpdateMsg),
    InterfaceDel(String),
    AddressAdd(AddressMsg),
    AddressDel(AddressMsg),
    RouteIpAdd(RouteMsg),
    RouteIpDel(RouteKeyMsg),
    RouteMplsAdd(LabelInstallMsg),
    RouteMplsDel(LabelUninstallMsg),
    NhgKernelAdd(KernelNhgMsg),
    NhgKernelDel(u32),
    PwInstall(Pseudowire),
    PwUninstall(String),
}

// Status snapshot.
#[derive(Debug, Serialize)]
pub struct FibStats {
    pub dplane: DplaneStats,
    pub routes: usize,
    pub lsps: usize,
    pub nhgs: usize,
    pub pseudowires: usize,
}

// ===== impl Master =====

impl Master {
    pub fn new(config: Config, kernel: Box<dyn KernelOps>) -> Master {
        let dplane = Dplane::new(config.dplane.clone(), kernel);
        Master {
            config,
            interfaces: Default::default(),
            rib: Default::default(),
            nhgs: Default::default(),
            dplane,
            filters: Default::default(),
            pseudowires: Default::default(),
        }
    }

    // Starts the dataplane thread.
    //
    // Processed contexts are handed to `results_cb` on the dataplane thread,
    // and must be passed back to `process_dplane_results`.
    pub fn start(
        &mut self,
        results_cb: impl FnMut(Vec<Context>) + Send + 'static,
    ) -> Result<(), Error> {
        self.dplane.start(results_cb)
    }

    // Main loop.
    //
    // New messages are held back while the dataplane is congested.
    pub async fn run(
        &mut self,
        mut msg_rx: mpsc::UnboundedReceiver<FibMsg>,
        results_rx: &mut mpsc::UnboundedReceiver<Vec<Context>>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(msg) = msg_rx.recv(), if !self.dplane.is_congested() => {
                    self.process_msg(msg);
                }
                Some(results) = results_rx.recv() => {
                    self.process_dplane_results(results);
                }
                Some(_) = self.rib.update_queue_rx.recv() => {
                    self.process_rib_update_queue();
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    }

    // Withdraws everything from the kernel and waits for the dataplane to
    // drain before stopping it.
    pub async fn shutdown(
        mut self,
        results_rx: &mut mpsc::UnboundedReceiver<Vec<Context>>,
    ) {
        self.dplane.pre_finish();
        self.rib.uninstall_all(&self.dplane);
        for pw in self.pseudowires.values_mut() {
            if pw.dplane_seq != 0 {
                self.dplane
                    .submit_pseudowire(DplaneOp::PwUninstall, pw, vec![]);
                pw.status = PwStatus::Down;
            }
        }

        let (done_tx, mut done_rx) = oneshot::channel();
        self.dplane.finish(move || {
            let _ = done_tx.send(());
        });
        loop {
            tokio::select! {
                biased;
                Some(results) = results_rx.recv() => {
                    self.process_dplane_results(results);
                }
                _ = &mut done_rx => {
                    break;
                }
            }
        }
        while let Ok(results) = results_rx.try_recv() {
            self.process_dplane_results(results);
        }

        self.dplane.shutdown();
    }

    pub fn process_msg(&mut self, msg: FibMsg) {
        match msg {
            FibMsg::InterfaceUpd(msg) => {
                self.interface_update(msg);
            }
            FibMsg::InterfaceDel(ifname) => {
                for nhe_id in self.interfaces.remove(&ifname) {
                    self.nhgs.set_invalid(nhe_id);
                }
                self.rib.queue_all();
            }
            FibMsg::AddressAdd(msg) => {
                self.interfaces.address_add(&msg.ifname, msg.addr, msg.flags);
                self.rib.connected_route_add(
                    &mut self.interfaces,
                    &mut self.nhgs,
                    &self.dplane,
                    &self.config.rib,
                    msg,
                );
            }
            FibMsg::AddressDel(msg) => {
                self.interfaces.address_del(&msg.ifname, &msg.addr);
                self.rib.connected_route_del(msg);
            }
            FibMsg::RouteIpAdd(msg) => {
                self.rib.ip_route_add(
                    &mut self.interfaces,
                    &mut self.nhgs,
                    &self.dplane,
                    &self.config.rib,
                    msg,
                );
            }
            FibMsg::RouteIpDel(msg) => {
                self.rib.ip_route_del(msg);
            }
            FibMsg::RouteMplsAdd(msg) => {
                self.rib.mpls_route_add(msg);
            }
            FibMsg::RouteMplsDel(msg) => {
                self.rib.mpls_route_del(msg);
            }
            FibMsg::NhgKernelAdd(msg) => {
                if let Err(error) =
                    self.nhgs
                        .kernel_update(&self.dplane, &mut self.interfaces, msg)
                {
                    error.log();
                }
            }
            FibMsg::NhgKernelDel(id) => {
                self.nhgs.kernel_delete(&mut self.interfaces, id);
            }
            FibMsg::PwInstall(pw) => {
                self.pw_install(pw);
            }
            FibMsg::PwUninstall(ifname) => {
                self.pw_uninstall(&ifname);
            }
        }
    }

    // Applies the results of processed contexts.
    pub fn process_dplane_results(&mut self, results: Vec<Context>) {
        for ctx in results {
            match ctx.payload() {
                ContextPayload::Route(_) => {
                    self.rib.process_route_result(&ctx);
                }
                ContextPayload::Nexthop(_) => {
                    self.nhgs.process_result(
                        &self.dplane,
                        &mut self.interfaces,
                        &ctx,
                    );
                }
                ContextPayload::Lsp(_) => {
                    self.rib.process_lsp_result(&ctx);
                }
                ContextPayload::Pw(_) => {
                    self.process_pw_result(&ctx);
                }
            }
        }
    }

    // Processes routes present in the RIB update queue.
    pub fn process_rib_update_queue(&mut self) {
        self.rib.process_rib_update_queue(
            &mut self.interfaces,
            &mut self.nhgs,
            &self.dplane,
            &self.config.rib,
            &self.filters,
        );
    }

    // Registers the nexthop filter of the given protocol, replacing any
    // previous one.
    pub fn register_filter(
        &mut self,
        protocol: Protocol,
        filter: Arc<dyn NexthopFilter>,
    ) {
        self.filters.insert(protocol, filter);
        self.rib.queue_all();
    }

    pub fn unregister_filter(&mut self, protocol: Protocol) {
        if self.filters.remove(&protocol).is_some() {
            self.rib.queue_all();
        }
    }

    pub fn stats(&self) -> FibStats {
        let routes = self
            .rib
            .tables
            .values()
            .map(|table| table.ipv4.iter().count() + table.ipv6.iter().count())
            .sum();
        FibStats {
            dplane: self.dplane.stats(),
            routes,
            lsps: self.rib.mpls.len(),
            nhgs: self.nhgs.len(),
            pseudowires: self.pseudowires.len(),
        }
    }

    fn interface_update(&mut self, msg: InterfaceUpdateMsg) {
        let ifindex = msg.ifindex;
        let was_operative =
            self.interfaces
                .update(msg.ifname.clone(), ifindex, msg.mtu, msg.flags);
        let Some(iface) = self.interfaces.get_by_ifindex(ifindex) else {
            return;
        };
        let is_operative = iface.is_operative();
        if was_operative == Some(is_operative) {
            return;
        }
        Debug::InterfaceUpdate(&msg.ifname, is_operative).log();

        // Invalidate the nexthop groups forwarding through the interface.
        if !is_operative {
            let nhe_ids = iface.nhe_dependents.clone();
            for nhe_id in nhe_ids {
                self.nhgs.set_invalid(nhe_id);
            }
        }

        self.rib.queue_all();
    }

    fn pw_install(&mut self, mut pw: Pseudowire) {
        let nexthops = self.rib.lookup_nexthops(pw.vrf_id, &pw.dest);
        pw.status = PwStatus::Down;
        if !nexthops.is_empty() {
            self.dplane
                .submit_pseudowire(DplaneOp::PwInstall, &mut pw, nexthops);
        }
        self.pseudowires.insert(pw.ifname.clone(), pw);
    }

    fn pw_uninstall(&mut self, ifname: &str) {
        let Some(mut pw) = self.pseudowires.remove(ifname) else {
            return;
        };
        if pw.dplane_seq != 0 {
            self.dplane
                .submit_pseudowire(DplaneOp::PwUninstall, &mut pw, vec![]);
        }
    }

    fn process_pw_result(&mut self, ctx: &Context) {
        let Some(info) = ctx.pw_info() else {
            return;
        };
        let Some(pw) = self.pseudowires.get_mut(&info.pw.ifname) else {
            Debug::ContextStale(ctx.op(), ctx.seq()).log();
            return;
        };
        if pw.dplane_seq != ctx.seq() {
            Debug::ContextStale(ctx.op(), ctx.seq()).log();
            return;
        }
        Debug::ContextResult(ctx.op(), ctx.seq(), ctx.status()).log();

        if ctx.op() == DplaneOp::PwInstall {
            pw.status = match ctx.status() {
                DplaneResult::Success => PwStatus::Up,
                _ => PwStatus::Down,
            };
        }
    }
}
