//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bitflags::bitflags;
use enum_as_inner::EnumAsInner;
use ipnetwork::IpNetwork;
use serde::Serialize;

use crate::error::Error;
use crate::nhg::Nhe;
use crate::rib::Route;
use crate::southbound::{
    AddressFamily, Label, Lsp, Nexthop, NexthopFlags, Protocol, Pseudowire,
    VrfId,
};

// Dataplane operation.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Serialize)]
pub enum DplaneOp {
    RouteInstall,
    RouteUpdate,
    RouteDelete,
    NhInstall,
    NhUpdate,
    NhDelete,
    LspInstall,
    LspUpdate,
    LspDelete,
    PwInstall,
    PwUninstall,
}

// Outcome of a dataplane operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Serialize)]
pub enum DplaneResult {
    Failure,
    Queued,
    Success,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ContextFlags: u8 {
        const SKIP_KERNEL = 0x01;
    }
}

// Network namespace information.
#[derive(Clone, Copy, Debug, Default)]
pub struct NsInfo {
    pub ns_id: u32,
}

// Self-contained unit of dataplane work.
//
// A context owns deep copies of everything the operation needs, so providers
// never read control-plane state.
#[derive(Debug)]
pub struct Context {
    op: DplaneOp,
    status: DplaneResult,
    provider: u32,
    flags: ContextFlags,
    seq: u32,
    old_seq: u32,
    is_update: bool,
    vrf_id: VrfId,
    table_id: u32,
    ns: NsInfo,
    payload: ContextPayload,
}

#[derive(Debug, EnumAsInner)]
pub enum ContextPayload {
    Route(RouteInfo),
    Nexthop(NheInfo),
    Lsp(Lsp),
    Pw(PwInfo),
}

// Route snapshot.
#[derive(Clone, Debug)]
pub struct RouteInfo {
    pub dest: IpNetwork,
    pub src: Option<IpNetwork>,
    pub addr_family: AddressFamily,
    pub protocol: Protocol,
    pub old_protocol: Protocol,
    pub tag: Option<u32>,
    pub old_tag: Option<u32>,
    pub metric: u32,
    pub old_metric: u32,
    pub instance: u16,
    pub old_instance: u16,
    pub distance: u32,
    pub old_distance: u32,
    pub mtu: u32,
    pub nexthop_mtu: u32,
    pub nhe_id: Option<u32>,
    pub old_nhe_id: Option<u32>,
    pub nexthops: Vec<Nexthop>,
    pub old_nexthops: Vec<Nexthop>,
}

// Nexthop group snapshot.
#[derive(Clone, Debug)]
pub struct NheInfo {
    pub id: u32,
    pub vrf_id: VrfId,
    pub addr_family: AddressFamily,
    pub refcnt: u32,
    pub is_kernel: bool,
    pub nexthops: Vec<Nexthop>,
    pub depends: Vec<u32>,
    pub ifindex: Option<u32>,
}

// Pseudowire snapshot.
#[derive(Clone, Debug)]
pub struct PwInfo {
    pub pw: Pseudowire,
    pub nexthops: Vec<Nexthop>,
}

// ===== impl DplaneOp =====

impl DplaneOp {
    pub fn is_route(&self) -> bool {
        matches!(
            self,
            DplaneOp::RouteInstall
                | DplaneOp::RouteUpdate
                | DplaneOp::RouteDelete
        )
    }

    pub fn is_nexthop(&self) -> bool {
        matches!(
            self,
            DplaneOp::NhInstall | DplaneOp::NhUpdate | DplaneOp::NhDelete
        )
    }

    pub fn is_lsp(&self) -> bool {
        matches!(
            self,
            DplaneOp::LspInstall | DplaneOp::LspUpdate | DplaneOp::LspDelete
        )
    }

    pub fn is_pw(&self) -> bool {
        matches!(self, DplaneOp::PwInstall | DplaneOp::PwUninstall)
    }
}

impl std::fmt::Display for DplaneOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DplaneOp::RouteInstall => write!(f, "ROUTE_INSTALL"),
            DplaneOp::RouteUpdate => write!(f, "ROUTE_UPDATE"),
            DplaneOp::RouteDelete => write!(f, "ROUTE_DELETE"),
            DplaneOp::NhInstall => write!(f, "NH_INSTALL"),
            DplaneOp::NhUpdate => write!(f, "NH_UPDATE"),
            DplaneOp::NhDelete => write!(f, "NH_DELETE"),
            DplaneOp::LspInstall => write!(f, "LSP_INSTALL"),
            DplaneOp::LspUpdate => write!(f, "LSP_UPDATE"),
            DplaneOp::LspDelete => write!(f, "LSP_DELETE"),
            DplaneOp::PwInstall => write!(f, "PW_INSTALL"),
            DplaneOp::PwUninstall => write!(f, "PW_UNINSTALL"),
        }
    }
}

// ===== impl DplaneResult =====

impl std::fmt::Display for DplaneResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DplaneResult::Failure => write!(f, "FAILURE"),
            DplaneResult::Queued => write!(f, "QUEUED"),
            DplaneResult::Success => write!(f, "SUCCESS"),
        }
    }
}

// ===== impl Context =====

impl Context {
    pub(crate) fn new(
        op: DplaneOp,
        vrf_id: VrfId,
        table_id: u32,
        payload: ContextPayload,
    ) -> Context {
        Context {
            op,
            status: DplaneResult::Success,
            provider: 0,
            flags: ContextFlags::empty(),
            seq: 0,
            old_seq: 0,
            is_update: false,
            vrf_id,
            table_id,
            ns: NsInfo::default(),
            payload,
        }
    }

    // Builds a route context from the control-plane route and, for updates,
    // the route being replaced.
    pub(crate) fn new_route(
        op: DplaneOp,
        prefix: IpNetwork,
        route: &Route,
        old_route: Option<&Route>,
    ) -> Context {
        let mut nexthops = route.nexthops.clone();
        for nexthop in nexthops.iter_mut() {
            nexthop.flags.remove(NexthopFlags::FIB);
            for resolved in nexthop.resolved.iter_mut() {
                resolved.flags.remove(NexthopFlags::FIB);
            }
        }

        let mut info = RouteInfo {
            dest: prefix,
            src: None,
            addr_family: AddressFamily::from_prefix(&prefix),
            protocol: route.protocol,
            old_protocol: route.protocol,
            tag: route.tag,
            old_tag: route.tag,
            metric: route.metric,
            old_metric: route.metric,
            instance: route.instance,
            old_instance: route.instance,
            distance: route.distance,
            old_distance: route.distance,
            mtu: route.mtu,
            nexthop_mtu: route.nexthop_mtu,
            nhe_id: route.nhe_id,
            old_nhe_id: None,
            nexthops,
            old_nexthops: Default::default(),
        };

        let mut old_seq = 0;
        let is_update = op == DplaneOp::RouteUpdate;
        if let Some(old_route) = old_route {
            info.old_protocol = old_route.protocol;
            info.old_tag = old_route.tag;
            info.old_metric = old_route.metric;
            info.old_instance = old_route.instance;
            info.old_distance = old_route.distance;
            info.old_nhe_id = old_route.nhe_id;
            info.old_nexthops = old_route.nexthops.clone();
            old_seq = old_route.dplane_seq;
        }

        let mut ctx = Context::new(
            op,
            route.vrf_id,
            route.table_id,
            ContextPayload::Route(info),
        );
        ctx.old_seq = old_seq;
        ctx.is_update = is_update;
        ctx
    }

    pub(crate) fn new_nexthop(op: DplaneOp, nhe: &Nhe) -> Context {
        let info = NheInfo {
            id: nhe.id,
            vrf_id: nhe.vrf_id,
            addr_family: nhe.addr_family,
            refcnt: nhe.refcnt,
            is_kernel: nhe.is_kernel(),
            nexthops: nhe.nexthops.clone(),
            depends: nhe.depends.iter().copied().collect(),
            ifindex: nhe.ifindex,
        };
        let mut ctx =
            Context::new(op, nhe.vrf_id, 0, ContextPayload::Nexthop(info));
        ctx.is_update = op == DplaneOp::NhUpdate;
        ctx
    }

    pub(crate) fn new_lsp(op: DplaneOp, lsp: &Lsp) -> Result<Context, Error> {
        if lsp.nhlfes.iter().any(|nhlfe| nhlfe.nexthop.is_none()) {
            return Err(Error::ContextInitError(op, "NHLFE without nexthop"));
        }

        let mut ctx =
            Context::new(op, 0, 0, ContextPayload::Lsp(lsp.clone()));
        ctx.is_update = op == DplaneOp::LspUpdate;
        Ok(ctx)
    }

    pub(crate) fn new_pw(
        op: DplaneOp,
        pw: &Pseudowire,
        nexthops: Vec<Nexthop>,
    ) -> Context {
        let info = PwInfo {
            pw: pw.clone(),
            nexthops,
        };
        Context::new(op, pw.vrf_id, 0, ContextPayload::Pw(info))
    }

    pub fn op(&self) -> DplaneOp {
        self.op
    }

    pub fn status(&self) -> DplaneResult {
        self.status
    }

    pub fn set_status(&mut self, status: DplaneResult) {
        self.status = status;
    }

    // Identifier of the provider that currently owns this context.
    pub fn provider(&self) -> u32 {
        self.provider
    }

    pub(crate) fn set_provider(&mut self, provider: u32) {
        self.provider = provider;
    }

    pub fn is_skip_kernel(&self) -> bool {
        self.flags.contains(ContextFlags::SKIP_KERNEL)
    }

    pub fn set_skip_kernel(&mut self) {
        self.flags.insert(ContextFlags::SKIP_KERNEL);
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub(crate) fn set_seq(&mut self, seq: u32) {
        self.seq = seq;
    }

    pub fn old_seq(&self) -> u32 {
        self.old_seq
    }

    pub fn is_update(&self) -> bool {
        self.is_update
    }

    pub fn vrf_id(&self) -> VrfId {
        self.vrf_id
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn ns(&self) -> &NsInfo {
        &self.ns
    }

    pub fn payload(&self) -> &ContextPayload {
        &self.payload
    }

    pub fn route(&self) -> Option<&RouteInfo> {
        self.payload.as_route()
    }

    pub fn nexthop_group(&self) -> Option<&NheInfo> {
        self.payload.as_nexthop()
    }

    pub fn lsp_info(&self) -> Option<&Lsp> {
        self.payload.as_lsp()
    }

    pub fn in_label(&self) -> Option<Label> {
        self.payload.as_lsp().map(|lsp| lsp.in_label)
    }

    pub fn pw_info(&self) -> Option<&PwInfo> {
        self.payload.as_pw()
    }
}
