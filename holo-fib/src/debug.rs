//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ipnetwork::IpNetwork;
use tracing::{debug, debug_span};

use crate::dplane::{DplaneOp, DplaneResult, ProviderPriority};
use crate::southbound::{Nexthop, Protocol, VrfId};

// FIB debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    // Dataplane pipeline
    ProviderRegister(&'a str, u32, ProviderPriority),
    ContextEnqueue(DplaneOp, u32),
    OrchestratorCycle(usize, usize),
    ContextResult(DplaneOp, u32, DplaneResult),
    ContextStale(DplaneOp, u32),
    ShutdownStart,
    ShutdownComplete,
    // Nexthop group table
    NheCreate(u32, usize),
    NheRelease(u32),
    NheRefcnt(u32, u32),
    NheInvalidate(u32),
    NheResolvedVia(u32, Option<u32>),
    // RIB
    RouteSelect(VrfId, &'a IpNetwork, Protocol),
    RouteUnselect(VrfId, &'a IpNetwork, Protocol),
    NexthopInactive(&'a IpNetwork, &'a Nexthop),
    // Interfaces
    InterfaceUpdate(&'a str, bool),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::ProviderRegister(name, id, priority) => {
                debug!(%name, %id, ?priority, "{}", self);
            }
            Debug::ContextEnqueue(op, seq) => {
                debug_span!("dplane").in_scope(|| {
                    debug!(%op, %seq, "{}", self);
                });
            }
            Debug::OrchestratorCycle(work, errors) => {
                debug_span!("dplane").in_scope(|| {
                    debug!(%work, %errors, "{}", self);
                });
            }
            Debug::ContextResult(op, seq, status) => {
                debug_span!("dplane").in_scope(|| {
                    debug!(%op, %seq, %status, "{}", self);
                });
            }
            Debug::ContextStale(op, seq) => {
                debug_span!("dplane").in_scope(|| {
                    debug!(%op, %seq, "{}", self);
                });
            }
            Debug::ShutdownStart | Debug::ShutdownComplete => {
                debug!("{}", self);
            }
            Debug::NheCreate(id, nexthops) => {
                debug_span!("nhg", %id).in_scope(|| {
                    debug!(%nexthops, "{}", self);
                });
            }
            Debug::NheRelease(id) | Debug::NheInvalidate(id) => {
                debug_span!("nhg", %id).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::NheRefcnt(id, refcnt) => {
                debug_span!("nhg", %id).in_scope(|| {
                    debug!(%refcnt, "{}", self);
                });
            }
            Debug::NheResolvedVia(id, target) => {
                debug_span!("nhg", %id).in_scope(|| {
                    debug!(?target, "{}", self);
                });
            }
            Debug::RouteSelect(vrf_id, prefix, protocol)
            | Debug::RouteUnselect(vrf_id, prefix, protocol) => {
                debug_span!("rib", vrf = %vrf_id, %prefix).in_scope(|| {
                    debug!(%protocol, "{}", self);
                });
            }
            Debug::NexthopInactive(prefix, nexthop) => {
                debug_span!("rib", %prefix).in_scope(|| {
                    debug!(%nexthop, "{}", self);
                });
            }
            Debug::InterfaceUpdate(ifname, operative) => {
                debug!(%ifname, %operative, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::ProviderRegister(..) => {
                write!(f, "registered dataplane provider")
            }
            Debug::ContextEnqueue(..) => {
                write!(f, "enqueued update")
            }
            Debug::OrchestratorCycle(..) => {
                write!(f, "processed updates")
            }
            Debug::ContextResult(..) => {
                write!(f, "update result")
            }
            Debug::ContextStale(..) => {
                write!(f, "discarding stale update result")
            }
            Debug::ShutdownStart => {
                write!(f, "dataplane shutdown started")
            }
            Debug::ShutdownComplete => {
                write!(f, "dataplane work drained")
            }
            Debug::NheCreate(..) => {
                write!(f, "nexthop group created")
            }
            Debug::NheRelease(..) => {
                write!(f, "nexthop group released")
            }
            Debug::NheRefcnt(..) => {
                write!(f, "nexthop group reference count updated")
            }
            Debug::NheInvalidate(..) => {
                write!(f, "nexthop group invalidated")
            }
            Debug::NheResolvedVia(..) => {
                write!(f, "nexthop group resolution updated")
            }
            Debug::RouteSelect(..) => {
                write!(f, "route selected")
            }
            Debug::RouteUnselect(..) => {
                write!(f, "route unselected")
            }
            Debug::NexthopInactive(..) => {
                write!(f, "nexthop inactive")
            }
            Debug::InterfaceUpdate(..) => {
                write!(f, "interface update")
            }
        }
    }
}
