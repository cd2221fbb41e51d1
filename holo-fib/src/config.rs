//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(clippy::derivable_impls)]

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::southbound::Protocol;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub dplane: DplaneCfg,
    pub rib: RibCfg,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DplaneCfg {
    // Maximum number of updates moved through the pipeline per cycle.
    pub updates_per_cycle: usize,
    // Queue depth above which producers should hold back.
    pub max_queued_updates: usize,
    // Shutdown drain polling interval, in milliseconds.
    pub shutdown_check_interval: u64,
    // Bypass the kernel for all updates.
    pub skip_kernel: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RibCfg {
    // Maximum number of active nexthops per route (zero means unlimited).
    pub multipath_num: usize,
    pub resolve_via_default: bool,
    // Protocols whose routes may resolve through non-connected routes.
    pub recursion_protocols: BTreeSet<Protocol>,
}

// ===== impl DplaneCfg =====

impl DplaneCfg {
    pub const DFLT_UPDATES_PER_CYCLE: usize = 100;
    pub const DFLT_MAX_QUEUED_UPDATES: usize = 200;
    pub const DFLT_SHUTDOWN_CHECK_INTERVAL: u64 = 100;
}

impl Default for DplaneCfg {
    fn default() -> DplaneCfg {
        DplaneCfg {
            updates_per_cycle: DplaneCfg::DFLT_UPDATES_PER_CYCLE,
            max_queued_updates: DplaneCfg::DFLT_MAX_QUEUED_UPDATES,
            shutdown_check_interval: DplaneCfg::DFLT_SHUTDOWN_CHECK_INTERVAL,
            skip_kernel: false,
        }
    }
}

// ===== impl RibCfg =====

impl Default for RibCfg {
    fn default() -> RibCfg {
        RibCfg {
            multipath_num: 64,
            resolve_via_default: false,
            recursion_protocols: [Protocol::BGP].into(),
        }
    }
}
