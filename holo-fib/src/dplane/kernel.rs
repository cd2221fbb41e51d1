//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::dplane::context::{Context, ContextPayload, DplaneResult};
use crate::dplane::provider::{Provider, ProviderHandler};
use crate::dplane::Counters;
use crate::error::Error;

// Kernel programming interface.
//
// Each call applies one context to the kernel and blocks until the kernel
// has answered.
pub trait KernelOps: Send {
    fn route_update(&mut self, ctx: &Context) -> Result<(), Error>;

    fn nexthop_update(&mut self, ctx: &Context) -> Result<(), Error>;

    fn lsp_update(&mut self, ctx: &Context) -> Result<(), Error>;

    fn pw_update(&mut self, ctx: &Context) -> Result<(), Error>;
}

// Built-in kernel provider.
pub(crate) struct KernelProvider {
    kernel: Box<dyn KernelOps>,
    counters: Arc<Counters>,
}

// ===== impl KernelProvider =====

impl KernelProvider {
    pub(crate) fn new(
        kernel: Box<dyn KernelOps>,
        counters: Arc<Counters>,
    ) -> KernelProvider {
        KernelProvider { kernel, counters }
    }

    fn update(&mut self, ctx: &Context) -> DplaneResult {
        let (result, errors) = match ctx.payload() {
            ContextPayload::Route(_) if ctx.op().is_route() => {
                (self.kernel.route_update(ctx), &self.counters.route_errors)
            }
            ContextPayload::Nexthop(_) if ctx.op().is_nexthop() => (
                self.kernel.nexthop_update(ctx),
                &self.counters.nexthop_errors,
            ),
            ContextPayload::Lsp(_) if ctx.op().is_lsp() => {
                (self.kernel.lsp_update(ctx), &self.counters.lsp_errors)
            }
            ContextPayload::Pw(_) if ctx.op().is_pw() => {
                (self.kernel.pw_update(ctx), &self.counters.pw_errors)
            }
            _ => {
                self.counters.other_errors.fetch_add(1, Ordering::Relaxed);
                return DplaneResult::Failure;
            }
        };

        match result {
            Ok(()) => DplaneResult::Success,
            Err(error) => {
                error.log();
                errors.fetch_add(1, Ordering::Relaxed);
                DplaneResult::Failure
            }
        }
    }
}

impl ProviderHandler for KernelProvider {
    fn process(&mut self, provider: &Provider) {
        let limit = provider.work_limit();
        let mut counter = 0;
        while counter < limit {
            let Some(mut ctx) = provider.dequeue_in() else {
                break;
            };
            counter += 1;

            let status = if ctx.is_skip_kernel() {
                DplaneResult::Success
            } else {
                self.update(&ctx)
            };
            if status == DplaneResult::Failure {
                provider.count_error();
            }
            ctx.set_status(status);
            provider.enqueue_out(ctx);
        }

        // Ensure that we'll run the work loop again if there's still more
        // work to do.
        if counter >= limit {
            self.counters.update_yields.fetch_add(1, Ordering::Relaxed);
            provider.work_ready();
        }
    }
}
