//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod context;
pub mod kernel;
pub mod provider;
mod worker;

use std::sync::atomic::{
    AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use ipnetwork::IpNetwork;
use serde::Serialize;

pub use crate::dplane::context::{
    Context, ContextPayload, DplaneOp, DplaneResult, NheInfo, PwInfo,
    RouteInfo,
};
pub use crate::dplane::kernel::KernelOps;
pub use crate::dplane::provider::{
    PassthroughProvider, Provider, ProviderFlags, ProviderHandler,
    ProviderPriority, ProviderStats,
};
use crate::config::DplaneCfg;
use crate::debug::Debug;
use crate::dplane::kernel::KernelProvider;
use crate::dplane::provider::lock;
use crate::dplane::worker::{ControlMsg, Orchestrator};
use crate::error::Error;
use crate::nhg::Nhe;
use crate::rib::Route;
use crate::southbound::{Lsp, Nexthop, Pseudowire};

// Callback receiving processed contexts on the dataplane thread.
pub type ResultsCallback = Box<dyn FnMut(Vec<Context>) + Send>;

// Handle to the dataplane pipeline.
pub struct Dplane {
    shared: Arc<Shared>,
    control_tx: Sender<ControlMsg>,
    channels: Option<WorkerChannels>,
    thread: Option<JoinHandle<()>>,
}

// State shared between producers and the dataplane thread.
pub(crate) struct Shared {
    pub(crate) config: DplaneCfg,
    pub(crate) providers: Mutex<Vec<Arc<Provider>>>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) incoming_tx: Sender<Context>,
    pub(crate) wakeup_tx: Sender<()>,
    queue_limit: AtomicUsize,
    finishing: AtomicBool,
    next_provider_id: AtomicU32,
    next_seq: AtomicU32,
}

// Receiving ends handed over to the dataplane thread when it starts.
struct WorkerChannels {
    incoming_rx: Receiver<Context>,
    wakeup_rx: Receiver<()>,
    control_rx: Receiver<ControlMsg>,
}

// Global pipeline counters.
#[derive(Debug, Default)]
pub struct Counters {
    pub routes_in: AtomicU64,
    pub route_errors: AtomicU64,
    pub nexthops_in: AtomicU64,
    pub nexthop_errors: AtomicU64,
    pub lsps_in: AtomicU64,
    pub lsp_errors: AtomicU64,
    pub pws_in: AtomicU64,
    pub pw_errors: AtomicU64,
    pub other_errors: AtomicU64,
    pub update_yields: AtomicU64,
    pub cycles: AtomicU64,
    pub queued: AtomicU64,
    pub queued_max: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct DplaneStats {
    pub routes_in: u64,
    pub route_errors: u64,
    pub nexthops_in: u64,
    pub nexthop_errors: u64,
    pub lsps_in: u64,
    pub lsp_errors: u64,
    pub pws_in: u64,
    pub pw_errors: u64,
    pub other_errors: u64,
    pub update_yields: u64,
    pub cycles: u64,
    pub queued: u64,
    pub queued_max: u64,
    pub queue_limit: usize,
    pub providers: Vec<ProviderStats>,
}

// ===== impl Dplane =====

impl Dplane {
    // Creates the pipeline with the built-in kernel provider registered.
    pub fn new(config: DplaneCfg, kernel: Box<dyn KernelOps>) -> Dplane {
        let (incoming_tx, incoming_rx) = crossbeam_channel::unbounded();
        let (wakeup_tx, wakeup_rx) = crossbeam_channel::bounded(1);
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let queue_limit = config.max_queued_updates;
        let counters = Arc::new(Counters::default());
        let dplane = Dplane {
            shared: Arc::new(Shared {
                config,
                providers: Default::default(),
                counters: counters.clone(),
                incoming_tx,
                wakeup_tx,
                queue_limit: AtomicUsize::new(queue_limit),
                finishing: AtomicBool::new(false),
                next_provider_id: AtomicU32::new(0),
                next_seq: AtomicU32::new(0),
            }),
            control_tx,
            channels: Some(WorkerChannels {
                incoming_rx,
                wakeup_rx,
                control_rx,
            }),
            thread: None,
        };

        let kernel = KernelProvider::new(kernel, counters);
        if let Err(error) = dplane.provider_register(
            Some("Kernel"),
            ProviderPriority::Kernel,
            ProviderFlags::empty(),
            Box::new(kernel),
        ) {
            error.log();
        }

        dplane
    }

    // Registers a provider.
    //
    // Providers are kept sorted by priority. Providers with equal priority
    // run in registration order.
    pub fn provider_register(
        &self,
        name: Option<&str>,
        priority: ProviderPriority,
        flags: ProviderFlags,
        handler: Box<dyn ProviderHandler>,
    ) -> Result<u32, Error> {
        if name.is_some_and(str::is_empty)
            || self.shared.finishing.load(Ordering::Relaxed)
        {
            return Err(Error::ProviderRegisterInvalid(
                name.unwrap_or_default().to_owned(),
            ));
        }

        let id = self.shared.next_provider_id.fetch_add(1, Ordering::Relaxed)
            + 1;
        let name = match name {
            Some(name) => name.to_owned(),
            None => format!("provider-{}", id),
        };
        Debug::ProviderRegister(&name, id, priority).log();

        let provider = Arc::new(Provider::new(
            name,
            id,
            priority,
            flags,
            self.shared.config.updates_per_cycle,
            handler,
            self.shared.wakeup_tx.clone(),
        ));
        let mut providers = lock(&self.shared.providers);
        let pos = providers
            .iter()
            .position(|prov| prov.priority() > priority)
            .unwrap_or(providers.len());
        providers.insert(pos, provider);

        Ok(id)
    }

    // Starts the dataplane thread.
    //
    // Updates submitted before this call are queued and picked up once the
    // thread runs.
    pub fn start(
        &mut self,
        results_cb: impl FnMut(Vec<Context>) + Send + 'static,
    ) -> Result<(), Error> {
        let Some(channels) = self.channels.take() else {
            return Ok(());
        };

        let orchestrator = Orchestrator::new(
            self.shared.clone(),
            channels.incoming_rx,
            channels.wakeup_rx,
            channels.control_rx,
            Box::new(results_cb),
        );
        let thread = std::thread::Builder::new()
            .name("dplane".to_owned())
            .spawn(move || orchestrator.run())
            .map_err(Error::ThreadSpawnError)?;
        self.thread = Some(thread);

        Ok(())
    }

    // Returns the next update sequence number.
    pub fn next_sequence(&self) -> u32 {
        self.shared
            .next_seq
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    // Enqueues a route update.
    //
    // The route's sequence number is updated so that results can be matched
    // against the latest submission.
    pub fn submit_route(
        &self,
        op: DplaneOp,
        prefix: IpNetwork,
        route: &mut Route,
        old_route: Option<&Route>,
    ) -> DplaneResult {
        let mut ctx = Context::new_route(op, prefix, route, old_route);
        route.dplane_seq = self.prepare(&mut ctx);
        self.enqueue(ctx)
    }

    // Enqueues a nexthop group update.
    pub fn submit_nexthop_group(
        &self,
        op: DplaneOp,
        nhe: &mut Nhe,
    ) -> DplaneResult {
        let mut ctx = Context::new_nexthop(op, nhe);
        nhe.dplane_seq = self.prepare(&mut ctx);
        self.enqueue(ctx)
    }

    // Enqueues an LSP update.
    pub fn submit_lsp(&self, op: DplaneOp, lsp: &mut Lsp) -> DplaneResult {
        let mut ctx = match Context::new_lsp(op, lsp) {
            Ok(ctx) => ctx,
            Err(error) => {
                error.log();
                self.shared.counters.lsps_in.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .counters
                    .lsp_errors
                    .fetch_add(1, Ordering::Relaxed);
                return DplaneResult::Failure;
            }
        };
        lsp.dplane_seq = self.prepare(&mut ctx);
        self.enqueue(ctx)
    }

    // Enqueues a pseudowire update.
    pub fn submit_pseudowire(
        &self,
        op: DplaneOp,
        pw: &mut Pseudowire,
        nexthops: Vec<Nexthop>,
    ) -> DplaneResult {
        let mut ctx = Context::new_pw(op, pw, nexthops);
        pw.dplane_seq = self.prepare(&mut ctx);
        self.enqueue(ctx)
    }

    // Number of updates accepted but not yet delivered back.
    pub fn queue_len(&self) -> usize {
        self.shared.counters.queued.load(Ordering::Relaxed) as usize
    }

    // Queue depth above which producers should stop submitting.
    pub fn queue_limit(&self) -> usize {
        self.shared.queue_limit.load(Ordering::Relaxed)
    }

    // Sets the queue limit. Zero restores the configured default.
    pub fn set_queue_limit(&self, limit: usize) {
        let limit = if limit == 0 {
            self.shared.config.max_queued_updates
        } else {
            limit
        };
        self.shared.queue_limit.store(limit, Ordering::Relaxed);
    }

    // Number of updates waiting to enter the pipeline.
    pub fn incoming_len(&self) -> usize {
        self.shared.incoming_tx.len()
    }

    pub fn is_congested(&self) -> bool {
        self.queue_len() >= self.queue_limit()
    }

    // Checks whether any update is queued anywhere in the pipeline.
    pub fn work_pending(&self) -> bool {
        self.shared.work_pending()
    }

    pub fn counters(&self) -> &Counters {
        &self.shared.counters
    }

    pub fn provider_names(&self) -> Vec<String> {
        lock(&self.shared.providers)
            .iter()
            .map(|prov| prov.name().to_owned())
            .collect()
    }

    pub fn stats(&self) -> DplaneStats {
        let counters = &self.shared.counters;
        DplaneStats {
            routes_in: counters.routes_in.load(Ordering::Relaxed),
            route_errors: counters.route_errors.load(Ordering::Relaxed),
            nexthops_in: counters.nexthops_in.load(Ordering::Relaxed),
            nexthop_errors: counters.nexthop_errors.load(Ordering::Relaxed),
            lsps_in: counters.lsps_in.load(Ordering::Relaxed),
            lsp_errors: counters.lsp_errors.load(Ordering::Relaxed),
            pws_in: counters.pws_in.load(Ordering::Relaxed),
            pw_errors: counters.pw_errors.load(Ordering::Relaxed),
            other_errors: counters.other_errors.load(Ordering::Relaxed),
            update_yields: counters.update_yields.load(Ordering::Relaxed),
            cycles: counters.cycles.load(Ordering::Relaxed),
            queued: counters.queued.load(Ordering::Relaxed),
            queued_max: counters.queued_max.load(Ordering::Relaxed),
            queue_limit: self.queue_limit(),
            providers: lock(&self.shared.providers)
                .iter()
                .map(|prov| prov.stats())
                .collect(),
        }
    }

    // First shutdown phase. Updates are still accepted so that the control
    // plane can withdraw its state.
    pub fn pre_finish(&self) {
        Debug::ShutdownStart.log();
        self.shared.finishing.store(true, Ordering::Relaxed);

        let providers = lock(&self.shared.providers).clone();
        for provider in providers {
            provider.finish(true);
        }
    }

    pub fn is_finishing(&self) -> bool {
        self.shared.finishing.load(Ordering::Relaxed)
    }

    // Second shutdown phase. `done` is invoked from the dataplane thread once
    // no work is queued anywhere in the pipeline.
    pub fn finish(&self, done: impl FnOnce() + Send + 'static) {
        let _ = self.control_tx.send(ControlMsg::Finish(Box::new(done)));
    }

    // Final shutdown phase. Stops the dataplane thread and lets every
    // provider clean up.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.control_tx.send(ControlMsg::Stop);
        let _ = thread.join();

        let providers = lock(&self.shared.providers).clone();
        for provider in providers {
            provider.finish(false);
        }
    }

    // Assigns a fresh sequence number to the context.
    fn prepare(&self, ctx: &mut Context) -> u32 {
        let seq = self.next_sequence();
        ctx.set_seq(seq);
        if self.shared.config.skip_kernel {
            ctx.set_skip_kernel();
        }
        seq
    }

    fn enqueue(&self, ctx: Context) -> DplaneResult {
        let counters = &self.shared.counters;
        let op = ctx.op();
        let seq = ctx.seq();
        counters.kind_in(op).fetch_add(1, Ordering::Relaxed);

        let queued = counters.queued.fetch_add(1, Ordering::Relaxed) + 1;
        counters.queued_max.fetch_max(queued, Ordering::Relaxed);

        if self.shared.incoming_tx.send(ctx).is_err() {
            counters.queued.fetch_sub(1, Ordering::Relaxed);
            counters.kind_errors(op).fetch_add(1, Ordering::Relaxed);
            Error::DplaneStopped(op).log();
            return DplaneResult::Failure;
        }

        Debug::ContextEnqueue(op, seq).log();
        self.shared.work_ready();
        DplaneResult::Queued
    }
}

impl Drop for Dplane {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Dplane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dplane")
            .field("providers", &self.provider_names())
            .field("queued", &self.queue_len())
            .field("running", &self.thread.is_some())
            .finish()
    }
}

// ===== impl Shared =====

impl Shared {
    pub(crate) fn work_ready(&self) {
        let _ = self.wakeup_tx.try_send(());
    }

    pub(crate) fn work_pending(&self) -> bool {
        if !self.incoming_tx.is_empty() {
            return true;
        }
        lock(&self.providers).iter().any(|prov| prov.has_pending())
    }
}

// ===== impl Counters =====

impl Counters {
    fn kind_in(&self, op: DplaneOp) -> &AtomicU64 {
        if op.is_route() {
            &self.routes_in
        } else if op.is_nexthop() {
            &self.nexthops_in
        } else if op.is_lsp() {
            &self.lsps_in
        } else {
            &self.pws_in
        }
    }

    fn kind_errors(&self, op: DplaneOp) -> &AtomicU64 {
        if op.is_route() {
            &self.route_errors
        } else if op.is_nexthop() {
            &self.nexthop_errors
        } else if op.is_lsp() {
            &self.lsp_errors
        } else {
            &self.pw_errors
        }
    }
}
