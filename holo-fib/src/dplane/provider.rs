//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;
use crossbeam_channel::Sender;
use serde::Serialize;

use crate::dplane::context::Context;

// Provider priorities, in pipeline order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Serialize)]
pub enum ProviderPriority {
    PreKernel,
    Kernel,
    PostKernel,
    Last,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ProviderFlags: u8 {
        // The provider does its work on a thread of its own.
        const THREADED = 0x01;
    }
}

// Provider processing hooks.
//
// `process` is invoked on the dataplane thread once per cycle. It takes work
// from the provider's inbound queue and hands finished contexts back through
// the outbound queue, either synchronously or later from another thread.
pub trait ProviderHandler: Send {
    fn process(&mut self, provider: &Provider);

    // Invoked on shutdown. `early` is set while work may still be in flight.
    fn finish(&mut self, _provider: &Provider, _early: bool) {}
}

// Dataplane provider.
pub struct Provider {
    name: String,
    id: u32,
    priority: ProviderPriority,
    flags: ProviderFlags,
    work_limit: usize,
    inbound: Mutex<VecDeque<Context>>,
    outbound: Mutex<VecDeque<Context>>,
    handler: Mutex<Box<dyn ProviderHandler>>,
    counters: ProviderCounters,
    wakeup_tx: Sender<()>,
}

#[derive(Debug, Default)]
pub struct ProviderCounters {
    pub in_counter: AtomicU64,
    pub in_queued: AtomicU64,
    pub in_max: AtomicU64,
    pub out_counter: AtomicU64,
    pub out_queued: AtomicU64,
    pub out_max: AtomicU64,
    pub error_counter: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProviderStats {
    pub name: String,
    pub id: u32,
    pub priority: ProviderPriority,
    pub in_counter: u64,
    pub in_queued: u64,
    pub in_max: u64,
    pub out_counter: u64,
    pub out_queued: u64,
    pub out_max: u64,
    pub error_counter: u64,
}

// Provider that hands every context back unchanged.
#[derive(Debug, Default)]
pub struct PassthroughProvider;

// ===== impl Provider =====

impl Provider {
    pub(crate) fn new(
        name: String,
        id: u32,
        priority: ProviderPriority,
        flags: ProviderFlags,
        work_limit: usize,
        handler: Box<dyn ProviderHandler>,
        wakeup_tx: Sender<()>,
    ) -> Provider {
        Provider {
            name,
            id,
            priority,
            flags,
            work_limit,
            inbound: Default::default(),
            outbound: Default::default(),
            handler: Mutex::new(handler),
            counters: Default::default(),
            wakeup_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn priority(&self) -> ProviderPriority {
        self.priority
    }

    pub fn is_threaded(&self) -> bool {
        self.flags.contains(ProviderFlags::THREADED)
    }

    // Maximum number of contexts to process per invocation.
    pub fn work_limit(&self) -> usize {
        self.work_limit
    }

    pub fn counters(&self) -> &ProviderCounters {
        &self.counters
    }

    // Takes the next context from the inbound queue.
    pub fn dequeue_in(&self) -> Option<Context> {
        let ctx = lock(&self.inbound).pop_front();
        if ctx.is_some() {
            self.counters.in_queued.fetch_sub(1, Ordering::Relaxed);
        }
        ctx
    }

    // Takes up to `limit` contexts from the inbound queue.
    pub fn dequeue_in_list(&self, limit: usize) -> Vec<Context> {
        let mut inbound = lock(&self.inbound);
        let count = limit.min(inbound.len());
        let list = inbound.drain(..count).collect::<Vec<_>>();
        self.counters
            .in_queued
            .fetch_sub(list.len() as u64, Ordering::Relaxed);
        list
    }

    // Hands a finished context back to the pipeline.
    pub fn enqueue_out(&self, ctx: Context) {
        let mut outbound = lock(&self.outbound);
        outbound.push_back(ctx);
        self.counters.out_counter.fetch_add(1, Ordering::Relaxed);
        let queued =
            self.counters.out_queued.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.out_max.fetch_max(queued, Ordering::Relaxed);
    }

    // Signals that the pipeline should run another cycle.
    pub fn work_ready(&self) {
        let _ = self.wakeup_tx.try_send(());
    }

    pub fn count_error(&self) {
        self.counters.error_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enqueue_in_list(
        &self,
        list: impl IntoIterator<Item = Context>,
    ) {
        let mut inbound = lock(&self.inbound);
        let before = inbound.len();
        inbound.extend(list);
        let count = (inbound.len() - before) as u64;
        if count == 0 {
            return;
        }
        self.counters.in_counter.fetch_add(count, Ordering::Relaxed);
        let queued =
            self.counters.in_queued.fetch_add(count, Ordering::Relaxed) + count;
        self.counters.in_max.fetch_max(queued, Ordering::Relaxed);
    }

    pub(crate) fn dequeue_out_list(&self, limit: usize) -> VecDeque<Context> {
        let mut outbound = lock(&self.outbound);
        let count = limit.min(outbound.len());
        let list = outbound.drain(..count).collect::<VecDeque<_>>();
        self.counters
            .out_queued
            .fetch_sub(list.len() as u64, Ordering::Relaxed);
        list
    }

    pub(crate) fn process(&self) {
        lock(&self.handler).process(self);
    }

    pub(crate) fn finish(&self, early: bool) {
        lock(&self.handler).finish(self, early);
    }

    // Checks whether any context is queued on either side of the provider.
    pub(crate) fn has_pending(&self) -> bool {
        let inbound = lock(&self.inbound).len();
        let outbound = lock(&self.outbound).len();
        inbound + outbound > 0
    }

    pub(crate) fn stats(&self) -> ProviderStats {
        let counters = &self.counters;
        ProviderStats {
            name: self.name.clone(),
            id: self.id,
            priority: self.priority,
            in_counter: counters.in_counter.load(Ordering::Relaxed),
            in_queued: counters.in_queued.load(Ordering::Relaxed),
            in_max: counters.in_max.load(Ordering::Relaxed),
            out_counter: counters.out_counter.load(Ordering::Relaxed),
            out_queued: counters.out_queued.load(Ordering::Relaxed),
            out_max: counters.out_max.load(Ordering::Relaxed),
            error_counter: counters.error_counter.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("flags", &self.flags)
            .finish()
    }
}

// ===== impl PassthroughProvider =====

impl ProviderHandler for PassthroughProvider {
    fn process(&mut self, provider: &Provider) {
        let limit = provider.work_limit();
        let list = provider.dequeue_in_list(limit);
        let count = list.len();
        for ctx in list {
            provider.enqueue_out(ctx);
        }

        // Ask for another cycle if there's more work to do.
        if count >= limit {
            provider.work_ready();
        }
    }
}

// ===== global functions =====

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
