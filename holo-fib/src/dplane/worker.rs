//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, select};

use crate::debug::Debug;
use crate::dplane::context::{Context, DplaneResult};
use crate::dplane::provider::lock;
use crate::dplane::{ResultsCallback, Shared};

// Messages from the pipeline handle to the dataplane thread.
pub(crate) enum ControlMsg {
    Finish(Box<dyn FnOnce() + Send>),
    Stop,
}

// Dataplane thread state.
pub(crate) struct Orchestrator {
    shared: Arc<Shared>,
    incoming_rx: Receiver<Context>,
    wakeup_rx: Receiver<()>,
    control_rx: Receiver<ControlMsg>,
    results_cb: ResultsCallback,
    shutdown_tick: Receiver<Instant>,
    finish_cb: Option<Box<dyn FnOnce() + Send>>,
}

// ===== impl Orchestrator =====

impl Orchestrator {
    pub(crate) fn new(
        shared: Arc<Shared>,
        incoming_rx: Receiver<Context>,
        wakeup_rx: Receiver<()>,
        control_rx: Receiver<ControlMsg>,
        results_cb: ResultsCallback,
    ) -> Orchestrator {
        Orchestrator {
            shared,
            incoming_rx,
            wakeup_rx,
            control_rx,
            results_cb,
            shutdown_tick: crossbeam_channel::never(),
            finish_cb: None,
        }
    }

    pub(crate) fn run(mut self) {
        let wakeup_rx = self.wakeup_rx.clone();
        let control_rx = self.control_rx.clone();
        loop {
            let shutdown_tick = self.shutdown_tick.clone();
            select! {
                recv(wakeup_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    self.process_cycle();
                }
                recv(control_rx) -> msg => {
                    match msg {
                        Ok(ControlMsg::Finish(done)) => {
                            let interval = Duration::from_millis(
                                self.shared.config.shutdown_check_interval,
                            );
                            self.finish_cb = Some(done);
                            self.shutdown_tick =
                                crossbeam_channel::tick(interval);
                        }
                        Ok(ControlMsg::Stop) | Err(_) => break,
                    }
                }
                recv(shutdown_tick) -> _ => {
                    self.check_shutdown_status();
                }
            }
        }
    }

    // Runs one orchestration cycle.
    fn process_cycle(&mut self) {
        let limit = self.shared.config.updates_per_cycle;
        let providers = lock(&self.shared.providers).clone();
        let Some(first) = providers.first() else {
            return;
        };

        // Dequeue a batch of new work, tagged with the first provider.
        let mut work_list = VecDeque::new();
        while work_list.len() < limit {
            let Ok(mut ctx) = self.incoming_rx.try_recv() else {
                break;
            };
            ctx.set_provider(first.id());
            work_list.push_back(ctx);
        }

        // Re-arm the cycle if the batch cap was hit.
        if work_list.len() >= limit {
            self.shared.work_ready();
        }

        let mut error_list = Vec::new();
        for provider in &providers {
            // Contexts that failed upstream skip the remaining providers.
            let (ok, errors): (Vec<_>, Vec<_>) = work_list
                .drain(..)
                .partition(|ctx| ctx.status() != DplaneResult::Failure);
            error_list.extend(errors);

            provider.enqueue_in_list(ok.into_iter().map(|mut ctx| {
                ctx.set_provider(provider.id());
                ctx
            }));

            // Providers are always invoked so that they can push out work
            // completed asynchronously.
            provider.process();

            work_list = provider.dequeue_out_list(limit);
        }

        let work = work_list.len();
        let errors = error_list.len();
        if work + errors > 0 {
            Debug::OrchestratorCycle(work, errors).log();
        }
        self.shared.counters.cycles.fetch_add(1, Ordering::Relaxed);

        self.deliver(error_list);
        self.deliver(work_list.into());
    }

    fn deliver(&mut self, list: Vec<Context>) {
        if list.is_empty() {
            return;
        }

        let count = list.len() as u64;
        (self.results_cb)(list);
        self.shared.counters.queued.fetch_sub(count, Ordering::Relaxed);
    }

    // Completes the shutdown once no work is queued anywhere.
    fn check_shutdown_status(&mut self) {
        if self.shared.work_pending() {
            return;
        }

        Debug::ShutdownComplete.log();
        self.shutdown_tick = crossbeam_channel::never();
        if let Some(done) = self.finish_cb.take() {
            done();
        }
    }
}
