/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Owns the channel's resolver and delivers its updates to the channel.
//!
//! The resolver lives inside the channel's work serializer. Its work runs
//! there too, so updates reach the channel one at a time and in the order
//! the resolver produced them.

use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use super::balancer_wrapper::BalancerWrapper;
use super::channel::{ChannelWork, ClientConnInner};
use super::name_resolution::{Resolver, ResolverController, ResolverUpdate, WorkScheduler};
use super::service_config::ServiceConfig;
use crate::error::Error;

/// A resolver plus the generation it was built in. Work scheduled by an
/// older generation is discarded.
pub(crate) struct ResolverWrapper {
    resolver: Box<dyn Resolver>,
    generation: u64,
}

impl ResolverWrapper {
    pub(crate) fn new(resolver: Box<dyn Resolver>, generation: u64) -> Self {
        Self {
            resolver,
            generation,
        }
    }

    pub(crate) fn resolve_now(&mut self) {
        self.resolver.resolve_now();
    }
}

/// Installs a freshly built resolver, running any work it requested while it
/// was being built.
pub(crate) fn install(work: &mut ChannelWork, cc: &Arc<ClientConnInner>, wrapper: ResolverWrapper) {
    if cc.is_closed() {
        return;
    }
    let generation = wrapper.generation;
    debug!(generation, "resolver started");
    work.resolver = Some(wrapper);
    if work.pending_resolver_work.take() == Some(generation) {
        run_work(work, cc, generation);
    }
}

/// Stops the current resolver. No further updates from it are delivered.
pub(crate) fn shutdown(work: &mut ChannelWork) {
    work.pending_resolver_work = None;
    if let Some(wrapper) = work.resolver.take() {
        debug!(generation = wrapper.generation, "resolver stopped");
    }
}

fn run_work(work: &mut ChannelWork, cc: &Arc<ClientConnInner>, generation: u64) {
    let ChannelWork {
        resolver, balancer, ..
    } = work;
    let Some(wrapper) = resolver.as_mut() else {
        return;
    };
    if wrapper.generation != generation {
        trace!(generation, "dropping work of a stale resolver");
        return;
    }
    let mut controller = Controller { cc, balancer };
    wrapper.resolver.work(&mut controller);
}

/// Lets a resolver ask for its work method to be called.
pub(crate) struct ResolverWorkScheduler {
    pub(crate) cc: Weak<ClientConnInner>,
    pub(crate) generation: u64,
}

impl WorkScheduler for ResolverWorkScheduler {
    fn schedule_work(&self) {
        let Some(cc) = self.cc.upgrade() else {
            return;
        };
        let generation = self.generation;
        let inner = cc.clone();
        cc.schedule(move |work| {
            match work.resolver.as_ref().map(|w| w.generation) {
                Some(current) if current == generation => run_work(work, &inner, generation),
                Some(current) if current > generation => {}
                // Scheduled while the resolver was still being built.
                _ => work.pending_resolver_work = Some(generation),
            }
        });
    }
}

struct Controller<'a> {
    cc: &'a Arc<ClientConnInner>,
    balancer: &'a mut BalancerWrapper,
}

impl ResolverController for Controller<'_> {
    fn update(&mut self, update: ResolverUpdate) -> Result<(), Error> {
        self.cc.update_resolver_state(Ok(update), self.balancer)
    }

    fn report_error(&mut self, error: String) {
        debug!(%error, "resolver reported an error");
        let _ = self.cc.update_resolver_state(Err(error), self.balancer);
    }

    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, String> {
        ServiceConfig::parse(config, self.cc.lb_registry())
    }
}
