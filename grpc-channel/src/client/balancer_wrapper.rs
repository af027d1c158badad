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

//! Owns the channel's load balancing policy.
//!
//! The policy lives inside the channel's work serializer. Every call into it
//! happens there, and the [`ChannelController`] it is handed forwards its
//! requests to the channel.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use super::ConnectivityState;
use super::channel::ClientConnInner;
use super::load_balancing::{
    ChannelController, LbPolicy, LbPolicyOptions, LbState, NewSubchannelOptions, Subchannel,
    SubchannelState, WorkScheduler, pick_first,
};
use super::name_resolution::{Address, ResolverUpdate};
use super::service_config::LbConfig;
use crate::error::Error;

pub(crate) struct BalancerWrapper {
    policy: Option<Box<dyn LbPolicy>>,
    policy_name: String,
    /// Bumped whenever the policy is replaced.
    generation: u64,
    /// Subchannels created by the current policy and not yet removed.
    subchannels: HashSet<Subchannel>,
    closed: bool,
}

impl BalancerWrapper {
    pub(crate) fn new() -> Self {
        Self {
            policy: None,
            policy_name: String::new(),
            generation: 0,
            subchannels: HashSet::new(),
            closed: false,
        }
    }

    /// Makes the policy named `name` the current one, unless it already is.
    pub(crate) fn switch_to(&mut self, cc: &Arc<ClientConnInner>, name: &str) {
        if self.closed || (self.policy.is_some() && self.policy_name == name) {
            return;
        }
        let builder = match cc.lb_registry().get(name) {
            Some(builder) => builder,
            None => {
                warn!(policy = name, "load balancing policy not registered; using pick_first");
                match cc.lb_registry().get(pick_first::POLICY_NAME) {
                    Some(builder) => builder,
                    None => {
                        warn!("pick_first is not registered; cannot build a policy");
                        return;
                    }
                }
            }
        };
        if self.policy.is_some() {
            info!(from = %self.policy_name, to = builder.name(), "switching load balancing policy");
        } else {
            debug!(policy = builder.name(), "building load balancing policy");
        }
        self.drop_policy(cc, Error::ConnDrain);
        self.generation += 1;
        self.policy_name = builder.name().to_string();
        self.policy = Some(builder.build(LbPolicyOptions {
            work_scheduler: Arc::new(BalancerWorkScheduler {
                cc: Arc::downgrade(cc),
                generation: self.generation,
            }),
        }));
    }

    pub(crate) fn update_client_conn_state(
        &mut self,
        cc: &Arc<ClientConnInner>,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
    ) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        let Some(policy) = self.policy.as_mut() else {
            return Ok(());
        };
        let mut controller = Controller {
            cc,
            subchannels: &mut self.subchannels,
        };
        policy
            .resolver_update(update, config, &mut controller)
            .map_err(|err| {
                debug!(%err, "load balancing policy rejected resolver update");
                Error::BadResolverState
            })
    }

    pub(crate) fn resolver_error(&mut self, cc: &Arc<ClientConnInner>, error: String) {
        if self.closed {
            return;
        }
        if let Some(policy) = self.policy.as_mut() {
            let mut controller = Controller {
                cc,
                subchannels: &mut self.subchannels,
            };
            policy.resolver_error(error, &mut controller);
        }
    }

    /// Delivers a subchannel state change to the policy that created the
    /// subchannel, if it is still current.
    pub(crate) fn update_subchannel_state(
        &mut self,
        cc: &Arc<ClientConnInner>,
        subchannel: &Subchannel,
        state: &SubchannelState,
    ) {
        if self.closed || !self.subchannels.contains(subchannel) {
            return;
        }
        if state.connectivity_state == ConnectivityState::Shutdown {
            self.subchannels.remove(subchannel);
        }
        if let Some(policy) = self.policy.as_mut() {
            let mut controller = Controller {
                cc,
                subchannels: &mut self.subchannels,
            };
            policy.subchannel_update(subchannel, state, &mut controller);
        }
    }

    pub(crate) fn exit_idle(&mut self, cc: &Arc<ClientConnInner>) {
        if self.closed {
            return;
        }
        if let Some(policy) = self.policy.as_mut() {
            let mut controller = Controller {
                cc,
                subchannels: &mut self.subchannels,
            };
            policy.exit_idle(&mut controller);
        }
    }

    fn work(&mut self, cc: &Arc<ClientConnInner>, generation: u64) {
        if self.closed || generation != self.generation {
            return;
        }
        if let Some(policy) = self.policy.as_mut() {
            let mut controller = Controller {
                cc,
                subchannels: &mut self.subchannels,
            };
            policy.work(&mut controller);
        }
    }

    /// Prepares the wrapper for use after the channel leaves idle mode.
    pub(crate) fn exit_idle_mode(&mut self) {
        self.closed = false;
    }

    /// Drops the policy and shuts down its subchannels with `err`. Nothing is
    /// delivered to a policy afterwards until [`Self::exit_idle_mode`].
    pub(crate) fn close(&mut self, cc: &Arc<ClientConnInner>, err: Error) {
        self.drop_policy(cc, err);
        self.closed = true;
    }

    fn drop_policy(&mut self, cc: &Arc<ClientConnInner>, err: Error) {
        self.policy = None;
        self.policy_name.clear();
        for sc in self.subchannels.drain() {
            cc.remove_addr_conn(&sc, err.clone());
        }
    }
}

struct BalancerWorkScheduler {
    cc: Weak<ClientConnInner>,
    generation: u64,
}

impl WorkScheduler for BalancerWorkScheduler {
    fn schedule_work(&self) {
        let Some(cc) = self.cc.upgrade() else {
            return;
        };
        let generation = self.generation;
        let inner = cc.clone();
        cc.schedule(move |work| work.balancer.work(&inner, generation));
    }
}

struct Controller<'a> {
    cc: &'a Arc<ClientConnInner>,
    subchannels: &'a mut HashSet<Subchannel>,
}

impl ChannelController for Controller<'_> {
    fn new_subchannel(
        &mut self,
        addresses: &[Address],
        options: NewSubchannelOptions,
    ) -> Result<Subchannel, Error> {
        let sc = self.cc.new_addr_conn(addresses.to_vec(), options)?;
        self.subchannels.insert(sc.clone());
        Ok(sc)
    }

    fn remove_subchannel(&mut self, subchannel: &Subchannel) {
        if self.subchannels.remove(subchannel) {
            self.cc.remove_addr_conn(subchannel, Error::ConnDrain);
        }
    }

    fn update_picker(&mut self, update: LbState) {
        self.cc.update_picker_state(update);
    }

    fn request_resolution(&mut self) {
        self.cc.resolve_now_internal();
    }
}
