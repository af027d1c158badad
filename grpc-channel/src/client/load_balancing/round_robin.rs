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

//! The round_robin policy: one subchannel per address, RPCs spread evenly
//! over the READY ones.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use tonic::Status;
use tracing::debug;

use super::{
    ChannelController, FailingPicker, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    NewSubchannelOptions, Pick, PickInfo, PickResult, Picker, QueuingPicker, Subchannel,
    SubchannelState,
};
use crate::client::ConnectivityState;
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::LbConfig;

pub static POLICY_NAME: &str = "round_robin";

#[derive(Debug, Default)]
pub struct Builder {
    _priv: (),
}

impl LbPolicyBuilder for Builder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy {
            subchannels: HashMap::new(),
            states: HashMap::new(),
            state: ConnectivityState::Connecting,
            last_connection_error: None,
            last_resolver_error: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct RoundRobinPolicy {
    subchannels: HashMap<Address, Subchannel>,
    /// States of the subchannels in `subchannels`, plus removed ones that
    /// have not reported SHUTDOWN yet.
    states: HashMap<Subchannel, ConnectivityState>,
    state: ConnectivityState,
    last_connection_error: Option<String>,
    last_resolver_error: Option<String>,
}

impl RoundRobinPolicy {
    fn aggregate_state(&self) -> ConnectivityState {
        let has = |s: ConnectivityState| self.states.values().any(|&st| st == s);
        if has(ConnectivityState::Ready) {
            ConnectivityState::Ready
        } else if has(ConnectivityState::Connecting) {
            ConnectivityState::Connecting
        } else if has(ConnectivityState::Idle) {
            ConnectivityState::Idle
        } else {
            ConnectivityState::TransientFailure
        }
    }

    fn picker(&self) -> Arc<dyn Picker> {
        if self.state == ConnectivityState::TransientFailure {
            return Arc::new(FailingPicker {
                status: Status::unavailable(self.merged_errors()),
            });
        }
        let ready: Vec<Subchannel> = self
            .states
            .iter()
            .filter(|(_, st)| **st == ConnectivityState::Ready)
            .map(|(sc, _)| sc.clone())
            .collect();
        if ready.is_empty() {
            return Arc::new(QueuingPicker {});
        }
        // Start at a random index so that channels do not all hit the same
        // backend first.
        let next = rand::rng().random_range(0..ready.len());
        Arc::new(RoundRobinPicker {
            subchannels: ready,
            next: AtomicUsize::new(next),
        })
    }

    fn merged_errors(&self) -> String {
        match (&self.last_connection_error, &self.last_resolver_error) {
            (None, None) => "no connections available".to_string(),
            (Some(conn), None) => format!("last connection error: {conn}"),
            (None, Some(res)) => format!("last resolver error: {res}"),
            (Some(conn), Some(res)) => {
                format!("last connection error: {conn}; last resolver error: {res}")
            }
        }
    }

    fn publish(&self, channel_controller: &mut dyn ChannelController) {
        channel_controller.update_picker(LbState {
            connectivity_state: self.state,
            picker: self.picker(),
        });
    }
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.last_resolver_error = None;
        for addr in &update.addresses {
            if self.subchannels.contains_key(addr) {
                continue;
            }
            let sc = channel_controller.new_subchannel(
                std::slice::from_ref(addr),
                NewSubchannelOptions {
                    health_check_enabled: true,
                },
            )?;
            debug!(subchannel = %sc, address = %addr, "round_robin created subchannel");
            self.states.insert(sc.clone(), ConnectivityState::Idle);
            self.subchannels.insert(addr.clone(), sc.clone());
            let _ = sc.connect();
        }
        let removed: Vec<Address> = self
            .subchannels
            .keys()
            .filter(|a| !update.addresses.contains(a))
            .cloned()
            .collect();
        for addr in removed {
            if let Some(sc) = self.subchannels.remove(&addr) {
                channel_controller.remove_subchannel(&sc);
                // The removal is final; its SHUTDOWN may not be delivered.
                self.states.remove(&sc);
            }
        }

        if update.addresses.is_empty() {
            self.resolver_error("produced zero addresses".to_string(), channel_controller);
            return Err("received empty address list from the name resolver".into());
        }
        self.state = self.aggregate_state();
        self.publish(channel_controller);
        Ok(())
    }

    fn resolver_error(&mut self, error: String, channel_controller: &mut dyn ChannelController) {
        self.last_resolver_error = Some(error);
        if self.subchannels.is_empty() {
            self.state = ConnectivityState::TransientFailure;
        }
        if self.state != ConnectivityState::TransientFailure {
            return;
        }
        self.publish(channel_controller);
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(&old) = self.states.get(subchannel) else {
            return;
        };
        let new = state.connectivity_state;
        if old == ConnectivityState::TransientFailure
            && matches!(new, ConnectivityState::Connecting | ConnectivityState::Idle)
        {
            // A failing subchannel keeps counting as failing until it is
            // READY, so many dead backends cannot hold the channel in
            // CONNECTING.
            if new == ConnectivityState::Idle {
                let _ = subchannel.connect();
            }
            return;
        }
        match new {
            ConnectivityState::Idle => {
                let _ = subchannel.connect();
            }
            ConnectivityState::Shutdown => {
                self.states.remove(subchannel);
            }
            ConnectivityState::TransientFailure => {
                self.last_connection_error = state
                    .last_connection_error
                    .as_ref()
                    .map(|e| e.to_string());
            }
            _ => {}
        }
        if new != ConnectivityState::Shutdown {
            self.states.insert(subchannel.clone(), new);
        }
        let prev = self.state;
        self.state = self.aggregate_state();
        let ready_changed =
            (old == ConnectivityState::Ready) != (new == ConnectivityState::Ready);
        if ready_changed || self.state != prev || self.state == ConnectivityState::TransientFailure
        {
            self.publish(channel_controller);
        }
    }

    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {
        for (sc, state) in &self.states {
            if *state == ConnectivityState::Idle {
                let _ = sc.connect();
            }
        }
    }
}

struct RoundRobinPicker {
    subchannels: Vec<Subchannel>,
    next: AtomicUsize,
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        PickResult::Pick(Pick::new(self.subchannels[idx].clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::sync::mpsc;

    use super::*;
    use crate::client::load_balancing::test_utils::{
        TestChannelController, TestEvent, TestWorkScheduler, expect_new_subchannel,
        expect_picker, next_event, pick, picked_subchannel,
    };
    use crate::error::Error as ChannelError;

    fn build_policy() -> (
        Box<dyn LbPolicy>,
        TestChannelController,
        mpsc::UnboundedReceiver<TestEvent>,
    ) {
        let (controller, rx) = TestChannelController::new();
        let (tx, _) = mpsc::unbounded_channel();
        let policy = Builder::default().build(LbPolicyOptions {
            work_scheduler: Arc::new(TestWorkScheduler { tx_events: tx }),
        });
        (policy, controller, rx)
    }

    fn update(list: &[&str]) -> ResolverUpdate {
        ResolverUpdate::new(list.iter().map(|a| Address::new(*a)).collect())
    }

    fn sc_state(state: ConnectivityState) -> SubchannelState {
        SubchannelState {
            connectivity_state: state,
            last_connection_error: None,
        }
    }

    #[tokio::test]
    async fn spreads_picks_over_ready_subchannels() {
        let (mut policy, mut cc, mut rx) = build_policy();
        policy
            .resolver_update(update(&["a:1", "b:2", "c:3"]), None, &mut cc)
            .unwrap();
        let mut scs = Vec::new();
        for _ in 0..3 {
            match next_event(&mut rx) {
                TestEvent::NewSubchannel(sc, opts) => {
                    assert!(opts.health_check_enabled);
                    assert_eq!(sc.addresses().len(), 1);
                    scs.push(sc);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        let state = expect_picker(&mut rx);
        assert_eq!(state.connectivity_state, ConnectivityState::Idle);

        for sc in &scs {
            policy.subchannel_update(sc, &sc_state(ConnectivityState::Connecting), &mut cc);
        }
        let state = expect_picker(&mut rx);
        assert_eq!(state.connectivity_state, ConnectivityState::Connecting);
        assert!(matches!(pick(&state), PickResult::Queue));

        policy.subchannel_update(&scs[0], &sc_state(ConnectivityState::Ready), &mut cc);
        policy.subchannel_update(&scs[2], &sc_state(ConnectivityState::Ready), &mut cc);
        let _ = expect_picker(&mut rx);
        let state = expect_picker(&mut rx);
        assert_eq!(state.connectivity_state, ConnectivityState::Ready);

        let picked: Vec<Subchannel> = (0..4).map(|_| picked_subchannel(&state)).collect();
        let distinct: HashSet<&Subchannel> = picked.iter().collect();
        assert_eq!(distinct.len(), 2);
        assert!(distinct.contains(&scs[0]) && distinct.contains(&scs[2]));
        // Alternates between the two.
        assert_ne!(picked[0], picked[1]);
        assert_eq!(picked[0], picked[2]);
    }

    #[tokio::test]
    async fn removes_subchannels_for_dropped_addresses() {
        let (mut policy, mut cc, mut rx) = build_policy();
        policy
            .resolver_update(update(&["a:1", "b:2"]), None, &mut cc)
            .unwrap();
        let a = expect_new_subchannel(&mut rx);
        let b = expect_new_subchannel(&mut rx);
        expect_picker(&mut rx);

        policy
            .resolver_update(update(&["b:2", "c:3"]), None, &mut cc)
            .unwrap();
        let c = expect_new_subchannel(&mut rx);
        assert_eq!(c.addresses(), vec![Address::new("c:3")]);
        match next_event(&mut rx) {
            TestEvent::RemoveSubchannel(sc) => assert_eq!(sc, a),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(a.state(), ConnectivityState::Shutdown);
        assert_ne!(b.state(), ConnectivityState::Shutdown);
        expect_picker(&mut rx);
    }

    #[tokio::test]
    async fn all_failing_reports_transient_failure() {
        let (mut policy, mut cc, mut rx) = build_policy();
        policy
            .resolver_update(update(&["a:1", "b:2"]), None, &mut cc)
            .unwrap();
        let a = expect_new_subchannel(&mut rx);
        let b = expect_new_subchannel(&mut rx);
        expect_picker(&mut rx);

        let failed = SubchannelState {
            connectivity_state: ConnectivityState::TransientFailure,
            last_connection_error: Some(ChannelError::Connection("refused".into())),
        };
        policy.subchannel_update(&a, &failed, &mut cc);
        // b is still IDLE, so nothing changes for the channel yet.
        assert!(rx.try_recv().is_err());
        policy.subchannel_update(&b, &failed, &mut cc);
        let state = expect_picker(&mut rx);
        assert_eq!(
            state.connectivity_state,
            ConnectivityState::TransientFailure
        );
        match pick(&state) {
            PickResult::Fail(status) => assert_eq!(
                status.message(),
                "last connection error: grpc: connection error: refused"
            ),
            _ => panic!("expected the picker to fail"),
        }

        // Reconnect attempts of failing subchannels are not reported.
        policy.subchannel_update(&a, &sc_state(ConnectivityState::Connecting), &mut cc);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_update_is_rejected() {
        let (mut policy, mut cc, mut rx) = build_policy();
        assert!(
            policy
                .resolver_update(update(&[]), None, &mut cc)
                .is_err()
        );
        let state = expect_picker(&mut rx);
        assert_eq!(
            state.connectivity_state,
            ConnectivityState::TransientFailure
        );
        match pick(&state) {
            PickResult::Fail(status) => assert_eq!(
                status.message(),
                "last resolver error: produced zero addresses"
            ),
            _ => panic!("expected the picker to fail"),
        }
    }
}
