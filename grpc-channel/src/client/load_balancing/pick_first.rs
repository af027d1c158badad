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

//! The pick_first policy: one subchannel over the whole address list.
//!
//! The subchannel connects to the addresses in order and RPCs go to
//! whichever one it reaches. Once connecting fails the policy reports
//! TRANSIENT_FAILURE until the subchannel is READY again, rather than
//! flapping through CONNECTING on every retry.

use std::error::Error;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::Value;
use tonic::Status;
use tracing::debug;

use super::{
    ChannelController, FailingPicker, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    NewSubchannelOptions, Pick, PickInfo, PickResult, Picker, QueuingPicker, Subchannel,
    SubchannelState,
};
use crate::client::ConnectivityState;
use crate::client::name_resolution::ResolverUpdate;
use crate::client::service_config::LbConfig;

pub static POLICY_NAME: &str = "pick_first";

#[derive(Debug, Default)]
pub struct Builder {
    _priv: (),
}

impl LbPolicyBuilder for Builder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            subchannel: None,
            state: ConnectivityState::Idle,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(&self, config: &Value) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let cfg: PickFirstConfig = serde_json::from_value(config.clone())
            .map_err(|e| format!("failed to parse JSON config: {e}"))?;
        Ok(Some(LbConfig::new(cfg)))
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PickFirstConfig {
    /// Randomizes the order of the addresses of each update.
    pub shuffle_address_list: Option<bool>,
}

struct PickFirstPolicy {
    subchannel: Option<Subchannel>,
    /// The state last reported to the channel.
    state: ConnectivityState,
}

impl PickFirstPolicy {
    fn update_state(
        &mut self,
        state: ConnectivityState,
        picker: Arc<dyn Picker>,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.state = state;
        channel_controller.update_picker(LbState {
            connectivity_state: state,
            picker,
        });
    }
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut addresses = update.addresses;
        if addresses.is_empty() {
            self.resolver_error("produced zero addresses".to_string(), channel_controller);
            return Err("received empty address list from the name resolver".into());
        }
        let shuffle = config
            .and_then(|c| c.convert_to::<PickFirstConfig>())
            .and_then(|c| c.shuffle_address_list)
            .unwrap_or(false);
        if shuffle {
            addresses.shuffle(&mut rand::rng());
        }

        if let Some(sc) = &self.subchannel {
            sc.update_addresses(addresses);
            return Ok(());
        }

        let sc = match channel_controller.new_subchannel(
            &addresses,
            NewSubchannelOptions {
                health_check_enabled: false,
            },
        ) {
            Ok(sc) => sc,
            Err(err) => {
                let status = Status::unavailable(format!("error creating connection: {err}"));
                self.update_state(
                    ConnectivityState::TransientFailure,
                    Arc::new(FailingPicker { status }),
                    channel_controller,
                );
                return Err(err.into());
            }
        };
        debug!(subchannel = %sc, "pick_first created subchannel");
        self.subchannel = Some(sc.clone());
        self.update_state(
            ConnectivityState::Connecting,
            Arc::new(QueuingPicker {}),
            channel_controller,
        );
        let _ = sc.connect();
        Ok(())
    }

    fn resolver_error(&mut self, error: String, channel_controller: &mut dyn ChannelController) {
        if self.subchannel.is_none() {
            self.state = ConnectivityState::TransientFailure;
        }
        // Without a failure to report, the current picker stays.
        if self.state != ConnectivityState::TransientFailure {
            return;
        }
        let status = Status::unavailable(format!("name resolver error: {error}"));
        self.update_state(
            ConnectivityState::TransientFailure,
            Arc::new(FailingPicker { status }),
            channel_controller,
        );
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if self.subchannel.as_ref() != Some(subchannel) {
            return;
        }
        match state.connectivity_state {
            ConnectivityState::Shutdown => self.subchannel = None,
            ConnectivityState::Ready => self.update_state(
                ConnectivityState::Ready,
                Arc::new(OneSubchannelPicker {
                    subchannel: subchannel.clone(),
                }),
                channel_controller,
            ),
            ConnectivityState::Connecting => {
                if self.state == ConnectivityState::TransientFailure {
                    return;
                }
                self.update_state(
                    ConnectivityState::Connecting,
                    Arc::new(QueuingPicker {}),
                    channel_controller,
                );
            }
            ConnectivityState::Idle => {
                if self.state == ConnectivityState::TransientFailure {
                    // Still failing; try again without reporting IDLE.
                    let _ = subchannel.connect();
                    return;
                }
                self.update_state(
                    ConnectivityState::Idle,
                    Arc::new(IdlePicker {
                        subchannel: subchannel.clone(),
                    }),
                    channel_controller,
                );
            }
            ConnectivityState::TransientFailure => {
                let message = state
                    .last_connection_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "connection failed".to_string());
                self.update_state(
                    ConnectivityState::TransientFailure,
                    Arc::new(FailingPicker {
                        status: Status::unavailable(message),
                    }),
                    channel_controller,
                );
            }
        }
    }

    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {
        if self.state != ConnectivityState::Idle {
            return;
        }
        if let Some(sc) = &self.subchannel {
            let _ = sc.connect();
        }
    }
}

/// Sends every RPC to the connected subchannel.
struct OneSubchannelPicker {
    subchannel: Subchannel,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        PickResult::Pick(Pick::new(self.subchannel.clone()))
    }
}

/// Reconnects an idle subchannel on the first RPC.
struct IdlePicker {
    subchannel: Subchannel,
}

impl Picker for IdlePicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        let _ = self.subchannel.connect();
        PickResult::Queue
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tonic::Code;

    use super::*;
    use crate::client::load_balancing::test_utils::{
        TestChannelController, TestEvent, TestWorkScheduler, expect_new_subchannel,
        expect_picker, pick, picked_subchannel,
    };
    use crate::client::name_resolution::Address;
    use crate::error::Error as ChannelError;

    fn build_policy() -> (
        Box<dyn LbPolicy>,
        TestChannelController,
        tokio::sync::mpsc::UnboundedReceiver<TestEvent>,
    ) {
        let (controller, rx) = TestChannelController::new();
        let (tx, _) = tokio::sync::mpsc::unbounded_channel();
        let policy = Builder::default().build(LbPolicyOptions {
            work_scheduler: Arc::new(TestWorkScheduler { tx_events: tx }),
        });
        (policy, controller, rx)
    }

    fn addrs(list: &[&str]) -> Vec<Address> {
        list.iter().map(|a| Address::new(*a)).collect()
    }

    fn sc_state(state: ConnectivityState) -> SubchannelState {
        SubchannelState {
            connectivity_state: state,
            last_connection_error: None,
        }
    }

    fn expect_failure(state: &LbState) -> Status {
        match pick(state) {
            PickResult::Fail(status) => status,
            _ => panic!("expected the picker to fail"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_subchannel_for_all_addresses() {
        let (mut policy, mut cc, mut rx) = build_policy();
        policy
            .resolver_update(ResolverUpdate::new(addrs(&["a:1", "b:2"])), None, &mut cc)
            .unwrap();

        let sc = expect_new_subchannel(&mut rx);
        assert_eq!(sc.addresses(), addrs(&["a:1", "b:2"]));
        let state = expect_picker(&mut rx);
        assert_eq!(state.connectivity_state, ConnectivityState::Connecting);
        assert!(matches!(pick(&state), PickResult::Queue));

        // The policy asked the subchannel to connect.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sc.state(), ConnectivityState::Connecting);

        // Later updates reuse the subchannel.
        policy
            .resolver_update(ResolverUpdate::new(addrs(&["c:3"])), None, &mut cc)
            .unwrap();
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sc.addresses(), addrs(&["c:3"]));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_update_fails_without_subchannel() {
        let (mut policy, mut cc, mut rx) = build_policy();
        let err = policy
            .resolver_update(ResolverUpdate::new(vec![]), None, &mut cc)
            .unwrap_err();
        assert!(err.to_string().contains("empty address list"), "{err}");

        let state = expect_picker(&mut rx);
        assert_eq!(
            state.connectivity_state,
            ConnectivityState::TransientFailure
        );
        let status = expect_failure(&state);
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "name resolver error: produced zero addresses");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_sticky() {
        let (mut policy, mut cc, mut rx) = build_policy();
        policy
            .resolver_update(ResolverUpdate::new(addrs(&["a:1"])), None, &mut cc)
            .unwrap();
        let sc = expect_new_subchannel(&mut rx);
        expect_picker(&mut rx);

        policy.subchannel_update(
            &sc,
            &SubchannelState {
                connectivity_state: ConnectivityState::TransientFailure,
                last_connection_error: Some(ChannelError::Connection("refused".into())),
            },
            &mut cc,
        );
        let state = expect_picker(&mut rx);
        assert_eq!(
            state.connectivity_state,
            ConnectivityState::TransientFailure
        );
        assert_eq!(
            expect_failure(&state).message(),
            "grpc: connection error: refused"
        );

        // Retries after backoff do not leave TRANSIENT_FAILURE.
        policy.subchannel_update(&sc, &sc_state(ConnectivityState::Idle), &mut cc);
        policy.subchannel_update(&sc, &sc_state(ConnectivityState::Connecting), &mut cc);
        assert!(rx.try_recv().is_err());

        // Resolver errors refresh the failing picker.
        policy.resolver_error("dns timeout".to_string(), &mut cc);
        let state = expect_picker(&mut rx);
        assert_eq!(
            expect_failure(&state).message(),
            "name resolver error: dns timeout"
        );

        policy.subchannel_update(&sc, &sc_state(ConnectivityState::Ready), &mut cc);
        let state = expect_picker(&mut rx);
        assert_eq!(state.connectivity_state, ConnectivityState::Ready);
        assert_eq!(picked_subchannel(&state), sc);

        // Resolver errors do not disturb a working connection.
        policy.resolver_error("dns timeout".to_string(), &mut cc);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_picker_reconnects() {
        let (mut policy, mut cc, mut rx) = build_policy();
        policy
            .resolver_update(ResolverUpdate::new(addrs(&["a:1"])), None, &mut cc)
            .unwrap();
        let sc = expect_new_subchannel(&mut rx);
        expect_picker(&mut rx);
        policy.subchannel_update(&sc, &sc_state(ConnectivityState::Ready), &mut cc);
        expect_picker(&mut rx);

        policy.subchannel_update(&sc, &sc_state(ConnectivityState::Idle), &mut cc);
        let state = expect_picker(&mut rx);
        assert_eq!(state.connectivity_state, ConnectivityState::Idle);
        assert!(matches!(pick(&state), PickResult::Queue));

        // Shutdown forgets the subchannel; the next update creates another.
        policy.subchannel_update(&sc, &sc_state(ConnectivityState::Shutdown), &mut cc);
        policy
            .resolver_update(ResolverUpdate::new(addrs(&["a:1"])), None, &mut cc)
            .unwrap();
        let next = expect_new_subchannel(&mut rx);
        assert_ne!(next, sc);
    }

    #[tokio::test(start_paused = true)]
    async fn shuffles_when_configured() {
        let cfg = Builder::default()
            .parse_config(&json!({"shuffleAddressList": true}))
            .unwrap()
            .unwrap();
        let list: Vec<String> = (0..32).map(|i| format!("10.0.0.{i}:80")).collect();
        let list: Vec<&str> = list.iter().map(String::as_str).collect();

        let (mut policy, mut cc, mut rx) = build_policy();
        policy
            .resolver_update(ResolverUpdate::new(addrs(&list)), Some(&cfg), &mut cc)
            .unwrap();
        let sc = expect_new_subchannel(&mut rx);
        let mut got = sc.addresses();
        assert_ne!(got, addrs(&list), "32 addresses kept their order");
        got.sort_by(|a, b| a.address.cmp(&b.address));
        let mut want = addrs(&list);
        want.sort_by(|a, b| a.address.cmp(&b.address));
        assert_eq!(got, want);
    }

    #[test]
    fn rejects_malformed_config() {
        let err = Builder::default()
            .parse_config(&json!({"shuffleAddressList": "yes"}))
            .unwrap_err();
        assert!(err.to_string().contains("failed to parse JSON config"), "{err}");
    }
}
