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

use std::fmt::Debug;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    ChannelController, LbState, NewSubchannelOptions, PickInfo, PickResult, Subchannel,
    WorkScheduler,
};
use crate::client::backoff::ExponentialBackoff;
use crate::client::name_resolution::Address;
use crate::client::subchannel::{AddrConn, SubchannelConfig};
use crate::client::test_utils::{Behavior, FakeTransport};
use crate::error::Error;
use crate::rt::default_runtime;

pub(crate) enum TestEvent {
    NewSubchannel(Subchannel, NewSubchannelOptions),
    RemoveSubchannel(Subchannel),
    UpdatePicker(LbState),
    RequestResolution,
    ScheduleWork,
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc, _) => write!(f, "NewSubchannel({:?})", sc.addresses()),
            Self::RemoveSubchannel(sc) => write!(f, "RemoveSubchannel({sc})"),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
        }
    }
}

/// A channel controller that records what the policy asks of it.
///
/// The subchannels it creates are real but detached from any channel: a
/// connect moves them to CONNECTING and no further, and the policy only
/// hears about state changes that a test feeds it.
pub(crate) struct TestChannelController {
    tx_events: mpsc::UnboundedSender<TestEvent>,
    transport: Arc<FakeTransport>,
    shutdown: CancellationToken,
}

impl TestChannelController {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<TestEvent>) {
        let (tx_events, rx) = mpsc::unbounded_channel();
        let (transport, _) = FakeTransport::new(Behavior::Hang);
        (
            Self {
                tx_events,
                transport,
                shutdown: CancellationToken::new(),
            },
            rx,
        )
    }
}

impl Drop for TestChannelController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl ChannelController for TestChannelController {
    fn new_subchannel(
        &mut self,
        addresses: &[Address],
        options: NewSubchannelOptions,
    ) -> Result<Subchannel, Error> {
        let config = SubchannelConfig {
            transport: self.transport.clone(),
            backoff: Arc::new(ExponentialBackoff::default()),
            min_connect_timeout: Duration::from_secs(20),
            runtime: default_runtime(),
            health_checker: None,
            disable_health_check: false,
            health_check_enabled: options.health_check_enabled,
        };
        let sc = AddrConn::new(Weak::new(), config, addresses.to_vec(), &self.shutdown);
        self.tx_events
            .send(TestEvent::NewSubchannel(sc.clone(), options))
            .unwrap();
        Ok(sc)
    }

    fn remove_subchannel(&mut self, subchannel: &Subchannel) {
        subchannel.addr_conn().tear_down(Error::ConnDrain);
        self.tx_events
            .send(TestEvent::RemoveSubchannel(subchannel.clone()))
            .unwrap();
    }

    fn update_picker(&mut self, update: LbState) {
        self.tx_events.send(TestEvent::UpdatePicker(update)).unwrap();
    }

    fn request_resolution(&mut self) {
        self.tx_events.send(TestEvent::RequestResolution).unwrap();
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        self.tx_events.send(TestEvent::ScheduleWork).unwrap();
    }
}

/// Returns the next event, failing the test if none is queued.
pub(crate) fn next_event(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> TestEvent {
    rx.try_recv().expect("expected an event from the policy")
}

pub(crate) fn expect_new_subchannel(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> Subchannel {
    match next_event(rx) {
        TestEvent::NewSubchannel(sc, _) => sc,
        other => panic!("unexpected event {other:?}"),
    }
}

pub(crate) fn expect_picker(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> LbState {
    match next_event(rx) {
        TestEvent::UpdatePicker(state) => state,
        other => panic!("unexpected event {other:?}"),
    }
}

/// Picks once with an empty [`PickInfo`].
pub(crate) fn pick(state: &LbState) -> PickResult {
    state.picker.pick(&PickInfo::default())
}

/// Returns the subchannel chosen by `state`'s picker, panicking on any
/// other result.
pub(crate) fn picked_subchannel(state: &LbState) -> Subchannel {
    match pick(state) {
        PickResult::Pick(pick) => pick.subchannel,
        PickResult::Queue => panic!("picker queued"),
        PickResult::Fail(status) => panic!("picker failed: {status}"),
        PickResult::Drop(status) => panic!("picker dropped: {status}"),
    }
}
