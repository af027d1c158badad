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

//! Fakes for exercising channels and subchannels without a network.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tonic::{Status, async_trait};

use super::ConnectivityState;
use super::health::{HealthChecker, HealthReporter};
use super::name_resolution::Address;
use super::transport::{
    ClientTransport, ConnectedTransport, GoAwayReason, Transport, TransportEvent, TransportOptions,
};
use crate::error::Error;

/// How the fake transport treats connection attempts to an address.
#[derive(Clone, Debug)]
pub(crate) enum Behavior {
    Accept,
    Refuse(String),
    /// The attempt never completes.
    Hang,
}

/// A connection attempt seen by [`FakeTransport`].
#[derive(Clone, Debug)]
pub(crate) struct ConnectAttempt {
    pub(crate) address: String,
    pub(crate) options: TransportOptions,
}

/// A [`Transport`] whose connection attempts follow a per-address script.
pub(crate) struct FakeTransport {
    behaviors: Mutex<HashMap<String, Behavior>>,
    default_behavior: Behavior,
    attempts_tx: mpsc::UnboundedSender<ConnectAttempt>,
    attempts: Mutex<Vec<ConnectAttempt>>,
    connections: Mutex<Vec<Arc<FakeClientTransport>>>,
}

impl FakeTransport {
    /// Returns the transport and a stream of the attempts it sees.
    pub(crate) fn new(
        default_behavior: Behavior,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectAttempt>) {
        let (attempts_tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            behaviors: Mutex::default(),
            default_behavior,
            attempts_tx,
            attempts: Mutex::default(),
            connections: Mutex::default(),
        });
        (transport, rx)
    }

    pub(crate) fn set_behavior(&self, address: &str, behavior: Behavior) {
        self.behaviors.lock().insert(address.to_string(), behavior);
    }

    pub(crate) fn attempts(&self) -> Vec<String> {
        self.attempts.lock().iter().map(|a| a.address.clone()).collect()
    }

    /// Every connection established so far, oldest first.
    pub(crate) fn connections(&self) -> Vec<Arc<FakeClientTransport>> {
        self.connections.lock().clone()
    }

    pub(crate) fn last_connection(&self) -> Option<Arc<FakeClientTransport>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        address: &Address,
        opts: &TransportOptions,
    ) -> Result<ConnectedTransport, String> {
        let attempt = ConnectAttempt {
            address: address.address.clone(),
            options: opts.clone(),
        };
        self.attempts.lock().push(attempt.clone());
        let _ = self.attempts_tx.send(attempt);

        let behavior = self
            .behaviors
            .lock()
            .get(&address.address)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone());
        match behavior {
            Behavior::Accept => {
                let (tx, events) = mpsc::unbounded_channel();
                let transport = Arc::new(FakeClientTransport {
                    address: address.address.clone(),
                    events: Mutex::new(Some(tx)),
                    state: Mutex::default(),
                });
                self.connections.lock().push(transport.clone());
                Ok(ConnectedTransport { transport, events })
            }
            Behavior::Refuse(err) => Err(err),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default, Debug)]
struct FakeConnState {
    going_away: bool,
    graceful_close: bool,
    closed: Option<String>,
    calls: usize,
    call_error: Option<Status>,
}

/// An established fake connection. Calls echo their request until the
/// connection is told to go away or is closed.
pub(crate) struct FakeClientTransport {
    pub(crate) address: String,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    state: Mutex<FakeConnState>,
}

impl FakeClientTransport {
    /// Simulates a GOAWAY from the server.
    pub(crate) fn go_away(&self, reason: GoAwayReason) {
        self.state.lock().going_away = true;
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(TransportEvent::GoAway(reason));
        }
    }

    /// Simulates the connection dropping.
    pub(crate) fn drop_connection(&self) {
        self.state.lock().closed = Some("connection reset".to_string());
        if let Some(tx) = self.events.lock().take() {
            let _ = tx.send(TransportEvent::Closed(Some("connection reset".to_string())));
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    pub(crate) fn closed_with(&self) -> Option<String> {
        self.state.lock().closed.clone()
    }

    pub(crate) fn was_gracefully_closed(&self) -> bool {
        self.state.lock().graceful_close
    }

    pub(crate) fn calls(&self) -> usize {
        self.state.lock().calls
    }

    /// Makes later calls fail with `status`, or echo again with `None`.
    pub(crate) fn fail_calls(&self, status: Option<Status>) {
        self.state.lock().call_error = status;
    }
}

#[async_trait]
impl ClientTransport for FakeClientTransport {
    async fn call(&self, _method: &str, request: Bytes) -> Result<Bytes, Status> {
        let mut state = self.state.lock();
        if state.going_away || state.graceful_close {
            return Err(Status::unavailable("transport is draining"));
        }
        if let Some(err) = &state.closed {
            return Err(Status::unavailable(format!("transport is closed: {err}")));
        }
        state.calls += 1;
        match &state.call_error {
            Some(status) => Err(status.clone()),
            None => Ok(request),
        }
    }

    fn graceful_close(&self) {
        self.state.lock().graceful_close = true;
    }

    fn close(&self, err: &Error) {
        self.state.lock().closed = Some(err.to_string());
        self.events.lock().take();
    }
}

/// What a [`FakeHealthChecker`] does once started.
#[derive(Clone, Debug)]
pub(crate) enum HealthScript {
    /// Reports this state and keeps the check running.
    Report(ConnectivityState),
    /// Fails as a server without the health service would.
    Unimplemented,
}

pub(crate) struct FakeHealthChecker {
    script: HealthScript,
    services: Mutex<Vec<String>>,
    reporters: Mutex<Vec<HealthReporter>>,
}

impl FakeHealthChecker {
    pub(crate) fn new(script: HealthScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            services: Mutex::default(),
            reporters: Mutex::default(),
        })
    }

    /// The service names of every check started so far.
    pub(crate) fn services(&self) -> Vec<String> {
        self.services.lock().clone()
    }

    pub(crate) fn last_reporter(&self) -> Option<HealthReporter> {
        self.reporters.lock().last().cloned()
    }
}

#[async_trait]
impl HealthChecker for FakeHealthChecker {
    async fn check(&self, reporter: HealthReporter, service_name: String) -> Result<(), Status> {
        self.services.lock().push(service_name);
        self.reporters.lock().push(reporter.clone());
        match &self.script {
            HealthScript::Report(state) => {
                reporter.set_state(*state, None);
                std::future::pending().await
            }
            HealthScript::Unimplemented => Err(Status::unimplemented("unknown service")),
        }
    }
}
