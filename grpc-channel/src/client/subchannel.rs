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

//! Subchannels.
//!
//! A subchannel owns one logical connection slot: an ordered list of
//! candidate addresses, at most one live transport and a connectivity state.
//! Commands from the load balancing policy, results of connection attempts,
//! health updates and transport notifications are all delivered as events
//! to a single task per subchannel, so state transitions happen strictly one
//! at a time.
//!
//! - Subchannels start IDLE.
//!
//! - IDLE transitions to CONNECTING when connect() is called.
//!
//! - CONNECTING transitions to READY on success or TRANSIENT_FAILURE once
//!   every address has failed.
//!
//! - READY transitions to IDLE when the connection is lost.
//!
//! - TRANSIENT_FAILURE transitions to IDLE when the reconnect backoff timer
//!   expires or the backoff is reset. The timer scales exponentially and is
//!   reset when a connection is established.
//!
//! - Any state transitions to SHUTDOWN when the subchannel is torn down.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::{debug, error, trace};

use super::ConnectivityState;
use super::backoff::Backoff;
use super::channel::ClientConnInner;
use super::health::{HealthChecker, HealthReporter};
use super::load_balancing::SubchannelState;
use super::name_resolution::Address;
use super::transport::{
    ClientTransport, ConnectedTransport, GoAwayReason, Transport, TransportEvent, TransportOptions,
};
use crate::error::Error;
use crate::rt::{GrpcRuntime, Sleep};

static NEXT_SUBCHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to a subchannel, given to load balancing policies.
///
/// Handles are cheap to clone and compare equal when they refer to the same
/// subchannel.
#[derive(Clone)]
pub struct Subchannel {
    inner: Arc<AddrConn>,
}

impl Subchannel {
    /// Starts connecting if the subchannel is IDLE; otherwise does nothing.
    ///
    /// Fails with [`Error::ConnClosing`] once the subchannel is shut down.
    pub fn connect(&self) -> Result<(), Error> {
        self.inner.connect()
    }

    /// Replaces the candidate addresses. A live connection to an address that
    /// is still present is kept.
    pub fn update_addresses(&self, addresses: Vec<Address>) {
        self.inner.send(Event::UpdateAddresses(addresses));
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.inner.shared.lock().addrs.clone()
    }

    /// The address of the current connection, if any.
    pub fn connected_address(&self) -> Option<Address> {
        self.inner.shared.lock().cur_addr.clone()
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.shared.lock().state
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns the transport if the subchannel is READY.
    pub(crate) fn ready_transport(&self) -> Option<Arc<dyn ClientTransport>> {
        let shared = self.inner.shared.lock();
        if shared.state != ConnectivityState::Ready {
            return None;
        }
        shared.transport.clone()
    }

    pub(crate) fn backoff_index(&self) -> usize {
        self.inner.shared.lock().backoff_idx
    }

    pub(crate) fn addr_conn(&self) -> &Arc<AddrConn> {
        &self.inner
    }
}

impl PartialEq for Subchannel {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Subchannel {}

impl Hash for Subchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subchannel({})", self.inner.id)
    }
}

impl fmt::Display for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subchannel {}", self.inner.id)
    }
}

/// Settings a subchannel captures from its channel when it is created.
#[derive(Clone)]
pub(crate) struct SubchannelConfig {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) backoff: Arc<dyn Backoff>,
    pub(crate) min_connect_timeout: Duration,
    pub(crate) runtime: GrpcRuntime,
    pub(crate) health_checker: Option<Arc<dyn HealthChecker>>,
    pub(crate) disable_health_check: bool,
    /// Whether the policy asked for health checking on this subchannel.
    pub(crate) health_check_enabled: bool,
}

enum Event {
    Connect,
    UpdateAddresses(Vec<Address>),
    ResetBackoff,
    AttemptFinished {
        attempt: u64,
        result: Result<(Address, ConnectedTransport), Error>,
    },
    HealthUpdate {
        generation: u64,
        state: ConnectivityState,
        error: Option<Error>,
    },
}

struct Shared {
    state: ConnectivityState,
    addrs: Vec<Address>,
    cur_addr: Option<Address>,
    transport: Option<Arc<dyn ClientTransport>>,
    /// Bumped whenever `transport` changes, so work bound to an old
    /// transport can tell it is stale.
    transport_gen: u64,
    backoff_idx: usize,
}

/// The state shared between a subchannel's handles and its event loop.
pub(crate) struct AddrConn {
    id: u64,
    cc: Weak<ClientConnInner>,
    config: SubchannelConfig,
    tx: mpsc::UnboundedSender<Event>,
    /// Canceled on tear down; parent of every attempt and health check.
    shutdown: CancellationToken,
    shared: Mutex<Shared>,
}

impl AddrConn {
    /// Creates a subchannel in IDLE and starts its event loop.
    pub(crate) fn new(
        cc: Weak<ClientConnInner>,
        config: SubchannelConfig,
        addrs: Vec<Address>,
        parent: &CancellationToken,
    ) -> Subchannel {
        let (tx, rx) = mpsc::unbounded_channel();
        let ac = Arc::new(AddrConn {
            id: NEXT_SUBCHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            cc,
            config,
            tx,
            shutdown: parent.child_token(),
            shared: Mutex::new(Shared {
                state: ConnectivityState::Idle,
                addrs,
                cur_addr: None,
                transport: None,
                transport_gen: 0,
                backoff_idx: 0,
            }),
        });
        let machine = Machine {
            ac: ac.clone(),
            rx,
            attempt: 0,
            attempt_cancel: None,
            backoff_for: Duration::ZERO,
            backoff: None,
            transport_events: None,
            health_cancel: None,
        };
        // The task ends on tear down; the handle is not needed to stop it.
        let _ = ac.config.runtime.spawn(Box::pin(machine.run()));
        Subchannel { inner: ac }
    }

    fn send(&self, ev: Event) {
        if let Err(mpsc::error::SendError(ev)) = self.tx.send(ev) {
            // The event loop is gone, so nobody else will close this.
            if let Event::AttemptFinished {
                result: Ok((_, conn)),
                ..
            } = ev
            {
                conn.transport.close(&Error::ConnClosing);
            }
        }
    }

    fn connect(&self) -> Result<(), Error> {
        let shared = self.shared.lock();
        match shared.state {
            ConnectivityState::Shutdown => Err(Error::ConnClosing),
            ConnectivityState::Idle => {
                drop(shared);
                self.send(Event::Connect);
                Ok(())
            }
            state => {
                trace!(subchannel = self.id, %state, "connect ignored; subchannel is not idle");
                Ok(())
            }
        }
    }

    /// Wakes a subchannel waiting out its backoff and restarts the backoff
    /// sequence.
    pub(crate) fn reset_backoff(&self) {
        self.send(Event::ResetBackoff);
    }

    /// Shuts the subchannel down. The transport is closed gracefully when
    /// `err` is [`Error::ConnDrain`] and immediately otherwise.
    pub(crate) fn tear_down(self: &Arc<Self>, err: Error) {
        let mut shared = self.shared.lock();
        if shared.state == ConnectivityState::Shutdown {
            return;
        }
        let transport = shared.transport.take();
        shared.cur_addr = None;
        shared.transport_gen += 1;
        self.update_state_locked(&mut shared, ConnectivityState::Shutdown, None);
        drop(shared);

        self.shutdown.cancel();
        if let Some(t) = transport {
            match err {
                Error::ConnDrain => t.graceful_close(),
                err => t.close(&err),
            }
        }
    }

    pub(crate) fn transport_for_generation(
        &self,
        generation: u64,
    ) -> Option<Arc<dyn ClientTransport>> {
        let shared = self.shared.lock();
        if shared.transport_gen != generation {
            return None;
        }
        shared.transport.clone()
    }

    pub(crate) fn health_update(
        &self,
        generation: u64,
        state: ConnectivityState,
        error: Option<Error>,
    ) {
        self.send(Event::HealthUpdate {
            generation,
            state,
            error,
        });
    }

    fn update_state(self: &Arc<Self>, state: ConnectivityState, err: Option<Error>) {
        let mut shared = self.shared.lock();
        self.update_state_locked(&mut shared, state, err);
    }

    // Runs with the subchannel lock held, so updates reach the channel's
    // work queue in the order they happen.
    fn update_state_locked(
        self: &Arc<Self>,
        shared: &mut Shared,
        state: ConnectivityState,
        err: Option<Error>,
    ) {
        if shared.state == state {
            return;
        }
        shared.state = state;
        match &err {
            Some(err) => debug!(subchannel = self.id, %state, %err, "subchannel state changed"),
            None => debug!(subchannel = self.id, %state, "subchannel state changed"),
        }
        if let Some(cc) = self.cc.upgrade() {
            cc.handle_subchannel_state_change(
                Subchannel {
                    inner: self.clone(),
                },
                SubchannelState {
                    connectivity_state: state,
                    last_connection_error: err,
                },
            );
        }
    }

    /// Tries each address in order until one connects, sharing a single
    /// deadline across all of them, and reports the outcome to the event loop.
    async fn try_all_addrs(
        self: Arc<Self>,
        addrs: Vec<Address>,
        dial_duration: Duration,
        cancel: CancellationToken,
        attempt: u64,
    ) {
        let deadline = Instant::now().checked_add(dial_duration);
        let mut first_err = None;
        for addr in addrs {
            if cancel.is_cancelled() {
                return;
            }
            let Some(cc) = self.cc.upgrade() else {
                return;
            };
            let opts = TransportOptions {
                authority: cc.server_name(&addr),
                connect_deadline: deadline,
                keepalive_time: cc.keepalive_time(),
            };
            drop(cc);

            let remaining = deadline.map_or(dial_duration, |d| {
                d.saturating_duration_since(Instant::now())
            });
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.config.runtime.sleep(remaining) => {
                    Err(format!("timed out connecting to {addr}"))
                }
                r = self.config.transport.connect(&addr, &opts) => r,
            };
            match result {
                Ok(conn) => {
                    self.send(Event::AttemptFinished {
                        attempt,
                        result: Ok((addr, conn)),
                    });
                    return;
                }
                Err(e) => {
                    debug!(subchannel = self.id, address = %addr, error = %e, "failed to connect");
                    if let Some(cc) = self.cc.upgrade() {
                        cc.update_connection_error(Error::Connection(e.clone()));
                    }
                    first_err.get_or_insert(Error::Connection(e));
                }
            }
        }
        let err = first_err.unwrap_or_else(|| Error::Connection("no addresses to connect to".into()));
        self.send(Event::AttemptFinished {
            attempt,
            result: Err(err),
        });
    }
}

enum Step {
    Event(Event),
    Transport(TransportEvent),
    BackoffExpired,
    Shutdown,
}

/// The event loop of a subchannel. It owns everything tied to the current
/// connection attempt or transport.
struct Machine {
    ac: Arc<AddrConn>,
    rx: mpsc::UnboundedReceiver<Event>,
    /// Identifies the current connection attempt; results of older attempts
    /// are discarded.
    attempt: u64,
    attempt_cancel: Option<CancellationToken>,
    backoff_for: Duration,
    backoff: Option<Pin<Box<dyn Sleep>>>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    health_cancel: Option<CancellationToken>,
}

impl Machine {
    async fn run(mut self) {
        loop {
            let shutdown = self.ac.shutdown.clone();
            let step = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Step::Shutdown,
                ev = self.rx.recv() => match ev {
                    Some(ev) => Step::Event(ev),
                    None => Step::Shutdown,
                },
                ev = next_transport_event(&mut self.transport_events) => Step::Transport(ev),
                _ = wait_backoff(&mut self.backoff) => Step::BackoffExpired,
            };
            match step {
                Step::Event(ev) => self.handle_event(ev),
                Step::Transport(ev) => self.on_transport_event(ev),
                Step::BackoffExpired => self.on_backoff_done(false),
                Step::Shutdown => break,
            }
        }
        self.stop();
    }

    fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Connect => {
                if self.ac.shared.lock().state == ConnectivityState::Idle {
                    self.reset_transport();
                }
            }
            Event::UpdateAddresses(addrs) => self.update_addrs(addrs),
            Event::ResetBackoff => {
                self.ac.shared.lock().backoff_idx = 0;
                if self.backoff.is_some() {
                    self.on_backoff_done(true);
                }
            }
            Event::AttemptFinished { attempt, result } => self.attempt_finished(attempt, result),
            Event::HealthUpdate {
                generation,
                state,
                error,
            } => {
                let mut shared = self.ac.shared.lock();
                if shared.transport.is_some() && shared.transport_gen == generation {
                    self.ac.update_state_locked(&mut shared, state, error);
                }
            }
        }
    }

    fn reset_transport(&mut self) {
        if self.ac.shutdown.is_cancelled() {
            return;
        }
        let (addrs, backoff_for) = {
            let shared = self.ac.shared.lock();
            (
                shared.addrs.clone(),
                self.ac.config.backoff.backoff(shared.backoff_idx),
            )
        };
        // Slow attempts still get a reasonable window, and repeated failures
        // never shrink it below the backoff.
        let dial_duration = backoff_for.max(self.ac.config.min_connect_timeout);
        self.backoff_for = backoff_for;
        self.ac.update_state(ConnectivityState::Connecting, None);

        self.attempt += 1;
        let cancel = self.ac.shutdown.child_token();
        self.attempt_cancel = Some(cancel.clone());
        let ac = self.ac.clone();
        let attempt = self.attempt;
        let _ = self.ac.config.runtime.spawn(Box::pin(ac.try_all_addrs(
            addrs,
            dial_duration,
            cancel,
            attempt,
        )));
    }

    fn attempt_finished(
        &mut self,
        attempt: u64,
        result: Result<(Address, ConnectedTransport), Error>,
    ) {
        if attempt != self.attempt || self.ac.shutdown.is_cancelled() {
            if let Ok((_, conn)) = result {
                conn.transport.close(&Error::ConnClosing);
            }
            return;
        }
        self.attempt_cancel = None;
        match result {
            Ok((addr, mut conn)) => {
                let closed_early = matches!(
                    conn.events.try_recv(),
                    Ok(_) | Err(TryRecvError::Disconnected)
                );
                let mut shared = self.ac.shared.lock();
                shared.backoff_idx = 0;
                if closed_early {
                    // The connection was established but is already gone.
                    // This still counts as a success.
                    debug!(subchannel = self.ac.id, address = %addr, "transport closed before it was used");
                    self.ac
                        .update_state_locked(&mut shared, ConnectivityState::Idle, None);
                    drop(shared);
                    self.resolve_now();
                    return;
                }
                debug!(subchannel = self.ac.id, address = %addr, "connected");
                shared.cur_addr = Some(addr);
                shared.transport = Some(conn.transport);
                shared.transport_gen += 1;
                let generation = shared.transport_gen;
                drop(shared);
                self.transport_events = Some(conn.events);
                self.start_health_check(generation);
            }
            Err(err) => {
                // The address list may be stale.
                self.resolve_now();
                self.ac
                    .update_state(ConnectivityState::TransientFailure, Some(err));
                self.backoff = Some(self.ac.config.runtime.sleep(self.backoff_for));
            }
        }
    }

    fn on_backoff_done(&mut self, reset: bool) {
        self.backoff = None;
        let mut shared = self.ac.shared.lock();
        if !reset {
            shared.backoff_idx += 1;
        }
        if shared.state == ConnectivityState::TransientFailure {
            self.ac
                .update_state_locked(&mut shared, ConnectivityState::Idle, None);
        }
    }

    fn update_addrs(&mut self, addrs: Vec<Address>) {
        let mut shared = self.ac.shared.lock();
        let changed = shared.addrs != addrs;
        // Keep the latest attributes even when the endpoints are unchanged.
        shared.addrs = addrs;
        if !changed {
            return;
        }
        debug!(subchannel = self.ac.id, addrs = ?shared.addrs, "updating addresses");
        match shared.state {
            ConnectivityState::Shutdown
            | ConnectivityState::TransientFailure
            | ConnectivityState::Idle => return,
            ConnectivityState::Ready => {
                if let Some(cur) = &shared.cur_addr {
                    if shared.addrs.contains(cur) {
                        return;
                    }
                }
            }
            ConnectivityState::Connecting => {}
        }

        // Connecting, or connected to an address that was removed: abandon
        // the attempt or connection and start over with the new list.
        let old = shared.transport.take();
        shared.cur_addr = None;
        shared.transport_gen += 1;
        let empty = shared.addrs.is_empty();
        if empty {
            self.ac
                .update_state_locked(&mut shared, ConnectivityState::Idle, None);
        }
        drop(shared);

        self.attempt += 1;
        if let Some(cancel) = self.attempt_cancel.take() {
            cancel.cancel();
        }
        self.stop_transport_watch();
        if let Some(t) = old {
            t.graceful_close();
        }
        if !empty {
            self.reset_transport();
        }
    }

    fn on_transport_event(&mut self, ev: TransportEvent) {
        debug!(subchannel = self.ac.id, event = ?ev, "transport event");
        if let TransportEvent::GoAway(GoAwayReason::TooManyPings) = ev {
            if let Some(cc) = self.ac.cc.upgrade() {
                cc.adjust_keepalive();
            }
        }
        self.stop_transport_watch();
        let mut shared = self.ac.shared.lock();
        if shared.state == ConnectivityState::Shutdown || shared.transport.is_none() {
            return;
        }
        // In-flight RPCs finish on the old transport; new ones wait for the
        // policy to decide whether to reconnect.
        shared.transport = None;
        shared.cur_addr = None;
        shared.transport_gen += 1;
        drop(shared);
        self.resolve_now();
        self.ac.update_state(ConnectivityState::Idle, None);
    }

    fn start_health_check(&mut self, generation: u64) {
        let Some((checker, service_name)) = self.health_check_params() else {
            self.ac.update_state(ConnectivityState::Ready, None);
            return;
        };
        debug!(subchannel = self.ac.id, service = %service_name, "starting health check");
        let cancel = self.ac.shutdown.child_token();
        self.health_cancel = Some(cancel.clone());
        let reporter = HealthReporter::new(&self.ac, generation);
        let _ = self.ac.config.runtime.spawn(Box::pin(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                r = checker.check(reporter.clone(), service_name) => r,
            };
            match result {
                Ok(()) => {}
                Err(status) if status.code() == Code::Unimplemented => {
                    error!(
                        "subchannel health check is unimplemented at server side, thus health check is disabled"
                    );
                    reporter.set_state(ConnectivityState::Ready, None);
                }
                Err(status) => error!(%status, "health checking failed"),
            }
        }));
    }

    /// Returns the checker and service name when every precondition for
    /// health checking holds.
    fn health_check_params(&self) -> Option<(Arc<dyn HealthChecker>, String)> {
        let config = &self.ac.config;
        if config.disable_health_check {
            return None;
        }
        let service_name = self.ac.cc.upgrade()?.health_check_service()?;
        if !config.health_check_enabled {
            return None;
        }
        match &config.health_checker {
            Some(checker) => Some((checker.clone(), service_name)),
            None => {
                error!("health check is requested but health checker is not set");
                None
            }
        }
    }

    fn stop_transport_watch(&mut self) {
        self.transport_events = None;
        if let Some(cancel) = self.health_cancel.take() {
            cancel.cancel();
        }
    }

    fn resolve_now(&self) {
        if let Some(cc) = self.ac.cc.upgrade() {
            cc.resolve_now_internal();
        }
    }

    /// Releases everything still owned by the loop after tear down.
    fn stop(mut self) {
        self.rx.close();
        while let Ok(ev) = self.rx.try_recv() {
            if let Event::AttemptFinished {
                result: Ok((_, conn)),
                ..
            } = ev
            {
                conn.transport.close(&Error::ConnClosing);
            }
        }
        self.stop_transport_watch();
        self.backoff = None;
        trace!(subchannel = self.ac.id, "subchannel event loop stopped");
    }
}

async fn next_transport_event(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> TransportEvent {
    match rx {
        Some(rx) => rx.recv().await.unwrap_or(TransportEvent::Closed(None)),
        None => std::future::pending().await,
    }
}

async fn wait_backoff(sleep: &mut Option<Pin<Box<dyn Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
