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

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use super::ConnectivityState;
use super::balancer_wrapper::BalancerWrapper;
use super::connectivity::ConnectivityStateManager;
use super::load_balancing::{
    DoneInfo, FailingPicker, LbState, NewSubchannelOptions, PickInfo, Subchannel,
    SubchannelState,
};
use super::name_resolution::{
    Address, ResolverBuilder, ResolverOptions, ResolverUpdate, Target,
};
use super::options::DialOptions;
use super::picker_wrapper::{DoneCallback, PickerWrapper};
use super::resolver_wrapper::{self, ResolverWorkScheduler, ResolverWrapper};
use super::retry_throttler::RetryThrottler;
use super::service_config::{ConfigSelector, DefaultConfigSelector, MethodConfig, ServiceConfig};
use super::subchannel::{AddrConn, SubchannelConfig};
use super::transport::{ClientTransport, Transport};
use super::work_serializer::WorkSerializer;
use crate::context::CallContext;
use crate::error::{Error, Result};


/// A virtual connection to a target.
///
/// A `ClientConn` resolves its target through a name resolver, lets a load
/// balancing policy open subchannels to the resolved addresses, and routes
/// RPCs to whichever subchannel the policy picks. Connections are
/// re-established in the background as long as the channel is not closed.
///
/// Clones refer to the same channel. [`ClientConn::close`] must be called to
/// release its resources.
#[derive(Clone)]
pub struct ClientConn {
    inner: Arc<ClientConnInner>,
}

/// The state only touched from the channel's work serializer.
pub(crate) struct ChannelWork {
    pub(crate) resolver: Option<ResolverWrapper>,
    pub(crate) balancer: BalancerWrapper,
    /// Set when a resolver asked for work before it was installed.
    pub(crate) pending_resolver_work: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IdleState {
    /// The resolver and policy are running.
    Active,
    /// Neither resolver nor policy exist.
    Idle,
    /// Leaving idle mode is in progress; other transitions wait for it.
    ExitingIdle,
}

struct Mu {
    /// `None` once the channel is closed.
    conns: Option<HashMap<u64, Subchannel>>,
    /// The service config in effect, if one was applied.
    sc: Option<Arc<ServiceConfig>>,
    keepalive_time: Option<Duration>,
    last_connection_error: Option<Error>,
}

pub(crate) struct ClientConnInner {
    target: String,
    parsed_target: Target,
    authority: String,
    options: DialOptions,
    transport: Arc<dyn Transport>,
    resolver_builder: Arc<dyn ResolverBuilder>,
    default_service_config: Option<Arc<ServiceConfig>>,

    serializer: WorkSerializer<ChannelWork>,
    picker_wrapper: PickerWrapper,
    cs_mgr: ConnectivityStateManager,
    /// Canceled by close; parent of every subchannel's token.
    shutdown: CancellationToken,
    /// Canceled once the resolver has reported for the first time.
    first_resolve: CancellationToken,
    resolver_generation: AtomicU64,

    mu: Mutex<Mu>,
    idle: Mutex<IdleState>,
    idle_cv: Condvar,

    config_selector: ArcSwap<Arc<dyn ConfigSelector>>,
    retry_throttler: ArcSwapOption<RetryThrottler>,
}

impl ClientConn {
    /// Creates a channel to `target` and starts resolving it.
    ///
    /// Dialing does not wait for a connection; use [`ClientConn::connect`]
    /// for that. It fails if no transport is configured, the target cannot
    /// be resolved by any registered resolver, the default service config is
    /// invalid, or the resolver cannot be built.
    pub fn dial(target: &str, options: DialOptions) -> Result<ClientConn> {
        let transport = options.transport.clone().ok_or(Error::NoTransport)?;
        options.resolver_registry.freeze();
        options.lb_registry.freeze();

        let (parsed_target, resolver_builder) = parse_target(target, &options)?;
        let authority = determine_authority(&parsed_target, resolver_builder.as_ref(), &options);
        let default_service_config = match &options.default_service_config {
            Some(json) => Some(Arc::new(
                ServiceConfig::parse(json, &options.lb_registry)
                    .map_err(Error::InvalidDefaultServiceConfig)?,
            )),
            None => None,
        };

        let shutdown = CancellationToken::new();
        let serializer = WorkSerializer::new(
            ChannelWork {
                resolver: None,
                balancer: BalancerWrapper::new(),
                pending_resolver_work: None,
            },
            &options.runtime,
            shutdown.clone(),
        );
        let empty: Arc<dyn ConfigSelector> = Arc::new(DefaultConfigSelector {
            sc: Arc::new(ServiceConfig::default()),
        });
        let keepalive_time = options.keepalive_time;
        let inner = Arc::new(ClientConnInner {
            target: target.to_string(),
            parsed_target,
            authority,
            options,
            transport,
            resolver_builder,
            default_service_config,
            serializer,
            picker_wrapper: PickerWrapper::new(),
            cs_mgr: ConnectivityStateManager::new(),
            shutdown,
            first_resolve: CancellationToken::new(),
            resolver_generation: AtomicU64::new(0),
            mu: Mutex::new(Mu {
                conns: Some(HashMap::new()),
                sc: None,
                keepalive_time,
                last_connection_error: None,
            }),
            idle: Mutex::new(IdleState::Idle),
            idle_cv: Condvar::new(),
            config_selector: ArcSwap::from_pointee(empty),
            retry_throttler: ArcSwapOption::empty(),
        });
        info!(target, parsed = %inner.parsed_target, authority = %inner.authority, "channel created");

        if let Err(err) = inner.exit_idle() {
            let _ = inner.close();
            return Err(err);
        }
        Ok(ClientConn { inner })
    }

    /// Dials `target` and waits until the channel is READY.
    ///
    /// If `ctx` ends first the channel is closed and the context error is
    /// returned, or the most recent connection error when the options ask for
    /// it.
    pub async fn connect(target: &str, options: DialOptions, ctx: &CallContext) -> Result<ClientConn> {
        let return_last_error = options.return_last_error;
        let cc = Self::dial(target, options)?;
        loop {
            let state = cc.state();
            match state {
                ConnectivityState::Ready => return Ok(cc),
                ConnectivityState::Idle => cc.connect_now(),
                ConnectivityState::Shutdown => return Err(Error::ClientConnClosing),
                _ => {}
            }
            if !cc.wait_for_state_change(ctx, state).await {
                let last = cc.last_connection_error();
                let _ = cc.close();
                return Err(match last {
                    Some(err) if return_last_error => err,
                    _ => ctx.err().unwrap_or(Error::Canceled),
                });
            }
        }
    }

    /// Closes the channel. Every pending and future pick fails, and every
    /// subchannel is shut down.
    ///
    /// Returns [`Error::ClientConnClosing`] if the channel was already closed.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// The channel's aggregate connectivity state.
    pub fn state(&self) -> ConnectivityState {
        self.inner.cs_mgr.get_state()
    }

    /// Waits until the state differs from `source`. Returns false if `ctx`
    /// ends first.
    pub async fn wait_for_state_change(&self, ctx: &CallContext, source: ConnectivityState) -> bool {
        self.inner.cs_mgr.wait_for_state_change(ctx, source).await
    }

    /// Returns a receiver that observes every connectivity state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.cs_mgr.subscribe()
    }

    /// Wakes every subchannel waiting out a reconnect backoff so that it may
    /// reconnect right away, and restarts the backoff sequence.
    pub fn reset_connect_backoff(&self) {
        let conns: Vec<Subchannel> = match &self.inner.mu.lock().conns {
            Some(conns) => conns.values().cloned().collect(),
            None => return,
        };
        for sc in conns {
            sc.addr_conn().reset_backoff();
        }
    }

    /// Leaves idle mode and asks the load balancing policy to connect.
    pub fn connect_now(&self) {
        if self.inner.exit_idle().is_err() {
            return;
        }
        let cc = self.inner.clone();
        self.inner.schedule(move |work| work.balancer.exit_idle(&cc));
    }

    /// Asks the resolver to re-resolve the target.
    pub fn resolve_now(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(Error::ClientConnClosing);
        }
        self.inner.resolve_now_internal();
        Ok(())
    }

    /// Shuts down the resolver, the policy and every subchannel while
    /// keeping the channel usable. The next RPC or [`Self::exit_idle_mode`]
    /// brings them back.
    pub fn enter_idle_mode(&self) -> Result<()> {
        self.inner.enter_idle()
    }

    pub fn exit_idle_mode(&self) -> Result<()> {
        self.inner.exit_idle()
    }

    /// The configuration for `method` ("/service/method") under the current
    /// service config.
    pub fn method_config(&self, method: &str) -> std::result::Result<MethodConfig, Status> {
        self.inner.config_selector.load().select_config(method)
    }

    /// The service config in effect, if one has been applied.
    pub fn service_config(&self) -> Option<Arc<ServiceConfig>> {
        self.inner.mu.lock().sc.clone()
    }

    /// The retry throttler configured by the current service config.
    pub fn retry_throttler(&self) -> Option<Arc<RetryThrottler>> {
        self.inner.retry_throttler.load_full()
    }

    /// The most recent error from connecting to any address.
    pub fn last_connection_error(&self) -> Option<Error> {
        self.inner.mu.lock().last_connection_error.clone()
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// The authority used by connections without a per-address override.
    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    /// Sends a unary request for `method` on a transport chosen by the load
    /// balancing policy.
    ///
    /// The method config's timeout bounds the call, and `wait_for_ready`
    /// overrides the method config's wait-for-ready setting.
    pub async fn invoke(
        &self,
        ctx: &CallContext,
        method: &str,
        request: Bytes,
        wait_for_ready: Option<bool>,
    ) -> Result<Bytes> {
        let mc = self.method_config(method)?;
        let ctx = match mc.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };
        let wait_for_ready = wait_for_ready.or(mc.wait_for_ready).unwrap_or(false);
        let info = PickInfo {
            method: method.to_string(),
        };
        let (transport, done) = self.inner.pick(&ctx, !wait_for_ready, &info).await?;

        let result = tokio::select! {
            r = transport.call(method, request) => r,
            err = ctx.done() => Err(Status::from(err)),
        };
        if let Some(done) = done {
            done(&DoneInfo {
                error: result.as_ref().err().cloned(),
            });
        }
        if let Some(throttler) = self.retry_throttler() {
            match &result {
                Ok(_) => throttler.successful_rpc(),
                Err(status) => {
                    let retryable = mc
                        .retry_policy
                        .as_ref()
                        .is_some_and(|p| p.retryable_status_codes.contains(&status.code()));
                    if retryable {
                        throttler.throttle();
                    }
                }
            }
        }
        result.map_err(Error::from)
    }

    #[cfg(test)]
    pub(crate) async fn pick(
        &self,
        ctx: &CallContext,
        fail_fast: bool,
        info: &PickInfo,
    ) -> Result<(Arc<dyn ClientTransport>, Option<DoneCallback>)> {
        self.inner.pick(ctx, fail_fast, info).await
    }
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("target", &self.inner.target)
            .field("authority", &self.inner.authority)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientConnInner {
    pub(crate) fn schedule(&self, work: impl FnOnce(&mut ChannelWork) + Send + 'static) -> bool {
        self.serializer.schedule(work)
    }

    pub(crate) fn lb_registry(&self) -> &super::load_balancing::LbPolicyRegistry {
        &self.options.lb_registry
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.mu.lock().conns.is_none()
    }

    fn exit_idle(self: &Arc<Self>) -> Result<()> {
        let mut idle = self.wait_for_idle_transition();
        if *idle == IdleState::Active {
            return Ok(());
        }
        if self.is_closed() {
            return Err(Error::ClientConnClosing);
        }
        *idle = IdleState::ExitingIdle;
        drop(idle);

        let result = self.start_resolver();

        let mut idle = self.idle.lock();
        *idle = if result.is_ok() {
            IdleState::Active
        } else {
            IdleState::Idle
        };
        self.idle_cv.notify_all();
        result
    }

    // The policy is reopened before the resolver is installed, so the first
    // resolver update finds it ready.
    fn start_resolver(self: &Arc<Self>) -> Result<()> {
        self.schedule(|work| work.balancer.exit_idle_mode());

        let generation = self.resolver_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let options = ResolverOptions {
            authority: self.authority.clone(),
            disable_service_config: self.options.disable_service_config,
            runtime: self.options.runtime.clone(),
            work_scheduler: Arc::new(ResolverWorkScheduler {
                cc: Arc::downgrade(self),
                generation,
            }),
        };
        let resolver = self
            .resolver_builder
            .build(&self.parsed_target, options)
            .map_err(|err| {
                warn!(target = %self.parsed_target, %err, "failed to build resolver");
                Error::ResolverBuild(err)
            })?;
        let cc = self.clone();
        self.schedule(move |work| {
            resolver_wrapper::install(work, &cc, ResolverWrapper::new(resolver, generation))
        });
        info!(target = %self.target, "channel exited idle mode");
        Ok(())
    }

    fn enter_idle(self: &Arc<Self>) -> Result<()> {
        let mut idle = self.wait_for_idle_transition();
        if self.is_closed() {
            return Err(Error::ClientConnClosing);
        }
        if *idle == IdleState::Idle {
            return Ok(());
        }
        *idle = IdleState::Idle;
        self.cs_mgr.update_state(ConnectivityState::Idle);
        self.picker_wrapper.reset();
        let cc = self.clone();
        self.schedule(move |work| {
            resolver_wrapper::shutdown(work);
            work.balancer.close(&cc, Error::ConnIdling);
            // Anything published by the old policy before it was closed is
            // discarded.
            cc.picker_wrapper.reset();
            cc.cs_mgr.update_state(ConnectivityState::Idle);
        });
        drop(idle);
        info!(target = %self.target, "channel entered idle mode");
        Ok(())
    }

    fn wait_for_idle_transition(&self) -> MutexGuard<'_, IdleState> {
        let mut idle = self.idle.lock();
        while *idle == IdleState::ExitingIdle {
            self.idle_cv.wait(&mut idle);
        }
        idle
    }

    fn close(self: &Arc<Self>) -> Result<()> {
        drop(self.wait_for_idle_transition());
        let Some(conns) = self.mu.lock().conns.take() else {
            return Err(Error::ClientConnClosing);
        };
        self.cs_mgr.update_state(ConnectivityState::Shutdown);
        self.picker_wrapper.close();

        let cc = self.clone();
        self.schedule(move |work| {
            work.balancer.close(&cc, Error::ClientConnClosing);
            resolver_wrapper::shutdown(work);
        });
        for sc in conns.into_values() {
            sc.addr_conn().tear_down(Error::ClientConnClosing);
        }
        self.shutdown.cancel();
        info!(target = %self.target, "channel closed");
        Ok(())
    }

    async fn wait_for_resolved_addrs(&self, ctx: &CallContext) -> Result<()> {
        if self.first_resolve.is_cancelled() {
            return Ok(());
        }
        tokio::select! {
            _ = self.first_resolve.cancelled() => Ok(()),
            _ = self.shutdown.cancelled() => Err(Error::ClientConnClosing),
            err = ctx.done() => Err(err),
        }
    }

    async fn pick(
        self: &Arc<Self>,
        ctx: &CallContext,
        fail_fast: bool,
        info: &PickInfo,
    ) -> Result<(Arc<dyn ClientTransport>, Option<DoneCallback>)> {
        self.exit_idle()?;
        self.wait_for_resolved_addrs(ctx).await?;
        self.picker_wrapper.pick(ctx, fail_fast, info).await
    }

    /// Applies an update or error from the resolver.
    ///
    /// The channel lock is held only while the service config is chosen and
    /// published; the policy is called after it is released.
    pub(crate) fn update_resolver_state(
        self: &Arc<Self>,
        result: std::result::Result<ResolverUpdate, String>,
        balancer: &mut BalancerWrapper,
    ) -> Result<()> {
        let _first_resolve = self.first_resolve.clone().drop_guard();
        let mut mu = self.mu.lock();
        if mu.conns.is_none() {
            return Ok(());
        }

        let update = match result {
            Ok(update) => update,
            Err(err) => {
                let name = self.apply_default_service_config(&mut mu);
                drop(mu);
                balancer.switch_to(self, &name);
                balancer.resolver_error(self, err);
                return Err(Error::BadResolverState);
            }
        };

        let mut ret = Ok(());
        let name = match (&update.service_config, self.options.disable_service_config) {
            (Some(_), true) => {
                debug!("ignoring service config from resolver; service config is disabled");
                self.apply_default_service_config(&mut mu)
            }
            (None, _) => self.apply_default_service_config(&mut mu),
            (Some(Ok(sc)), false) => {
                let selector = match &update.config_selector {
                    Some(selector) => selector.clone(),
                    None => Arc::new(DefaultConfigSelector { sc: sc.clone() }),
                };
                self.apply_service_config(&mut mu, sc.clone(), Some(selector))
            }
            (Some(Err(err)), false) => {
                warn!(%err, "resolver returned an invalid service config");
                ret = Err(Error::BadResolverState);
                if mu.sc.is_none() {
                    // Nothing valid has been seen yet, so fail RPCs with the
                    // parse error.
                    drop(mu);
                    self.update_picker_state(LbState {
                        connectivity_state: ConnectivityState::TransientFailure,
                        picker: Arc::new(FailingPicker {
                            status: Status::unavailable(format!(
                                "error parsing service config: {err}"
                            )),
                        }),
                    });
                    return ret;
                }
                mu.sc
                    .as_ref()
                    .map(|sc| sc.lb_policy_name().to_string())
                    .unwrap_or_default()
            }
        };
        let lb_config = mu.sc.as_ref().and_then(|sc| sc.lb_config());
        drop(mu);

        balancer.switch_to(self, &name);
        let res = balancer.update_client_conn_state(self, update, lb_config.as_ref());
        ret.and(res)
    }

    /// Re-applies the current service config, or else the default one, or
    /// else an empty one. Returns the name of the policy it selects.
    fn apply_default_service_config(&self, mu: &mut Mu) -> String {
        if let Some(sc) = mu.sc.clone() {
            return self.apply_service_config(mu, sc, None);
        }
        let sc = self
            .default_service_config
            .clone()
            .unwrap_or_else(|| Arc::new(ServiceConfig::default()));
        let selector = Arc::new(DefaultConfigSelector { sc: sc.clone() });
        self.apply_service_config(mu, sc, Some(selector))
    }

    fn apply_service_config(
        &self,
        mu: &mut Mu,
        sc: Arc<ServiceConfig>,
        selector: Option<Arc<dyn ConfigSelector>>,
    ) -> String {
        let previous = mu.sc.replace(sc.clone());
        if let Some(selector) = selector {
            self.config_selector.store(Arc::new(selector));
        }
        // An unchanged throttling policy keeps its tokens.
        let unchanged = previous
            .as_ref()
            .is_some_and(|p| p.retry_throttling() == sc.retry_throttling());
        if !unchanged {
            self.retry_throttler
                .store(sc.retry_throttling().map(|p| Arc::new(RetryThrottler::new(p))));
        }
        sc.lb_policy_name().to_string()
    }

    /// Publishes the policy's picker and connectivity state.
    pub(crate) fn update_picker_state(&self, state: LbState) {
        self.picker_wrapper.update_picker(state.picker);
        self.cs_mgr.update_state(state.connectivity_state);
    }

    pub(crate) fn new_addr_conn(
        self: &Arc<Self>,
        addrs: Vec<Address>,
        options: NewSubchannelOptions,
    ) -> Result<Subchannel> {
        let mut mu = self.mu.lock();
        let Some(conns) = mu.conns.as_mut() else {
            return Err(Error::ClientConnClosing);
        };
        let config = SubchannelConfig {
            transport: self.transport.clone(),
            backoff: self.options.backoff.clone(),
            min_connect_timeout: self.options.min_connect_timeout,
            runtime: self.options.runtime.clone(),
            health_checker: self.options.health_checker.clone(),
            disable_health_check: self.options.disable_health_check,
            health_check_enabled: options.health_check_enabled,
        };
        let sc = AddrConn::new(Arc::downgrade(self), config, addrs, &self.shutdown);
        debug!(subchannel = sc.id(), addresses = ?sc.addresses(), "subchannel created");
        conns.insert(sc.id(), sc.clone());
        Ok(sc)
    }

    /// Forgets `sc` and shuts it down with `err`.
    pub(crate) fn remove_addr_conn(&self, sc: &Subchannel, err: Error) {
        if let Some(conns) = self.mu.lock().conns.as_mut() {
            conns.remove(&sc.id());
        }
        sc.addr_conn().tear_down(err);
    }

    pub(crate) fn resolve_now_internal(&self) {
        self.schedule(|work| {
            if let Some(resolver) = work.resolver.as_mut() {
                resolver.resolve_now();
            }
        });
    }

    /// Queues a subchannel state change for the policy. Never blocks on the
    /// channel lock, as subchannels call it while holding their own.
    pub(crate) fn handle_subchannel_state_change(
        self: &Arc<Self>,
        sc: Subchannel,
        state: SubchannelState,
    ) {
        let cc = self.clone();
        self.schedule(move |work| work.balancer.update_subchannel_state(&cc, &sc, &state));
    }

    pub(crate) fn update_connection_error(&self, err: Error) {
        self.mu.lock().last_connection_error = Some(err);
    }

    /// The authority for connections to `addr`.
    pub(crate) fn server_name(&self, addr: &Address) -> String {
        if let Some(authority) = &self.options.authority {
            return authority.clone();
        }
        match &addr.server_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.authority.clone(),
        }
    }

    pub(crate) fn keepalive_time(&self) -> Option<Duration> {
        self.mu.lock().keepalive_time
    }

    /// Doubles the configured keepalive interval after a server complained
    /// about too many pings.
    pub(crate) fn adjust_keepalive(&self) {
        let Some(configured) = self.options.keepalive_time else {
            return;
        };
        let doubled = configured.saturating_mul(2);
        let mut mu = self.mu.lock();
        if mu.keepalive_time.is_none_or(|cur| doubled > cur) {
            info!(keepalive_time = ?doubled, "server sent too_many_pings; increasing keepalive time");
            mu.keepalive_time = Some(doubled);
        }
    }

    /// The health-check service named by the current service config.
    pub(crate) fn health_check_service(&self) -> Option<String> {
        let mu = self.mu.lock();
        let sc = mu.sc.as_ref()?;
        sc.health_check_config().map(|hc| hc.service_name.clone())
    }
}

/// Parses `target`, falling back to the default scheme when it has no
/// scheme with a known resolver.
fn parse_target(
    target: &str,
    options: &DialOptions,
) -> Result<(Target, Arc<dyn ResolverBuilder>)> {
    if let Ok(parsed) = target.parse::<Target>() {
        if let Some(builder) = options.resolver_builder(parsed.scheme()) {
            return Ok((parsed, builder));
        }
    }
    let canonical = format!("{}:///{}", options.default_scheme, target);
    debug!(target, canonical, "target has no registered scheme; applying the default scheme");
    let parsed: Target = canonical.parse().map_err(|reason| Error::InvalidTarget {
        target: target.to_string(),
        reason,
    })?;
    let builder = options
        .resolver_builder(parsed.scheme())
        .ok_or_else(|| Error::NoResolver(parsed.scheme().to_string()))?;
    Ok((parsed, builder))
}

fn determine_authority(
    target: &Target,
    builder: &dyn ResolverBuilder,
    options: &DialOptions,
) -> String {
    if let Some(authority) = &options.authority {
        return authority.clone();
    }
    if target.scheme() == "unix" || target.scheme() == "unix-abstract" {
        return "localhost".to_string();
    }
    let endpoint = builder.default_authority(target);
    if endpoint.starts_with(':') {
        return format!("localhost{endpoint}");
    }
    encode_authority(&endpoint)
}

/// Percent-encodes the characters not allowed in a URI authority.
fn encode_authority(authority: &str) -> String {
    fn allowed(c: u8) -> bool {
        c.is_ascii_alphanumeric() || b"-_.~!$&'()*+,;=:[]@".contains(&c)
    }
    let mut out = String::with_capacity(authority.len());
    for &c in authority.as_bytes() {
        if allowed(c) {
            out.push(c as char);
        } else {
            out.push_str(&format!("%{c:02X}"));
        }
    }
    out
}
