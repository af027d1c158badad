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

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::backoff::{Backoff, ExponentialBackoff};
use super::health::HealthChecker;
use super::load_balancing::{self, LbPolicyRegistry};
use super::name_resolution::{self, ResolverBuilder, ResolverRegistry, passthrough};
use super::transport::Transport;
use crate::rt::GrpcRuntime;

const DEFAULT_MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Configures how a [`ClientConn`] connects to its target.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use grpc_channel::client::{ClientConn, DialOptions};
/// # fn connector() -> Arc<dyn grpc_channel::client::transport::Transport> { unimplemented!() }
/// let options = DialOptions::new()
///     .with_transport(connector())
///     .with_min_connect_timeout(Duration::from_secs(5))
///     .with_default_service_config(r#"{"loadBalancingConfig": [{"round_robin": {}}]}"#);
/// let cc = ClientConn::dial("passthrough:///localhost:50051", options)?;
/// # Ok::<(), grpc_channel::Error>(())
/// ```
///
/// [`ClientConn`]: crate::client::ClientConn
#[derive(Clone)]
pub struct DialOptions {
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) backoff: Arc<dyn Backoff>,
    pub(crate) min_connect_timeout: Duration,
    pub(crate) authority: Option<String>,
    pub(crate) default_service_config: Option<String>,
    pub(crate) disable_service_config: bool,
    pub(crate) disable_health_check: bool,
    pub(crate) health_checker: Option<Arc<dyn HealthChecker>>,
    pub(crate) keepalive_time: Option<Duration>,
    pub(crate) resolvers: Vec<Arc<dyn ResolverBuilder>>,
    pub(crate) resolver_registry: Arc<ResolverRegistry>,
    pub(crate) lb_registry: Arc<LbPolicyRegistry>,
    pub(crate) default_scheme: String,
    pub(crate) runtime: GrpcRuntime,
    pub(crate) return_last_error: bool,
}

impl DialOptions {
    #[cfg(feature = "_runtime-tokio")]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the default options with tasks and timers driven by
    /// `runtime`. Unlike [`Self::new`], this is available without the
    /// built-in tokio runtime.
    pub fn with_runtime_defaults(runtime: GrpcRuntime) -> Self {
        DialOptions {
            transport: None,
            backoff: Arc::new(ExponentialBackoff::default()),
            min_connect_timeout: DEFAULT_MIN_CONNECT_TIMEOUT,
            authority: None,
            default_service_config: None,
            disable_service_config: false,
            disable_health_check: false,
            health_checker: None,
            keepalive_time: None,
            resolvers: Vec::new(),
            resolver_registry: name_resolution::global_registry(),
            lb_registry: load_balancing::global_registry(),
            default_scheme: passthrough::SCHEME.to_string(),
            runtime,
            return_last_error: false,
        }
    }

    /// Sets the connector used to establish transports. Dialing fails
    /// without one.
    pub fn with_transport(self, transport: Arc<dyn Transport>) -> Self {
        DialOptions {
            transport: Some(transport),
            ..self
        }
    }

    /// Sets the strategy for the delay between connection attempts.
    ///
    /// Defaults to exponential backoff starting at 1 second, growing by a
    /// factor of 1.6 with 20% jitter, capped at 120 seconds.
    pub fn with_backoff(self, backoff: Arc<dyn Backoff>) -> Self {
        DialOptions { backoff, ..self }
    }

    /// Sets the shortest time a connection attempt is given, regardless of
    /// the current backoff. Defaults to 20 seconds.
    pub fn with_min_connect_timeout(self, min_connect_timeout: Duration) -> Self {
        DialOptions {
            min_connect_timeout,
            ..self
        }
    }

    /// Overrides the authority used for every connection.
    pub fn with_authority(self, authority: impl Into<String>) -> Self {
        DialOptions {
            authority: Some(authority.into()),
            ..self
        }
    }

    /// Sets the service config used when the resolver provides none. The
    /// JSON is validated when dialing.
    pub fn with_default_service_config(self, json: impl Into<String>) -> Self {
        DialOptions {
            default_service_config: Some(json.into()),
            ..self
        }
    }

    /// Ignores service configs provided by the resolver.
    pub fn with_disable_service_config(self, disable: bool) -> Self {
        DialOptions {
            disable_service_config: disable,
            ..self
        }
    }

    pub fn with_disable_health_check(self, disable: bool) -> Self {
        DialOptions {
            disable_health_check: disable,
            ..self
        }
    }

    /// Sets the implementation of the health-checking protocol.
    pub fn with_health_checker(self, checker: Arc<dyn HealthChecker>) -> Self {
        DialOptions {
            health_checker: Some(checker),
            ..self
        }
    }

    /// Enables client keepalive pings at this interval. The interval is
    /// doubled once a server complains about too many pings.
    pub fn with_keepalive_time(self, keepalive_time: Duration) -> Self {
        DialOptions {
            keepalive_time: Some(keepalive_time),
            ..self
        }
    }

    /// Adds a resolver consulted before the registry.
    pub fn with_resolver(mut self, builder: Arc<dyn ResolverBuilder>) -> Self {
        self.resolvers.push(builder);
        self
    }

    pub fn with_resolver_registry(self, registry: Arc<ResolverRegistry>) -> Self {
        DialOptions {
            resolver_registry: registry,
            ..self
        }
    }

    pub fn with_lb_registry(self, registry: Arc<LbPolicyRegistry>) -> Self {
        DialOptions {
            lb_registry: registry,
            ..self
        }
    }

    /// Sets the scheme applied to targets without a usable one. Defaults to
    /// `passthrough`.
    pub fn with_default_scheme(self, scheme: impl Into<String>) -> Self {
        DialOptions {
            default_scheme: scheme.into(),
            ..self
        }
    }

    pub fn with_runtime(self, runtime: GrpcRuntime) -> Self {
        DialOptions { runtime, ..self }
    }

    /// Makes a failed blocking connect report the most recent connection
    /// error instead of the context error.
    pub fn with_return_last_error(self, return_last_error: bool) -> Self {
        DialOptions {
            return_last_error,
            ..self
        }
    }

    /// Finds the resolver for `scheme`, preferring the ones given to
    /// [`Self::with_resolver`].
    pub(crate) fn resolver_builder(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.resolvers
            .iter()
            .find(|b| b.scheme().eq_ignore_ascii_case(scheme))
            .cloned()
            .or_else(|| self.resolver_registry.get(scheme))
    }
}

#[cfg(feature = "_runtime-tokio")]
impl Default for DialOptions {
    fn default() -> Self {
        Self::with_runtime_defaults(crate::rt::default_runtime())
    }
}

impl fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialOptions")
            .field("transport", &self.transport.is_some())
            .field("min_connect_timeout", &self.min_connect_timeout)
            .field("authority", &self.authority)
            .field("default_service_config", &self.default_service_config)
            .field("disable_service_config", &self.disable_service_config)
            .field("disable_health_check", &self.disable_health_check)
            .field("keepalive_time", &self.keepalive_time)
            .field("default_scheme", &self.default_scheme)
            .field("return_last_error", &self.return_last_error)
            .finish_non_exhaustive()
    }
}
