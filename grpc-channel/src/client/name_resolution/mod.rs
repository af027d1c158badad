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

//! Name Resolution for gRPC.
//!
//! Name Resolution is the process by which a channel's target is converted into
//! network addresses used by the channel to connect to a service. Resolvers are
//! selected by the scheme of the target and push their results to the channel
//! through a [`ResolverController`].

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use url::Url;

use super::service_config::{ConfigSelector, ServiceConfig};
use crate::attributes::Attributes;
use crate::error::Error;
use crate::rt::GrpcRuntime;

pub mod manual;
pub mod passthrough;
mod registry;

pub use registry::{ResolverRegistry, global_registry};

/// Target represents a target for gRPC, as specified in:
/// https://github.com/grpc/grpc/blob/master/doc/naming.md.
/// It is parsed from the target string that gets passed during channel creation
/// by the user. gRPC passes it to the resolver and the balancer.
///
/// If the target follows the naming spec, and the parsed scheme is registered
/// with gRPC, we will parse the target string according to the spec. If the
/// target does not contain a scheme or if the parsed scheme is not registered
/// (i.e. no corresponding resolver available to resolve the endpoint), the
/// channel applies the default scheme and reparses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    url: Url,
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Url>() {
            Ok(url) => Ok(Target { url }),
            Err(err) => Err(err.to_string()),
        }
    }
}

impl From<Url> for Target {
    fn from(url: Url) -> Self {
        Target { url }
    }
}

impl Target {
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// The host part of the authority.
    pub fn authority_host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    /// The port part of the authority.
    pub fn authority_port(&self) -> Option<u16> {
        self.url.port()
    }

    /// Returns either host:port or host depending on the existence of the port
    /// in the authority.
    pub fn authority_host_port(&self) -> String {
        let host = self.authority_host();
        match self.authority_port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// The endpoint to resolve: the percent-decoded path of the target
    /// without its leading slash.
    pub fn endpoint(&self) -> Cow<'_, str> {
        let path = self.url.path();
        let path = path.strip_prefix('/').unwrap_or(path);
        percent_decode_str(path).decode_utf8_lossy()
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// A name resolver factory that produces Resolver instances used by the channel
/// to resolve network addresses for the target URI.
pub trait ResolverBuilder: Send + Sync {
    /// Builds a name resolver instance.
    ///
    /// An error fails channel creation, or the exit from idle mode that
    /// triggered the build.
    fn build(&self, target: &Target, options: ResolverOptions) -> Result<Box<dyn Resolver>, String>;

    /// Reports the URI scheme handled by this name resolver.
    fn scheme(&self) -> &str;

    /// Returns the default authority for a channel using this name resolver
    /// and target. This refers to the *dataplane authority*, the value used
    /// in the `:authority` header of HTTP/2 requests.
    ///
    /// By default, this method returns the endpoint of the target URI.
    fn default_authority(&self, target: &Target) -> String {
        target.endpoint().to_string()
    }
}

/// A collection of data configured on the channel that is constructing this
/// name resolver.
#[non_exhaustive]
pub struct ResolverOptions {
    /// The authority that will be used for the channel by default.
    pub authority: String,

    /// Whether the channel ignores service configs from the resolver, in which
    /// case the resolver need not fetch them.
    pub disable_service_config: bool,

    /// The runtime which provides utilities to do async work.
    pub runtime: GrpcRuntime,

    /// A hook into the channel's work serializer that allows the Resolver to
    /// request the ability to perform operations on the ResolverController.
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

/// Used to asynchronously request a call into a work method.
pub trait WorkScheduler: Send + Sync {
    /// Schedules a call into the work method. Calls are serialized with every
    /// other resolver and load balancing policy callback of the channel.
    fn schedule_work(&self);
}

/// Resolver watches for the updates on the specified target.
/// Updates include address updates and service config updates.
pub trait Resolver: Send {
    /// Asks the resolver to obtain an updated resolver result, if applicable.
    ///
    /// The implementation is not required to re-resolve immediately upon
    /// receiving this call; it may instead elect to delay based on some
    /// configured minimum time between queries. Concurrent requests are
    /// coalesced by the resolver.
    fn resolve_now(&mut self);

    /// Called serially by the channel to provide access to the
    /// `ResolverController`.
    fn work(&mut self, controller: &mut dyn ResolverController);
}

/// The `ResolverController` trait provides the resolver with functionality
/// to interact with the channel.
pub trait ResolverController: Send {
    /// Notifies the channel about the current state of the name resolver.  If
    /// an error is returned, the name resolver should attempt to re-resolve,
    /// if possible, applying its own backoff.
    fn update(&mut self, update: ResolverUpdate) -> Result<(), Error>;

    /// Notifies the channel that resolution failed. The channel keeps its
    /// last known configuration and forwards the error to the load balancing
    /// policy.
    fn report_error(&mut self, error: String);

    /// Parses the provided JSON service config.
    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, String>;
}

/// ResolverUpdate contains the current Resolver state relevant to the
/// channel.
#[derive(Clone, Default)]
#[non_exhaustive]
pub struct ResolverUpdate {
    /// Attributes contains arbitrary data about the resolver intended for
    /// consumption by the load balancing policy.
    pub attributes: Attributes,

    /// The resolved addresses for the target.
    pub addresses: Vec<Address>,

    /// The service config which the client should use for communicating with
    /// the service. `None` indicates no service config is present or the
    /// resolver does not provide service configs.
    pub service_config: Option<Result<Arc<ServiceConfig>, String>>,

    /// Overrides per-call config selection. When unset the channel selects
    /// method configs from `service_config`.
    pub config_selector: Option<Arc<dyn ConfigSelector>>,

    /// An optional human-readable note describing context about the
    /// resolution, such as "no DNS entries found for <name>".
    pub resolution_note: Option<String>,
}

impl ResolverUpdate {
    pub fn new(addresses: Vec<Address>) -> Self {
        ResolverUpdate {
            addresses,
            ..Default::default()
        }
    }

    pub fn with_service_config(mut self, config: Result<ServiceConfig, String>) -> Self {
        self.service_config = Some(config.map(Arc::new));
        self
    }

    pub fn with_config_selector(mut self, selector: Arc<dyn ConfigSelector>) -> Self {
        self.config_selector = Some(selector);
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

impl fmt::Debug for ResolverUpdate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverUpdate")
            .field("attributes", &self.attributes)
            .field("addresses", &self.addresses)
            .field("service_config", &self.service_config)
            .field("config_selector", &self.config_selector.is_some())
            .field("resolution_note", &self.resolution_note)
            .finish()
    }
}

/// An Address is an identifier that indicates how to connect to a server.
///
/// Two addresses are equal when they name the same server and authority.
/// Their attributes do not take part in the comparison, so a resolver that
/// only changes attributes does not disturb existing connections.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Address {
    /// The address itself is passed to the transport in order to create a
    /// connection to it, typically "host:port".
    pub address: String,

    /// Overrides the authority used when connecting to this address.
    pub server_name: Option<String>,

    /// Attributes contains arbitrary data about this address intended for
    /// consumption by the load balancing policy.
    pub attributes: Attributes,
}

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Address {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.server_name == other.server_name
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.server_name.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}
