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

//! Load balancing policies.
//!
//! A policy receives the resolver's addresses, creates [`Subchannel`]s for
//! them through a [`ChannelController`], and publishes [`Picker`]s that
//! route each RPC to one of its ready subchannels.

use std::error::Error;
use std::sync::Arc;

use serde_json::Value;
use tonic::{Status, metadata::MetadataMap};

use super::ConnectivityState;
use super::name_resolution::{Address, ResolverUpdate};
use super::service_config::LbConfig;
use crate::error::Error as ChannelError;

pub mod pick_first;
mod registry;
pub mod round_robin;
#[cfg(test)]
pub(crate) mod test_utils;

pub use super::name_resolution::WorkScheduler;
pub use super::subchannel::Subchannel;
pub use registry::{LbPolicyRegistry, global_registry};

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
#[non_exhaustive]
pub struct LbPolicyOptions {
    /// A hook into the channel's work serializer that allows the LbPolicy to
    /// request a call into its work method.
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's resolver_update method.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(&self, _config: &Value) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// All methods are called serially on the channel's work serializer. When the
/// policy is replaced or the channel goes idle the policy is dropped and the
/// channel removes every subchannel it created.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.
    ///
    /// An error tells the resolver that the update could not be used.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when the name resolver reports an error. Policies
    /// should keep using the addresses of earlier updates where they can.
    fn resolver_error(&mut self, error: String, channel_controller: &mut dyn ChannelController);

    /// Called by the channel when any subchannel created by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: &Subchannel,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called when the application asks an idle channel to connect.
    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController);

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}
}

/// Options for creating a subchannel.
#[derive(Clone, Debug, Default)]
pub struct NewSubchannelOptions {
    /// Whether the subchannel runs the health-check protocol once connected,
    /// provided the service config names a health-check service.
    pub health_check_enabled: bool,
}

/// Controls channel behaviors.
pub trait ChannelController: Send {
    /// Creates a new subchannel in IDLE state.
    fn new_subchannel(
        &mut self,
        addresses: &[Address],
        options: NewSubchannelOptions,
    ) -> Result<Subchannel, ChannelError>;

    /// Shuts down a subchannel created by this policy. Its transport is
    /// drained gracefully.
    fn remove_subchannel(&mut self, subchannel: &Subchannel);

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.  Typically
    /// used when connections fail, indicating a possible change in the overall
    /// network configuration.
    fn request_resolution(&mut self);
}

/// Represents the current state of a Subchannel.
#[derive(Clone, Debug)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.
    pub connectivity_state: ConnectivityState,
    /// Set if connectivity state is TransientFailure to describe the most recent
    /// connection error.
    pub last_connection_error: Option<ChannelError>,
}

/// Data about an RPC made available to pickers.
#[derive(Clone, Debug, Default)]
pub struct PickInfo {
    /// The full method name, "/service/method".
    pub method: String,
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  If pick() returns Queue, the channel will queue the RPC until a
/// new Picker is produced by the LbPolicy, and will call pick() on the new
/// Picker for the request.
///
/// Pickers are always paired with a ConnectivityState which the channel will
/// expose to applications:
///
/// If the ConnectivityState is Idle, the Picker should ensure connections are
/// initiated and return Queue.
///
/// If the ConnectivityState is Connecting, the Picker should return Queue.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure, the Picker should return a
/// Fail result that describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.
    fn pick(&self, info: &PickInfo) -> PickResult;
}

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status
    /// (with the code converted to UNAVAILABLE).  If the RPC is wait-for-ready,
    /// then it will not be terminated, but instead attempted on a new picker if
    /// one is produced before it is cancelled.
    Fail(Status),
    /// Indicates that the request should fail with the included status
    /// immediately, even if the RPC is wait-for-ready.
    Drop(Status),
}

/// Reported to a pick's completion callback once the RPC finishes.
#[derive(Debug, Default)]
pub struct DoneInfo {
    pub error: Option<Status>,
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Subchannel,
    /// Metadata to be added to existing outgoing metadata.
    pub metadata: MetadataMap,
    /// Called when the RPC completes, or with a default `DoneInfo` if the
    /// subchannel turned out not to be ready.
    pub on_complete: Option<Box<dyn FnOnce(&DoneInfo) + Send>>,
}

impl Pick {
    pub fn new(subchannel: Subchannel) -> Self {
        Pick {
            subchannel,
            metadata: MetadataMap::new(),
            on_complete: None,
        }
    }
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting and a picker which
    /// queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every pick with the same status.
pub struct FailingPicker {
    pub status: Status,
}

impl Picker for FailingPicker {
    fn pick(&self, _info: &PickInfo) -> PickResult {
        PickResult::Fail(self.status.clone())
    }
}
