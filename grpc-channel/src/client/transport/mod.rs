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

//! The seam between the channel and the transport layer.
//!
//! Framing and HTTP/2 live behind these traits. A [`Transport`] dials one
//! address and hands back a [`ClientTransport`] along with a queue of
//! [`TransportEvent`]s that the owning subchannel drains.

use std::sync::Arc;
use std::time::Duration;

use tonic::{Status, async_trait};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::name_resolution::Address;
use crate::error::Error;

pub struct ConnectedTransport {
    pub transport: Arc<dyn ClientTransport>,
    /// Lifecycle notifications from the connection. The subchannel treats
    /// the sender being dropped like [`TransportEvent::Closed`].
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[derive(Clone, Debug, Default)]
pub struct TransportOptions {
    /// The authority (server name) to use for the connection.
    pub authority: String,
    /// The transport must give up connecting at this instant.
    pub connect_deadline: Option<Instant>,
    /// Interval of client keepalive pings, if enabled.
    pub keepalive_time: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GoAwayReason {
    NoReason,
    /// The server reported that the client sent keepalive pings too often.
    TooManyPings,
}

#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// The server is draining the connection. No new streams may be started.
    GoAway(GoAwayReason),
    /// The connection is gone.
    Closed(Option<String>),
}

/// Establishes connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        address: &Address,
        opts: &TransportOptions,
    ) -> Result<ConnectedTransport, String>;
}

/// An established connection owned by exactly one subchannel.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Performs a unary call. Fails once the transport is draining or closed.
    async fn call(&self, method: &str, request: Bytes) -> Result<Bytes, Status>;

    /// Stops accepting new streams and closes once in-flight streams finish.
    fn graceful_close(&self);

    /// Closes immediately, failing in-flight streams with `err`.
    fn close(&self, err: &Error);
}
