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

//! Client-side health checking of subchannels.

use std::sync::{Arc, Weak};

use tonic::{Status, async_trait};

use super::ConnectivityState;
use super::subchannel::AddrConn;
use super::transport::ClientTransport;
use crate::error::Error;

/// Runs the health-checking protocol on a connected subchannel.
///
/// While a check runs, the states it reports through the [`HealthReporter`]
/// decide whether the subchannel is Ready or in TransientFailure. Returning
/// a status with code `Unimplemented` tells the subchannel that the server
/// does not support health checking, after which it is considered Ready.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, reporter: HealthReporter, service_name: String) -> Result<(), Status>;
}

/// The health checker's view of the subchannel it watches: a factory for the
/// transport to open the health stream on and a callback for states.
///
/// Both are bound to the transport the check was started for; once that
/// transport is gone, `transport` fails and `set_state` is ignored.
#[derive(Clone)]
pub struct HealthReporter {
    subchannel: Weak<AddrConn>,
    generation: u64,
}

impl HealthReporter {
    pub(crate) fn new(subchannel: &Arc<AddrConn>, generation: u64) -> Self {
        HealthReporter {
            subchannel: Arc::downgrade(subchannel),
            generation,
        }
    }

    /// Returns the transport to open the health stream on.
    pub fn transport(&self) -> Result<Arc<dyn ClientTransport>, Status> {
        self.subchannel
            .upgrade()
            .and_then(|ac| ac.transport_for_generation(self.generation))
            .ok_or_else(|| Status::cancelled("the provided transport is no longer valid to use"))
    }

    /// Reports the health of the subchannel.
    pub fn set_state(&self, state: ConnectivityState, error: Option<String>) {
        if let Some(ac) = self.subchannel.upgrade() {
            ac.health_update(self.generation, state, error.map(Error::Connection));
        }
    }
}
