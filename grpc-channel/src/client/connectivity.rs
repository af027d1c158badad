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

//! Tracks the aggregated connectivity state of a channel.

use tokio::sync::watch;
use tracing::debug;

use super::ConnectivityState;
use crate::context::CallContext;

/// Holds the channel's current [`ConnectivityState`] and wakes anyone waiting
/// for it to change.
///
/// Once SHUTDOWN has been recorded no further update is accepted.
pub(crate) struct ConnectivityStateManager {
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityStateManager {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ConnectivityState::Idle);
        Self { tx }
    }

    /// Records `state`, notifying waiters if it differs from the current one.
    pub(crate) fn update_state(&self, state: ConnectivityState) {
        self.tx.send_if_modified(|cur| {
            if *cur == ConnectivityState::Shutdown || *cur == state {
                return false;
            }
            debug!(%state, "channel connectivity state changed");
            *cur = state;
            true
        });
    }

    pub(crate) fn get_state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    /// Waits until the state differs from `source`. Returns false if `ctx`
    /// finishes first.
    pub(crate) async fn wait_for_state_change(
        &self,
        ctx: &CallContext,
        source: ConnectivityState,
    ) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            r = rx.wait_for(|s| *s != source) => r.is_ok(),
            _ = ctx.done() => false,
        }
    }

    /// Returns a receiver observing every state change.
    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}
