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

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::trace;

use super::load_balancing::{DoneInfo, PickInfo, PickResult, Picker};
use super::transport::ClientTransport;
use crate::context::CallContext;
use crate::error::Error;

/// Called with the outcome of an RPC sent on a picked transport.
pub(crate) type DoneCallback = Box<dyn FnOnce(&DoneInfo) + Send>;

struct PickerGeneration {
    picker: Option<Arc<dyn Picker>>,
    /// Canceled when this generation is replaced.
    changed: CancellationToken,
    closed: bool,
}

impl PickerGeneration {
    fn new(picker: Option<Arc<dyn Picker>>, closed: bool) -> Self {
        Self {
            picker,
            changed: CancellationToken::new(),
            closed,
        }
    }
}

/// Holds the latest picker from the load balancing policy and blocks picks
/// until a picker can route them.
pub(crate) struct PickerWrapper {
    current: ArcSwap<PickerGeneration>,
}

impl PickerWrapper {
    pub(crate) fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(PickerGeneration::new(None, false)),
        }
    }

    /// Installs a new picker and wakes every blocked pick to retry with it.
    pub(crate) fn update_picker(&self, picker: Arc<dyn Picker>) {
        self.replace(PickerGeneration::new(Some(picker), false));
    }

    /// Drops the current picker; picks block until a new one arrives.
    pub(crate) fn reset(&self) {
        self.replace(PickerGeneration::new(None, false));
    }

    /// Fails every pending and future pick with [`Error::ClientConnClosing`].
    pub(crate) fn close(&self) {
        self.replace(PickerGeneration::new(None, true));
    }

    fn replace(&self, next: PickerGeneration) {
        let next = Arc::new(next);
        let old = self
            .current
            .rcu(|cur| if cur.closed { cur.clone() } else { next.clone() });
        if !old.closed {
            old.changed.cancel();
        }
    }

    /// Returns a ready transport for the call described by `info`, waiting
    /// for new pickers while the current one queues the call.
    ///
    /// Unless `fail_fast` is false, a `Fail` result ends the pick with
    /// UNAVAILABLE. Otherwise the call waits for a picker that routes it or
    /// for `ctx` to end, and the last failure is reported in that case.
    pub(crate) async fn pick(
        &self,
        ctx: &CallContext,
        fail_fast: bool,
        info: &PickInfo,
    ) -> Result<(Arc<dyn ClientTransport>, Option<DoneCallback>), Error> {
        let mut last_tried: Option<Arc<PickerGeneration>> = None;
        let mut last_pick_err: Option<Status> = None;
        loop {
            let generation = self.current.load_full();
            if generation.closed {
                return Err(Error::ClientConnClosing);
            }
            let stale = last_tried
                .as_ref()
                .is_some_and(|t| Arc::ptr_eq(t, &generation));
            let picker = match &generation.picker {
                Some(p) if !stale => p.clone(),
                _ => {
                    tokio::select! {
                        _ = generation.changed.cancelled() => continue,
                        err = ctx.done() => return Err(context_error(err, last_pick_err)),
                    }
                }
            };
            last_tried = Some(generation);

            match picker.pick(info) {
                PickResult::Queue => continue,
                PickResult::Fail(status) => {
                    if fail_fast {
                        return Err(Status::new(Code::Unavailable, status.message()).into());
                    }
                    last_pick_err = Some(status);
                }
                PickResult::Drop(status) => return Err(status.into()),
                PickResult::Pick(pick) => match pick.subchannel.ready_transport() {
                    Some(transport) => return Ok((transport, pick.on_complete)),
                    None => {
                        trace!(subchannel = %pick.subchannel, "picked subchannel is not ready; retrying");
                        if let Some(done) = pick.on_complete {
                            done(&DoneInfo::default());
                        }
                    }
                },
            }
        }
    }
}

fn context_error(err: Error, last_pick_err: Option<Status>) -> Error {
    match last_pick_err {
        Some(last) => Status::new(
            err.code(),
            format!("{err}, latest balancer error: {}", last.message()),
        )
        .into(),
        None => err,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::client::load_balancing::{FailingPicker, QueuingPicker};

    struct CountingPicker {
        picks: AtomicUsize,
        result: fn() -> PickResult,
    }

    impl Picker for CountingPicker {
        fn pick(&self, _info: &PickInfo) -> PickResult {
            self.picks.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_until_context_ends_without_a_picker() {
        let pw = PickerWrapper::new();
        let ctx = CallContext::new().with_timeout(Duration::from_millis(100));
        let err = pw.pick(&ctx, true, &PickInfo::default()).await.err();
        assert!(matches!(err, Some(Error::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_pick_fails_with_unavailable() {
        let pw = PickerWrapper::new();
        pw.update_picker(Arc::new(FailingPicker {
            status: Status::internal("no backends"),
        }));
        let err = pw
            .pick(&CallContext::new(), true, &PickInfo::default())
            .await
            .err()
            .map(Status::from);
        let status = err.expect("pick should fail");
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "no backends");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_ready_reports_latest_balancer_error() {
        let pw = PickerWrapper::new();
        pw.update_picker(Arc::new(FailingPicker {
            status: Status::unavailable("all addresses failed"),
        }));
        let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
        let status = Status::from(
            pw.pick(&ctx, false, &PickInfo::default())
                .await
                .err()
                .expect("pick should fail"),
        );
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert_eq!(
            status.message(),
            "context deadline exceeded, latest balancer error: all addresses failed"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn drop_fails_even_when_waiting_for_ready() {
        let pw = PickerWrapper::new();
        pw.update_picker(Arc::new(CountingPicker {
            picks: AtomicUsize::new(0),
            result: || PickResult::Drop(Status::resource_exhausted("dropped")),
        }));
        let status = Status::from(
            pw.pick(&CallContext::new(), false, &PickInfo::default())
                .await
                .err()
                .expect("pick should fail"),
        );
        assert_eq!(status.code(), Code::ResourceExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_pick_retries_on_new_picker() {
        let pw = Arc::new(PickerWrapper::new());
        let queuing = Arc::new(CountingPicker {
            picks: AtomicUsize::new(0),
            result: || PickResult::Queue,
        });
        pw.update_picker(queuing.clone());

        let task = tokio::spawn({
            let pw = pw.clone();
            async move {
                pw.pick(&CallContext::new(), true, &PickInfo::default())
                    .await
                    .err()
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Queued picks are not retried against the same picker.
        assert_eq!(queuing.picks.load(Ordering::SeqCst), 1);

        pw.update_picker(Arc::new(FailingPicker {
            status: Status::unavailable("down"),
        }));
        let err = task.await.unwrap().map(Status::from);
        assert_eq!(err.map(|s| s.code()), Some(Code::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_blocked_picks() {
        let pw = Arc::new(PickerWrapper::new());
        pw.update_picker(Arc::new(QueuingPicker {}));
        let task = tokio::spawn({
            let pw = pw.clone();
            async move {
                pw.pick(&CallContext::new(), false, &PickInfo::default())
                    .await
                    .err()
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pw.close();
        assert!(matches!(
            task.await.unwrap(),
            Some(Error::ClientConnClosing)
        ));

        // Closed is final.
        pw.update_picker(Arc::new(QueuingPicker {}));
        let err = pw
            .pick(&CallContext::new(), true, &PickInfo::default())
            .await
            .err();
        assert!(matches!(err, Some(Error::ClientConnClosing)));
    }
}
