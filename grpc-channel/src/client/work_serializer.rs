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

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::rt::GrpcRuntime;

type Work<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Runs closures against a state value one at a time, in the order they
/// were scheduled.
///
/// Resolver and balancer callbacks all go through the channel's serializer,
/// so neither ever runs concurrently with itself or the other. Once
/// `shutdown` is canceled the serializer finishes the work already queued
/// and then drops the state.
pub(crate) struct WorkSerializer<S> {
    tx: mpsc::UnboundedSender<Work<S>>,
}

impl<S: Send + 'static> WorkSerializer<S> {
    pub(crate) fn new(state: S, runtime: &GrpcRuntime, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = runtime.spawn(Box::pin(run(state, rx, shutdown)));
        Self { tx }
    }

    /// Queues `work`. Returns false if the serializer has stopped.
    pub(crate) fn schedule(&self, work: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.tx.send(Box::new(work)).is_ok()
    }
}

async fn run<S>(
    mut state: S,
    mut rx: mpsc::UnboundedReceiver<Work<S>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            work = rx.recv() => match work {
                Some(work) => work(&mut state),
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
    rx.close();
    while let Ok(work) = rx.try_recv() {
        work(&mut state);
    }
    trace!("work serializer stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;
    use crate::rt::default_runtime;

    #[tokio::test]
    async fn runs_work_in_order() {
        let ws = WorkSerializer::new(Vec::new(), &default_runtime(), CancellationToken::new());
        for i in 0..10 {
            ws.schedule(move |v: &mut Vec<i32>| v.push(i));
        }
        let (tx, rx) = oneshot::channel();
        ws.schedule(move |v| {
            let _ = tx.send(v.clone());
        });
        assert_eq!(rx.await.unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn drains_queued_work_on_shutdown() {
        let shutdown = CancellationToken::new();
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ws = WorkSerializer::new((), &default_runtime(), shutdown.clone());
        let (tx, rx) = oneshot::channel();
        for _ in 0..3 {
            let counter = counter.clone();
            ws.schedule(move |_| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        ws.schedule(move |_| {
            let _ = tx.send(());
        });
        shutdown.cancel();
        rx.await.unwrap();
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
