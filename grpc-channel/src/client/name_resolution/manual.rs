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

//! A resolver driven by hand.
//!
//! The manual resolver delivers whatever updates its [`Builder`] is given. It
//! is useful in tests and for applications that discover backends through
//! their own means.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{
    Resolver, ResolverBuilder, ResolverController, ResolverOptions, ResolverUpdate, Target,
    WorkScheduler,
};
use crate::error::Error;

enum Pending {
    Update(ResolverUpdate, Option<oneshot::Sender<Result<(), Error>>>),
    Error(String),
}

impl Pending {
    /// Fails the waiter, if any, and keeps the update itself.
    fn detach(self) -> Self {
        match self {
            Pending::Update(update, Some(done)) => {
                let _ = done.send(Err(Error::ClientConnClosing));
                Pending::Update(update, None)
            }
            other => other,
        }
    }
}

#[derive(Default)]
struct State {
    scheduler: Option<Arc<dyn WorkScheduler>>,
    pending: VecDeque<Pending>,
    initial: Option<ResolverUpdate>,
    builds: usize,
    resolve_now_calls: usize,
    last_target: Option<Target>,
}

/// Builds manual resolvers and feeds them updates.
///
/// Clones share state, so a test can register one clone and keep another to
/// push updates through.
#[derive(Clone)]
pub struct Builder {
    scheme: String,
    state: Arc<Mutex<State>>,
}

impl Builder {
    pub fn new(scheme: impl Into<String>) -> Self {
        Builder {
            scheme: scheme.into(),
            state: Arc::default(),
        }
    }

    /// Sets an update that is delivered every time a resolver is built.
    pub fn with_initial_state(self, update: ResolverUpdate) -> Self {
        self.state.lock().initial = Some(update);
        self
    }

    /// Queues `update` for delivery to the channel.
    pub fn push(&self, update: ResolverUpdate) {
        self.enqueue(Pending::Update(update, None));
    }

    /// Queues `update` and waits until the channel has applied it, returning
    /// the channel's verdict.
    ///
    /// Returns [`Error::ClientConnClosing`] if the channel stopped its
    /// resolver, by closing or going idle, before the update was applied.
    pub async fn push_and_wait(&self, update: ResolverUpdate) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Pending::Update(update, Some(tx)));
        rx.await.unwrap_or(Err(Error::ClientConnClosing))
    }

    /// Queues a resolution error for delivery to the channel.
    pub fn report_error(&self, error: impl Into<String>) {
        self.enqueue(Pending::Error(error.into()));
    }

    /// The number of times the channel asked for re-resolution.
    pub fn resolve_now_count(&self) -> usize {
        self.state.lock().resolve_now_calls
    }

    /// The number of resolvers built so far.
    pub fn build_count(&self) -> usize {
        self.state.lock().builds
    }

    /// The target the most recent resolver was built for.
    pub fn last_target(&self) -> Option<Target> {
        self.state.lock().last_target.clone()
    }

    fn enqueue(&self, p: Pending) {
        let mut state = self.state.lock();
        // The last resolver is gone. The update is kept for the next one, but
        // nobody is left waiting on it.
        let p = if state.scheduler.is_none() && state.builds > 0 {
            p.detach()
        } else {
            p
        };
        state.pending.push_back(p);
        if let Some(scheduler) = &state.scheduler {
            scheduler.schedule_work();
        }
    }
}

impl ResolverBuilder for Builder {
    fn build(&self, target: &Target, options: ResolverOptions) -> Result<Box<dyn Resolver>, String> {
        let mut state = self.state.lock();
        state.builds += 1;
        state.last_target = Some(target.clone());
        state.scheduler = Some(options.work_scheduler.clone());
        if let Some(initial) = state.initial.clone() {
            state.pending.push_front(Pending::Update(initial, None));
        }
        if !state.pending.is_empty() {
            options.work_scheduler.schedule_work();
        }
        Ok(Box::new(ManualResolver {
            state: self.state.clone(),
            build: state.builds,
        }))
    }

    fn scheme(&self) -> &str {
        &self.scheme
    }
}

struct ManualResolver {
    state: Arc<Mutex<State>>,
    build: usize,
}

impl Resolver for ManualResolver {
    fn resolve_now(&mut self) {
        self.state.lock().resolve_now_calls += 1;
    }

    fn work(&mut self, controller: &mut dyn ResolverController) {
        loop {
            // The lock is released before calling into the channel.
            let Some(next) = self.state.lock().pending.pop_front() else {
                return;
            };
            match next {
                Pending::Update(update, done) => {
                    let res = controller.update(update);
                    if let Some(done) = done {
                        let _ = done.send(res);
                    }
                }
                Pending::Error(err) => controller.report_error(err),
            }
        }
    }
}

impl Drop for ManualResolver {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        // A newer resolver may already have been built from this builder.
        if state.builds != self.build {
            return;
        }
        state.scheduler = None;
        let pending = std::mem::take(&mut state.pending);
        state.pending = pending.into_iter().map(Pending::detach).collect();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::name_resolution::Address;
    use crate::rt::default_runtime;

    struct NoopScheduler;

    impl WorkScheduler for NoopScheduler {
        fn schedule_work(&self) {}
    }

    fn build(builder: &Builder) -> Box<dyn Resolver> {
        let target: Target = "test:///svc".parse().unwrap();
        let options = ResolverOptions {
            authority: "svc".to_string(),
            disable_service_config: false,
            runtime: default_runtime(),
            work_scheduler: Arc::new(NoopScheduler),
        };
        builder.build(&target, options).unwrap()
    }

    fn update() -> ResolverUpdate {
        ResolverUpdate::new(vec![Address::new("a:1")])
    }

    #[tokio::test]
    async fn dropping_the_resolver_releases_waiters() {
        let builder = Builder::new("test");
        let resolver = build(&builder);

        let waiter = tokio::spawn({
            let builder = builder.clone();
            async move { builder.push_and_wait(update()).await }
        });
        while builder.state.lock().pending.is_empty() {
            tokio::task::yield_now().await;
        }
        drop(resolver);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(Error::ClientConnClosing)
        ));

        // With no resolver left, pushes fail right away.
        assert!(matches!(
            builder.push_and_wait(update()).await,
            Err(Error::ClientConnClosing)
        ));
        // The updates are still handed to the next resolver.
        assert_eq!(builder.state.lock().pending.len(), 2);
        let _resolver = build(&builder);
        assert_eq!(builder.build_count(), 2);
    }

    #[tokio::test]
    async fn stale_resolver_drop_keeps_the_current_scheduler() {
        let builder = Builder::new("test");
        let first = build(&builder);
        let _second = build(&builder);
        drop(first);
        assert!(builder.state.lock().scheduler.is_some());
    }
}
