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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

use super::ResolverBuilder;
use super::passthrough;
use crate::error::Error;

/// A registry to store and retrieve name resolvers.  Resolvers are indexed by
/// the URI scheme they are intended to handle.
///
/// Builders are registered during start-up. Once a channel is created with a
/// registry it is frozen and further registration fails, so every channel
/// observes the same set of resolvers for its lifetime.
#[derive(Default)]
pub struct ResolverRegistry {
    m: RwLock<HashMap<String, Arc<dyn ResolverBuilder>>>,
    frozen: AtomicBool,
}

impl ResolverRegistry {
    /// Construct an empty name resolver registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a registry holding the resolvers built into this crate.
    pub fn with_defaults() -> Self {
        let r = Self::new();
        r.m.write().insert(
            passthrough::SCHEME.to_string(),
            Arc::new(passthrough::Builder::default()),
        );
        r
    }

    /// Add a name resolver into the registry. `builder.scheme()` will be used
    /// as the scheme registered with this builder. If multiple resolvers are
    /// registered with the same scheme, the one registered last takes effect.
    ///
    /// # Panics
    ///
    /// Panics if the given scheme contains uppercase characters.
    pub fn add_builder(&self, builder: Arc<dyn ResolverBuilder>) -> Result<(), Error> {
        let scheme = builder.scheme().to_string();
        if scheme.chars().any(|c| c.is_ascii_uppercase()) {
            panic!("Scheme must not contain uppercase characters: {scheme}");
        }
        let mut m = self.m.write();
        if self.frozen.load(Ordering::Acquire) {
            return Err(Error::RegistryFrozen(scheme));
        }
        m.insert(scheme, builder);
        Ok(())
    }

    /// Returns the resolver builder registered for the given scheme, if any.
    ///
    /// The provided scheme is case-insensitive.
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.m.read().get(&scheme.to_lowercase()).cloned()
    }

    /// Rejects every later registration.
    pub fn freeze(&self) {
        let _guard = self.m.write();
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

static GLOBAL_RESOLVER_REGISTRY: LazyLock<Arc<ResolverRegistry>> =
    LazyLock::new(|| Arc::new(ResolverRegistry::with_defaults()));

/// The process-wide resolver registry used by channels that are not given one
/// explicitly.
pub fn global_registry() -> Arc<ResolverRegistry> {
    GLOBAL_RESOLVER_REGISTRY.clone()
}
