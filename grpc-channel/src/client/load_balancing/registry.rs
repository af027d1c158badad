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

use super::{LbPolicyBuilder, pick_first, round_robin};
use crate::error::Error;

/// A registry to store and retrieve LB policies.  LB policies are indexed by
/// their names.
///
/// Like the resolver registry, it accepts builders until it is frozen by the
/// first channel that uses it.
#[derive(Default)]
pub struct LbPolicyRegistry {
    m: RwLock<HashMap<String, Arc<dyn LbPolicyBuilder>>>,
    frozen: AtomicBool,
}

impl LbPolicyRegistry {
    /// Construct an empty LB policy registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a registry holding `pick_first` and `round_robin`.
    pub fn with_defaults() -> Self {
        let r = Self::new();
        {
            let mut m = r.m.write();
            m.insert(
                pick_first::POLICY_NAME.to_string(),
                Arc::new(pick_first::Builder::default()),
            );
            m.insert(
                round_robin::POLICY_NAME.to_string(),
                Arc::new(round_robin::Builder::default()),
            );
        }
        r
    }

    /// Add a LB policy into the registry, replacing any policy of the same
    /// name.
    pub fn add_builder(&self, builder: Arc<dyn LbPolicyBuilder>) -> Result<(), Error> {
        let name = builder.name().to_lowercase();
        let mut m = self.m.write();
        if self.frozen.load(Ordering::Acquire) {
            return Err(Error::RegistryFrozen(name));
        }
        m.insert(name, builder);
        Ok(())
    }

    /// Retrieve a LB policy from the registry, or None if not found. Names
    /// are case-insensitive.
    pub fn get(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.m.read().get(&name.to_lowercase()).cloned()
    }

    /// Rejects every later registration.
    pub fn freeze(&self) {
        let _guard = self.m.write();
        self.frozen.store(true, Ordering::Release);
    }
}

static GLOBAL_LB_REGISTRY: LazyLock<Arc<LbPolicyRegistry>> =
    LazyLock::new(|| Arc::new(LbPolicyRegistry::with_defaults()));

/// The registry used if a local registry is not provided to a channel.
pub fn global_registry() -> Arc<LbPolicyRegistry> {
    GLOBAL_LB_REGISTRY.clone()
}
