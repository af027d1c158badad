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

//! A resolver that hands the target's endpoint to the channel unchanged.

use super::{
    Address, Resolver, ResolverBuilder, ResolverController, ResolverOptions, ResolverUpdate,
    Target,
};

pub static SCHEME: &str = "passthrough";

#[derive(Debug, Default)]
pub struct Builder {
    _priv: (),
}

impl ResolverBuilder for Builder {
    fn build(&self, target: &Target, options: ResolverOptions) -> Result<Box<dyn Resolver>, String> {
        let endpoint = target.endpoint();
        if endpoint.is_empty() {
            return Err("passthrough: received empty target in build()".to_string());
        }
        options.work_scheduler.schedule_work();
        Ok(Box::new(PassthroughResolver {
            address: Address::new(endpoint),
            pending: true,
        }))
    }

    fn scheme(&self) -> &str {
        SCHEME
    }
}

struct PassthroughResolver {
    address: Address,
    pending: bool,
}

impl Resolver for PassthroughResolver {
    // The address never changes, so there is nothing to refresh.
    fn resolve_now(&mut self) {}

    fn work(&mut self, controller: &mut dyn ResolverController) {
        if !std::mem::take(&mut self.pending) {
            return;
        }
        let _ = controller.update(ResolverUpdate::new(vec![self.address.clone()]));
    }
}
