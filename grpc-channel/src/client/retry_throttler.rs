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

use parking_lot::Mutex;

use super::service_config::RetryThrottlingPolicy;

/// A token bucket shared by every RPC on a channel that decides whether
/// retries are currently permitted.
///
/// Each failed RPC removes one token and each successful RPC returns
/// `token_ratio` tokens. Retries are disallowed while the bucket holds at
/// most half of `max_tokens`.
#[derive(Debug)]
pub struct RetryThrottler {
    max: f64,
    thresh: f64,
    ratio: f64,
    tokens: Mutex<f64>,
}

impl RetryThrottler {
    pub(crate) fn new(policy: &RetryThrottlingPolicy) -> Self {
        let max = policy.max_tokens;
        RetryThrottler {
            max,
            thresh: max / 2.0,
            ratio: policy.token_ratio,
            tokens: Mutex::new(max),
        }
    }

    /// Consumes a token for a failed attempt and reports whether a retry
    /// must be throttled.
    pub fn throttle(&self) -> bool {
        let mut tokens = self.tokens.lock();
        *tokens = (*tokens - 1.0).max(0.0);
        *tokens <= self.thresh
    }

    /// Returns tokens to the bucket after a successful RPC.
    pub fn successful_rpc(&self) {
        let mut tokens = self.tokens.lock();
        *tokens = (*tokens + self.ratio).min(self.max);
    }

    pub fn tokens(&self) -> f64 {
        *self.tokens.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn throttler(max_tokens: f64, token_ratio: f64) -> RetryThrottler {
        RetryThrottler::new(&RetryThrottlingPolicy {
            max_tokens,
            token_ratio,
        })
    }

    #[test]
    fn throttles_once_half_the_tokens_are_gone() {
        let rt = throttler(10.0, 0.1);
        for _ in 0..4 {
            assert!(!rt.throttle());
        }
        // 5 tokens left, which is the threshold.
        assert!(rt.throttle());
    }

    #[test]
    fn one_success_does_not_reopen_an_empty_bucket() {
        let rt = throttler(10.0, 0.1);
        for _ in 0..10 {
            rt.throttle();
        }
        assert!(rt.tokens().abs() < EPSILON);
        assert!(rt.throttle());

        rt.successful_rpc();
        assert!((rt.tokens() - 0.1).abs() < EPSILON);
        assert!(rt.throttle());
        assert!(rt.tokens().abs() < EPSILON);
    }

    #[test]
    fn tokens_never_exceed_max() {
        let rt = throttler(3.0, 1.0);
        rt.throttle();
        for _ in 0..5 {
            rt.successful_rpc();
        }
        assert!((rt.tokens() - 3.0).abs() < EPSILON);
    }
}
