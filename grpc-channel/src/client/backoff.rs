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

//! Connection backoff.

use std::time::Duration;

use rand::Rng;

/// Computes how long a subchannel waits before its next connection attempt.
///
/// `retries` is the number of consecutive failed attempts so far; it is reset
/// to zero whenever a connection is established.
pub trait Backoff: Send + Sync {
    fn backoff(&self, retries: usize) -> Duration;
}

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// The amount of time to backoff after the first failure.
    pub base_delay: Duration,

    /// The factor with which to multiply backoffs after a
    /// failed retry. Should ideally be greater than 1.
    pub multiplier: f64,

    /// The factor with which backoffs are randomized.
    pub jitter: f64,

    /// The upper bound of backoff delay.
    pub max_delay: Duration,
}

/// This is a backoff configuration with the default values specified
/// at https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md.
pub const DEFAULT_EXPONENTIAL_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
};

impl BackoffConfig {
    fn validate(&self) -> Result<(), &'static str> {
        // 0 <= base_delay <= max_delay
        if self.base_delay > self.max_delay {
            Err("base_delay must not be greater than max_delay")?;
        }
        // 1 <= multiplier
        if self.multiplier < 1.0 {
            Err("multiplier must be greater than 1.0")?;
        }
        // 0 <= jitter <= 1
        if self.jitter < 0.0 {
            Err("jitter must be greater than or equal to 0")?;
        }
        if self.jitter > 1.0 {
            Err("jitter must be less than or equal to 1")?
        }
        Ok(())
    }
}

/// Exponential backoff with randomized jitter.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Result<Self, &'static str> {
        config.validate()?;
        Ok(ExponentialBackoff { config })
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff {
            config: DEFAULT_EXPONENTIAL_CONFIG,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn backoff(&self, retries: usize) -> Duration {
        // The first attempt after a success waits exactly the base delay.
        if retries == 0 {
            return self.config.base_delay;
        }
        let max = self.config.max_delay.as_secs_f64();
        let mut delay = self.config.base_delay.as_secs_f64();
        let mut retries = retries;
        while delay < max && retries > 0 {
            delay *= self.config.multiplier;
            retries -= 1;
        }
        delay = delay.min(max);
        if self.config.jitter > 0.0 {
            delay *= 1.0 + self.config.jitter * rand::rng().random_range(-1.0..1.0);
        }
        Duration::from_secs_f64(delay.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Backoff, BackoffConfig, DEFAULT_EXPONENTIAL_CONFIG, ExponentialBackoff};

    const EPSILON: f64 = 1e-9;

    #[test]
    fn default_config_is_valid() {
        let result = ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG.clone());
        assert!(result.is_ok());
    }

    #[test]
    fn base_more_than_max() {
        let config = BackoffConfig {
            multiplier: 123.0,
            jitter: 0.0,
            base_delay: Duration::from_secs(100),
            max_delay: Duration::from_secs(10),
        };
        assert!(ExponentialBackoff::new(config).is_err());
    }

    #[test]
    fn invalid_multiplier_and_jitter() {
        let mut config = BackoffConfig {
            multiplier: -123.0,
            jitter: 0.0,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(100),
        };
        assert!(ExponentialBackoff::new(config.clone()).is_err());
        config.multiplier = 1.0;
        config.jitter = -10.0;
        assert!(ExponentialBackoff::new(config.clone()).is_err());
        config.jitter = 2.0;
        assert!(ExponentialBackoff::new(config).is_err());
    }

    #[test]
    fn backoff_grows_and_is_capped_without_jitter() {
        let config = BackoffConfig {
            multiplier: 2.0,
            jitter: 0.0,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
        };
        let backoff = ExponentialBackoff::new(config).unwrap();
        let got: Vec<_> = (0..7).map(|i| backoff.backoff(i)).collect();
        let want: Vec<_> = [1, 2, 4, 8, 15, 15, 15]
            .into_iter()
            .map(Duration::from_secs)
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn first_retry_has_no_jitter() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.backoff(0), Duration::from_secs(1));
    }

    #[test]
    fn backoff_with_jitter() {
        let config = BackoffConfig {
            multiplier: 2.0,
            jitter: 0.2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
        };
        let backoff = ExponentialBackoff::new(config).unwrap();
        // 1.6 <= duration <= 2.4.
        let duration = backoff.backoff(1);
        assert!(duration.gt(&Duration::from_secs_f64(1.6 - EPSILON)));
        assert!(duration.lt(&Duration::from_secs_f64(2.4 + EPSILON)));
        // 3.2 <= duration <= 4.8.
        let duration = backoff.backoff(2);
        assert!(duration.gt(&Duration::from_secs_f64(3.2 - EPSILON)));
        assert!(duration.lt(&Duration::from_secs_f64(4.8 + EPSILON)));
    }
}
