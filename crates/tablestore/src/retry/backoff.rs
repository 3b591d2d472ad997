// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use super::RetryOptions;
use super::constants::{JITTER_LOW, JITTER_SPAN};

/// Computes the wait before retry number `retry_count` (1-based).
///
/// `min + (2^retry_count - 1) × base`, clamped to `[min, max]`, where `base` is the retry
/// interval scaled by a jitter factor in `[0.8, 1.2)`. Consecutive intervals never decrease: the
/// exponential factor at least doubles per retry while jitter varies by less than 1.5×.
pub(super) fn retry_interval(options: &RetryOptions, retry_count: u32, jitter: Jitter) -> Duration {
    let base = if options.use_jitter {
        options.retry_interval.as_secs_f64() * JITTER_SPAN.mul_add(jitter.draw(), JITTER_LOW)
    } else {
        options.retry_interval.as_secs_f64()
    };

    let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
    let increment = secs_to_duration_saturating(base * (2.0_f64.powi(exponent) - 1.0));

    clamp(options.min_retry_interval.saturating_add(increment), options)
}

/// The random draw behind the jitter factor.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct Jitter {
    pinned: Option<f64>,
}

impl Jitter {
    #[cfg(test)]
    pub(super) fn pinned(draw: f64) -> Self {
        Self { pinned: Some(draw) }
    }

    /// Returns a draw in `[0, 1)`.
    fn draw(self) -> f64 {
        self.pinned.unwrap_or_else(fastrand::f64)
    }
}

fn clamp(interval: Duration, options: &RetryOptions) -> Duration {
    interval.min(options.max_retry_interval).max(options.min_retry_interval)
}

fn secs_to_duration_saturating(secs: f64) -> Duration {
    if secs <= 0.0 || secs.is_nan() {
        return Duration::ZERO;
    }

    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
