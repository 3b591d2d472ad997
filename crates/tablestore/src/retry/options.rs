// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use super::constants::{
    DEFAULT_MAX_RETRY_INTERVAL, DEFAULT_MIN_RETRY_INTERVAL, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_INTERVAL, DEFAULT_USE_JITTER,
};

/// Configuration of the [`ExponentialRetryPolicy`][super::ExponentialRetryPolicy].
///
/// | Field | Default |
/// |-------|---------|
/// | `retry_count` | `3` (4 attempts in total) |
/// | `retry_interval` | `30s` |
/// | `min_retry_interval` | `3s` |
/// | `max_retry_interval` | `90s` |
/// | `use_jitter` | `true` |
/// | `deadline` | `None` |
///
/// With the `serde` feature enabled the options can be loaded from configuration; missing fields
/// take their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryOptions {
    /// Maximum number of retries after the original attempt.
    pub retry_count: u32,

    /// Base interval that the exponential factor is applied to.
    pub retry_interval: Duration,

    /// Lower bound of every computed interval. Wins over `max_retry_interval` when the two cross.
    pub min_retry_interval: Duration,

    /// Upper bound of every computed interval.
    pub max_retry_interval: Duration,

    /// Randomizes the base interval within `[0.8, 1.2)` of `retry_interval`.
    pub use_jitter: bool,

    /// Upper bound on the time one logical call may spend, measured from its first attempt.
    ///
    /// A retry whose wait would end past the deadline is not attempted.
    pub deadline: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            min_retry_interval: DEFAULT_MIN_RETRY_INTERVAL,
            max_retry_interval: DEFAULT_MAX_RETRY_INTERVAL,
            use_jitter: DEFAULT_USE_JITTER,
            deadline: None,
        }
    }
}
