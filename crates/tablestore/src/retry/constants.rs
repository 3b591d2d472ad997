// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Default number of retries after the original attempt.
pub(super) const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default base interval that the exponential factor is applied to.
pub(super) const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Default lower bound of every computed interval.
pub(super) const DEFAULT_MIN_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Default upper bound of every computed interval.
pub(super) const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(90);

/// Jitter is enabled by default to desynchronize many clients retrying at once.
pub(super) const DEFAULT_USE_JITTER: bool = true;

/// Lower bound of the jitter factor applied to the base interval.
pub(super) const JITTER_LOW: f64 = 0.8;

/// Width of the jitter factor range; the factor lies in `[0.8, 1.2)`.
pub(super) const JITTER_SPAN: f64 = 0.4;
