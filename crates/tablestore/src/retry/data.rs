// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use http::{StatusCode, Uri};

/// Per-call retry state.
///
/// A fresh `RetryData` is created for every logical call and carried through that call's
/// attempts only, so one policy instance can serve concurrent calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryData {
    pub(super) retry_count: u32,
    pub(super) last_status: Option<StatusCode>,
    pub(super) target_location: Uri,
    pub(super) retry_interval: Duration,
}

impl RetryData {
    pub(crate) fn new(target_location: Uri) -> Self {
        Self {
            retry_count: 0,
            last_status: None,
            target_location,
            retry_interval: Duration::ZERO,
        }
    }

    /// Returns how many retries this call has made so far.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Returns the status of the most recent attempt; `None` after a transport failure.
    #[must_use]
    pub fn last_status(&self) -> Option<StatusCode> {
        self.last_status
    }

    /// Returns the location the attempts are sent to.
    #[must_use]
    pub fn target_location(&self) -> &Uri {
        &self.target_location
    }

    /// Returns the wait computed before the most recent retry.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}
