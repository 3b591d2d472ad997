// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use layered::Layer;
use parking_lot::RwLock;
use recoverable::RecoveryKind;
use tick::Clock;

use super::backoff::Jitter;
use super::{ExponentialRetry, RetryData, RetryOptions};
use crate::error::status_recovery;
use crate::fn_wrapper::define_fn_wrapper;

define_fn_wrapper!(ShouldRetry(Fn(status: Option<StatusCode>, data: &RetryData, options: &RetryOptions) -> bool));
define_fn_wrapper!(OnRetry(Fn(data: &RetryData)));

/// Exponential backoff retry filter.
///
/// The policy is a cheap, cloneable handle: clones share configuration, so a caller can keep one
/// clone to tune the policy after it has been installed in a client. Each logical call reads the
/// configuration once when it starts; changes apply to calls started afterwards.
///
/// Install the policy with [`FilterChain::filter`][crate::FilterChain::filter] or
/// [`TableClient::with_filter`][crate::TableClient::with_filter]; it implements [`Layer`] for
/// any inner service.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use tablestore::retry::ExponentialRetryPolicy;
/// use tick::Clock;
///
/// let clock = Clock::new_frozen();
/// let policy = ExponentialRetryPolicy::new(&clock);
///
/// policy.set_retry_count(5);
/// policy.set_retry_interval(Duration::from_millis(500));
///
/// // Retry anything, at most `retry_count` times.
/// policy.set_should_retry(|_status, data, options| data.retry_count() < options.retry_count);
///
/// assert_eq!(policy.options().retry_count, 5);
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialRetryPolicy {
    shared: Arc<PolicyShared>,
}

#[derive(Debug)]
struct PolicyShared {
    clock: Clock,
    jitter: Jitter,
    state: RwLock<PolicyState>,
}

#[derive(Debug, Clone)]
pub(super) struct PolicyState {
    pub(super) options: RetryOptions,
    pub(super) should_retry: ShouldRetry,
    pub(super) on_retry: Option<OnRetry>,
}

impl ExponentialRetryPolicy {
    /// Creates a policy with default [`RetryOptions`].
    ///
    /// The clock drives the waits between attempts.
    #[must_use]
    pub fn new(clock: &Clock) -> Self {
        Self::with_options(clock, RetryOptions::default())
    }

    /// Creates a policy with the given options.
    #[must_use]
    pub fn with_options(clock: &Clock, options: RetryOptions) -> Self {
        Self::with_jitter(clock, options, Jitter::default())
    }

    pub(super) fn with_jitter(clock: &Clock, options: RetryOptions, jitter: Jitter) -> Self {
        Self {
            shared: Arc::new(PolicyShared {
                clock: clock.clone(),
                jitter,
                state: RwLock::new(PolicyState {
                    options,
                    should_retry: ShouldRetry::new(default_should_retry),
                    on_retry: None,
                }),
            }),
        }
    }

    /// Returns a copy of the current options.
    #[must_use]
    pub fn options(&self) -> RetryOptions {
        self.shared.state.read().options.clone()
    }

    /// Replaces all options at once.
    pub fn set_options(&self, options: RetryOptions) {
        self.shared.state.write().options = options;
    }

    /// Sets the maximum number of retries after the original attempt.
    pub fn set_retry_count(&self, retry_count: u32) {
        self.shared.state.write().options.retry_count = retry_count;
    }

    /// Sets the base interval of the exponential backoff.
    pub fn set_retry_interval(&self, interval: Duration) {
        self.shared.state.write().options.retry_interval = interval;
    }

    /// Sets the lower bound of every computed interval.
    pub fn set_min_retry_interval(&self, interval: Duration) {
        self.shared.state.write().options.min_retry_interval = interval;
    }

    /// Sets the upper bound of every computed interval.
    pub fn set_max_retry_interval(&self, interval: Duration) {
        self.shared.state.write().options.max_retry_interval = interval;
    }

    /// Enables or disables jitter of the base interval.
    pub fn set_use_jitter(&self, use_jitter: bool) {
        self.shared.state.write().options.use_jitter = use_jitter;
    }

    /// Sets or clears the overall deadline of one logical call.
    pub fn set_deadline(&self, deadline: Option<Duration>) {
        self.shared.state.write().options.deadline = deadline;
    }

    /// Replaces the retry decision.
    ///
    /// The function receives the status of the failed attempt (`None` after a transport failure),
    /// the call's [`RetryData`] before it is updated for the next retry, and the options the call
    /// runs with. The configured retry count is enforced independently of the decision.
    pub fn set_should_retry(&self, should_retry: impl Fn(Option<StatusCode>, &RetryData, &RetryOptions) -> bool + Send + Sync + 'static) {
        self.shared.state.write().should_retry = ShouldRetry::new(should_retry);
    }

    /// Restores the default retry decision, see [`default_should_retry`].
    pub fn reset_should_retry(&self) {
        self.shared.state.write().should_retry = ShouldRetry::new(default_should_retry);
    }

    /// Registers an observer invoked before each wait.
    ///
    /// The observer sees the call's [`RetryData`] with the retry count and interval already
    /// updated. It cannot influence the retry.
    pub fn on_retry(&self, on_retry: impl Fn(&RetryData) + Send + Sync + 'static) {
        self.shared.state.write().on_retry = Some(OnRetry::new(on_retry));
    }

    pub(super) fn snapshot(&self) -> PolicyState {
        self.shared.state.read().clone()
    }

    pub(super) fn clock(&self) -> &Clock {
        &self.shared.clock
    }

    pub(super) fn jitter(&self) -> Jitter {
        self.shared.jitter
    }
}

impl<S> Layer<S> for ExponentialRetryPolicy {
    type Service = ExponentialRetry<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ExponentialRetry {
            policy: self.clone(),
            inner,
        }
    }
}

/// The default retry decision.
///
/// Retries transport failures, `408 Request Timeout` and server errors other than `501` and
/// `505`, as long as fewer than `retry_count` retries have been made. Client errors such as
/// conflicts, missing resources, or bad requests are never retried: re-sending the same request
/// cannot change their outcome.
#[must_use]
pub fn default_should_retry(status: Option<StatusCode>, data: &RetryData, options: &RetryOptions) -> bool {
    let transient = match status {
        None => true,
        Some(status) => status_recovery(status).kind() == RecoveryKind::Retry,
    };

    transient && data.retry_count() < options.retry_count
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use http::Uri;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(None, true)]
    #[case(Some(StatusCode::INTERNAL_SERVER_ERROR), true)]
    #[case(Some(StatusCode::SERVICE_UNAVAILABLE), true)]
    #[case(Some(StatusCode::REQUEST_TIMEOUT), true)]
    #[case(Some(StatusCode::NOT_IMPLEMENTED), false)]
    #[case(Some(StatusCode::CONFLICT), false)]
    #[case(Some(StatusCode::NOT_FOUND), false)]
    #[case(Some(StatusCode::BAD_REQUEST), false)]
    fn default_decision(#[case] status: Option<StatusCode>, #[case] expected: bool) {
        let data = RetryData::new(Uri::from_static("http://localhost/"));

        assert_eq!(default_should_retry(status, &data, &RetryOptions::default()), expected);
    }

    #[test]
    fn default_decision_respects_retry_count() {
        let mut data = RetryData::new(Uri::from_static("http://localhost/"));
        data.retry_count = 3;

        assert!(!default_should_retry(None, &data, &RetryOptions::default()));
    }

    #[test]
    fn clones_share_configuration() {
        let policy = ExponentialRetryPolicy::new(&Clock::new_frozen());
        let handle = policy.clone();

        handle.set_retry_count(7);
        handle.set_min_retry_interval(Duration::from_millis(30));
        handle.set_use_jitter(false);

        let options = policy.options();
        assert_eq!(options.retry_count, 7);
        assert_eq!(options.min_retry_interval, Duration::from_millis(30));
        assert!(!options.use_jitter);
    }

    #[test]
    fn should_retry_can_be_swapped_and_reset() {
        let policy = ExponentialRetryPolicy::new(&Clock::new_frozen());
        let data = RetryData::new(Uri::from_static("http://localhost/"));
        let options = policy.options();

        policy.set_should_retry(|_, _, _| true);
        assert!(policy.snapshot().should_retry.call(Some(StatusCode::CONFLICT), &data, &options));

        policy.reset_should_retry();
        assert!(!policy.snapshot().should_retry.call(Some(StatusCode::CONFLICT), &data, &options));
    }

    #[test]
    fn static_assertions() {
        static_assertions::assert_impl_all!(ExponentialRetryPolicy: Send, Sync, Clone, std::fmt::Debug);
    }
}
