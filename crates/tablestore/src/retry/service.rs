// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ops::ControlFlow;
use std::time::Duration;

use http::StatusCode;
use layered::Service;
use tick::Stopwatch;

use super::layer::PolicyState;
use super::{ExponentialRetryPolicy, RetryData, backoff};
use crate::error::ErrorKind;
use crate::wire::{Request, Response, clone_request};
use crate::{Error, Result};

/// A service wrapped by an [`ExponentialRetryPolicy`].
///
/// Every attempt sends a byte-identical copy of the original request to the inner service. When
/// the retry budget is exhausted, the decision declines, or the deadline would be exceeded, the
/// outcome of the last attempt is returned unmodified.
#[derive(Debug, Clone)]
pub struct ExponentialRetry<S> {
    pub(super) policy: ExponentialRetryPolicy,
    pub(super) inner: S,
}

impl<S> Service<Request> for ExponentialRetry<S>
where
    S: Service<Request, Out = Result<Response>>,
{
    type Out = Result<Response>;

    async fn execute(&self, request: Request) -> Self::Out {
        let state = self.policy.snapshot();
        let stopwatch = self.policy.clock().stopwatch();
        let mut data = RetryData::new(request.uri().clone());

        loop {
            let out = self.inner.execute(clone_request(&request)).await;

            match self.evaluate(&state, &stopwatch, &mut data, &out) {
                ControlFlow::Continue(interval) => {
                    drop(out);
                    self.policy.clock().delay(interval).await;
                }
                ControlFlow::Break(()) => return out,
            }
        }
    }
}

impl<S> ExponentialRetry<S> {
    fn evaluate(&self, state: &PolicyState, stopwatch: &Stopwatch, data: &mut RetryData, out: &Result<Response>) -> ControlFlow<(), Duration> {
        let Some(status) = retry_candidate(out) else {
            return ControlFlow::Break(());
        };

        data.last_status = status;

        if data.retry_count >= state.options.retry_count || !state.should_retry.call(status, data, &state.options) {
            return ControlFlow::Break(());
        }

        let retry_count = data.retry_count + 1;
        let interval = backoff::retry_interval(&state.options, retry_count, self.policy.jitter());

        if let Some(deadline) = state.options.deadline
            && stopwatch.elapsed().saturating_add(interval) > deadline
        {
            tracing::event!(
                name: "tablestore.retry.deadline",
                tracing::Level::WARN,
                retry.count = data.retry_count,
                retry.delay = interval.as_secs_f32(),
                retry.deadline = deadline.as_secs_f32(),
                http.status = status.map(|status| status.as_u16()),
            );
            return ControlFlow::Break(());
        }

        data.retry_count = retry_count;
        data.retry_interval = interval;

        if let Some(on_retry) = &state.on_retry {
            on_retry.call(data);
        }

        tracing::event!(
            name: "tablestore.retry",
            tracing::Level::WARN,
            retry.count = retry_count,
            retry.delay = interval.as_secs_f32(),
            http.status = status.map(|status| status.as_u16()),
            url.full = %data.target_location,
        );

        ControlFlow::Continue(interval)
    }
}

/// Extracts the status an outcome is judged by.
///
/// Returns `None` for outcomes that are never retried: successes, caller contract violations,
/// and responses that could not be decoded. `Some(None)` stands for a transport failure.
fn retry_candidate(out: &Result<Response>) -> Option<Option<StatusCode>> {
    match out {
        Ok(response) if response.status().is_success() => None,
        Ok(response) => Some(Some(response.status())),
        Err(error) => error_status(error),
    }
}

fn error_status(error: &Error) -> Option<Option<StatusCode>> {
    match error.kind() {
        ErrorKind::Transport => Some(None),
        ErrorKind::Service(service) => Some(Some(service.status())),
        _ => None,
    }
}
