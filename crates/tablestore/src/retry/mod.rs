// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Exponential backoff retry filter.
//!
//! [`ExponentialRetryPolicy`] re-sends a failed request with waits that grow exponentially with
//! every retry:
//!
//! ```text
//! interval(n) = clamp(min_retry_interval + (2^n - 1) × base, min_retry_interval, max_retry_interval)
//! ```
//!
//! where `n` is the 1-based retry number and `base` is `retry_interval`, scaled by a random
//! factor in `[0.8, 1.2)` when jitter is enabled.
//!
//! Whether an outcome is retried is decided per attempt:
//!
//! - successful responses, usage errors, and undecodable responses end the call immediately;
//! - otherwise the decision function sees the status (`None` for transport failures) and the
//!   call's [`RetryData`]; by default it retries timeouts and server errors only, see
//!   [`default_should_retry`];
//! - independently of the decision, at most [`RetryOptions::retry_count`] retries are made.
//!
//! When no retry follows, the last outcome is returned exactly as the inner service produced it.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use tablestore::retry::{ExponentialRetryPolicy, RetryOptions};
//! use tick::Clock;
//!
//! let options = RetryOptions {
//!     retry_count: 2,
//!     retry_interval: Duration::from_millis(200),
//!     ..RetryOptions::default()
//! };
//!
//! let policy = ExponentialRetryPolicy::with_options(&Clock::new_frozen(), options);
//! policy.on_retry(|data| println!("retry {} in {:?}", data.retry_count(), data.retry_interval()));
//! ```

mod backoff;
mod constants;
mod data;
mod layer;
mod options;
mod service;

pub use data::RetryData;
pub use layer::{ExponentialRetryPolicy, default_should_retry};
pub use options::RetryOptions;
pub use service::ExponentialRetry;
