// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Atomic entity batches.
//!
//! While a batch is open on a [`TableClient`][crate::TableClient], entity mutations are queued
//! instead of sent. Committing encodes them into one `multipart/mixed` transaction, sends it
//! through the client's filters, and splits the single response back into one
//! [`OperationResult`] per queued operation, in the order the operations were queued.
//!
//! A transaction is all-or-nothing and spans one table partition. Violations the client can see
//! locally are resolved without a round trip, reported the way the service would report them:
//!
//! - an operation on a different table or partition than the first operation fails with
//!   `CommandsInBatchActOnDifferentPartitions`;
//! - a second operation on an entity the batch already touches fails with `ResourceNotFound`;
//!   the first operation on an entity is the authoritative one;
//! - every other operation is [`RolledBack`][OperationOutcome::RolledBack].

mod accumulator;
mod codec;
pub(crate) mod multipart;
mod outcome;

pub(crate) use accumulator::{BatchContext, OperationRecord, validate, validate_keys};
pub use accumulator::{MAX_BATCH_OPERATIONS, OperationKind};
pub(crate) use codec::{decode, encode};
#[cfg(any(test, feature = "test-util"))]
pub(crate) use codec::has_if_match;
pub use outcome::{BatchResponse, OperationOutcome, OperationResult};
