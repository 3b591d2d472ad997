// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::OperationKind;
use crate::ServiceError;
use crate::wire::ResponseInfo;

/// What happened to one operation of a committed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// The operation was applied.
    Succeeded {
        /// The new `ETag` of the entity; absent for deletes.
        etag: Option<String>,
    },
    /// The operation was rejected with the given error.
    Failed(ServiceError),
    /// The operation was valid but was not applied because another operation of the batch failed.
    RolledBack,
}

/// The outcome of one operation, correlated with the call that queued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub(crate) sequence: usize,
    pub(crate) kind: OperationKind,
    pub(crate) partition_key: String,
    pub(crate) row_key: String,
    pub(crate) outcome: OperationOutcome,
}

impl OperationResult {
    /// Returns the sequence number assigned when the operation was queued.
    #[must_use]
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    /// Returns the kind of operation.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Returns the partition key of the targeted entity.
    #[must_use]
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// Returns the row key of the targeted entity.
    #[must_use]
    pub fn row_key(&self) -> &str {
        &self.row_key
    }

    /// Returns the outcome.
    #[must_use]
    pub fn outcome(&self) -> &OperationOutcome {
        &self.outcome
    }

    /// Returns `true` if the operation was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, OperationOutcome::Succeeded { .. })
    }

    /// Returns the error, if the operation was the one rejected.
    #[must_use]
    pub fn error(&self) -> Option<&ServiceError> {
        match &self.outcome {
            OperationOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// The result of committing a batch.
///
/// Two levels must be checked. The [`envelope`][Self::envelope] describes the transaction round
/// trip as a whole and is successful even when individual operations were rejected; the
/// [`results`][Self::results] carry one entry per queued operation, in sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResponse {
    pub(crate) results: Vec<OperationResult>,
    pub(crate) envelope: ResponseInfo,
}

impl BatchResponse {
    /// Returns the per-operation results, aligned with the sequence numbers.
    #[must_use]
    pub fn results(&self) -> &[OperationResult] {
        &self.results
    }

    /// Returns the status and headers of the transaction round trip.
    #[must_use]
    pub fn envelope(&self) -> &ResponseInfo {
        &self.envelope
    }

    /// Returns `true` if the round trip succeeded and every operation was applied.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.envelope.is_successful() && self.results.iter().all(OperationResult::is_success)
    }

    /// Returns the first rejected operation, if any.
    #[must_use]
    pub fn first_failure(&self) -> Option<&OperationResult> {
        self.results.iter().find(|result| result.error().is_some())
    }

    /// Consumes the response, returning the per-operation results.
    #[must_use]
    pub fn into_results(self) -> Vec<OperationResult> {
        self.results
    }
}
