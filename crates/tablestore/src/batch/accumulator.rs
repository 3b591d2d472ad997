// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashSet;

use http::{Method, StatusCode};

use super::{OperationOutcome, OperationResult};
use crate::entity::Entity;
use crate::error::{UsageError, codes};
use crate::wire::merge_method;
use crate::{Error, Result, ServiceError};

/// Maximum number of operations in one transaction.
pub const MAX_BATCH_OPERATIONS: usize = 100;

/// The kind of an entity operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Inserts a new entity; fails if it exists.
    Insert,
    /// Replaces an existing entity; fails if it does not exist.
    Update,
    /// Merges properties into an existing entity; fails if it does not exist.
    Merge,
    /// Deletes an existing entity; fails if it does not exist.
    Delete,
    /// Inserts the entity or replaces it if it exists.
    InsertOrReplace,
    /// Inserts the entity or merges it into the existing one.
    InsertOrMerge,
}

impl OperationKind {
    pub(crate) fn method(self) -> Method {
        match self {
            Self::Insert => Method::POST,
            Self::Update | Self::InsertOrReplace => Method::PUT,
            Self::Merge | Self::InsertOrMerge => merge_method(),
            Self::Delete => Method::DELETE,
        }
    }

    /// Whether the request addresses the entity itself rather than the table's collection.
    pub(crate) fn addresses_entity(self) -> bool {
        !matches!(self, Self::Insert)
    }

    /// Whether the request carries an `If-Match` precondition.
    pub(crate) fn requires_if_match(self) -> bool {
        matches!(self, Self::Update | Self::Merge | Self::Delete)
    }

    pub(crate) fn has_body(self) -> bool {
        !matches!(self, Self::Delete)
    }
}

/// An operation queued into an open batch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OperationRecord {
    pub(crate) kind: OperationKind,
    pub(crate) table: String,
    pub(crate) entity: Entity,
    pub(crate) sequence: usize,
}

impl OperationRecord {
    pub(crate) fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn result(&self, outcome: OperationOutcome) -> OperationResult {
        OperationResult {
            sequence: self.sequence,
            kind: self.kind,
            partition_key: self.entity.partition_key().to_owned(),
            row_key: self.entity.row_key().to_owned(),
            outcome,
        }
    }
}

/// The operations of an open batch.
///
/// The first queued operation fixes the table and partition key of the batch. Operations that
/// disagree are still queued; they are rejected when the batch is committed.
#[derive(Debug, Default)]
pub(crate) struct BatchContext {
    operations: Vec<OperationRecord>,
}

impl BatchContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends an operation and returns its sequence number.
    pub(crate) fn queue(&mut self, kind: OperationKind, table: &str, entity: Entity) -> Result<usize> {
        validate_keys(&entity)?;

        let sequence = self.operations.len();
        self.operations.push(OperationRecord {
            kind,
            table: table.to_owned(),
            entity,
            sequence,
        });

        Ok(sequence)
    }

    pub(crate) fn len(&self) -> usize {
        self.operations.len()
    }

    pub(crate) fn table(&self) -> Option<&str> {
        self.operations.first().map(OperationRecord::table)
    }

    pub(crate) fn partition_key(&self) -> Option<&str> {
        self.operations.first().map(|op| op.entity.partition_key())
    }

    pub(crate) fn into_operations(self) -> Vec<OperationRecord> {
        self.operations
    }
}

pub(crate) fn validate_keys(entity: &Entity) -> Result<()> {
    if entity.partition_key().is_empty() {
        return Err(Error::usage(UsageError::MissingPartitionKey));
    }

    if entity.row_key().is_empty() {
        return Err(Error::usage(UsageError::MissingRowKey));
    }

    Ok(())
}

/// Checks the operations of a batch against the rules of one transaction.
///
/// Returns `Ok(None)` if the batch can be sent. Otherwise returns the result of every operation
/// as the service would report it: the offending operations are rejected and all others are
/// rolled back. Per identity, the first operation is authoritative; later operations on the same
/// entity are rejected as not found. An operation outside the batch's table or partition is
/// rejected as acting on a different partition.
///
/// # Errors
///
/// Returns a usage error if the batch holds more than [`MAX_BATCH_OPERATIONS`] operations.
pub(crate) fn validate(operations: &[OperationRecord]) -> Result<Option<Vec<OperationResult>>> {
    if operations.len() > MAX_BATCH_OPERATIONS {
        return Err(Error::usage(UsageError::BatchTooLarge {
            count: operations.len(),
            limit: MAX_BATCH_OPERATIONS,
        }));
    }

    let Some(first) = operations.first() else {
        return Ok(None);
    };

    let mut seen = HashSet::new();
    let mut violations = 0;

    let results: Vec<_> = operations
        .iter()
        .map(|op| {
            let identity = (op.table.as_str(), op.entity.partition_key(), op.entity.row_key());

            let error = if op.table != first.table || op.entity.partition_key() != first.entity.partition_key() {
                Some(ServiceError::new(
                    StatusCode::BAD_REQUEST,
                    codes::COMMANDS_IN_BATCH_ACT_ON_DIFFERENT_PARTITIONS,
                    format!("{}:All commands in a batch must operate on same entity group.", op.sequence),
                ))
            } else if !seen.insert(identity) {
                Some(ServiceError::new(
                    StatusCode::NOT_FOUND,
                    codes::RESOURCE_NOT_FOUND,
                    format!("{}:The specified resource does not exist.", op.sequence),
                ))
            } else {
                None
            };

            match error {
                Some(error) => {
                    violations += 1;
                    op.result(OperationOutcome::Failed(error))
                }
                None => op.result(OperationOutcome::RolledBack),
            }
        })
        .collect();

    Ok((violations > 0).then_some(results))
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn batch(ops: &[(OperationKind, &str, &str, &str)]) -> Vec<OperationRecord> {
        let mut context = BatchContext::new();
        for (kind, table, pk, rk) in ops {
            context.queue(*kind, table, Entity::new(*pk, *rk)).unwrap();
        }
        context.into_operations()
    }

    #[test]
    fn queue_assigns_sequence_in_order() {
        let mut context = BatchContext::new();

        assert_eq!(context.queue(OperationKind::Insert, "t", Entity::new("p", "1")).unwrap(), 0);
        assert_eq!(context.queue(OperationKind::Delete, "t", Entity::new("p", "2")).unwrap(), 1);
        assert_eq!(context.len(), 2);
        assert_eq!(context.table(), Some("t"));
        assert_eq!(context.partition_key(), Some("p"));
    }

    #[test]
    fn queue_rejects_missing_keys() {
        let mut context = BatchContext::new();

        let error = context.queue(OperationKind::Insert, "t", Entity::new("", "1")).unwrap_err();
        assert_eq!(error.usage_error(), Some(&UsageError::MissingPartitionKey));

        let error = context.queue(OperationKind::Insert, "t", Entity::new("p", "")).unwrap_err();
        assert_eq!(error.usage_error(), Some(&UsageError::MissingRowKey));

        assert_eq!(context.len(), 0);
    }

    #[test]
    fn valid_batch_passes() {
        let ops = batch(&[
            (OperationKind::Insert, "t", "p", "1"),
            (OperationKind::Merge, "t", "p", "2"),
            (OperationKind::Delete, "t", "p", "3"),
        ]);

        assert_eq!(validate(&ops).unwrap(), None);
        assert_eq!(validate(&[]).unwrap(), None);
    }

    #[test]
    fn duplicate_identity_fails_later_occurrence() {
        let ops = batch(&[
            (OperationKind::Insert, "t", "p", "E"),
            (OperationKind::Insert, "t", "p", "F"),
            (OperationKind::Update, "t", "p", "E"),
        ]);

        let results = validate(&ops).unwrap().unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].outcome(), &OperationOutcome::RolledBack);
        assert_eq!(results[1].outcome(), &OperationOutcome::RolledBack);
        let error = results[2].error().unwrap();
        assert_eq!(error.code(), codes::RESOURCE_NOT_FOUND);
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
        assert!(error.message().starts_with("2:"));
    }

    #[test]
    fn different_partition_or_table_is_rejected() {
        let ops = batch(&[
            (OperationKind::Insert, "t", "p", "1"),
            (OperationKind::Insert, "t", "q", "2"),
            (OperationKind::Insert, "u", "p", "3"),
        ]);

        let results = validate(&ops).unwrap().unwrap();

        assert_eq!(results[0].outcome(), &OperationOutcome::RolledBack);
        for result in &results[1..] {
            let error = result.error().unwrap();
            assert_eq!(error.code(), codes::COMMANDS_IN_BATCH_ACT_ON_DIFFERENT_PARTITIONS);
            assert_eq!(error.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn oversized_batch_is_usage_error() {
        let mut context = BatchContext::new();
        for row in 0..=MAX_BATCH_OPERATIONS {
            context.queue(OperationKind::Insert, "t", Entity::new("p", row.to_string())).unwrap();
        }

        let error = validate(&context.into_operations()).unwrap_err();

        assert_eq!(
            error.usage_error(),
            Some(&UsageError::BatchTooLarge {
                count: MAX_BATCH_OPERATIONS + 1,
                limit: MAX_BATCH_OPERATIONS
            })
        );
    }

    #[test]
    fn operation_kind_wire_mapping() {
        assert_eq!(OperationKind::Insert.method(), Method::POST);
        assert_eq!(OperationKind::InsertOrReplace.method(), Method::PUT);
        assert_eq!(OperationKind::InsertOrMerge.method().as_str(), "MERGE");
        assert!(!OperationKind::Insert.addresses_entity());
        assert!(OperationKind::Update.requires_if_match());
        assert!(!OperationKind::InsertOrMerge.requires_if_match());
        assert!(!OperationKind::Delete.has_body());
    }
}
