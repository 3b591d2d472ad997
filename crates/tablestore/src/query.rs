// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Entity queries and paging.

use http::HeaderMap;

use crate::entity::PropertyValue;
use crate::wire::{header_str, headers};

/// A query against the entities of one table.
///
/// Predicates are equality comparisons joined with `and`. Results are paged by the service;
/// pass the [`ContinuationToken`] of one page to [`TableQuery::continue_from`] to request the
/// next one.
///
/// # Examples
///
/// ```
/// use tablestore::TableQuery;
///
/// let query = TableQuery::select()
///     .from("buildings")
///     .where_eq("address", "street1")
///     .and_eq("RowKey", "1")
///     .top(4);
///
/// assert_eq!(query.filter(), Some("address eq 'street1' and RowKey eq '1'"));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableQuery {
    table: Option<String>,
    columns: Vec<String>,
    filter: Option<String>,
    top: Option<u32>,
    continuation: Option<ContinuationToken>,
}

impl TableQuery {
    /// Starts a query returning all columns.
    #[must_use]
    pub fn select() -> Self {
        Self::default()
    }

    /// Starts a query returning only the given columns.
    #[must_use]
    pub fn select_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the table to query.
    #[must_use]
    pub fn from(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Replaces the predicate with `property eq value`.
    #[must_use]
    pub fn where_eq(mut self, property: &str, value: impl Into<PropertyValue>) -> Self {
        self.filter = Some(equals(property, &value.into()));
        self
    }

    /// Adds `and property eq value` to the predicate.
    #[must_use]
    pub fn and_eq(mut self, property: &str, value: impl Into<PropertyValue>) -> Self {
        let clause = equals(property, &value.into());
        self.filter = Some(match self.filter.take() {
            Some(filter) => format!("{filter} and {clause}"),
            None => clause,
        });
        self
    }

    /// Restricts the query to the entity with the given keys.
    #[must_use]
    pub fn where_keys(self, partition_key: &str, row_key: &str) -> Self {
        self.where_eq("PartitionKey", partition_key).and_eq("RowKey", row_key)
    }

    /// Limits the number of entities per page.
    #[must_use]
    pub fn top(mut self, count: u32) -> Self {
        self.top = Some(count);
        self
    }

    /// Resumes a paged query where the previous page ended.
    #[must_use]
    pub fn continue_from(mut self, token: ContinuationToken) -> Self {
        self.continuation = Some(token);
        self
    }

    /// Returns the table, if set.
    #[must_use]
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// Returns the `$filter` expression, if any.
    #[must_use]
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Returns the page size limit, if any.
    #[must_use]
    pub fn top_count(&self) -> Option<u32> {
        self.top
    }

    /// Returns the query string parameters, not yet percent-encoded.
    pub(crate) fn parameters(&self) -> Vec<(&'static str, String)> {
        let mut parameters = Vec::new();

        if let Some(filter) = &self.filter {
            parameters.push(("$filter", filter.clone()));
        }

        if let Some(top) = self.top {
            parameters.push(("$top", top.to_string()));
        }

        if !self.columns.is_empty() {
            parameters.push(("$select", self.columns.join(",")));
        }

        if let Some(token) = &self.continuation {
            parameters.push(("NextPartitionKey", token.next_partition_key.clone()));
            if let Some(row_key) = &token.next_row_key {
                parameters.push(("NextRowKey", row_key.clone()));
            }
        }

        parameters
    }
}

fn equals(property: &str, value: &PropertyValue) -> String {
    format!("{property} eq {}", literal(value))
}

/// Formats a value as a filter literal.
pub(crate) fn literal(value: &PropertyValue) -> String {
    match value {
        PropertyValue::String(text) => format!("'{}'", text.replace('\'', "''")),
        PropertyValue::Boolean(value) => value.to_string(),
        PropertyValue::Int32(value) => value.to_string(),
        PropertyValue::Int64(value) => format!("{value}L"),
        PropertyValue::Double(value) => format!("{value:?}"),
        PropertyValue::Guid(value) => format!("guid'{value}'"),
        PropertyValue::DateTime(value) => format!("datetime'{value}'"),
    }
}

/// Marks where a paged query resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken {
    next_partition_key: String,
    next_row_key: Option<String>,
}

impl ContinuationToken {
    /// Creates a token from the keys of the next entity.
    #[must_use]
    pub fn new(next_partition_key: impl Into<String>, next_row_key: Option<String>) -> Self {
        Self {
            next_partition_key: next_partition_key.into(),
            next_row_key,
        }
    }

    /// Returns the partition key the next page starts at.
    #[must_use]
    pub fn next_partition_key(&self) -> &str {
        &self.next_partition_key
    }

    /// Returns the row key the next page starts at.
    #[must_use]
    pub fn next_row_key(&self) -> Option<&str> {
        self.next_row_key.as_deref()
    }

    pub(crate) fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let next_partition_key = header_str(headers, headers::CONTINUATION_NEXT_PARTITION_KEY)?;

        Some(Self {
            next_partition_key: next_partition_key.to_owned(),
            next_row_key: header_str(headers, headers::CONTINUATION_NEXT_ROW_KEY).map(str::to_owned),
        })
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use jiff::Timestamp;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn where_keys_builds_conjunction() {
        let query = TableQuery::select().from("t").where_keys("partition1", "1");

        assert_eq!(query.table(), Some("t"));
        assert_eq!(query.filter(), Some("PartitionKey eq 'partition1' and RowKey eq '1'"));
    }

    #[test]
    fn and_eq_without_where_starts_predicate() {
        let query = TableQuery::select().and_eq("a", true);

        assert_eq!(query.filter(), Some("a eq true"));
    }

    #[test]
    fn literals_by_type() {
        assert_eq!(literal(&"it's".into()), "'it''s'");
        assert_eq!(literal(&5.into()), "5");
        assert_eq!(literal(&5_i64.into()), "5L");
        assert_eq!(literal(&2.0.into()), "2.0");
        assert_eq!(literal(&Uuid::nil().into()), "guid'00000000-0000-0000-0000-000000000000'");
        assert_eq!(literal(&Timestamp::UNIX_EPOCH.into()), "datetime'1970-01-01T00:00:00Z'");
    }

    #[test]
    fn parameters_include_paging() {
        let query = TableQuery::select_columns(["a", "b"])
            .top(4)
            .continue_from(ContinuationToken::new("p", Some("r".to_owned())));

        assert_eq!(
            query.parameters(),
            vec![
                ("$top", "4".to_owned()),
                ("$select", "a,b".to_owned()),
                ("NextPartitionKey", "p".to_owned()),
                ("NextRowKey", "r".to_owned()),
            ]
        );
    }

    #[test]
    fn token_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(ContinuationToken::from_headers(&headers), None);

        headers.insert("x-ms-continuation-nextpartitionkey", "1!4!cA--".parse().unwrap());
        headers.insert("x-ms-continuation-nextrowkey", "1!4!Mg--".parse().unwrap());

        let token = ContinuationToken::from_headers(&headers).unwrap();
        assert_eq!(token.next_partition_key(), "1!4!cA--");
        assert_eq!(token.next_row_key(), Some("1!4!Mg--"));
    }
}
