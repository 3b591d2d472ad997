// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode};
use layered::{Layer, Service};
use parking_lot::Mutex;
use serde_json::Value;

use crate::batch::{self, BatchContext, BatchResponse, OperationKind};
use crate::endpoint::{Endpoint, to_uri};
use crate::entity::Entity;
use crate::error::UsageError;
use crate::filter::{FilterChain, Pipeline, Sign, wrap};
use crate::query::{ContinuationToken, TableQuery};
use crate::wire::{Request, Response, ResponseInfo, Transport, ensure_success, headers, json_request, set_if_match};
use crate::{Error, Result};

const TABLE_NAME: &str = "TableName";

/// Client for the tables and entities of one storage account.
///
/// Every request flows through the client's filters before reaching the transport. Entity
/// mutations are sent immediately unless a batch is open, in which case they are queued until
/// [`commit_batch`][Self::commit_batch].
///
/// Clones share the filters, the transport, and the open batch. A client is not meant to be
/// used for concurrent batches: queueing operations while a commit is in flight on the same
/// client has no defined order.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use tablestore::retry::ExponentialRetryPolicy;
/// use tablestore::testing::InMemoryTableService;
/// use tablestore::{Endpoint, Entity, TableClient, TableQuery};
/// use tick::Clock;
///
/// # futures::executor::block_on(async {
/// let retry = ExponentialRetryPolicy::new(&Clock::new_frozen());
/// retry.set_retry_interval(Duration::from_millis(100));
///
/// let client = TableClient::builder(Endpoint::development_storage(), InMemoryTableService::new())
///     .filter(retry)
///     .build();
///
/// client.create_table("buildings").await?;
///
/// client.begin_batch()?;
/// for row in 1..=3 {
///     client.insert_entity("buildings", Entity::new("partition1", row.to_string())).await?;
/// }
/// let committed = client.commit_batch().await?;
/// assert!(committed.is_successful());
///
/// let page = client.query_entities(&TableQuery::select().from("buildings").top(2)).await?;
/// assert_eq!(page.entities().len(), 2);
/// # Ok::<(), tablestore::Error>(())
/// # }).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct TableClient {
    endpoint: Endpoint,
    pipeline: Pipeline,
    batch: Arc<Mutex<Option<BatchContext>>>,
}

/// Builder for [`TableClient`].
#[derive(Debug)]
pub struct TableClientBuilder<T> {
    endpoint: Endpoint,
    transport: T,
    filters: FilterChain,
}

impl<T> TableClientBuilder<T>
where
    T: Transport + 'static,
{
    /// Appends a filter. Filters run outer to inner in the order they are added.
    #[must_use]
    pub fn filter<L>(mut self, filter: L) -> Self
    where
        L: Layer<Pipeline> + Send + Sync + 'static,
        L::Service: Service<Request, Out = Result<Response>> + 'static,
    {
        self.filters = self.filters.filter(filter);
        self
    }

    /// Sets the signer, invoked for every attempt directly above the transport.
    #[must_use]
    pub fn signer(mut self, signer: impl Sign + 'static) -> Self {
        self.filters = self.filters.signer(signer);
        self
    }

    /// Builds the client.
    #[must_use]
    pub fn build(self) -> TableClient {
        TableClient::new(self.endpoint, self.filters.into_pipeline(self.transport))
    }
}

impl TableClient {
    /// Starts building a client that sends requests through the given transport.
    #[must_use]
    pub fn builder<T: Transport + 'static>(endpoint: Endpoint, transport: T) -> TableClientBuilder<T> {
        TableClientBuilder {
            endpoint,
            transport,
            filters: FilterChain::new(),
        }
    }

    /// Creates a client on top of an assembled pipeline.
    #[must_use]
    pub fn new(endpoint: Endpoint, pipeline: Pipeline) -> Self {
        Self {
            endpoint,
            pipeline,
            batch: Arc::default(),
        }
    }

    /// Returns a client whose requests pass through `filter` before this client's filters.
    ///
    /// The new client shares the transport but starts without an open batch.
    #[must_use]
    pub fn with_filter<L>(&self, filter: L) -> Self
    where
        L: Layer<Pipeline>,
        L::Service: Service<Request, Out = Result<Response>> + 'static,
    {
        Self::new(self.endpoint.clone(), wrap(&filter, self.pipeline.clone()))
    }

    /// Returns the service endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Creates a table.
    ///
    /// # Errors
    ///
    /// Fails with `TableAlreadyExists` if the table exists.
    pub async fn create_table(&self, table: &str) -> Result<TableInfo> {
        let body = serde_json::json!({ "TableName": table }).to_string();
        let request = json_request(Method::POST, self.endpoint.tables_uri()?, Bytes::from(body))?;

        let response = self.send(request).await?;
        TableInfo::from_response(table, &response)
    }

    /// Creates a table unless it exists. Returns `true` if the table was created.
    ///
    /// # Errors
    ///
    /// Fails if the service rejects the request for any other reason.
    pub async fn create_table_if_not_exists(&self, table: &str) -> Result<bool> {
        match self.create_table(table).await {
            Ok(_) => Ok(true),
            Err(error) if error.code() == Some(crate::error::codes::TABLE_ALREADY_EXISTS) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Deletes a table and all its entities.
    ///
    /// # Errors
    ///
    /// Fails with `ResourceNotFound` if the table does not exist.
    pub async fn delete_table(&self, table: &str) -> Result<ResponseInfo> {
        let request = json_request(Method::DELETE, self.endpoint.table_uri(table)?, Bytes::new())?;

        let response = self.send(request).await?;
        Ok(ResponseInfo::from_response(&response))
    }

    /// Deletes a table if it exists. Returns `true` if the table was deleted.
    ///
    /// # Errors
    ///
    /// Fails if the service rejects the request for any other reason.
    pub async fn delete_table_if_exists(&self, table: &str) -> Result<bool> {
        match self.delete_table(table).await {
            Ok(_) => Ok(true),
            Err(error) if error.status() == Some(StatusCode::NOT_FOUND) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Reads the properties of a table.
    ///
    /// # Errors
    ///
    /// Fails with `ResourceNotFound` if the table does not exist.
    pub async fn get_table(&self, table: &str) -> Result<TableInfo> {
        let request = json_request(Method::GET, self.endpoint.table_uri(table)?, Bytes::new())?;

        let response = self.send(request).await?;
        TableInfo::from_response(table, &response)
    }

    /// Reads one entity.
    ///
    /// # Errors
    ///
    /// Fails with `ResourceNotFound` if the entity does not exist.
    pub async fn query_entity(&self, table: &str, partition_key: &str, row_key: &str) -> Result<Entity> {
        let uri = to_uri(self.endpoint.entity_url(table, partition_key, row_key))?;
        let request = json_request(Method::GET, uri, Bytes::new())?;

        let response = self.send(request).await?;
        let entity = Entity::from_body(response.body())?;

        Ok(match ResponseInfo::from_response(&response).etag() {
            Some(etag) => entity.with_etag(etag),
            None => entity,
        })
    }

    /// Reads one page of entities matching a query.
    ///
    /// The client does not follow continuations; re-issue the query with
    /// [`TableQuery::continue_from`] to read the next page.
    ///
    /// # Errors
    ///
    /// Fails with a usage error if the query names no table.
    pub async fn query_entities(&self, query: &TableQuery) -> Result<QueryPage> {
        let table = query.table().ok_or_else(|| Error::usage(UsageError::MissingTable))?;
        let uri = self.endpoint.query_uri(table, &query.parameters())?;
        let request = json_request(Method::GET, uri, Bytes::new())?;

        let response = self.send(request).await?;
        QueryPage::from_response(&response)
    }

    /// Inserts an entity; fails if it exists.
    ///
    /// # Errors
    ///
    /// Fails with a usage error if a key is missing, or with the service's error.
    pub async fn insert_entity(&self, table: &str, entity: Entity) -> Result<EntityDispatch> {
        self.dispatch(OperationKind::Insert, table, entity).await
    }

    /// Replaces an existing entity.
    ///
    /// Outside a batch the entity's `ETag`, if any, is the write's precondition.
    ///
    /// # Errors
    ///
    /// Fails with a usage error if a key is missing, or with the service's error.
    pub async fn update_entity(&self, table: &str, entity: Entity) -> Result<EntityDispatch> {
        self.dispatch(OperationKind::Update, table, entity).await
    }

    /// Merges properties into an existing entity.
    ///
    /// # Errors
    ///
    /// Fails with a usage error if a key is missing, or with the service's error.
    pub async fn merge_entity(&self, table: &str, entity: Entity) -> Result<EntityDispatch> {
        self.dispatch(OperationKind::Merge, table, entity).await
    }

    /// Deletes an existing entity. Only the keys and `ETag` of `entity` are used.
    ///
    /// # Errors
    ///
    /// Fails with a usage error if a key is missing, or with the service's error.
    pub async fn delete_entity(&self, table: &str, entity: Entity) -> Result<EntityDispatch> {
        self.dispatch(OperationKind::Delete, table, entity).await
    }

    /// Inserts an entity or replaces the existing one.
    ///
    /// # Errors
    ///
    /// Fails with a usage error if a key is missing, or with the service's error.
    pub async fn insert_or_replace_entity(&self, table: &str, entity: Entity) -> Result<EntityDispatch> {
        self.dispatch(OperationKind::InsertOrReplace, table, entity).await
    }

    /// Inserts an entity or merges it into the existing one.
    ///
    /// # Errors
    ///
    /// Fails with a usage error if a key is missing, or with the service's error.
    pub async fn insert_or_merge_entity(&self, table: &str, entity: Entity) -> Result<EntityDispatch> {
        self.dispatch(OperationKind::InsertOrMerge, table, entity).await
    }

    /// Opens a batch. Entity mutations are queued until the batch is committed.
    ///
    /// # Errors
    ///
    /// Fails with [`UsageError::BatchAlreadyOpen`] if a batch is open; batches do not nest.
    pub fn begin_batch(&self) -> Result<()> {
        let mut batch = self.batch.lock();
        if batch.is_some() {
            return Err(Error::usage(UsageError::BatchAlreadyOpen));
        }

        *batch = Some(BatchContext::new());
        Ok(())
    }

    /// Returns `true` if a batch is open.
    #[must_use]
    pub fn has_open_batch(&self) -> bool {
        self.batch.lock().is_some()
    }

    /// Discards the open batch without sending it. Returns `true` if a batch was open.
    pub fn rollback_batch(&self) -> bool {
        self.batch.lock().take().is_some()
    }

    /// Commits the open batch as one transaction.
    ///
    /// The batch is closed before anything is sent, whatever the outcome. On return, check both
    /// the envelope and the per-operation results of the [`BatchResponse`]: a transaction the
    /// service rolled back still completes with a successful envelope.
    ///
    /// An empty batch completes locally. So does a batch that violates the rules of a
    /// transaction; see the [`batch`][crate::batch] module.
    ///
    /// # Errors
    ///
    /// Fails with [`UsageError::NoOpenBatch`] if no batch is open and with
    /// [`UsageError::BatchTooLarge`] if the batch holds too many operations. Fails with the
    /// transport's or service's error if the round trip fails, and with a protocol error if the
    /// response cannot be aligned with the operations.
    pub async fn commit_batch(&self) -> Result<BatchResponse> {
        let context = self.batch.lock().take().ok_or_else(|| Error::usage(UsageError::NoOpenBatch))?;

        let table = context.table().unwrap_or_default().to_owned();
        let partition_key = context.partition_key().unwrap_or_default().to_owned();
        let operations = context.into_operations();

        if operations.is_empty() {
            return Ok(BatchResponse {
                results: Vec::new(),
                envelope: ResponseInfo::local(StatusCode::ACCEPTED),
            });
        }

        if let Some(results) = batch::validate(&operations)? {
            tracing::event!(
                name: "tablestore.batch.rejected",
                tracing::Level::WARN,
                batch.operations = operations.len(),
                batch.rejected = results.iter().filter(|result| result.error().is_some()).count(),
                table.name = %table,
                table.partition_key = %partition_key,
            );

            return Ok(BatchResponse {
                results,
                envelope: ResponseInfo::local(StatusCode::ACCEPTED),
            });
        }

        tracing::event!(
            name: "tablestore.batch.commit",
            tracing::Level::DEBUG,
            batch.operations = operations.len(),
            table.name = %table,
            table.partition_key = %partition_key,
        );

        let request = batch::encode(&self.endpoint, &operations)?;
        let response = self.pipeline.execute(request).await?;
        let results = batch::decode(&operations, &response)?;

        Ok(BatchResponse {
            results,
            envelope: ResponseInfo::from_response(&response),
        })
    }

    async fn dispatch(&self, kind: OperationKind, table: &str, entity: Entity) -> Result<EntityDispatch> {
        if let Some(context) = self.batch.lock().as_mut() {
            return context.queue(kind, table, entity).map(|sequence| EntityDispatch::Queued { sequence });
        }

        batch::validate_keys(&entity)?;

        let uri = if kind.addresses_entity() {
            self.endpoint.entity_url(table, entity.partition_key(), entity.row_key())
        } else {
            self.endpoint.entities_url(table)
        };
        let body = if kind.has_body() { Bytes::from(entity.to_body()) } else { Bytes::new() };

        let mut request = json_request(kind.method(), to_uri(uri)?, body)?;
        if kind.requires_if_match() {
            set_if_match(&mut request, entity.etag())?;
        }
        if kind == OperationKind::Insert {
            request
                .headers_mut()
                .insert(headers::PREFER, http::HeaderValue::from_static(headers::RETURN_NO_CONTENT));
        }

        let response = self.send(request).await?;
        Ok(EntityDispatch::Completed(EntityResponse {
            response: ResponseInfo::from_response(&response),
        }))
    }

    async fn send(&self, request: Request) -> Result<Response> {
        ensure_success(self.pipeline.execute(request).await?)
    }
}

/// How an entity mutation was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityDispatch {
    /// The operation was queued into the open batch.
    Queued {
        /// The operation's position in the batch.
        sequence: usize,
    },
    /// The operation was sent and applied.
    Completed(EntityResponse),
}

impl EntityDispatch {
    /// Returns the sequence number if the operation was queued.
    #[must_use]
    pub fn sequence(&self) -> Option<usize> {
        match self {
            Self::Queued { sequence } => Some(*sequence),
            Self::Completed(_) => None,
        }
    }

    /// Returns the response if the operation was sent.
    #[must_use]
    pub fn response(&self) -> Option<&EntityResponse> {
        match self {
            Self::Queued { .. } => None,
            Self::Completed(response) => Some(response),
        }
    }
}

/// The response to a single entity mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityResponse {
    response: ResponseInfo,
}

impl EntityResponse {
    /// Returns the new `ETag` of the entity; absent for deletes.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.response.etag()
    }

    /// Returns the status and headers of the response.
    #[must_use]
    pub fn response(&self) -> &ResponseInfo {
        &self.response
    }
}

/// A table as returned by table operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    name: String,
    response: ResponseInfo,
}

impl TableInfo {
    fn from_response(requested: &str, response: &Response) -> Result<Self> {
        let name = if response.body().is_empty() {
            requested.to_owned()
        } else {
            let document: Value = serde_json::from_slice(response.body()).map_err(Error::protocol)?;
            document
                .get(TABLE_NAME)
                .and_then(Value::as_str)
                .unwrap_or(requested)
                .to_owned()
        };

        Ok(Self {
            name,
            response: ResponseInfo::from_response(response),
        })
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the status and headers of the response.
    #[must_use]
    pub fn response(&self) -> &ResponseInfo {
        &self.response
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPage {
    entities: Vec<Entity>,
    continuation: Option<ContinuationToken>,
    response: ResponseInfo,
}

impl QueryPage {
    fn from_response(response: &Response) -> Result<Self> {
        let document: Value = serde_json::from_slice(response.body()).map_err(Error::protocol)?;
        let values = document
            .get("value")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::protocol("query response has no 'value' array"))?;

        let entities = values
            .iter()
            .map(|value| match value {
                Value::Object(map) => Entity::from_json(map),
                _ => Err(Error::protocol("query result is not a JSON object")),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            entities,
            continuation: ContinuationToken::from_headers(response.headers()),
            response: ResponseInfo::from_response(response),
        })
    }

    /// Returns the entities of this page.
    #[must_use]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Returns the token for the next page, if there is one.
    #[must_use]
    pub fn continuation(&self) -> Option<&ContinuationToken> {
        self.continuation.as_ref()
    }

    /// Returns the status and headers of the response.
    #[must_use]
    pub fn response(&self) -> &ResponseInfo {
        &self.response
    }

    /// Consumes the page, returning its entities.
    #[must_use]
    pub fn into_entities(self) -> Vec<Entity> {
        self.entities
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use layered::Execute;

    use super::*;

    fn counting_client() -> (TableClient, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let transport = Execute::new(move |_request: Request| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, Error>(http::Response::builder().status(StatusCode::NO_CONTENT).body(Bytes::new()).unwrap()) }
        });

        (TableClient::builder(Endpoint::development_storage(), transport).build(), calls)
    }

    #[tokio::test]
    async fn batch_lifecycle() {
        let (client, calls) = counting_client();

        assert!(!client.has_open_batch());
        client.begin_batch().unwrap();
        assert!(client.has_open_batch());

        let error = client.begin_batch().unwrap_err();
        assert_eq!(error.usage_error(), Some(&UsageError::BatchAlreadyOpen));

        let first = client.insert_entity("t", Entity::new("p", "1")).await.unwrap();
        let second = client.delete_entity("t", Entity::new("p", "2")).await.unwrap();
        assert_eq!(first, EntityDispatch::Queued { sequence: 0 });
        assert_eq!(second.sequence(), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(client.rollback_batch());
        assert!(!client.has_open_batch());
        assert!(!client.rollback_batch());
    }

    #[tokio::test]
    async fn commit_without_batch_is_usage_error() {
        let (client, _) = counting_client();

        let error = client.commit_batch().await.unwrap_err();

        assert_eq!(error.usage_error(), Some(&UsageError::NoOpenBatch));
    }

    #[tokio::test]
    async fn empty_batch_completes_locally() {
        let (client, calls) = counting_client();
        client.begin_batch().unwrap();

        let response = client.commit_batch().await.unwrap();

        assert!(response.results().is_empty());
        assert!(response.envelope().is_local());
        assert!(response.is_successful());
        assert!(!client.has_open_batch());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_batch_completes_locally_and_closes() {
        let (client, calls) = counting_client();
        client.begin_batch().unwrap();
        client.insert_entity("t", Entity::new("p", "E")).await.unwrap();
        client.update_entity("t", Entity::new("p", "E")).await.unwrap();

        let response = client.commit_batch().await.unwrap();

        assert_eq!(response.results().len(), 2);
        assert!(response.envelope().is_successful());
        assert!(response.envelope().is_local());
        assert!(!response.is_successful());
        assert_eq!(response.first_failure().unwrap().sequence(), 1);
        assert!(!client.has_open_batch());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_batch_fails_and_closes() {
        let (client, calls) = counting_client();
        client.begin_batch().unwrap();
        for row in 0..=batch::MAX_BATCH_OPERATIONS {
            client.insert_entity("t", Entity::new("p", row.to_string())).await.unwrap();
        }

        let error = client.commit_batch().await.unwrap_err();

        assert!(matches!(error.usage_error(), Some(UsageError::BatchTooLarge { .. })));
        assert!(!client.has_open_batch());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_keys_are_rejected_before_sending() {
        let (client, calls) = counting_client();

        let error = client.insert_entity("t", Entity::new("", "1")).await.unwrap_err();

        assert_eq!(error.usage_error(), Some(&UsageError::MissingPartitionKey));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn query_without_table_is_usage_error() {
        let (client, _) = counting_client();

        let error = client.query_entities(&TableQuery::select()).await.unwrap_err();

        assert_eq!(error.usage_error(), Some(&UsageError::MissingTable));
    }

    #[tokio::test]
    async fn single_mutation_sends_conditional_request() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let transport = Execute::new(move |request: Request| {
            seen_clone.lock().push(request);
            async move {
                Ok::<_, Error>(http::Response::builder()
                    .status(StatusCode::NO_CONTENT)
                    .header(http::header::ETAG, "W/\"2\"")
                    .body(Bytes::new())
                    .unwrap())
            }
        });
        let client = TableClient::builder(Endpoint::development_storage(), transport).build();

        let dispatch = client
            .merge_entity("t", Entity::new("p", "r").with("a", 1).with_etag("W/\"1\""))
            .await
            .unwrap();

        assert_eq!(dispatch.response().unwrap().etag(), Some("W/\"2\""));
        let seen = seen.lock();
        assert_eq!(seen[0].method().as_str(), "MERGE");
        assert_eq!(seen[0].uri(), "http://127.0.0.1:10002/devstoreaccount1/t(PartitionKey='p',RowKey='r')");
        assert_eq!(seen[0].headers().get(http::header::IF_MATCH).unwrap(), "W/\"1\"");
    }

    #[test]
    fn static_assertions() {
        static_assertions::assert_impl_all!(TableClient: Send, Sync, Clone, std::fmt::Debug);
        static_assertions::assert_impl_all!(BatchResponse: Send, Sync);
    }
}
