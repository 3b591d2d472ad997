// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles for the transport collaborator.
//!
//! [`InMemoryTableService`] answers table requests the way the service does, keeping tables and
//! entities in memory. [`FlakyTransport`] wraps another transport and injects scripted failures,
//! recording every request it sees.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, ETAG, IF_MATCH};
use http::{HeaderValue, Method, StatusCode, Uri};
use jiff::Timestamp;
use layered::Service;
use parking_lot::Mutex;
use pct_str::PctStr;
use serde_json::{Map, Value};

use crate::batch::multipart::{
    APPLICATION_HTTP, CONTENT_TRANSFER_ENCODING, EmbeddedRequest, MultipartWriter, boundary_of, embedded_messages, http_message,
    multipart_content_type, new_boundary,
};
use crate::batch::{MAX_BATCH_OPERATIONS, has_if_match};
use crate::entity::{Entity, PropertyValue};
use crate::error::codes;
use crate::wire::{Request, Response, Transport, clone_request, header_str, headers};
use crate::{Error, Result, ServiceError};

const DEFAULT_PAGE_SIZE: usize = 1000;
const JSON_CONTENT: &str = "application/json;odata=minimalmetadata;streaming=true;charset=utf-8";

type Key = (String, String);

#[derive(Debug, Clone)]
struct Stored {
    properties: Map<String, Value>,
    etag: String,
    timestamp: Timestamp,
}

#[derive(Debug, Clone, Default)]
struct Store {
    tables: BTreeMap<String, BTreeMap<Key, Stored>>,
    version: u64,
}

#[derive(Debug)]
struct ServiceState {
    store: Store,
    page_size: usize,
    requests: usize,
}

/// An in-memory table service.
///
/// Supports table creation, lookup and deletion, the six entity writes with `If-Match`
/// preconditions, equality-filtered and paged queries, and `$batch` transactions. A transaction
/// is applied atomically: the first failing operation rolls back the whole batch and is reported
/// alone, its message prefixed with its index, as in `1:The specified resource does not exist.`
/// Within a batch, a second operation on an entity the batch already touched fails with
/// `ResourceNotFound`.
///
/// Clones share the stored data.
///
/// # Examples
///
/// ```
/// use tablestore::testing::InMemoryTableService;
/// use tablestore::{Endpoint, TableClient};
///
/// # futures::executor::block_on(async {
/// let service = InMemoryTableService::new();
/// let client = TableClient::builder(Endpoint::development_storage(), service.clone()).build();
///
/// client.create_table("t").await.unwrap();
///
/// assert!(service.has_table("t"));
/// assert_eq!(service.request_count(), 1);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryTableService {
    state: Arc<Mutex<ServiceState>>,
}

impl Default for InMemoryTableService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTableService {
    /// Creates a service without tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServiceState {
                store: Store::default(),
                page_size: DEFAULT_PAGE_SIZE,
                requests: 0,
            })),
        }
    }

    /// Limits the number of entities per query page; further entities need a continuation.
    #[must_use]
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state.lock().page_size = page_size.max(1);
        self
    }

    /// Returns `true` if the table exists.
    #[must_use]
    pub fn has_table(&self, table: &str) -> bool {
        self.state.lock().store.tables.contains_key(table)
    }

    /// Returns the number of entities in a table.
    #[must_use]
    pub fn entity_count(&self, table: &str) -> usize {
        self.state.lock().store.tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Returns the number of requests handled.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.state.lock().requests
    }

    /// Handles one request.
    #[must_use]
    pub fn handle(&self, request: &Request) -> Response {
        let mut state = self.state.lock();
        state.requests += 1;

        let segment = last_segment(request.uri());

        match (request.method(), segment) {
            (&Method::POST, "$batch") => batch(&mut state.store, request),
            (&Method::POST, "Tables") => create_table(&mut state.store, request),
            (&Method::GET, "Tables") => list_tables(&state.store),
            (method, segment) if segment.starts_with("Tables(") => match table_name(segment) {
                Ok(name) if method == Method::GET => get_table(&state.store, &name),
                Ok(name) if method == Method::DELETE => delete_table(&mut state.store, &name),
                Ok(_) => error_response(&method_not_allowed()),
                Err(error) => error_response(&error),
            },
            (&Method::GET, segment) => {
                let page_size = state.page_size;
                query(&state.store, segment, request.uri().query(), page_size)
            }
            (method, _) => {
                let write = EntityWrite::resolve(method, request.uri(), request.headers(), request.body());
                match write.and_then(|write| state.store.apply(write)) {
                    Ok(applied) => applied.into_response(prefers_no_content(request.headers())),
                    Err(error) => error_response(&error),
                }
            }
        }
    }
}

impl Service<Request> for InMemoryTableService {
    type Out = Result<Response>;

    async fn execute(&self, request: Request) -> Self::Out {
        Ok(self.handle(&request))
    }
}

fn last_segment(uri: &Uri) -> &str {
    uri.path().rsplit('/').next().unwrap_or_default()
}

fn decode(text: &str) -> std::result::Result<String, ServiceError> {
    PctStr::new(text)
        .ok()
        .map(PctStr::decode)
        .ok_or_else(|| invalid_input("The request URL is not correctly percent-encoded."))
}

/// Reads `'value'` with doubled quotes into `value`.
fn unquote(text: &str) -> Option<String> {
    text.strip_prefix('\'')?.strip_suffix('\'').map(|inner| inner.replace("''", "'"))
}

fn table_name(segment: &str) -> std::result::Result<String, ServiceError> {
    let quoted = segment
        .strip_prefix("Tables(")
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| invalid_input("Malformed table address."))?;

    unquote(&decode(quoted)?).ok_or_else(|| invalid_input("Malformed table address."))
}

fn create_table(store: &mut Store, request: &Request) -> Response {
    let name = serde_json::from_slice::<Value>(request.body())
        .ok()
        .and_then(|body| body.get("TableName").and_then(Value::as_str).map(str::to_owned));

    let Some(name) = name.filter(|name| !name.is_empty()) else {
        return error_response(&invalid_input("The table name is missing."));
    };

    if store.tables.contains_key(&name) {
        return error_response(&ServiceError::new(
            StatusCode::CONFLICT,
            codes::TABLE_ALREADY_EXISTS,
            "The table specified already exists.",
        ));
    }

    store.tables.insert(name.clone(), BTreeMap::new());

    if prefers_no_content(request.headers()) {
        empty_response(StatusCode::NO_CONTENT, None)
    } else {
        json_response(StatusCode::CREATED, &serde_json::json!({ "TableName": name }), None)
    }
}

fn get_table(store: &Store, name: &str) -> Response {
    if store.tables.contains_key(name) {
        json_response(StatusCode::OK, &serde_json::json!({ "TableName": name }), None)
    } else {
        error_response(&resource_not_found())
    }
}

fn delete_table(store: &mut Store, name: &str) -> Response {
    match store.tables.remove(name) {
        Some(_) => empty_response(StatusCode::NO_CONTENT, None),
        None => error_response(&resource_not_found()),
    }
}

fn list_tables(store: &Store) -> Response {
    let value: Vec<Value> = store.tables.keys().map(|name| serde_json::json!({ "TableName": name })).collect();
    json_response(StatusCode::OK, &serde_json::json!({ "value": value }), None)
}

fn query(store: &Store, segment: &str, query: Option<&str>, page_size: usize) -> Response {
    match run_query(store, segment, query, page_size) {
        Ok(response) => response,
        Err(error) => error_response(&error),
    }
}

fn run_query(store: &Store, segment: &str, query: Option<&str>, page_size: usize) -> std::result::Result<Response, ServiceError> {
    let addressed = decode(segment)?;

    if let Some((table, keys)) = entity_address(&addressed) {
        let table = store.tables.get(&table).ok_or_else(table_not_found)?;
        let stored = table.get(&keys).ok_or_else(resource_not_found)?;
        return Ok(json_response(StatusCode::OK, &Value::Object(entity_json(&keys, stored)), Some(&stored.etag)));
    }

    let table = addressed.strip_suffix("()").unwrap_or(&addressed);
    let entities = store.tables.get(table).ok_or_else(table_not_found)?;

    let mut parameters = BTreeMap::new();
    for pair in query.unwrap_or_default().split('&').filter(|pair| !pair.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        parameters.insert(name.to_owned(), decode(value)?);
    }

    let clauses = parameters.get("$filter").map(|filter| parse_filter(filter)).transpose()?.unwrap_or_default();
    let top = match parameters.get("$top") {
        Some(top) => top.parse::<usize>().map_err(|_parse| invalid_input("$top is not a number."))?,
        None => usize::MAX,
    };
    let columns: Option<Vec<&str>> = parameters.get("$select").map(|select| select.split(',').map(str::trim).collect());
    let start = parameters.get("NextPartitionKey").map(|partition_key| {
        (
            partition_key.clone(),
            parameters.get("NextRowKey").cloned().unwrap_or_default(),
        )
    });

    let mut matching = entities
        .iter()
        .filter(|(keys, _)| start.as_ref().is_none_or(|start| *keys >= start))
        .map(|(keys, stored)| entity_json(keys, stored))
        .filter(|json| Entity::from_json(json).is_ok_and(|entity| matches_all(&entity, &clauses)));

    let page: Vec<Map<String, Value>> = matching.by_ref().take(top.min(page_size)).collect();
    let next = matching.next();

    let value: Vec<Value> = page
        .into_iter()
        .map(|json| Value::Object(project(json, columns.as_deref())))
        .collect();

    let mut response = json_response(StatusCode::OK, &serde_json::json!({ "value": value }), None);

    if let Some(next) = next {
        insert_header(&mut response, headers::CONTINUATION_NEXT_PARTITION_KEY, next.get("PartitionKey"));
        insert_header(&mut response, headers::CONTINUATION_NEXT_ROW_KEY, next.get("RowKey"));
    }

    Ok(response)
}

fn insert_header(response: &mut Response, name: &'static str, value: Option<&Value>) {
    if let Some(value) = value.and_then(Value::as_str).and_then(|value| HeaderValue::from_str(value).ok()) {
        response.headers_mut().insert(name, value);
    }
}

fn project(mut json: Map<String, Value>, columns: Option<&[&str]>) -> Map<String, Value> {
    if let Some(columns) = columns {
        json.retain(|name, _| {
            let property = name.split('@').next().unwrap_or(name);
            matches!(property, "PartitionKey" | "RowKey" | "Timestamp") || name.starts_with("odata.") || columns.contains(&property)
        });
    }
    json
}

/// Splits `table(PartitionKey='p',RowKey='r')` into the table and the keys.
fn entity_address(addressed: &str) -> Option<(String, Key)> {
    let (table, predicate) = addressed.split_once('(')?;
    let predicate = predicate.strip_suffix(')')?;
    let (partition_key, row_key) = predicate.strip_prefix("PartitionKey=")?.split_once(",RowKey=")?;

    Some((table.to_owned(), (unquote(partition_key)?, unquote(row_key)?)))
}

fn parse_filter(filter: &str) -> std::result::Result<Vec<(String, PropertyValue)>, ServiceError> {
    filter
        .split(" and ")
        .map(|clause| {
            let (property, literal) = clause
                .trim()
                .split_once(" eq ")
                .ok_or_else(|| invalid_input(format!("Unsupported filter clause '{clause}'.")))?;
            let value = parse_literal(literal.trim()).ok_or_else(|| invalid_input(format!("Malformed literal '{literal}'.")))?;
            Ok((property.trim().to_owned(), value))
        })
        .collect()
}

fn parse_literal(literal: &str) -> Option<PropertyValue> {
    if let Some(guid) = literal.strip_prefix("guid") {
        return unquote(guid)?.parse().ok().map(PropertyValue::Guid);
    }

    if let Some(datetime) = literal.strip_prefix("datetime") {
        return unquote(datetime)?.parse().ok().map(PropertyValue::DateTime);
    }

    if literal.starts_with('\'') {
        return unquote(literal).map(PropertyValue::String);
    }

    match literal {
        "true" => return Some(PropertyValue::Boolean(true)),
        "false" => return Some(PropertyValue::Boolean(false)),
        _ => {}
    }

    if let Some(int64) = literal.strip_suffix('L') {
        return int64.parse().ok().map(PropertyValue::Int64);
    }

    if literal.contains(['.', 'e', 'E']) {
        return literal.parse().ok().map(PropertyValue::Double);
    }

    literal.parse().ok().map(PropertyValue::Int32)
}

fn matches_all(entity: &Entity, clauses: &[(String, PropertyValue)]) -> bool {
    clauses.iter().all(|(property, expected)| match property.as_str() {
        "PartitionKey" => expected.as_str() == Some(entity.partition_key()),
        "RowKey" => expected.as_str() == Some(entity.row_key()),
        name => entity.property(name) == Some(expected),
    })
}

fn entity_json(keys: &Key, stored: &Stored) -> Map<String, Value> {
    let mut json = Map::new();
    json.insert("odata.etag".to_owned(), Value::String(stored.etag.clone()));
    json.insert("PartitionKey".to_owned(), Value::String(keys.0.clone()));
    json.insert("RowKey".to_owned(), Value::String(keys.1.clone()));
    json.insert("Timestamp".to_owned(), Value::String(stored.timestamp.to_string()));
    json.extend(stored.properties.clone());
    json
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Replace,
    Merge,
    Delete,
}

/// An entity write, parsed from a request.
#[derive(Debug)]
struct EntityWrite {
    kind: WriteKind,
    table: String,
    keys: Key,
    if_match: Option<String>,
    properties: Map<String, Value>,
}

impl EntityWrite {
    fn resolve(method: &Method, uri: &Uri, headers: &http::HeaderMap, body: &[u8]) -> std::result::Result<Self, ServiceError> {
        let addressed = decode(last_segment(uri))?;
        let mut properties = parse_properties(body)?;

        let (kind, table, keys) = match entity_address(&addressed) {
            Some((table, keys)) => {
                let kind = match method.as_str() {
                    "PUT" => WriteKind::Replace,
                    "MERGE" => WriteKind::Merge,
                    "DELETE" => WriteKind::Delete,
                    _ => return Err(method_not_allowed()),
                };
                (kind, table, keys)
            }
            None if method == Method::POST => {
                let key = |name: &str| match properties.get(name) {
                    Some(Value::String(value)) => Ok(value.clone()),
                    _ => Err(invalid_input(format!("The entity has no {name}."))),
                };
                let keys = (key("PartitionKey")?, key("RowKey")?);
                (WriteKind::Insert, addressed, keys)
            }
            None => return Err(method_not_allowed()),
        };

        properties.retain(|name, _| !matches!(name.as_str(), "PartitionKey" | "RowKey" | "Timestamp") && !name.starts_with("odata."));

        let if_match = if has_if_match(headers) {
            header_str(headers, IF_MATCH).map(str::to_owned)
        } else {
            None
        };

        Ok(Self {
            kind,
            table,
            keys,
            if_match,
            properties,
        })
    }
}

fn parse_properties(body: &[u8]) -> std::result::Result<Map<String, Value>, ServiceError> {
    if body.trim_ascii().is_empty() {
        return Ok(Map::new());
    }

    match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(invalid_input("The request body is not a JSON object.")),
    }
}

/// The result of an applied write.
#[derive(Debug)]
struct Applied {
    status: StatusCode,
    etag: Option<String>,
    entity: Option<Value>,
}

impl Applied {
    fn into_response(self, no_content: bool) -> Response {
        match self.entity {
            Some(entity) if !no_content => json_response(self.status, &entity, self.etag.as_deref()),
            _ => empty_response(StatusCode::NO_CONTENT, self.etag.as_deref()),
        }
    }
}

impl Store {
    fn apply(&mut self, write: EntityWrite) -> std::result::Result<Applied, ServiceError> {
        self.version += 1;
        let etag = format!("W/\"{}\"", self.version);

        let table = self.tables.get_mut(&write.table).ok_or_else(table_not_found)?;
        let existing = table.get(&write.keys).cloned();

        if let (Some(stored), Some(expected)) = (&existing, write.if_match.as_deref())
            && expected != "*"
            && expected != stored.etag
        {
            return Err(ServiceError::new(
                StatusCode::PRECONDITION_FAILED,
                codes::UPDATE_CONDITION_NOT_SATISFIED,
                "The update condition specified in the request was not satisfied.",
            ));
        }

        let conditional = write.if_match.is_some();
        let properties = match (write.kind, existing) {
            (WriteKind::Insert, Some(_)) => {
                return Err(ServiceError::new(
                    StatusCode::CONFLICT,
                    codes::ENTITY_ALREADY_EXISTS,
                    "The specified entity already exists.",
                ));
            }
            (WriteKind::Replace | WriteKind::Merge | WriteKind::Delete, None) if conditional || write.kind == WriteKind::Delete => {
                return Err(resource_not_found());
            }
            (WriteKind::Delete, Some(_)) => {
                table.remove(&write.keys);
                return Ok(Applied {
                    status: StatusCode::NO_CONTENT,
                    etag: None,
                    entity: None,
                });
            }
            (WriteKind::Merge, Some(stored)) => merge(stored.properties, write.properties),
            _ => write.properties,
        };

        let stored = Stored {
            properties,
            etag: etag.clone(),
            timestamp: Timestamp::now(),
        };
        let entity = Value::Object(entity_json(&write.keys, &stored));
        let status = if write.kind == WriteKind::Insert { StatusCode::CREATED } else { StatusCode::NO_CONTENT };
        table.insert(write.keys, stored);

        Ok(Applied {
            status,
            etag: Some(etag),
            entity: (status == StatusCode::CREATED).then_some(entity),
        })
    }
}

fn merge(mut existing: Map<String, Value>, incoming: Map<String, Value>) -> Map<String, Value> {
    for name in incoming.keys().filter(|name| !name.contains('@')) {
        existing.remove(&format!("{name}@odata.type"));
    }
    existing.extend(incoming);
    existing
}

fn batch(store: &mut Store, request: &Request) -> Response {
    match run_batch(store, request) {
        Ok(response) => response,
        Err(error) => error_response(&error),
    }
}

fn run_batch(store: &mut Store, request: &Request) -> std::result::Result<Response, ServiceError> {
    let malformed = || invalid_input("The batch request body is malformed.");

    let boundary = header_str(request.headers(), CONTENT_TYPE).and_then(boundary_of).ok_or_else(malformed)?;
    let body = std::str::from_utf8(request.body()).map_err(|_utf8| malformed())?;
    let parts = embedded_messages(body, boundary)
        .and_then(|messages| messages.into_iter().map(EmbeddedRequest::parse).collect::<Result<Vec<_>>>())
        .map_err(|_protocol| malformed())?;

    if parts.len() > MAX_BATCH_OPERATIONS {
        return Err(invalid_input(format!("The batch holds more than {MAX_BATCH_OPERATIONS} operations.")));
    }

    let mut staged = store.clone();
    let mut touched = HashSet::new();
    let mut group: Option<(String, String)> = None;
    let mut responses = Vec::with_capacity(parts.len());

    for (index, part) in parts.iter().enumerate() {
        let content_id = part.content_id().unwrap_or(index + 1);

        let applied = part
            .url
            .parse::<Uri>()
            .map_err(|_uri| malformed())
            .and_then(|uri| EntityWrite::resolve(&part.method, &uri, &part.headers, &part.body))
            .and_then(|write| {
                let entity_group = (write.table.clone(), write.keys.0.clone());
                if group.get_or_insert_with(|| entity_group.clone()) != &entity_group {
                    return Err(ServiceError::new(
                        StatusCode::BAD_REQUEST,
                        codes::COMMANDS_IN_BATCH_ACT_ON_DIFFERENT_PARTITIONS,
                        "All commands in a batch must operate on same entity group.",
                    ));
                }

                if !touched.insert((write.table.clone(), write.keys.clone())) {
                    return Err(resource_not_found());
                }

                staged.apply(write)
            });

        match applied {
            Ok(applied) => responses.push((content_id, applied)),
            Err(error) => {
                let indexed = ServiceError::new(error.status(), error.code(), format!("{index}:{}", error.message()));
                return Ok(changeset_response(&[(content_id, embedded_error(&indexed))]));
            }
        }
    }

    *store = staged;

    let messages: Vec<_> = responses
        .iter()
        .zip(&parts)
        .map(|((content_id, applied), part)| (*content_id, embedded_success(applied, prefers_no_content(&part.headers))))
        .collect();

    Ok(changeset_response(&messages))
}

fn embedded_success(applied: &Applied, no_content: bool) -> String {
    let body = match &applied.entity {
        Some(entity) if !no_content => entity.to_string(),
        _ => String::new(),
    };
    let status = if body.is_empty() { StatusCode::NO_CONTENT } else { applied.status };

    let mut message_headers = vec![("DataServiceVersion", headers::DATA_SERVICE_VERSION_VALUE)];
    if let Some(etag) = &applied.etag {
        message_headers.push(("ETag", etag.as_str()));
    }
    if !body.is_empty() {
        message_headers.push(("Content-Type", JSON_CONTENT));
    }

    http_message(&status_line(status), &message_headers, &body)
}

fn embedded_error(error: &ServiceError) -> String {
    http_message(
        &status_line(error.status()),
        &[("DataServiceVersion", headers::DATA_SERVICE_VERSION_VALUE), ("Content-Type", JSON_CONTENT)],
        &String::from_utf8_lossy(&error.to_body()),
    )
}

fn status_line(status: StatusCode) -> String {
    format!("HTTP/1.1 {} {}", status.as_u16(), status.canonical_reason().unwrap_or_default())
}

/// Wraps embedded responses, prefixed with their `Content-ID`, in a batch response.
fn changeset_response(messages: &[(usize, String)]) -> Response {
    let changeset_boundary = new_boundary("changesetresponse");
    let batch_boundary = new_boundary("batchresponse");

    let mut changeset = MultipartWriter::new(changeset_boundary.clone());
    for (content_id, message) in messages {
        let message = message.replacen("\r\n", &format!("\r\nContent-ID: {content_id}\r\n"), 1);
        changeset.part(&[("Content-Type", APPLICATION_HTTP), (CONTENT_TRANSFER_ENCODING, "binary")], &message);
    }

    let changeset_type = multipart_content_type(&changeset_boundary);
    let mut batch = MultipartWriter::new(batch_boundary.clone());
    batch.part(&[("Content-Type", changeset_type.as_str())], &changeset.finish());

    let mut response = Response::new(Bytes::from(batch.finish()));
    *response.status_mut() = StatusCode::ACCEPTED;
    if let Ok(value) = HeaderValue::from_str(&multipart_content_type(&batch_boundary)) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn prefers_no_content(request_headers: &http::HeaderMap) -> bool {
    header_str(request_headers, headers::PREFER) == Some(headers::RETURN_NO_CONTENT)
}

fn json_response(status: StatusCode, body: &Value, etag: Option<&str>) -> Response {
    let mut response = empty_response(status, etag);
    *response.body_mut() = Bytes::from(body.to_string());
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT));
    response
}

fn empty_response(status: StatusCode, etag: Option<&str>) -> Response {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(headers::MS_VERSION, HeaderValue::from_static(headers::MS_VERSION_VALUE));
    if let Some(value) = etag.and_then(|etag| HeaderValue::from_str(etag).ok()) {
        response.headers_mut().insert(ETAG, value);
    }
    response
}

fn error_response(error: &ServiceError) -> Response {
    let mut response = Response::new(Bytes::from(error.to_body()));
    *response.status_mut() = error.status();
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT));
    response
}

fn invalid_input(message: impl Into<String>) -> ServiceError {
    ServiceError::new(StatusCode::BAD_REQUEST, codes::INVALID_INPUT, message)
}

fn method_not_allowed() -> ServiceError {
    ServiceError::new(StatusCode::METHOD_NOT_ALLOWED, "UnsupportedHttpVerb", "The resource doesn't support the specified HTTP verb.")
}

fn resource_not_found() -> ServiceError {
    ServiceError::new(StatusCode::NOT_FOUND, codes::RESOURCE_NOT_FOUND, "The specified resource does not exist.")
}

fn table_not_found() -> ServiceError {
    ServiceError::new(StatusCode::NOT_FOUND, codes::TABLE_NOT_FOUND, "The table specified does not exist.")
}

/// A failure injected by [`FlakyTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Answer with an error response of this status.
    Status(StatusCode),
    /// Fail as if the connection broke.
    Transport,
}

/// A transport that fails on demand.
///
/// Scripted faults are consumed in order, one per request; once the script is exhausted,
/// requests reach the inner transport. Every request is recorded, including the ones answered
/// with a fault.
///
/// # Examples
///
/// ```
/// use http::StatusCode;
/// use tablestore::testing::{Fault, FlakyTransport, InMemoryTableService};
///
/// let transport = FlakyTransport::new(InMemoryTableService::new());
/// transport.push_faults(Fault::Status(StatusCode::SERVICE_UNAVAILABLE), 2);
/// transport.push_fault(Fault::Transport);
///
/// assert_eq!(transport.pending_faults(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct FlakyTransport<T> {
    inner: T,
    faults: Arc<Mutex<VecDeque<Fault>>>,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl<T> FlakyTransport<T> {
    /// Wraps a transport without scripted faults.
    #[must_use]
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            faults: Arc::default(),
            requests: Arc::default(),
        }
    }

    /// Appends one fault to the script.
    pub fn push_fault(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    /// Appends the same fault `times` times.
    pub fn push_faults(&self, fault: Fault, times: usize) {
        self.faults.lock().extend(std::iter::repeat_n(fault, times));
    }

    /// Returns the number of faults not yet injected.
    #[must_use]
    pub fn pending_faults(&self) -> usize {
        self.faults.lock().len()
    }

    /// Returns the number of requests seen.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns copies of the requests seen, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().iter().map(clone_request).collect()
    }

    /// Returns the wrapped transport.
    #[must_use]
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T> Service<Request> for FlakyTransport<T>
where
    T: Transport,
{
    type Out = Result<Response>;

    async fn execute(&self, request: Request) -> Self::Out {
        self.requests.lock().push(clone_request(&request));

        let fault = self.faults.lock().pop_front();
        match fault {
            Some(Fault::Status(status)) => Ok(error_response(&ServiceError::from_body(status, b""))),
            Some(Fault::Transport) => Err(Error::transport("connection reset by injected fault")),
            None => self.inner.execute(request).await,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_filter_literals() {
        assert_eq!(parse_literal("'it''s'"), Some(PropertyValue::String("it's".to_owned())));
        assert_eq!(parse_literal("5"), Some(PropertyValue::Int32(5)));
        assert_eq!(parse_literal("5L"), Some(PropertyValue::Int64(5)));
        assert_eq!(parse_literal("2.5"), Some(PropertyValue::Double(2.5)));
        assert_eq!(parse_literal("true"), Some(PropertyValue::Boolean(true)));
        assert_eq!(
            parse_literal("guid'00000000-0000-0000-0000-000000000000'"),
            Some(PropertyValue::Guid(uuid::Uuid::nil()))
        );
        assert_eq!(parse_literal("bogus"), None);
    }

    #[test]
    fn parses_entity_address() {
        assert_eq!(
            entity_address("t(PartitionKey='p''1',RowKey='r')"),
            Some(("t".to_owned(), ("p'1".to_owned(), "r".to_owned())))
        );
        assert_eq!(entity_address("t()"), None);
        assert_eq!(entity_address("t"), None);
    }

    #[test]
    fn merge_drops_stale_annotations() {
        let existing = serde_json::json!({ "a": "1", "a@odata.type": "Edm.Int64", "b": true });
        let incoming = serde_json::json!({ "a": 2 });
        let (Value::Object(existing), Value::Object(incoming)) = (existing, incoming) else {
            unreachable!()
        };

        let merged = merge(existing, incoming);

        assert_eq!(Value::Object(merged), serde_json::json!({ "a": 2, "b": true }));
    }

    #[test]
    fn routes_by_last_segment() {
        let uri: Uri = "http://h/acct/Tables('t')".parse().unwrap();
        assert_eq!(last_segment(&uri), "Tables('t')");
        assert_eq!(table_name("Tables('t')").unwrap(), "t");
        assert_eq!(table_name("Tables(%27a%27%27b%27)").unwrap(), "a'b");
    }

    #[tokio::test]
    async fn flaky_transport_consumes_script() {
        let transport = FlakyTransport::new(InMemoryTableService::new());
        transport.push_fault(Fault::Status(StatusCode::SERVICE_UNAVAILABLE));
        transport.push_fault(Fault::Transport);

        let request = || http::Request::builder().uri("http://h/acct/Tables").body(Bytes::new()).unwrap();

        let first = transport.execute(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ServiceError::from_body(first.status(), first.body()).code(), codes::SERVER_BUSY);

        let second = transport.execute(request()).await.unwrap_err();
        assert!(matches!(second.kind(), crate::ErrorKind::Transport));

        let third = transport.execute(request()).await.unwrap();
        assert_eq!(third.status(), StatusCode::OK);

        assert_eq!(transport.request_count(), 3);
        assert_eq!(transport.inner().request_count(), 1);
    }
}
