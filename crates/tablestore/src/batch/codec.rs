// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, ETAG};

use super::multipart::{
    APPLICATION_HTTP, CONTENT_TRANSFER_ENCODING, EmbeddedResponse, MultipartWriter, boundary_of, embedded_messages, http_message,
    multipart_content_type, new_boundary,
};
use super::{OperationOutcome, OperationRecord, OperationResult};
use crate::endpoint::Endpoint;
use crate::wire::{Request, Response, header_str, headers, if_match_value};
use crate::{Error, Result, ServiceError};

/// Encodes operations into one transaction request.
///
/// The body is a `multipart/mixed` batch holding a single changeset. Every operation becomes an
/// `application/http` part whose `Content-ID` is its sequence number plus one.
pub(crate) fn encode(endpoint: &Endpoint, operations: &[OperationRecord]) -> Result<Request> {
    let batch_boundary = new_boundary("batch");
    let changeset_boundary = new_boundary("changeset");

    let mut changeset = MultipartWriter::new(changeset_boundary.clone());
    for operation in operations {
        changeset.part(
            &[("Content-Type", APPLICATION_HTTP), (CONTENT_TRANSFER_ENCODING, "binary")],
            &encode_operation(endpoint, operation),
        );
    }

    let changeset_type = multipart_content_type(&changeset_boundary);
    let mut batch = MultipartWriter::new(batch_boundary.clone());
    batch.part(&[("Content-Type", changeset_type.as_str())], &changeset.finish());

    http::Request::builder()
        .method(http::Method::POST)
        .uri(endpoint.batch_uri()?)
        .header(CONTENT_TYPE, multipart_content_type(&batch_boundary))
        .header(ACCEPT, headers::ACCEPT_JSON)
        .header(headers::MS_VERSION, headers::MS_VERSION_VALUE)
        .header(headers::DATA_SERVICE_VERSION, headers::DATA_SERVICE_VERSION_VALUE)
        .header(headers::MAX_DATA_SERVICE_VERSION, headers::MAX_DATA_SERVICE_VERSION_VALUE)
        .body(Bytes::from(batch.finish()))
        .map_err(Error::protocol)
}

fn encode_operation(endpoint: &Endpoint, operation: &OperationRecord) -> String {
    let entity = &operation.entity;
    let url = if operation.kind.addresses_entity() {
        endpoint.entity_url(&operation.table, entity.partition_key(), entity.row_key())
    } else {
        endpoint.entities_url(&operation.table)
    };

    let content_id = (operation.sequence + 1).to_string();
    let mut part_headers = vec![
        ("Content-ID", content_id.as_str()),
        ("Accept", headers::ACCEPT_JSON),
        ("DataServiceVersion", headers::DATA_SERVICE_VERSION_VALUE),
    ];

    if operation.kind.requires_if_match() {
        part_headers.push(("If-Match", if_match_value(entity.etag())));
    }

    let body = if operation.kind.has_body() {
        part_headers.push(("Content-Type", headers::CONTENT_JSON));
        part_headers.push(("Prefer", headers::RETURN_NO_CONTENT));
        String::from_utf8_lossy(&entity.to_body()).into_owned()
    } else {
        String::new()
    };

    http_message(&format!("{} {url} HTTP/1.1", operation.kind.method()), &part_headers, &body)
}

/// Splits a transaction response into one result per operation.
///
/// # Errors
///
/// A non-success envelope yields the service error it carries. A body that cannot be aligned
/// with the operations yields a protocol error; no partial results are returned.
pub(crate) fn decode(operations: &[OperationRecord], response: &Response) -> Result<Vec<OperationResult>> {
    if !response.status().is_success() {
        return Err(Error::service(ServiceError::from_body(response.status(), response.body())));
    }

    let content_type = header_str(response.headers(), CONTENT_TYPE).unwrap_or_default();
    let boundary = boundary_of(content_type)
        .ok_or_else(|| Error::protocol(format!("batch response has content type '{content_type}' instead of multipart/mixed")))?;
    let body = std::str::from_utf8(response.body()).map_err(Error::protocol)?;

    let responses = embedded_messages(body, boundary)?
        .into_iter()
        .map(EmbeddedResponse::parse)
        .collect::<Result<Vec<_>>>()?;

    align(operations, responses)
}

fn align(operations: &[OperationRecord], responses: Vec<EmbeddedResponse>) -> Result<Vec<OperationResult>> {
    let count = operations.len();
    let failures = responses.iter().filter(|response| !response.status.is_success()).count();

    if responses.len() == 1 && failures == 1 && count > 1 {
        return Ok(rolled_back(operations, responses.into_iter().next()));
    }

    if responses.len() != count {
        return Err(Error::protocol(format!(
            "batch response holds {} results for {count} operations",
            responses.len()
        )));
    }

    let mut outcomes: Vec<Option<OperationOutcome>> = vec![None; count];

    for (position, response) in responses.into_iter().enumerate() {
        let index = match response.content_id() {
            Some(id) => id
                .checked_sub(1)
                .filter(|index| *index < count)
                .ok_or_else(|| Error::protocol(format!("batch response refers to unknown operation with Content-ID {id}")))?,
            None => position,
        };

        let slot = &mut outcomes[index];
        if slot.is_some() {
            return Err(Error::protocol(format!("batch response holds two results for operation {index}")));
        }

        *slot = Some(outcome_of(response));
    }

    operations
        .iter()
        .zip(outcomes)
        .map(|(operation, outcome)| {
            outcome
                .map(|outcome| operation.result(outcome))
                .ok_or_else(|| Error::protocol(format!("batch response holds no result for operation {}", operation.sequence)))
        })
        .collect()
}

/// Builds the results of a transaction the service rolled back because of one failed operation.
fn rolled_back(operations: &[OperationRecord], failure: Option<EmbeddedResponse>) -> Vec<OperationResult> {
    let Some(failure) = failure else {
        return Vec::new();
    };

    let error = ServiceError::from_body(failure.status, &failure.body);
    let index = failed_index(error.message())
        .or_else(|| failure.content_id().and_then(|id| id.checked_sub(1)))
        .filter(|index| *index < operations.len())
        .unwrap_or(0);

    let mut error = Some(error);
    operations
        .iter()
        .map(|operation| match error.take_if(|_| operation.sequence == index) {
            Some(error) => operation.result(OperationOutcome::Failed(error)),
            None => operation.result(OperationOutcome::RolledBack),
        })
        .collect()
}

/// Reads the index of the failed operation from a message such as `1:The specified resource...`.
fn failed_index(message: &str) -> Option<usize> {
    let (index, _) = message.split_once(':')?;
    index.trim().parse().ok()
}

fn outcome_of(response: EmbeddedResponse) -> OperationOutcome {
    if response.status.is_success() {
        OperationOutcome::Succeeded {
            etag: header_str(&response.headers, ETAG).map(str::to_owned),
        }
    } else {
        OperationOutcome::Failed(ServiceError::from_body(response.status, &response.body))
    }
}

/// Returns `true` if an embedded request carries an `If-Match` header.
#[cfg(any(test, feature = "test-util"))]
pub(crate) fn has_if_match(headers: &http::HeaderMap) -> bool {
    headers.contains_key(http::header::IF_MATCH)
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;
    use crate::batch::multipart::{EmbeddedRequest, MultipartWriter};
    use crate::batch::{BatchContext, OperationKind};
    use crate::entity::Entity;
    use crate::error::codes;

    fn operations(kinds: &[OperationKind]) -> Vec<OperationRecord> {
        let mut context = BatchContext::new();
        for (row, kind) in kinds.iter().enumerate() {
            context
                .queue(*kind, "buildings", Entity::new("partition1", (row + 1).to_string()).with("address", format!("street{}", row + 1)))
                .unwrap();
        }
        context.into_operations()
    }

    /// Builds a batch response holding the given embedded responses.
    fn response(parts: &[String]) -> Response {
        let mut changeset = MultipartWriter::new("changesetresponse_1".to_owned());
        for part in parts {
            changeset.part(&[("Content-Type", APPLICATION_HTTP), ("Content-Transfer-Encoding", "binary")], part);
        }

        let mut batch = MultipartWriter::new("batchresponse_1".to_owned());
        batch.part(&[("Content-Type", "multipart/mixed; boundary=changesetresponse_1")], &changeset.finish());

        http::Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(CONTENT_TYPE, "multipart/mixed; boundary=batchresponse_1")
            .body(Bytes::from(batch.finish()))
            .unwrap()
    }

    fn created(content_id: usize) -> String {
        format!("HTTP/1.1 204 No Content\r\nContent-ID: {content_id}\r\nETag: W/\"{content_id}\"\r\n\r\n")
    }

    fn failed(status: StatusCode, code: &str, message: &str, content_id: Option<usize>) -> String {
        let error = ServiceError::new(status, code, message);
        let content_id = content_id.map(|id| format!("Content-ID: {id}\r\n")).unwrap_or_default();
        format!(
            "HTTP/1.1 {} {}\r\n{content_id}Content-Type: application/json\r\n\r\n{}",
            status.as_u16(),
            status.canonical_reason().unwrap_or_default(),
            String::from_utf8(error.to_body()).unwrap()
        )
    }

    #[test]
    fn encodes_one_part_per_operation() {
        let ops = operations(&[OperationKind::Insert, OperationKind::Update, OperationKind::Delete]);

        let request = encode(&Endpoint::development_storage(), &ops).unwrap();

        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.uri(), "http://127.0.0.1:10002/devstoreaccount1/$batch");
        let content_type = request.headers().get(CONTENT_TYPE).unwrap().to_str().unwrap();
        let boundary = boundary_of(content_type).unwrap();
        assert!(boundary.starts_with("batch_"));

        let body = std::str::from_utf8(request.body()).unwrap();
        assert!(body.contains("\r\n"));
        let messages = embedded_messages(body, boundary).unwrap();
        let parts: Vec<_> = messages.into_iter().map(|m| EmbeddedRequest::parse(m).unwrap()).collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].method, http::Method::POST);
        assert_eq!(parts[0].url, "http://127.0.0.1:10002/devstoreaccount1/buildings");
        assert!(!has_if_match(&parts[0].headers));
        assert_eq!(Entity::from_body(&parts[0].body).unwrap(), ops[0].entity);

        assert_eq!(parts[1].method, http::Method::PUT);
        assert_eq!(parts[1].url, "http://127.0.0.1:10002/devstoreaccount1/buildings(PartitionKey='partition1',RowKey='2')");
        assert!(has_if_match(&parts[1].headers));

        assert_eq!(parts[2].method, http::Method::DELETE);
        assert!(parts[2].body.is_empty());

        let ids: Vec<_> = parts.iter().map(|p| p.content_id().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn decodes_aligned_results() {
        let ops = operations(&[OperationKind::Insert, OperationKind::Insert, OperationKind::Insert]);

        let results = decode(&ops, &response(&[created(1), created(2), created(3)])).unwrap();

        assert_eq!(results.len(), 3);
        for (sequence, result) in results.iter().enumerate() {
            assert_eq!(result.sequence(), sequence);
            assert_eq!(result.row_key(), (sequence + 1).to_string());
            assert_eq!(
                result.outcome(),
                &OperationOutcome::Succeeded {
                    etag: Some(format!("W/\"{}\"", sequence + 1))
                }
            );
        }
    }

    #[test]
    fn content_id_overrides_position() {
        let ops = operations(&[OperationKind::Insert, OperationKind::Insert]);

        let results = decode(&ops, &response(&[created(2), created(1)])).unwrap();

        assert_eq!(results[0].outcome(), &OperationOutcome::Succeeded { etag: Some("W/\"1\"".to_owned()) });
        assert_eq!(results[1].outcome(), &OperationOutcome::Succeeded { etag: Some("W/\"2\"".to_owned()) });
    }

    #[test]
    fn single_failure_rolls_back_the_rest() {
        let ops = operations(&[OperationKind::Insert, OperationKind::Update, OperationKind::Insert]);
        let failure = failed(StatusCode::NOT_FOUND, codes::RESOURCE_NOT_FOUND, "1:The specified resource does not exist.", None);

        let results = decode(&ops, &response(&[failure])).unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].outcome(), &OperationOutcome::RolledBack);
        assert_eq!(results[1].error().unwrap().code(), codes::RESOURCE_NOT_FOUND);
        assert_eq!(results[2].outcome(), &OperationOutcome::RolledBack);
    }

    #[test]
    fn rollback_index_falls_back_to_content_id() {
        let ops = operations(&[OperationKind::Insert, OperationKind::Insert, OperationKind::Insert]);
        let failure = failed(StatusCode::CONFLICT, codes::ENTITY_ALREADY_EXISTS, "exists", Some(3));

        let results = decode(&ops, &response(&[failure])).unwrap();

        assert!(results[2].error().is_some());
        assert_eq!(results.iter().filter(|r| r.error().is_some()).count(), 1);
    }

    #[test]
    fn count_mismatch_is_protocol_error() {
        let ops = operations(&[OperationKind::Insert, OperationKind::Insert, OperationKind::Insert]);

        let error = decode(&ops, &response(&[created(1), created(2)])).unwrap_err();

        assert!(matches!(error.kind(), crate::ErrorKind::Protocol));
    }

    #[test]
    fn duplicate_content_id_is_protocol_error() {
        let ops = operations(&[OperationKind::Insert, OperationKind::Insert]);

        let error = decode(&ops, &response(&[created(1), created(1)])).unwrap_err();

        assert!(matches!(error.kind(), crate::ErrorKind::Protocol));
    }

    #[test]
    fn unknown_content_id_is_protocol_error() {
        let ops = operations(&[OperationKind::Insert, OperationKind::Insert]);

        for stray in [0, 3] {
            let error = decode(&ops, &response(&[created(1), created(stray)])).unwrap_err();

            assert!(matches!(error.kind(), crate::ErrorKind::Protocol));
        }
    }

    #[test]
    fn missing_content_id_uses_position() {
        let ops = operations(&[OperationKind::Insert, OperationKind::Insert]);
        let anonymous = "HTTP/1.1 204 No Content\r\nETag: W/\"9\"\r\n\r\n".to_owned();

        let results = decode(&ops, &response(&[created(1), anonymous])).unwrap();

        assert_eq!(results[1].outcome(), &OperationOutcome::Succeeded { etag: Some("W/\"9\"".to_owned()) });
    }

    #[test]
    fn conditional_operations_carry_entity_etag() {
        let mut context = BatchContext::new();
        context
            .queue(OperationKind::Update, "buildings", Entity::new("partition1", "1").with_etag("W/\"7\""))
            .unwrap();
        context.queue(OperationKind::Delete, "buildings", Entity::new("partition1", "2")).unwrap();
        let ops = context.into_operations();

        let request = encode(&Endpoint::development_storage(), &ops).unwrap();

        let content_type = request.headers().get(CONTENT_TYPE).unwrap().to_str().unwrap();
        let body = std::str::from_utf8(request.body()).unwrap();
        let parts: Vec<_> = embedded_messages(body, boundary_of(content_type).unwrap())
            .unwrap()
            .into_iter()
            .map(|m| EmbeddedRequest::parse(m).unwrap())
            .collect();
        assert_eq!(parts[0].headers[http::header::IF_MATCH], "W/\"7\"");
        assert_eq!(parts[1].headers[http::header::IF_MATCH], "*");
    }

    #[test]
    fn error_envelope_is_service_error() {
        let ops = operations(&[OperationKind::Insert]);
        let error = ServiceError::new(StatusCode::BAD_REQUEST, codes::INVALID_INPUT, "bad batch");
        let response = http::Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Bytes::from(error.to_body()))
            .unwrap();

        let error = decode(&ops, &response).unwrap_err();

        assert_eq!(error.code(), Some(codes::INVALID_INPUT));
    }

    #[test]
    fn missing_boundary_is_protocol_error() {
        let ops = operations(&[OperationKind::Insert]);
        let response = http::Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(CONTENT_TYPE, "application/json")
            .body(Bytes::from_static(b"{}"))
            .unwrap();

        let error = decode(&ops, &response).unwrap_err();

        assert!(matches!(error.kind(), crate::ErrorKind::Protocol));
    }

    #[test]
    fn failed_index_parsing() {
        assert_eq!(failed_index("0:boom"), Some(0));
        assert_eq!(failed_index("12:The specified resource does not exist."), Some(12));
        assert_eq!(failed_index("no index here"), None);
        assert_eq!(failed_index("x:y"), None);
    }
}
