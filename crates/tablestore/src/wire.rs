// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Request and response types exchanged with the transport.

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use layered::Service;

use crate::{Error, Result, ServiceError};

/// A request sent through the filter chain to the transport.
pub type Request = http::Request<Bytes>;

/// A response returned by the transport.
pub type Response = http::Response<Bytes>;

/// The transport collaborator.
///
/// A transport sends a [`Request`] and resolves to the [`Response`] the service produced,
/// whatever its status. It fails with [`Error::transport`] only when no well-formed response
/// arrived. Any [`Service`] with the matching signature is a transport, including
/// [`layered::Execute`] around an async function.
pub trait Transport: Service<Request, Out = Result<Response>> {}

impl<T> Transport for T where T: Service<Request, Out = Result<Response>> {}

pub(crate) mod headers {
    pub(crate) const ACCEPT_JSON: &str = "application/json;odata=minimalmetadata";
    pub(crate) const CONTENT_JSON: &str = "application/json";
    pub(crate) const DATA_SERVICE_VERSION: &str = "dataserviceversion";
    pub(crate) const MAX_DATA_SERVICE_VERSION: &str = "maxdataserviceversion";
    pub(crate) const MS_VERSION: &str = "x-ms-version";
    pub(crate) const PREFER: &str = "prefer";
    pub(crate) const CONTINUATION_NEXT_PARTITION_KEY: &str = "x-ms-continuation-nextpartitionkey";
    pub(crate) const CONTINUATION_NEXT_ROW_KEY: &str = "x-ms-continuation-nextrowkey";

    pub(crate) const DATA_SERVICE_VERSION_VALUE: &str = "3.0;";
    pub(crate) const MAX_DATA_SERVICE_VERSION_VALUE: &str = "3.0;NetFx";
    pub(crate) const MS_VERSION_VALUE: &str = "2019-02-02";
    pub(crate) const RETURN_NO_CONTENT: &str = "return-no-content";
}

/// Returns the `MERGE` method used by merge and insert-or-merge operations.
#[expect(clippy::missing_panics_doc, reason = "MERGE is a valid method token")]
#[must_use]
pub fn merge_method() -> Method {
    Method::from_bytes(b"MERGE").expect("MERGE is a valid method token")
}

/// Status and headers of a completed round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    status: StatusCode,
    headers: HeaderMap,
    local: bool,
}

impl ResponseInfo {
    pub(crate) fn from_response(response: &Response) -> Self {
        Self {
            status: response.status(),
            headers: response.headers().clone(),
            local: false,
        }
    }

    /// Describes an outcome decided on the client without a round trip.
    pub(crate) fn local(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            local: true,
        }
    }

    /// Returns the response status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns `true` if the status is in the `2xx` range.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.status.is_success()
    }

    /// Returns `true` if the outcome was decided without contacting the service.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Returns the `ETag` header, if present.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        header_str(&self.headers, http::header::ETAG)
    }
}

pub(crate) fn header_str<K: http::header::AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Copies a request so it can be sent again.
///
/// Extensions are not carried over; filters must not rely on them across attempts.
pub(crate) fn clone_request(request: &Request) -> Request {
    let mut clone = http::Request::new(request.body().clone());
    *clone.method_mut() = request.method().clone();
    *clone.uri_mut() = request.uri().clone();
    *clone.version_mut() = request.version();
    *clone.headers_mut() = request.headers().clone();
    clone
}

/// Turns a non-success response into a service error.
pub(crate) fn ensure_success(response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(Error::service(ServiceError::from_body(response.status(), response.body())))
    }
}

pub(crate) fn json_request(method: Method, uri: http::Uri, body: Bytes) -> Result<Request> {
    let mut builder = http::Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::ACCEPT, headers::ACCEPT_JSON)
        .header(headers::MS_VERSION, headers::MS_VERSION_VALUE)
        .header(headers::DATA_SERVICE_VERSION, headers::DATA_SERVICE_VERSION_VALUE)
        .header(headers::MAX_DATA_SERVICE_VERSION, headers::MAX_DATA_SERVICE_VERSION_VALUE);

    if !body.is_empty() {
        builder = builder.header(http::header::CONTENT_TYPE, headers::CONTENT_JSON);
    }

    builder.body(body).map_err(Error::protocol)
}

/// Returns the `If-Match` condition for a write: the entity's `ETag`, or `*` when it has none.
pub(crate) fn if_match_value(etag: Option<&str>) -> &str {
    etag.unwrap_or("*")
}

pub(crate) fn set_if_match(request: &mut Request, etag: Option<&str>) -> Result<()> {
    let value = HeaderValue::from_str(if_match_value(etag)).map_err(Error::protocol)?;
    request.headers_mut().insert(http::header::IF_MATCH, value);
    Ok(())
}
