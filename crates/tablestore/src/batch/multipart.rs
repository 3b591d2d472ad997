// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reading and writing `multipart/mixed` bodies with embedded HTTP messages.

use std::fmt::Write;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use uuid::Uuid;

use crate::{Error, Result};

pub(crate) const CRLF: &str = "\r\n";
pub(crate) const APPLICATION_HTTP: &str = "application/http";
pub(crate) const CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";
pub(crate) const CONTENT_ID: &str = "content-id";
const MULTIPART_MIXED: &str = "multipart/mixed";

/// Generates a fresh boundary such as `batch_4f0d...`.
pub(crate) fn new_boundary(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4())
}

pub(crate) fn multipart_content_type(boundary: &str) -> String {
    format!("{MULTIPART_MIXED}; boundary={boundary}")
}

/// Extracts the boundary of a `multipart/mixed` content type.
pub(crate) fn boundary_of(content_type: &str) -> Option<&str> {
    let mut params = content_type.split(';').map(str::trim);

    if !params.next()?.eq_ignore_ascii_case(MULTIPART_MIXED) {
        return None;
    }

    params.find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"'))
            .filter(|value| !value.is_empty())
    })
}

/// Appends the bodies of a multipart document.
#[derive(Debug)]
pub(crate) struct MultipartWriter {
    boundary: String,
    out: String,
}

impl MultipartWriter {
    pub(crate) fn new(boundary: String) -> Self {
        Self { boundary, out: String::new() }
    }

    /// Starts a part with the given headers, followed by `content`.
    pub(crate) fn part(&mut self, headers: &[(&str, &str)], content: &str) {
        let _ = write!(self.out, "--{}{CRLF}", self.boundary);
        for (name, value) in headers {
            let _ = write!(self.out, "{name}: {value}{CRLF}");
        }
        self.out.push_str(CRLF);
        self.out.push_str(content);
        self.out.push_str(CRLF);
    }

    pub(crate) fn finish(mut self) -> String {
        let _ = write!(self.out, "--{}--{CRLF}", self.boundary);
        self.out
    }
}

/// Writes an embedded HTTP message: a start line, headers, a blank line and the body.
pub(crate) fn http_message(start_line: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = String::new();
    let _ = write!(out, "{start_line}{CRLF}");
    for (name, value) in headers {
        let _ = write!(out, "{name}: {value}{CRLF}");
    }
    out.push_str(CRLF);
    out.push_str(body);
    out
}

/// Splits a multipart body into its parts.
///
/// Content before the first delimiter and after the closing delimiter is ignored. Fails if the
/// closing delimiter is missing.
pub(crate) fn split_parts<'a>(body: &'a str, boundary: &str) -> Result<Vec<&'a str>> {
    let delimiter = format!("--{boundary}");
    let mut segments = body.split(delimiter.as_str());

    // preamble
    segments.next();

    let mut parts = Vec::new();
    for segment in segments {
        if segment.starts_with("--") {
            return Ok(parts);
        }

        let segment = segment.strip_prefix(CRLF).or_else(|| segment.strip_prefix('\n')).unwrap_or(segment);
        parts.push(segment.strip_suffix(CRLF).or_else(|| segment.strip_suffix('\n')).unwrap_or(segment));
    }

    Err(Error::protocol(format!("multipart body has no closing delimiter for boundary '{boundary}'")))
}

/// A parsed part or embedded message: headers followed by a body.
#[derive(Debug)]
pub(crate) struct Section<'a> {
    pub(crate) start_line: Option<&'a str>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: &'a str,
}

impl Section<'_> {
    pub(crate) fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok())
    }
}

/// Parses headers and body; the first line is taken as start line when `with_start_line` is set.
pub(crate) fn parse_section(text: &str, with_start_line: bool) -> Result<Section<'_>> {
    let (head, body) = if let Some(body) = text.strip_prefix(CRLF) {
        ("", body)
    } else {
        text.split_once("\r\n\r\n")
            .or_else(|| text.split_once("\n\n"))
            .unwrap_or((text.trim_end(), ""))
    };

    let mut lines = head.lines().map(|line| line.trim_end_matches('\r'));

    let start_line = if with_start_line {
        Some(lines.next().filter(|line| !line.is_empty()).ok_or_else(|| Error::protocol("embedded message has no start line"))?)
    } else {
        None
    };

    let mut headers = HeaderMap::new();
    for line in lines.filter(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::protocol(format!("malformed header line '{line}'")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(Error::protocol)?;
        let value = HeaderValue::from_str(value.trim()).map_err(Error::protocol)?;
        headers.append(name, value);
    }

    Ok(Section { start_line, headers, body })
}

/// An HTTP response embedded in a batch response.
#[derive(Debug)]
pub(crate) struct EmbeddedResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

impl EmbeddedResponse {
    pub(crate) fn parse(text: &str) -> Result<Self> {
        let section = parse_section(text, true)?;
        let start_line = section.start_line.unwrap_or_default();

        let status = start_line
            .split_whitespace()
            .nth(1)
            .filter(|_| start_line.starts_with("HTTP/"))
            .ok_or_else(|| Error::protocol(format!("malformed status line '{start_line}'")))?;
        let status = StatusCode::from_bytes(status.as_bytes()).map_err(Error::protocol)?;

        Ok(Self {
            status,
            headers: section.headers,
            body: Bytes::copy_from_slice(section.body.as_bytes()),
        })
    }

    pub(crate) fn content_id(&self) -> Option<usize> {
        self.headers.get(CONTENT_ID)?.to_str().ok()?.trim().parse().ok()
    }
}

/// An HTTP request embedded in a batch request.
#[cfg_attr(not(any(test, feature = "test-util")), expect(dead_code, reason = "read by the in-memory service only"))]
#[derive(Debug)]
pub(crate) struct EmbeddedRequest {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

#[cfg_attr(not(any(test, feature = "test-util")), expect(dead_code, reason = "read by the in-memory service only"))]
impl EmbeddedRequest {
    pub(crate) fn parse(text: &str) -> Result<Self> {
        let section = parse_section(text, true)?;
        let start_line = section.start_line.unwrap_or_default();

        let mut words = start_line.split_whitespace();
        let (Some(method), Some(url)) = (words.next(), words.next()) else {
            return Err(Error::protocol(format!("malformed request line '{start_line}'")));
        };

        Ok(Self {
            method: Method::from_bytes(method.as_bytes()).map_err(Error::protocol)?,
            url: url.to_owned(),
            headers: section.headers,
            body: Bytes::copy_from_slice(section.body.as_bytes()),
        })
    }

    pub(crate) fn content_id(&self) -> Option<usize> {
        self.headers.get(CONTENT_ID)?.to_str().ok()?.trim().parse().ok()
    }
}

/// Collects the embedded messages of a batch body, descending into nested changesets.
pub(crate) fn embedded_messages<'a>(body: &'a str, boundary: &str) -> Result<Vec<&'a str>> {
    let mut messages = Vec::new();

    for part in split_parts(body, boundary)? {
        let section = parse_section(part, false)?;
        let content_type = section.content_type().unwrap_or_default();

        if let Some(nested) = boundary_of(content_type) {
            messages.extend(embedded_messages(section.body, nested)?);
        } else if content_type.starts_with(APPLICATION_HTTP) {
            messages.push(section.body);
        } else {
            return Err(Error::protocol(format!("unexpected batch part of type '{content_type}'")));
        }
    }

    Ok(messages)
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_parsing() {
        assert_eq!(boundary_of("multipart/mixed; boundary=batch_1"), Some("batch_1"));
        assert_eq!(boundary_of("Multipart/Mixed;boundary=\"cs_2\""), Some("cs_2"));
        assert_eq!(boundary_of("application/json"), None);
        assert_eq!(boundary_of("multipart/mixed"), None);
        assert_eq!(boundary_of("multipart/mixed; boundary="), None);
    }

    #[test]
    fn writer_output_splits_back() {
        let mut writer = MultipartWriter::new("b".to_owned());
        writer.part(&[("Content-Type", "application/http")], "one");
        writer.part(&[], "two");
        let body = writer.finish();

        assert_eq!(body, "--b\r\nContent-Type: application/http\r\n\r\none\r\n--b\r\n\r\ntwo\r\n--b--\r\n");

        let parts = split_parts(&body, "b").unwrap();
        assert_eq!(parts, vec!["Content-Type: application/http\r\n\r\none", "\r\ntwo"]);
    }

    #[test]
    fn unterminated_body_is_protocol_error() {
        let error = split_parts("--b\r\npart\r\n", "b").unwrap_err();

        assert!(matches!(error.kind(), crate::ErrorKind::Protocol));
    }

    #[test]
    fn parses_embedded_response() {
        let text = "HTTP/1.1 404 Not Found\r\nContent-ID: 2\r\nContent-Type: application/json\r\n\r\n{\"x\":1}";

        let response = EmbeddedResponse::parse(text).unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.content_id(), Some(2));
        assert_eq!(response.body, Bytes::from_static(b"{\"x\":1}"));
    }

    #[test]
    fn parses_embedded_request_with_lf_only() {
        let text = "MERGE http://h/t(PartitionKey='p',RowKey='r') HTTP/1.1\nContent-ID: 1\nIf-Match: *\n\n{}";

        let request = EmbeddedRequest::parse(text).unwrap();

        assert_eq!(request.method.as_str(), "MERGE");
        assert_eq!(request.url, "http://h/t(PartitionKey='p',RowKey='r')");
        assert_eq!(request.headers.get("if-match").unwrap(), "*");
        assert_eq!(request.content_id(), Some(1));
        assert_eq!(request.body, Bytes::from_static(b"{}"));
    }

    #[test]
    fn rejects_garbage_status_line() {
        assert!(EmbeddedResponse::parse("garbage\r\n\r\n").is_err());
        assert!(EmbeddedResponse::parse("").is_err());
    }

    #[test]
    fn nested_changeset_messages_are_flattened() {
        let mut changeset = MultipartWriter::new("cs".to_owned());
        changeset.part(&[("Content-Type", APPLICATION_HTTP)], "HTTP/1.1 204 No Content\r\n\r\n");
        changeset.part(&[("Content-Type", APPLICATION_HTTP)], "HTTP/1.1 201 Created\r\n\r\n");
        let changeset = changeset.finish();

        let changeset_type = multipart_content_type("cs");
        let mut batch = MultipartWriter::new("batch".to_owned());
        batch.part(&[("Content-Type", changeset_type.as_str())], &changeset);
        let batch = batch.finish();

        let messages = embedded_messages(&batch, "batch").unwrap();

        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("HTTP/1.1 204"));
        assert!(messages[1].starts_with("HTTP/1.1 201"));
    }
}
