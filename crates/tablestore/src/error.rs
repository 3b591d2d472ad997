// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for table service operations.
//!
//! Every fallible operation in this crate returns [`Error`]. The [`ErrorKind`] tells transport
//! failures apart from well-formed error responses, caller contract violations, and responses
//! that could not be understood.

use std::fmt::{Display, Formatter};

use http::StatusCode;
use recoverable::{Recovery, RecoveryInfo};
use serde_json::Value;

/// Well-known service error codes.
pub mod codes {
    /// The table being created already exists.
    pub const TABLE_ALREADY_EXISTS: &str = "TableAlreadyExists";
    /// The table being addressed does not exist.
    pub const TABLE_NOT_FOUND: &str = "TableNotFound";
    /// The addressed resource does not exist.
    pub const RESOURCE_NOT_FOUND: &str = "ResourceNotFound";
    /// The entity being inserted already exists.
    pub const ENTITY_ALREADY_EXISTS: &str = "EntityAlreadyExists";
    /// The `If-Match` condition of an update did not hold.
    pub const UPDATE_CONDITION_NOT_SATISFIED: &str = "UpdateConditionNotSatisfied";
    /// The request is malformed.
    pub const INVALID_INPUT: &str = "InvalidInput";
    /// The operations of one batch address more than one partition or table.
    pub const COMMANDS_IN_BATCH_ACT_ON_DIFFERENT_PARTITIONS: &str = "CommandsInBatchActOnDifferentPartitions";
    /// A value in the request is out of the allowed range.
    pub const OUT_OF_RANGE_INPUT: &str = "OutOfRangeInput";
    /// The service is temporarily overloaded.
    pub const SERVER_BUSY: &str = "ServerBusy";
    /// The service failed while processing the request.
    pub const INTERNAL_ERROR: &str = "InternalError";
}

/// An error returned by the table client or one of its filters.
///
/// Inspect [`Error::kind`] to decide how to react. Errors that carry a service payload expose it
/// through [`Error::service_error`], and the convenience accessors [`Error::status`] and
/// [`Error::code`] read straight from it.
///
/// # Examples
///
/// ```
/// use tablestore::{Error, ErrorKind};
///
/// let error = Error::transport("connection reset");
/// assert!(matches!(error.kind(), ErrorKind::Transport));
/// assert_eq!(error.status(), None);
/// ```
#[ohno::error]
#[display("{kind}")]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    /// Creates an error describing a network or connectivity failure.
    ///
    /// Transport implementations return this when no well-formed response was received.
    pub fn transport(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(ErrorKind::Transport, cause)
    }

    /// Creates an error describing a response that could not be understood.
    pub fn protocol(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(ErrorKind::Protocol, cause)
    }

    /// Creates an error from a well-formed service error response.
    #[must_use]
    pub fn service(error: ServiceError) -> Self {
        Self::new(ErrorKind::Service(error))
    }

    pub(crate) fn usage(error: UsageError) -> Self {
        Self::new(ErrorKind::Usage(error))
    }

    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Returns the service error payload, if the service answered with one.
    #[must_use]
    pub fn service_error(&self) -> Option<&ServiceError> {
        match &self.kind {
            ErrorKind::Service(error) => Some(error),
            _ => None,
        }
    }

    /// Returns the HTTP status of the failed response, if there was one.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.service_error().map(ServiceError::status)
    }

    /// Returns the machine-readable service error code, if there was one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.service_error().map(ServiceError::code)
    }

    /// Returns the usage error, if the caller violated a contract.
    #[must_use]
    pub fn usage_error(&self) -> Option<&UsageError> {
        match &self.kind {
            ErrorKind::Usage(error) => Some(error),
            _ => None,
        }
    }
}

impl Recovery for Error {
    fn recovery(&self) -> RecoveryInfo {
        match &self.kind {
            ErrorKind::Transport => RecoveryInfo::retry(),
            ErrorKind::Service(error) => error.recovery(),
            ErrorKind::Usage(_) | ErrorKind::Protocol => RecoveryInfo::never(),
        }
    }
}

/// A specialized [`Result`] type for table operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies an [`Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The request never produced a well-formed response.
    Transport,
    /// The service answered with an error status.
    Service(ServiceError),
    /// The caller violated an API contract.
    Usage(UsageError),
    /// The response could not be decoded.
    Protocol,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport => write!(f, "transport failure"),
            Self::Service(error) => write!(f, "{error}"),
            Self::Usage(error) => write!(f, "usage error: {error}"),
            Self::Protocol => write!(f, "malformed service response"),
        }
    }
}

/// A caller contract violation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UsageError {
    /// [`begin_batch`][crate::TableClient::begin_batch] was called while a batch was open.
    BatchAlreadyOpen,
    /// A batch operation was attempted without an open batch.
    NoOpenBatch,
    /// The entity lacks its partition key.
    MissingPartitionKey,
    /// The entity lacks its row key.
    MissingRowKey,
    /// The query does not name the table it reads.
    MissingTable,
    /// The service endpoint is not an absolute `http` or `https` URL.
    InvalidEndpoint {
        /// The rejected URL.
        url: String,
    },
    /// The batch holds more operations than one transaction accepts.
    BatchTooLarge {
        /// Number of operations queued.
        count: usize,
        /// Maximum number of operations per transaction.
        limit: usize,
    },
}

impl Display for UsageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BatchAlreadyOpen => write!(f, "a batch is already open"),
            Self::NoOpenBatch => write!(f, "no batch is open"),
            Self::MissingPartitionKey => write!(f, "entity has no partition key"),
            Self::MissingRowKey => write!(f, "entity has no row key"),
            Self::MissingTable => write!(f, "query has no table"),
            Self::InvalidEndpoint { url } => write!(f, "'{url}' is not a valid service endpoint"),
            Self::BatchTooLarge { count, limit } => {
                write!(f, "batch holds {count} operations but at most {limit} are allowed")
            }
        }
    }
}

/// The error payload of a failed service response.
///
/// The payload mirrors the service's JSON error document: a stable machine-readable `code`, a
/// human-readable `message`, and an optional inner error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    status: StatusCode,
    code: String,
    message: String,
    inner_error: Option<String>,
}

impl ServiceError {
    /// Creates a new service error.
    #[must_use]
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            inner_error: None,
        }
    }

    /// Attaches the message of a nested cause.
    #[must_use]
    pub fn with_inner_error(mut self, inner_error: impl Into<String>) -> Self {
        self.inner_error = Some(inner_error.into());
        self
    }

    /// Parses an error response body.
    ///
    /// Bodies that are empty or not a JSON error document still yield an error whose code is
    /// derived from the status, so callers always see a code.
    #[must_use]
    pub fn from_body(status: StatusCode, body: &[u8]) -> Self {
        serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|document| Self::from_document(status, &document))
            .unwrap_or_else(|| Self::new(status, fallback_code(status), String::from_utf8_lossy(body).trim().to_owned()))
    }

    fn from_document(status: StatusCode, document: &Value) -> Option<Self> {
        let error = document.get("odata.error").or_else(|| document.get("error"))?;
        let code = error.get("code")?.as_str()?;

        let message = match error.get("message") {
            Some(Value::String(message)) => message.clone(),
            Some(message) => message.get("value").and_then(Value::as_str).unwrap_or_default().to_owned(),
            None => String::new(),
        };

        let inner_error = error
            .get("innererror")
            .and_then(|inner| inner.get("message"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        Some(Self {
            status,
            code: code.to_owned(),
            message,
            inner_error,
        })
    }

    /// Renders the JSON error document the service sends for this error.
    #[must_use]
    pub fn to_body(&self) -> Vec<u8> {
        let mut error = serde_json::json!({
            "code": self.code,
            "message": { "lang": "en-US", "value": self.message },
        });

        if let Some(inner) = &self.inner_error {
            error["innererror"] = serde_json::json!({ "message": inner });
        }

        serde_json::json!({ "odata.error": error }).to_string().into_bytes()
    }

    /// Returns the HTTP status of the response.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns the human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the message of the nested cause, if any.
    #[must_use]
    pub fn inner_error(&self) -> Option<&str> {
        self.inner_error.as_deref()
    }
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "service responded {} {}", self.status.as_u16(), self.code)?;

        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }

        Ok(())
    }
}

impl Recovery for ServiceError {
    fn recovery(&self) -> RecoveryInfo {
        status_recovery(self.status)
    }
}

/// Classifies a response status.
///
/// Timeouts and server-side failures are transient; everything else is definitive. `501 Not
/// Implemented` and `505 HTTP Version Not Supported` will not change on a re-send.
pub(crate) fn status_recovery(status: StatusCode) -> RecoveryInfo {
    match status {
        StatusCode::REQUEST_TIMEOUT => RecoveryInfo::retry(),
        StatusCode::NOT_IMPLEMENTED | StatusCode::HTTP_VERSION_NOT_SUPPORTED => RecoveryInfo::never(),
        status if status.is_server_error() => RecoveryInfo::retry(),
        _ => RecoveryInfo::never(),
    }
}

fn fallback_code(status: StatusCode) -> String {
    match status {
        StatusCode::NOT_FOUND => codes::RESOURCE_NOT_FOUND.to_owned(),
        StatusCode::BAD_REQUEST => codes::INVALID_INPUT.to_owned(),
        StatusCode::SERVICE_UNAVAILABLE => codes::SERVER_BUSY.to_owned(),
        StatusCode::INTERNAL_SERVER_ERROR => codes::INTERNAL_ERROR.to_owned(),
        status => status.canonical_reason().unwrap_or("Unknown").replace(' ', ""),
    }
}
