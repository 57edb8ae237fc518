use std::fmt;
use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Broad category of a [`ClientError`].
///
/// Callers should branch on the category rather than on message text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect/read failures or retryable statuses that outlived the retry budget.
    Transient,
    /// Some inputs of a batch failed while others succeeded.
    PartialBatch,
    /// Credentials were rejected or the project is not accessible.
    Authorization,
    /// Any other non-success response from the service.
    Api,
    /// Misuse of the client: bad configuration, empty input, bridging misuse.
    Programming,
    /// A response could not be decoded.
    Decode,
}

/// Errors returned by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Base URL is not a valid absolute URL.
    #[error("invalid base URL '{0}'")]
    InvalidBaseUrl(String),

    /// Endpoint path could not be joined to the base URL.
    #[error("invalid endpoint path '{0}'")]
    InvalidPath(String),

    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// HTTP method is not one the client knows how to classify.
    #[error("unsupported HTTP method '{0}'")]
    UnsupportedMethod(String),

    /// A batch operation was called without any identifiers or items.
    #[error("batch operation requires at least one input")]
    EmptyInput,

    /// An input item cannot be sent in the requested shape.
    #[error("invalid item: {0}")]
    InvalidItem(String),

    /// A blocking call was made from inside an async runtime.
    #[error("blocking client used from within an async runtime; use the async `ApiClient` instead")]
    BlockingInAsyncContext,

    /// The private runtime backing the blocking client could not be started.
    #[error("failed to start blocking runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// Request body could not be gzip-compressed.
    #[error("failed to compress request body: {0}")]
    Compression(#[source] std::io::Error),

    /// The credential provider could not produce an authorization header.
    #[error("failed to obtain credentials: {0}")]
    Credentials(String),

    /// HTTP transport-layer request failure.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Response body could not be parsed as JSON.
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Credentials rejected or project not accessible (401/403).
    #[error("not authorized for project '{project}' ({}): {}", .error.status, .error.message)]
    Authorization { project: String, error: ApiError },

    /// Non-success HTTP status with a parsed error payload.
    #[error(transparent)]
    Api(ApiError),

    /// One or more chunks of a batch operation failed.
    #[error(transparent)]
    Batch(Box<BatchFailure>),

    /// A chunk was dropped in flight because another chunk of a fail-fast batch failed.
    #[error("request cancelled in flight after another chunk of the batch failed")]
    Cancelled,

    /// An input was rejected only because it shared a request with an unresolved one.
    #[error("rejected together with unresolved inputs of the same request: {0}")]
    ChunkRejected(#[source] Arc<ClientError>),

    /// A spawned batch driver panicked or was aborted.
    #[error("batch task aborted: {0}")]
    TaskAborted(String),
}

impl ClientError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidBaseUrl(_)
            | Self::InvalidPath(_)
            | Self::Config(_)
            | Self::UnsupportedMethod(_)
            | Self::EmptyInput
            | Self::InvalidItem(_)
            | Self::BlockingInAsyncContext
            | Self::Runtime(_)
            | Self::Compression(_)
            | Self::TaskAborted(_) => ErrorKind::Programming,
            Self::Credentials(_) | Self::Authorization { .. } => ErrorKind::Authorization,
            Self::Request(err) if err.is_decode() => ErrorKind::Decode,
            Self::Request(_) | Self::Cancelled => ErrorKind::Transient,
            Self::Json(_) => ErrorKind::Decode,
            Self::Api(error) if error.is_transient() => ErrorKind::Transient,
            Self::Api(_) | Self::ChunkRejected(_) => ErrorKind::Api,
            Self::Batch(_) => ErrorKind::PartialBatch,
        }
    }

    /// Returns the API error payload when the service rejected the request.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Api(error) | Self::Authorization { error, .. } => Some(error),
            _ => None,
        }
    }

    /// True when the service reported one or more unknown identifiers.
    pub fn is_not_found(&self) -> bool {
        self.api_error().is_some_and(ApiError::is_not_found)
    }

    /// Returns the compound failure for batch errors.
    pub fn batch_failure(&self) -> Option<&BatchFailure> {
        match self {
            Self::Batch(failure) => Some(failure),
            _ => None,
        }
    }

    /// True when an input in a failed chunk may still have been applied server-side.
    pub(crate) fn outcome_is_unknown(&self) -> bool {
        match self {
            Self::Api(error) => error.status.is_server_error(),
            Self::Request(_) | Self::Cancelled => true,
            _ => false,
        }
    }
}

/// Error payload returned by the service for a non-success status.
#[derive(Clone, Debug)]
pub struct ApiError {
    /// HTTP status of the final attempt.
    pub status: StatusCode,
    /// Human-readable message from the error envelope, or the raw body.
    pub message: String,
    /// Identifiers the service could not resolve.
    pub missing: Vec<Value>,
    /// Identifiers that already exist.
    pub duplicated: Vec<Value>,
    /// Value of the `x-request-id` response header.
    pub request_id: Option<String>,
}

impl ApiError {
    /// Parses the service's `{"error": {...}}` envelope.
    ///
    /// Bodies that are not an envelope are kept verbatim as the message.
    pub fn from_response(status: StatusCode, body: &str, request_id: Option<String>) -> Self {
        let envelope = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|mut value| value.get_mut("error").map(Value::take));

        let Some(error) = envelope else {
            return Self {
                status,
                message: body.trim().to_owned(),
                missing: Vec::new(),
                duplicated: Vec::new(),
                request_id,
            };
        };

        let list = |key: &str| {
            error
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };

        Self {
            status,
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            missing: list("missing"),
            duplicated: list("duplicated"),
            request_id,
        }
    }

    /// True for 400/404 responses that name unresolved identifiers.
    pub fn is_not_found(&self) -> bool {
        matches!(self.status, StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND)
            && !self.missing.is_empty()
    }

    fn is_transient(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS || self.status.is_server_error()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server returned status {}: {}", self.status, self.message)?;
        if !self.missing.is_empty() {
            write!(f, " (missing: {})", Value::Array(self.missing.clone()))?;
        }
        if !self.duplicated.is_empty() {
            write!(f, " (duplicated: {})", Value::Array(self.duplicated.clone()))?;
        }
        if let Some(request_id) = &self.request_id {
            write!(f, " [request id {request_id}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

/// One input of a batch operation that did not succeed.
#[derive(Clone, Debug)]
pub struct FailedItem {
    /// The input as it was sent (identifier object or resource body).
    pub item: Value,
    /// Error of the chunk this input was sent in.
    pub cause: Arc<ClientError>,
}

/// Compound outcome of a batch operation with at least one failed chunk.
///
/// Every input of the call ends up in exactly one of `successful` (as the
/// service's response item), `not_found`, `failed`, `unknown` or `skipped`.
#[derive(Debug, Default)]
pub struct BatchFailure {
    /// Response items of the chunks that succeeded, in input order.
    pub successful: Vec<Value>,
    /// Inputs whose identifier the service reported as unresolved.
    pub not_found: Vec<Value>,
    /// Inputs rejected by the service (4xx).
    pub failed: Vec<FailedItem>,
    /// Inputs whose chunk failed in a way that may still have been applied.
    pub unknown: Vec<FailedItem>,
    /// Inputs never sent because a fail-fast batch stopped first.
    pub skipped: Vec<Value>,
}

impl BatchFailure {
    /// Distinct causes across failed and unknown inputs, in first-seen order.
    pub fn causes(&self) -> Vec<&ClientError> {
        let mut seen: Vec<&Arc<ClientError>> = Vec::new();
        for entry in self.failed.iter().chain(&self.unknown) {
            if !seen.iter().any(|cause| Arc::ptr_eq(cause, &entry.cause)) {
                seen.push(&entry.cause);
            }
        }
        seen.into_iter().map(|cause| &**cause).collect()
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch partially failed: {} succeeded, {} not found, {} failed, {} unknown, {} skipped",
            self.successful.len(),
            self.not_found.len(),
            self.failed.len(),
            self.unknown.len(),
            self.skipped.len()
        )?;
        if let Some(first) = self.causes().first() {
            write!(f, "; first cause: {first}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchFailure {}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{ApiError, ClientError, ErrorKind};

    #[test]
    fn parses_error_envelope_with_missing_identifiers() {
        let body = json!({
            "error": {"code": 400, "message": "Ids not found", "missing": [{"id": 3}]}
        })
        .to_string();
        let error = ApiError::from_response(StatusCode::BAD_REQUEST, &body, Some("req-1".into()));

        assert_eq!(error.message, "Ids not found");
        assert_eq!(error.missing, vec![json!({"id": 3})]);
        assert!(error.is_not_found());
        assert_eq!(error.request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn keeps_raw_body_when_not_an_envelope() {
        let error = ApiError::from_response(StatusCode::BAD_GATEWAY, "upstream down\n", None);
        assert_eq!(error.message, "upstream down");
        assert!(!error.is_not_found());
        assert_eq!(ClientError::Api(error).kind(), ErrorKind::Transient);
    }

    #[test]
    fn authorization_is_distinct_from_validation_errors() {
        let forbidden = ApiError::from_response(StatusCode::FORBIDDEN, "{}", None);
        let auth = ClientError::Authorization {
            project: "demo".into(),
            error: forbidden,
        };
        let invalid = ClientError::Api(ApiError::from_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error": {"message": "bad field"}}"#,
            None,
        ));

        assert_eq!(auth.kind(), ErrorKind::Authorization);
        assert_eq!(invalid.kind(), ErrorKind::Api);
        assert_eq!(ClientError::EmptyInput.kind(), ErrorKind::Programming);
    }
}
