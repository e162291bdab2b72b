//! HTTP Ports
//!
//! Collaborators of the REST fetcher: a request builder, a response parser,
//! and the transport that actually performs the call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::domain::response::{ErrorCode, ProviderId, ProviderValue, Response};

/// One outbound HTTP request. A body turns it into a POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    /// Absolute URL for direct transports, a path for fan-out transports.
    pub url: String,
    /// Request body.
    pub body: Option<Vec<u8>>,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
}

impl PreparedRequest {
    /// A GET request.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    /// A POST request carrying `body`.
    #[must_use]
    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            body: Some(body.into()),
            headers: Vec::new(),
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A response as received from the wire, before any status handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers (names lowercased).
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
    /// When the response was read.
    pub received_at: DateTime<Utc>,
}

impl RawResponse {
    /// A response with no headers, stamped now.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    /// Whether the status is in `[200, 300)`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Turns a batch of ids into one request.
#[cfg_attr(test, mockall::automock)]
pub trait RequestBuilder<K: Send + Sync + 'static>: Send + Sync {
    /// Build the request for `ids`.
    ///
    /// # Errors
    ///
    /// Any error marks every id in the batch as [`ErrorCode::BuildRequest`].
    fn build(&self, ids: &[K]) -> anyhow::Result<PreparedRequest>;
}

/// Turns a successful HTTP response into per-id results.
#[cfg_attr(test, mockall::automock)]
pub trait ResponseParser<K: ProviderId, V: ProviderValue>: Send + Sync {
    /// Parse `response` for `ids`. Ids missing from the payload should be
    /// marked [`ErrorCode::NoResponse`]; the fetcher fills in any it forgets.
    fn parse(&self, ids: &[K], response: &RawResponse) -> Response<K, V>;
}

/// Performs HTTP calls.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `request`, returning early with [`TransportError::Cancelled`]
    /// once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` when no response could be obtained. Non-2xx
    /// statuses are returned as `Ok` for the caller to classify.
    async fn send(
        &self,
        request: PreparedRequest,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportError>;
}

/// HTTP transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The call failed on the wire.
    #[error("request failed: {message}")]
    Request {
        /// HTTP status, when known.
        status: Option<u16>,
        /// Underlying error text.
        message: String,
    },

    /// The client-side timeout elapsed.
    #[error("request timed out")]
    Timeout,

    /// The governing scope was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// No endpoint produced a usable response.
    #[error("no usable response from {endpoints} endpoint(s)")]
    NoUsableResponse {
        /// Number of endpoints that were tried.
        endpoints: usize,
    },
}

impl TransportError {
    /// The per-id code this error maps to.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest(_) => ErrorCode::BuildRequest,
            Self::Request { status, .. } => ErrorCode::RequestFailed { status: *status },
            Self::Timeout => ErrorCode::Timeout,
            Self::Cancelled => ErrorCode::Unknown,
            Self::NoUsableResponse { .. } => ErrorCode::RequestFailed { status: None },
        }
    }
}
