//! Direct HTTP transport.
//!
//! A single `reqwest` client. Non-2xx answers are returned as-is for the
//! fetcher to classify.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{HttpTransport, PreparedRequest, RawResponse, TransportError};

/// HTTP transport over one `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct DirectTransport {
    client: Client,
}

impl DirectTransport {
    /// Create a transport whose client enforces `timeout` per request.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidRequest` if the client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }

    /// Wrap an existing client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for DirectTransport {
    async fn send(
        &self,
        request: PreparedRequest,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportError> {
        let outbound = prepare(&self.client, &request.url, &request);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            result = execute(outbound) => result,
        }
    }
}

/// Build a client with the per-request timeout.
pub(crate) fn build_client(timeout: Duration) -> Result<Client, TransportError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))
}

/// Turn a prepared request into a `reqwest` builder aimed at `url`.
///
/// The body is copied so every destination owns its own buffer.
pub(crate) fn prepare(
    client: &Client,
    url: &str,
    request: &PreparedRequest,
) -> reqwest::RequestBuilder {
    let mut builder = match &request.body {
        Some(body) => client.post(url).body(body.clone()),
        None => client.get(url),
    };
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

/// Send and read the full body.
pub(crate) async fn execute(
    builder: reqwest::RequestBuilder,
) -> Result<RawResponse, TransportError> {
    let response = builder.send().await.map_err(map_reqwest_error)?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = response.bytes().await.map_err(map_reqwest_error)?;

    Ok(RawResponse {
        status,
        headers,
        body: body.to_vec(),
        received_at: Utc::now(),
    })
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout;
    }
    if error.is_builder() {
        return TransportError::InvalidRequest(error.to_string());
    }
    TransportError::Request {
        status: error.status().map(|s| s.as_u16()),
        message: error.to_string(),
    }
}
