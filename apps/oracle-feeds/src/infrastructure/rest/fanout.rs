//! Fan-Out Transport
//!
//! Sends one logical request to several redundant endpoints at once and
//! reduces whatever 2xx answers arrive with a caller-supplied filter.
//! Transport errors and non-2xx answers are dropped silently here; the
//! filter decides what a usable answer is.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use super::transport::{build_client, execute, prepare};
use crate::application::ports::{HttpTransport, PreparedRequest, RawResponse, TransportError};

/// Reduces the collected 2xx responses to the one handed to the parser.
pub type ResponseFilter = Arc<dyn Fn(Vec<RawResponse>) -> Option<RawResponse> + Send + Sync>;

/// Keep the first response to arrive.
#[must_use]
pub fn first_response() -> ResponseFilter {
    Arc::new(|responses: Vec<RawResponse>| responses.into_iter().next())
}

/// Keep the response whose `header` carries the largest integer.
///
/// Responses without a parseable header are ignored.
#[must_use]
pub fn freshest_by_header(header: impl Into<String>) -> ResponseFilter {
    let header = header.into();
    Arc::new(move |responses: Vec<RawResponse>| {
        responses
            .into_iter()
            .filter_map(|response| {
                let rank = response.header(&header)?.trim().parse::<u64>().ok()?;
                Some((rank, response))
            })
            .max_by_key(|(rank, _)| *rank)
            .map(|(_, response)| response)
    })
}

/// Transport racing one request across redundant endpoints.
///
/// The request URL is treated as a path appended to every endpoint base.
#[derive(Clone)]
pub struct FanOutTransport {
    client: Client,
    endpoints: Vec<String>,
    filter: ResponseFilter,
}

impl std::fmt::Debug for FanOutTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutTransport")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl FanOutTransport {
    /// Create a transport over `endpoints` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidRequest` if the client cannot be built.
    pub fn new(
        endpoints: Vec<String>,
        timeout: Duration,
        filter: ResponseFilter,
    ) -> Result<Self, TransportError> {
        Ok(Self::with_client(build_client(timeout)?, endpoints, filter))
    }

    /// Wrap an existing client.
    #[must_use]
    pub fn with_client(client: Client, endpoints: Vec<String>, filter: ResponseFilter) -> Self {
        Self {
            client,
            endpoints,
            filter,
        }
    }

    /// Endpoint bases in use.
    #[must_use]
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Fire `request` at every endpoint and reduce the 2xx answers.
    ///
    /// Waits for every endpoint or for `cancel`, whichever comes first. On
    /// cancellation the filter sees only what had arrived until then, which
    /// is an empty list when nothing usable had.
    pub async fn dispatch(
        &self,
        request: &PreparedRequest,
        cancel: &CancellationToken,
    ) -> Option<RawResponse> {
        let collected = self.collect(request, cancel).await;
        tracing::trace!(
            endpoints = self.endpoints.len(),
            usable = collected.len(),
            "fan-out collected"
        );
        (self.filter)(collected)
    }

    async fn collect(&self, request: &PreparedRequest, cancel: &CancellationToken) -> Vec<RawResponse> {
        let mut pending: FuturesUnordered<_> = self
            .endpoints
            .iter()
            .map(|base| {
                let url = join_url(base, &request.url);
                let outbound = prepare(&self.client, &url, request);
                async move { (url, execute(outbound).await) }
            })
            .collect();

        let mut collected = Vec::with_capacity(self.endpoints.len());
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = pending.next() => match next {
                    Some((_, Ok(response))) if response.is_success() => collected.push(response),
                    Some((url, Ok(response))) => {
                        tracing::debug!(url = %url, status = response.status, "discarding non-2xx answer");
                    }
                    Some((url, Err(e))) => {
                        tracing::debug!(url = %url, error = %e, "endpoint failed");
                    }
                    None => break,
                },
            }
        }
        collected
    }
}

#[async_trait]
impl HttpTransport for FanOutTransport {
    async fn send(
        &self,
        request: PreparedRequest,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportError> {
        match self.dispatch(&request, cancel).await {
            Some(response) => Ok(response),
            None if cancel.is_cancelled() => Err(TransportError::Cancelled),
            None => Err(TransportError::NoUsableResponse {
                endpoints: self.endpoints.len(),
            }),
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_header(name: &str, value: &str) -> RawResponse {
        let mut response = RawResponse::new(200, value.as_bytes().to_vec());
        response.headers.push((name.to_string(), value.to_string()));
        response
    }

    #[test]
    fn url_joining() {
        assert_eq!(join_url("http://a/", "/v1/ticker"), "http://a/v1/ticker");
        assert_eq!(join_url("http://a", "v1/ticker"), "http://a/v1/ticker");
        assert_eq!(join_url("http://a", ""), "http://a");
    }

    #[test]
    fn first_response_filter() {
        let filter = first_response();
        assert!(filter(Vec::new()).is_none());
        let picked = filter(vec![RawResponse::new(200, "1"), RawResponse::new(200, "2")]);
        assert_eq!(picked.map(|r| r.body), Some(b"1".to_vec()));
    }

    #[test]
    fn freshest_filter_prefers_highest_header() {
        let filter = freshest_by_header("X-Block-Height");
        let picked = filter(vec![
            with_header("x-block-height", "100"),
            with_header("x-block-height", "102"),
            RawResponse::new(200, "no header"),
            with_header("x-block-height", "101"),
        ]);
        assert_eq!(picked.map(|r| r.body), Some(b"102".to_vec()));
    }

    #[test]
    fn freshest_filter_ignores_unparseable() {
        let filter = freshest_by_header("x-block-height");
        assert!(filter(vec![with_header("x-block-height", "latest")]).is_none());
    }
}
