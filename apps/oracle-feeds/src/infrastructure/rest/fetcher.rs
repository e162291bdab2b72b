//! REST Fetcher
//!
//! One id batch in, one request out, one Response back. Every failure mode
//! is attributed to the ids of the batch; nothing is returned as an error.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::application::ports::{HttpTransport, RequestBuilder, ResponseParser};
use crate::domain::response::{ErrorCode, ErrorWithCode, ProviderId, ProviderValue, Response};

/// HTTP status signalling rate limiting.
const TOO_MANY_REQUESTS: u16 = 429;

/// Turns id batches into Responses over an [`HttpTransport`].
pub struct RestFetcher<K: ProviderId, V: ProviderValue> {
    builder: Arc<dyn RequestBuilder<K>>,
    parser: Arc<dyn ResponseParser<K, V>>,
    transport: Arc<dyn HttpTransport>,
}

impl<K: ProviderId, V: ProviderValue> Clone for RestFetcher<K, V> {
    fn clone(&self) -> Self {
        Self {
            builder: Arc::clone(&self.builder),
            parser: Arc::clone(&self.parser),
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<K: ProviderId, V: ProviderValue> RestFetcher<K, V> {
    /// Create a fetcher from its collaborators.
    pub fn new(
        builder: Arc<dyn RequestBuilder<K>>,
        parser: Arc<dyn ResponseParser<K, V>>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            builder,
            parser,
            transport,
        }
    }

    /// Fetch `ids`. The returned Response covers every id in `ids`.
    pub async fn fetch(&self, ids: &[K], cancel: &CancellationToken) -> Response<K, V> {
        let request = match self.builder.build(ids) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, ids = ids.len(), "cannot build request");
                return Response::failed(ids, &ErrorWithCode::new(ErrorCode::BuildRequest, e));
            }
        };

        let raw = match self.transport.send(request, cancel).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(error = %e, ids = ids.len(), "request failed");
                return Response::failed(ids, &ErrorWithCode::new(e.code(), e));
            }
        };

        if raw.status == TOO_MANY_REQUESTS {
            let retry_after = raw.header("retry-after").unwrap_or("unspecified");
            return Response::failed(
                ids,
                &ErrorWithCode::msg(
                    ErrorCode::RateLimited,
                    format!("rate limited, retry after {retry_after}"),
                ),
            );
        }

        if !raw.is_success() {
            return Response::failed(
                ids,
                &ErrorWithCode::msg(
                    ErrorCode::UnexpectedStatus(raw.status),
                    format!("unexpected status {}", raw.status),
                ),
            );
        }

        let mut response = self.parser.parse(ids, &raw);
        let missing = response.fill_missing(ids);
        if missing > 0 {
            tracing::debug!(missing, "parser left ids without an outcome");
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{
        MockRequestBuilder, MockResponseParser, PreparedRequest, RawResponse, TransportError,
    };
    use crate::domain::response::PriceResult;
    use async_trait::async_trait;

    struct FixedTransport(fn() -> Result<RawResponse, TransportError>);

    #[async_trait]
    impl HttpTransport for FixedTransport {
        async fn send(
            &self,
            _request: PreparedRequest,
            _cancel: &CancellationToken,
        ) -> Result<RawResponse, TransportError> {
            (self.0)()
        }
    }

    fn builder_ok() -> MockRequestBuilder<String> {
        let mut builder = MockRequestBuilder::new();
        builder
            .expect_build()
            .returning(|_| Ok(PreparedRequest::get("http://prices.test/ticker")));
        builder
    }

    fn parser_never() -> MockResponseParser<String, i64> {
        let mut parser = MockResponseParser::new();
        parser.expect_parse().never();
        parser
    }

    fn ids() -> Vec<String> {
        vec!["A".to_string(), "B".to_string()]
    }

    fn codes(response: &Response<String, i64>) -> Vec<ErrorCode> {
        let mut codes: Vec<_> = response.unresolved().values().map(ErrorWithCode::code).collect();
        codes.dedup();
        codes
    }

    #[tokio::test]
    async fn build_failure_marks_every_id() {
        let mut builder = MockRequestBuilder::new();
        builder
            .expect_build()
            .returning(|_| Err(anyhow::anyhow!("unknown pair")));
        let fetcher = RestFetcher::new(
            Arc::new(builder),
            Arc::new(parser_never()),
            Arc::new(FixedTransport(|| Ok(RawResponse::new(200, Vec::new())))),
        );

        let response = fetcher.fetch(&ids(), &CancellationToken::new()).await;
        assert_eq!(response.unresolved().len(), 2);
        assert_eq!(codes(&response), vec![ErrorCode::BuildRequest]);
    }

    #[tokio::test]
    async fn transport_failure_carries_status() {
        let fetcher = RestFetcher::new(
            Arc::new(builder_ok()),
            Arc::new(parser_never()),
            Arc::new(FixedTransport(|| {
                Err(TransportError::Request {
                    status: Some(503),
                    message: "unavailable".into(),
                })
            })),
        );

        let response = fetcher.fetch(&ids(), &CancellationToken::new()).await;
        assert_eq!(
            codes(&response),
            vec![ErrorCode::RequestFailed { status: Some(503) }]
        );
    }

    #[tokio::test]
    async fn rate_limited_status() {
        let fetcher = RestFetcher::new(
            Arc::new(builder_ok()),
            Arc::new(parser_never()),
            Arc::new(FixedTransport(|| Ok(RawResponse::new(429, Vec::new())))),
        );

        let response = fetcher.fetch(&ids(), &CancellationToken::new()).await;
        assert_eq!(codes(&response), vec![ErrorCode::RateLimited]);
    }

    #[tokio::test]
    async fn unexpected_status() {
        let fetcher = RestFetcher::new(
            Arc::new(builder_ok()),
            Arc::new(parser_never()),
            Arc::new(FixedTransport(|| Ok(RawResponse::new(404, Vec::new())))),
        );

        let response = fetcher.fetch(&ids(), &CancellationToken::new()).await;
        assert_eq!(codes(&response), vec![ErrorCode::UnexpectedStatus(404)]);
    }

    #[tokio::test]
    async fn parser_gaps_become_no_response() {
        let mut parser = MockResponseParser::new();
        parser.expect_parse().times(1).returning(|_, raw| {
            assert_eq!(raw.body, b"{\"A\":100}");
            Response::new().with_resolved("A".to_string(), PriceResult::now(100))
        });
        let fetcher = RestFetcher::new(
            Arc::new(builder_ok()),
            Arc::new(parser),
            Arc::new(FixedTransport(|| {
                Ok(RawResponse::new(200, b"{\"A\":100}".to_vec()))
            })),
        );

        let response = fetcher.fetch(&ids(), &CancellationToken::new()).await;
        assert_eq!(response.resolved().get("A").map(|r| r.value), Some(100));
        assert_eq!(
            response.unresolved().get("B").map(ErrorWithCode::code),
            Some(ErrorCode::NoResponse)
        );
    }
}
