//! Metrics Port
//!
//! The core reports observations through [`MetricsSink`]. Every call goes
//! through [`GuardedMetrics`], which swallows sink panics so that a broken
//! sink can never reach the data path.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::response::{ProviderId, Response};

/// Label used for resolved ids.
pub const STATUS_SUCCESS: &str = "success";

/// Destination for provider observations.
#[cfg_attr(test, mockall::automock)]
pub trait MetricsSink: Send + Sync {
    /// One id finished a fetch with `status` (`success` or an error code label).
    fn record_outcome(&self, provider: &str, id: &str, status: &str);

    /// Latency of one fetch.
    fn observe_fetch_duration(&self, provider: &str, duration: Duration);

    /// Snapshot entries replaced by a merge.
    fn record_snapshot_updates(&self, provider: &str, count: u64);

    /// A socket lifecycle event (`connected`, `read_failed`, `decode_failed`, ...).
    fn record_socket_event(&self, provider: &str, event: &str);

    /// The run loop restarted its handler.
    fn record_restart(&self, provider: &str, reason: &str);

    /// Current number of tracked ids.
    fn set_tracked_ids(&self, provider: &str, count: usize);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_outcome(&self, _provider: &str, _id: &str, _status: &str) {}
    fn observe_fetch_duration(&self, _provider: &str, _duration: Duration) {}
    fn record_snapshot_updates(&self, _provider: &str, _count: u64) {}
    fn record_socket_event(&self, _provider: &str, _event: &str) {}
    fn record_restart(&self, _provider: &str, _reason: &str) {}
    fn set_tracked_ids(&self, _provider: &str, _count: usize) {}
}

/// A sink bound to one provider name, with panics contained.
#[derive(Clone)]
pub struct GuardedMetrics {
    provider: Arc<str>,
    sink: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for GuardedMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedMetrics")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

impl GuardedMetrics {
    /// Bind `sink` to `provider`.
    pub fn new(provider: impl Into<Arc<str>>, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            provider: provider.into(),
            sink,
        }
    }

    /// Observations for `provider` are discarded.
    pub fn noop(provider: impl Into<Arc<str>>) -> Self {
        Self::new(provider, Arc::new(NoopSink))
    }

    /// Provider name the observations are tagged with.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Tag every id of `response` with its outcome.
    pub fn record_response<K: ProviderId, V>(&self, response: &Response<K, V>) {
        self.guard("record_outcome", |sink, provider| {
            for id in response.resolved().keys() {
                sink.record_outcome(provider, &id.to_string(), STATUS_SUCCESS);
            }
            for (id, error) in response.unresolved() {
                sink.record_outcome(provider, &id.to_string(), &error.code().label());
            }
        });
    }

    /// Record fetch latency.
    pub fn fetch_duration(&self, duration: Duration) {
        self.guard("observe_fetch_duration", |sink, provider| {
            sink.observe_fetch_duration(provider, duration);
        });
    }

    /// Record snapshot replacements.
    pub fn snapshot_updates(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.guard("record_snapshot_updates", |sink, provider| {
            sink.record_snapshot_updates(provider, u64::try_from(count).unwrap_or(u64::MAX));
        });
    }

    /// Record a socket event.
    pub fn socket_event(&self, event: &str) {
        self.guard("record_socket_event", |sink, provider| {
            sink.record_socket_event(provider, event);
        });
    }

    /// Record a run-loop restart.
    pub fn restart(&self, reason: &str) {
        self.guard("record_restart", |sink, provider| {
            sink.record_restart(provider, reason);
        });
    }

    /// Publish the tracked id count.
    pub fn tracked_ids(&self, count: usize) {
        self.guard("set_tracked_ids", |sink, provider| {
            sink.set_tracked_ids(provider, count);
        });
    }

    fn guard(&self, call: &'static str, f: impl FnOnce(&dyn MetricsSink, &str)) {
        let sink = self.sink.as_ref();
        let provider = self.provider.as_ref();
        if catch_unwind(AssertUnwindSafe(|| f(sink, provider))).is_err() {
            tracing::warn!(provider, call, "metrics sink panicked, observation dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::response::{ErrorCode, ErrorWithCode, PriceResult};
    use mockall::predicate::eq;

    #[test]
    fn tags_every_id() {
        let mut sink = MockMetricsSink::new();
        sink.expect_record_outcome()
            .with(eq("binance"), eq("BTC/USD"), eq("success"))
            .times(1)
            .return_const(());
        sink.expect_record_outcome()
            .with(eq("binance"), eq("ETH/USD"), eq("rate_limited"))
            .times(1)
            .return_const(());

        let metrics = GuardedMetrics::new("binance", Arc::new(sink));
        let response: Response<String, i32> = Response::new()
            .with_resolved("BTC/USD".to_string(), PriceResult::now(1))
            .with_unresolved(
                "ETH/USD".to_string(),
                ErrorWithCode::msg(ErrorCode::RateLimited, "429"),
            );
        metrics.record_response(&response);
    }

    struct ExplodingSink;

    impl MetricsSink for ExplodingSink {
        fn record_outcome(&self, _: &str, _: &str, _: &str) {
            panic!("sink exploded");
        }
        fn observe_fetch_duration(&self, _: &str, _: Duration) {
            panic!("sink exploded");
        }
        fn record_snapshot_updates(&self, _: &str, _: u64) {}
        fn record_socket_event(&self, _: &str, _: &str) {}
        fn record_restart(&self, _: &str, _: &str) {
            panic!("sink exploded");
        }
        fn set_tracked_ids(&self, _: &str, _: usize) {}
    }

    #[test]
    fn panicking_sink_is_contained() {
        let metrics = GuardedMetrics::new("kraken", Arc::new(ExplodingSink));
        metrics.restart("session_failed");
        metrics.fetch_duration(Duration::from_millis(5));
        metrics.record_response(&Response::<&str, i32>::new().with_resolved("A", PriceResult::now(1)));
    }

    #[test]
    fn zero_updates_are_not_reported() {
        let mut sink = MockMetricsSink::new();
        sink.expect_record_snapshot_updates().never();

        let metrics = GuardedMetrics::new("okx", Arc::new(sink));
        metrics.snapshot_updates(0);
    }
}
