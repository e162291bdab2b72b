//! REST Query Orchestrator
//!
//! Polls a [`RestFetcher`] on a fixed interval. Ids are split into tasks
//! (one atomic task, or fixed-size batches), and every tick hands up to
//! `limit` tasks to a fixed pool of workers, walking the task list
//! round-robin so every task keeps being retried while others are in flight.
//!
//! ```text
//!  interval tick ──► round-robin index ──► bounded job queue ──► worker 0..limit
//!                                                                   │
//!                                         response channel ◄────────┘
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::fetcher::RestFetcher;
use crate::application::ports::{
    FetchError, GuardedMetrics, ResponseSource, StrategyKind, deliver,
};
use crate::application::services::provider::FetchStrategy;
use crate::domain::response::{ErrorCode, ErrorWithCode, ProviderId, ProviderValue, Response};
use crate::infrastructure::config::RestSettings;

/// Shortest polling period; smaller configured intervals are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Split `ids` into the id subsets fetched by one request each.
#[must_use]
pub fn plan_tasks<K: Clone>(ids: &[K], atomic: bool, batch_size: usize) -> Vec<Vec<K>> {
    if ids.is_empty() {
        return Vec::new();
    }
    if atomic {
        return vec![ids.to_vec()];
    }
    ids.chunks(batch_size.max(1)).map(<[K]>::to_vec).collect()
}

/// Periodic REST poller.
pub struct RestQueryHandler<K: ProviderId, V: ProviderValue> {
    settings: RestSettings,
    fetcher: RestFetcher<K, V>,
    metrics: GuardedMetrics,
}

impl<K: ProviderId, V: ProviderValue> RestQueryHandler<K, V> {
    /// Create a handler.
    #[must_use]
    pub const fn new(
        settings: RestSettings,
        fetcher: RestFetcher<K, V>,
        metrics: GuardedMetrics,
    ) -> Self {
        Self {
            settings,
            fetcher,
            metrics,
        }
    }

    /// The settings in use.
    #[must_use]
    pub const fn settings(&self) -> &RestSettings {
        &self.settings
    }

    /// Poll `ids` until `cancel` fires, then wait for in-flight fetches.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Cancelled`] once the scope ends. Returns `Ok(())`
    /// immediately when `ids` is empty.
    pub async fn query(
        &self,
        cancel: CancellationToken,
        ids: Vec<K>,
        responses: mpsc::Sender<Response<K, V>>,
    ) -> Result<(), FetchError> {
        let tasks = plan_tasks(&ids, self.settings.atomic, self.settings.batch_size);
        if tasks.is_empty() {
            return Ok(());
        }

        let limit = self.settings.max_concurrent_queries.clamp(1, tasks.len());
        tracing::debug!(
            provider = self.metrics.provider(),
            ids = ids.len(),
            tasks = tasks.len(),
            limit,
            interval_ms = self.settings.interval.as_millis(),
            "starting rest query loop"
        );

        let (job_tx, job_rx) = mpsc::channel::<Vec<K>>(limit);
        let jobs = Arc::new(Mutex::new(job_rx));
        let mut workers = JoinSet::new();
        for index in 0..limit {
            let worker = Worker {
                index,
                fetcher: self.fetcher.clone(),
                timeout: self.settings.timeout,
                metrics: self.metrics.clone(),
            };
            workers.spawn(worker.run(Arc::clone(&jobs), responses.clone(), cancel.clone()));
        }
        drop(responses);

        if self.settings.interval < MIN_INTERVAL {
            tracing::warn!(
                provider = self.metrics.provider(),
                interval_ms = self.settings.interval.as_millis(),
                "polling interval below minimum, using 1ms"
            );
        }
        let mut ticker = tokio::time::interval(self.settings.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut next = 0usize;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for _ in 0..limit {
                        match job_tx.try_send(tasks[next].clone()) {
                            Ok(()) => next = (next + 1) % tasks.len(),
                            Err(TrySendError::Full(_)) => {
                                tracing::trace!(
                                    provider = self.metrics.provider(),
                                    "worker pool saturated, deferring to next tick"
                                );
                                break;
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
        }

        drop(job_tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(
                    provider = self.metrics.provider(),
                    error = %e,
                    "rest worker terminated abnormally"
                );
            }
        }

        Err(FetchError::Cancelled)
    }
}

#[async_trait]
impl<K: ProviderId, V: ProviderValue> ResponseSource<K, V> for RestQueryHandler<K, V> {
    async fn run(
        &self,
        cancel: CancellationToken,
        ids: Vec<K>,
        responses: mpsc::Sender<Response<K, V>>,
    ) -> Result<(), FetchError> {
        self.query(cancel, ids, responses).await
    }

    fn kind(&self) -> Option<StrategyKind> {
        Some(StrategyKind::Rest)
    }
}

impl<K: ProviderId, V: ProviderValue> From<RestQueryHandler<K, V>> for FetchStrategy<K, V> {
    fn from(handler: RestQueryHandler<K, V>) -> Self {
        Self::Rest(Arc::new(handler))
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker<K: ProviderId, V: ProviderValue> {
    index: usize,
    fetcher: RestFetcher<K, V>,
    timeout: Duration,
    metrics: GuardedMetrics,
}

impl<K: ProviderId, V: ProviderValue> Worker<K, V> {
    async fn run(
        self,
        jobs: Arc<Mutex<mpsc::Receiver<Vec<K>>>>,
        responses: mpsc::Sender<Response<K, V>>,
        cancel: CancellationToken,
    ) {
        loop {
            let job = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                job = async { jobs.lock().await.recv().await } => job,
            };
            let Some(ids) = job else { break };

            let started = Instant::now();
            let Some(response) = self.execute(&ids, &cancel).await else {
                break;
            };
            self.metrics.fetch_duration(started.elapsed());
            self.metrics.record_response(&response);

            tracing::trace!(
                provider = self.metrics.provider(),
                worker = self.index,
                resolved = response.resolved().len(),
                unresolved = response.unresolved().len(),
                "fetch finished"
            );

            if !deliver(&responses, response, &cancel).await {
                break;
            }
        }
    }

    /// Run one fetch under the per-fetch deadline, containing panics.
    ///
    /// Returns `None` when the outer scope ends first.
    async fn execute(&self, ids: &[K], cancel: &CancellationToken) -> Option<Response<K, V>> {
        let scope = cancel.child_token();
        let _scope_guard = scope.clone().drop_guard();
        let fetch = AssertUnwindSafe(self.fetcher.fetch(ids, &scope)).catch_unwind();

        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            outcome = tokio::time::timeout(self.timeout, fetch) => Some(match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(panic)) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(
                        provider = self.metrics.provider(),
                        worker = self.index,
                        panic = %message,
                        "fetch task panicked"
                    );
                    Response::failed(
                        ids,
                        &ErrorWithCode::msg(ErrorCode::Panicked, format!("fetch panicked: {message}")),
                    )
                }
                Err(_) => Response::failed(
                    ids,
                    &ErrorWithCode::msg(
                        ErrorCode::Timeout,
                        format!("fetch exceeded {}ms", self.timeout.as_millis()),
                    ),
                ),
            }),
        }
    }
}

/// Best-effort text of a panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{
        HttpTransport, PreparedRequest, RawResponse, RequestBuilder, ResponseParser,
        TransportError,
    };
    use crate::domain::response::PriceResult;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    #[test_case(&[], false, 2, &[] ; "empty ids")]
    #[test_case(&["A", "B", "C"], true, 1, &[&["A", "B", "C"]] ; "atomic")]
    #[test_case(&["A", "B", "C"], false, 1, &[&["A"], &["B"], &["C"]] ; "per id")]
    #[test_case(&["A", "B", "C"], false, 2, &[&["A", "B"], &["C"]] ; "batched")]
    #[test_case(&["A", "B"], false, 0, &[&["A"], &["B"]] ; "zero batch treated as one")]
    fn task_planning(ids: &[&str], atomic: bool, batch: usize, expected: &[&[&str]]) {
        let tasks = plan_tasks(ids, atomic, batch);
        let expected: Vec<Vec<&str>> = expected.iter().map(|t| t.to_vec()).collect();
        assert_eq!(tasks, expected);
    }

    /// Builder that encodes the ids into the URL.
    struct PathBuilder;

    impl RequestBuilder<String> for PathBuilder {
        fn build(&self, ids: &[String]) -> anyhow::Result<PreparedRequest> {
            Ok(PreparedRequest::get(ids.join(",")))
        }
    }

    /// Parser that resolves every requested id to its call count.
    struct CountingParser;

    impl ResponseParser<String, usize> for CountingParser {
        fn parse(&self, ids: &[String], raw: &RawResponse) -> Response<String, usize> {
            let count: usize = String::from_utf8_lossy(&raw.body).parse().unwrap_or(0);
            ids.iter().fold(Response::new(), |response, id| {
                response.with_resolved(id.clone(), PriceResult::now(count))
            })
        }
    }

    /// Transport that counts calls per URL and can be told to hang or panic.
    #[derive(Default)]
    struct ScriptedTransport {
        calls: parking_lot::Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(
            &self,
            request: PreparedRequest,
            _cancel: &CancellationToken,
        ) -> Result<RawResponse, TransportError> {
            assert!(request.url != "PANIC", "scripted panic");
            let count = {
                let mut calls = self.calls.lock();
                let entry = calls.entry(request.url.clone()).or_default();
                *entry += 1;
                *entry
            };
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(RawResponse::new(200, count.to_string()))
        }
    }

    fn handler(
        settings: RestSettings,
        transport: Arc<ScriptedTransport>,
    ) -> RestQueryHandler<String, usize> {
        RestQueryHandler::new(
            settings,
            RestFetcher::new(Arc::new(PathBuilder), Arc::new(CountingParser), transport),
            GuardedMetrics::noop("test"),
        )
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn empty_ids_return_immediately() {
        let transport = Arc::new(ScriptedTransport::default());
        let (tx, _rx) = mpsc::channel(4);
        let result = handler(RestSettings::default(), transport)
            .query(CancellationToken::new(), Vec::new(), tx)
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn zero_interval_polls_at_the_minimum_period() {
        let transport = Arc::new(ScriptedTransport::default());
        let settings = RestSettings {
            interval: Duration::ZERO,
            ..RestSettings::default()
        };
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let handler = handler(settings, Arc::clone(&transport));
            let cancel = cancel.clone();
            async move { handler.query(cancel, ids(&["A"]), tx).await }
        });

        for _ in 0..3 {
            let response = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(response.resolved().contains_key("A"));
        }

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Err(FetchError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_dispatches_every_task() {
        let transport = Arc::new(ScriptedTransport::default());
        let settings = RestSettings {
            interval: Duration::from_secs(60),
            max_concurrent_queries: 3,
            ..RestSettings::default()
        };
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let handler = handler(settings, Arc::clone(&transport));
            let cancel = cancel.clone();
            async move { handler.query(cancel, ids(&["A", "B", "C"]), tx).await }
        });

        let mut seen = Vec::new();
        for _ in 0..3 {
            let response = rx.recv().await.unwrap();
            seen.extend(response.resolved().keys().cloned());
        }
        seen.sort();
        assert_eq!(seen, ids(&["A", "B", "C"]));

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Err(FetchError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_and_round_robin_continues() {
        let transport = Arc::new(ScriptedTransport {
            delay: Duration::from_millis(250),
            ..ScriptedTransport::default()
        });
        let settings = RestSettings {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
            max_concurrent_queries: 2,
            atomic: false,
            batch_size: 1,
        };
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let handler = handler(settings, Arc::clone(&transport));
            let cancel = cancel.clone();
            async move { handler.query(cancel, ids(&["A", "B", "C", "D"]), tx).await }
        });

        let mut seen = std::collections::HashSet::new();
        while seen.len() < 4 {
            let response = rx.recv().await.unwrap();
            seen.extend(response.resolved().keys().cloned());
        }

        cancel.cancel();
        let _ = handle.await.unwrap();
        assert!(transport.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out_per_id() {
        let transport = Arc::new(ScriptedTransport {
            delay: Duration::from_secs(5),
            ..ScriptedTransport::default()
        });
        let settings = RestSettings {
            interval: Duration::from_secs(60),
            timeout: Duration::from_millis(100),
            max_concurrent_queries: 1,
            atomic: true,
            batch_size: 1,
        };
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let handler = handler(settings, transport);
            let cancel = cancel.clone();
            async move { handler.query(cancel, ids(&["A", "B"]), tx).await }
        });

        let response = rx.recv().await.unwrap();
        assert_eq!(response.unresolved().len(), 2);
        assert!(
            response
                .unresolved()
                .values()
                .all(|e| e.code() == ErrorCode::Timeout)
        );

        cancel.cancel();
        let _ = handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_fetch_is_contained() {
        let transport = Arc::new(ScriptedTransport::default());
        let settings = RestSettings {
            interval: Duration::from_secs(60),
            max_concurrent_queries: 2,
            ..RestSettings::default()
        };
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let handler = handler(settings, transport);
            let cancel = cancel.clone();
            async move { handler.query(cancel, ids(&["PANIC", "OK"]), tx).await }
        });

        let mut panicked = false;
        let mut resolved = false;
        for _ in 0..2 {
            let response = rx.recv().await.unwrap();
            panicked |= response
                .unresolved()
                .get("PANIC")
                .is_some_and(|e| e.code() == ErrorCode::Panicked);
            resolved |= response.resolved().contains_key("OK");
        }
        assert!(panicked);
        assert!(resolved);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Err(FetchError::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_stops_promptly_with_full_channel() {
        let transport = Arc::new(ScriptedTransport::default());
        let settings = RestSettings {
            interval: Duration::from_millis(5),
            max_concurrent_queries: 4,
            ..RestSettings::default()
        };
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let handler = handler(settings, transport);
            let cancel = cancel.clone();
            async move { handler.query(cancel, ids(&["A", "B", "C", "D"]), tx).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(FetchError::Cancelled));
    }

    #[test]
    fn panic_payload_text() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
