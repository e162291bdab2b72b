//! Provider
//!
//! Per-source runtime. A provider owns exactly one fetch strategy, runs it
//! against its current id set and folds every Response it produces into a
//! last-known-good snapshot.
//!
//! ```text
//!  update() ──► update queue ──┐
//!                              ▼
//!  run() ──► start() ──► strategy.run(child scope, ids, tx)
//!                │                                    │
//!                └──── merge ◄──── response channel ◄─┘
//! ```
//!
//! Reconfiguration never touches a running strategy. `update()` enqueues the
//! change; the loop applies it under the state lock, cancels the strategy's
//! scope and starts over with the new configuration.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    FetchError, GuardedMetrics, MetricsSink, NoopSink, ProviderStatus, ResponseSource,
    StrategyKind,
};
use crate::domain::backoff::{Backoff, BackoffConfig};
use crate::domain::response::{PriceResult, ProviderId, ProviderValue, Response};
use crate::domain::snapshot::{MergeOutcome, Snapshot};
use crate::infrastructure::config::ProviderSettings;

/// Default capacity of the response channel between strategy and provider.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Strategy
// =============================================================================

/// The fetch strategy a provider runs. Exactly one per provider.
///
/// The variant drives health reporting and metrics labels. Handlers that
/// declare a [`ResponseSource::kind`] must sit in the matching variant.
pub enum FetchStrategy<K: ProviderId, V: ProviderValue> {
    /// Periodic REST polling.
    Rest(Arc<dyn ResponseSource<K, V>>),
    /// Long-lived socket session.
    Socket(Arc<dyn ResponseSource<K, V>>),
}

impl<K: ProviderId, V: ProviderValue> Clone for FetchStrategy<K, V> {
    fn clone(&self) -> Self {
        match self {
            Self::Rest(source) => Self::Rest(Arc::clone(source)),
            Self::Socket(source) => Self::Socket(Arc::clone(source)),
        }
    }
}

impl<K: ProviderId, V: ProviderValue> std::fmt::Debug for FetchStrategy<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FetchStrategy").field(&self.kind()).finish()
    }
}

impl<K: ProviderId, V: ProviderValue> FetchStrategy<K, V> {
    /// Which variant this is.
    #[must_use]
    pub const fn kind(&self) -> StrategyKind {
        match self {
            Self::Rest(_) => StrategyKind::Rest,
            Self::Socket(_) => StrategyKind::Socket,
        }
    }

    /// The underlying Response source.
    #[must_use]
    pub fn source(&self) -> Arc<dyn ResponseSource<K, V>> {
        match self {
            Self::Rest(source) | Self::Socket(source) => Arc::clone(source),
        }
    }

    /// Reject a source that declares a different strategy than its variant.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] on a mismatch.
    pub fn check(&self) -> Result<(), ProviderError> {
        let source = match self {
            Self::Rest(source) | Self::Socket(source) => source,
        };
        match source.kind() {
            Some(declared) if declared != self.kind() => Err(ProviderError::Configuration(
                format!("{declared} source registered as a {} strategy", self.kind()),
            )),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Errors and updates
// =============================================================================

/// Why a provider stopped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The governing scope was cancelled.
    #[error("provider cancelled")]
    Cancelled,

    /// An update was applied; the strategy must be restarted.
    #[error("provider reconfigured")]
    Reconfigured,

    /// The provider was built with an invalid configuration.
    #[error("invalid provider configuration: {0}")]
    Configuration(String),

    /// Another task is already running this provider.
    #[error("provider is already running")]
    AlreadyRunning,

    /// The strategy ended on its own.
    #[error("session ended: {0}")]
    Session(FetchError),
}

/// A pending change to a provider's ids or strategy.
pub struct ProviderUpdate<K: ProviderId, V: ProviderValue> {
    /// Replacement id set.
    pub ids: Option<Vec<K>>,
    /// Replacement strategy.
    pub strategy: Option<FetchStrategy<K, V>>,
}

struct ProviderState<K: ProviderId, V: ProviderValue> {
    ids: Vec<K>,
    strategy: FetchStrategy<K, V>,
    snapshot: Snapshot<K, V>,
    last_update: Option<DateTime<Utc>>,
}

// =============================================================================
// Provider
// =============================================================================

/// Runs one source and keeps its snapshot.
pub struct Provider<K: ProviderId, V: ProviderValue> {
    name: String,
    state: RwLock<ProviderState<K, V>>,
    updates_tx: mpsc::UnboundedSender<ProviderUpdate<K, V>>,
    updates_rx: Mutex<mpsc::UnboundedReceiver<ProviderUpdate<K, V>>>,
    backoff: Backoff,
    channel_capacity: usize,
    metrics: GuardedMetrics,
}

impl<K: ProviderId, V: ProviderValue> Provider<K, V> {
    /// Start building a provider.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ProviderBuilder<K, V> {
        ProviderBuilder::new(name)
    }

    /// Provider name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ids currently requested.
    #[must_use]
    pub fn ids(&self) -> Vec<K> {
        self.state.read().ids.clone()
    }

    /// Copy of the last-known-good values.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<K, PriceResult<V>> {
        self.state.read().snapshot.entries().clone()
    }

    /// Last-known-good value of one id.
    #[must_use]
    pub fn get(&self, id: &K) -> Option<PriceResult<V>> {
        self.state.read().snapshot.get(id).cloned()
    }

    /// When a merge last changed the snapshot.
    #[must_use]
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_update
    }

    /// Strategy currently configured.
    #[must_use]
    pub fn strategy_kind(&self) -> StrategyKind {
        self.state.read().strategy.kind()
    }

    /// Queue a change of ids and/or strategy.
    ///
    /// A running provider restarts its strategy with the new configuration;
    /// an idle one applies it on its next start. Snapshot entries for ids
    /// that are no longer requested are dropped. A strategy that fails
    /// [`FetchStrategy::check`] is discarded with a warning.
    pub fn update(&self, ids: Option<Vec<K>>, strategy: Option<FetchStrategy<K, V>>) {
        let strategy = strategy.filter(|strategy| match strategy.check() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(provider = %self.name, error = %e, "strategy update rejected");
                false
            }
        });
        if ids.is_none() && strategy.is_none() {
            return;
        }
        if self
            .updates_tx
            .send(ProviderUpdate { ids, strategy })
            .is_err()
        {
            tracing::debug!(provider = %self.name, "update queue closed, update dropped");
        }
    }

    /// Run the strategy once against the current ids.
    ///
    /// Blocks until the scope is cancelled, an update arrives, or the
    /// strategy ends on its own. Returns `Ok(())` only when the strategy had
    /// nothing to do (no ids).
    ///
    /// # Errors
    ///
    /// - [`ProviderError::Cancelled`] when `cancel` fires.
    /// - [`ProviderError::Reconfigured`] after applying an update.
    /// - [`ProviderError::Session`] when the strategy ended with an error.
    /// - [`ProviderError::AlreadyRunning`] if another task is running it.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        self.start_session(cancel).await.0
    }

    /// Keep the strategy running until `cancel` fires.
    ///
    /// Restarts immediately after an update and after a backoff delay when
    /// the strategy fails. A session that produced data before failing
    /// shortens the delay, and an update arriving during the delay ends it.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Cancelled`] once `cancel` fires, or
    /// [`ProviderError::AlreadyRunning`].
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        tracing::info!(provider = %self.name, strategy = %self.strategy_kind(), "provider starting");
        loop {
            let (result, delivered) = self.start_session(cancel).await;
            match result {
                Ok(()) => {
                    tracing::debug!(provider = %self.name, "no ids to fetch, waiting for an update");
                    self.wait_for_update(cancel).await?;
                    self.backoff.reset();
                }
                Err(ProviderError::Reconfigured) => {
                    self.metrics.restart("reconfigured");
                    self.backoff.reset();
                }
                Err(ProviderError::Session(error)) => {
                    let delay = self.backoff.backoff(delivered);
                    tracing::warn!(
                        provider = %self.name,
                        error = %error,
                        delivered,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "session ended, restarting after backoff"
                    );
                    self.metrics.restart("session_failed");
                    if self.sleep_or_update(cancel).await? {
                        self.metrics.restart("reconfigured");
                        self.backoff.reset();
                    }
                }
                Err(e) => {
                    tracing::info!(provider = %self.name, reason = %e, "provider stopped");
                    return Err(e);
                }
            }
        }
    }

    /// One strategy run. The flag reports whether any resolved value arrived.
    async fn start_session(&self, cancel: &CancellationToken) -> (Result<(), ProviderError>, bool) {
        let Ok(mut updates) = self.updates_rx.try_lock() else {
            return (Err(ProviderError::AlreadyRunning), false);
        };
        while let Ok(update) = updates.try_recv() {
            self.apply_update(update);
        }
        if cancel.is_cancelled() {
            return (Err(ProviderError::Cancelled), false);
        }

        let (ids, source) = {
            let state = self.state.read();
            (state.ids.clone(), state.strategy.source())
        };
        tracing::debug!(provider = %self.name, ids = ids.len(), "starting strategy");

        let scope = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(self.channel_capacity);
        let handler = tokio::spawn({
            let scope = scope.clone();
            async move { source.run(scope, ids, tx).await }
        });

        let mut delivered = false;
        let stopped = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break Some(ProviderError::Cancelled),
                Some(update) = updates.recv() => {
                    self.apply_update(update);
                    break Some(ProviderError::Reconfigured);
                }
                received = rx.recv() => match received {
                    Some(response) => {
                        delivered |= !response.resolved().is_empty();
                        self.merge(response);
                    }
                    None => break None,
                },
            }
        };

        scope.cancel();
        drop(rx);
        let session = match handler.await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(provider = %self.name, error = %e, "strategy task failed");
                Err(FetchError::Panicked(e.to_string()))
            }
        };

        let result = match (stopped, session) {
            (Some(reason), _) => Err(reason),
            (None, Ok(())) => Ok(()),
            (None, Err(e)) => Err(ProviderError::Session(e)),
        };
        (result, delivered)
    }

    /// Wait out the backoff delay. An update cuts the wait short and is
    /// applied at once; the return value reports whether that happened.
    async fn sleep_or_update(&self, cancel: &CancellationToken) -> Result<bool, ProviderError> {
        let Ok(mut updates) = self.updates_rx.try_lock() else {
            return Err(ProviderError::AlreadyRunning);
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ProviderError::Cancelled),
            Some(update) = updates.recv() => {
                tracing::debug!(provider = %self.name, "update arrived during backoff");
                self.apply_update(update);
                Ok(true)
            }
            () = self.backoff.tick() => Ok(false),
        }
    }

    async fn wait_for_update(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let Ok(mut updates) = self.updates_rx.try_lock() else {
            return Err(ProviderError::AlreadyRunning);
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ProviderError::Cancelled),
            Some(update) = updates.recv() => {
                self.apply_update(update);
                Ok(())
            }
        }
    }

    fn apply_update(&self, update: ProviderUpdate<K, V>) {
        let (tracked, kind) = {
            let mut state = self.state.write();
            if let Some(ids) = update.ids {
                state.snapshot.retain_ids(&ids);
                state.ids = ids;
            }
            if let Some(strategy) = update.strategy {
                state.strategy = strategy;
            }
            (state.ids.len(), state.strategy.kind())
        };
        self.metrics.tracked_ids(tracked);
        tracing::info!(provider = %self.name, ids = tracked, strategy = %kind, "provider reconfigured");
    }

    fn merge(&self, response: Response<K, V>) -> MergeOutcome {
        for (id, error) in response.unresolved() {
            tracing::debug!(provider = %self.name, id = %id, code = %error.code(), error = %error, "id unresolved");
        }

        let outcome = {
            let mut state = self.state.write();
            let outcome = state.snapshot.apply(response);
            if outcome.updated > 0 {
                state.last_update = Some(Utc::now());
            }
            outcome
        };
        self.metrics.snapshot_updates(outcome.updated);
        tracing::trace!(
            provider = %self.name,
            updated = outcome.updated,
            stale = outcome.stale,
            errors = outcome.errors,
            "response merged"
        );
        outcome
    }
}

impl<K: ProviderId, V: ProviderValue> ProviderStatus for Provider<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy_kind(&self) -> StrategyKind {
        Self::strategy_kind(self)
    }

    fn tracked_ids(&self) -> usize {
        self.state.read().ids.len()
    }

    fn snapshot_len(&self) -> usize {
        self.state.read().snapshot.len()
    }

    fn last_update(&self) -> Option<DateTime<Utc>> {
        Self::last_update(self)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds a [`Provider`], enforcing exactly one strategy.
pub struct ProviderBuilder<K: ProviderId, V: ProviderValue> {
    name: String,
    ids: Vec<K>,
    rest: Option<Arc<dyn ResponseSource<K, V>>>,
    socket: Option<Arc<dyn ResponseSource<K, V>>>,
    backoff: BackoffConfig,
    channel_capacity: usize,
    sink: Arc<dyn MetricsSink>,
}

impl<K: ProviderId, V: ProviderValue> ProviderBuilder<K, V> {
    /// Start a builder for provider `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ids: Vec::new(),
            rest: None,
            socket: None,
            backoff: BackoffConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            sink: Arc::new(NoopSink),
        }
    }

    /// Initial ids.
    #[must_use]
    pub fn ids(mut self, ids: Vec<K>) -> Self {
        self.ids = ids;
        self
    }

    /// Poll over REST.
    #[must_use]
    pub fn rest(mut self, source: Arc<dyn ResponseSource<K, V>>) -> Self {
        self.rest = Some(source);
        self
    }

    /// Stream over a socket.
    #[must_use]
    pub fn socket(mut self, source: Arc<dyn ResponseSource<K, V>>) -> Self {
        self.socket = Some(source);
        self
    }

    /// Set the strategy from an existing value.
    #[must_use]
    pub fn strategy(self, strategy: FetchStrategy<K, V>) -> Self {
        match strategy {
            FetchStrategy::Rest(source) => self.rest(source),
            FetchStrategy::Socket(source) => self.socket(source),
        }
    }

    /// Restart backoff.
    #[must_use]
    pub const fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = config;
        self
    }

    /// Response channel capacity.
    #[must_use]
    pub const fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Metrics sink.
    #[must_use]
    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Apply name, channel capacity and backoff from settings.
    #[must_use]
    pub fn settings(mut self, settings: &ProviderSettings) -> Self {
        self.name.clone_from(&settings.name);
        self.channel_capacity = settings.response_buffer;
        self.backoff = BackoffConfig::from_settings(&settings.backoff);
        self
    }

    /// Build the provider.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] unless exactly one strategy
    /// is set, when a handler sits under the other strategy, or when the
    /// channel capacity is zero.
    pub fn build(self) -> Result<Provider<K, V>, ProviderError> {
        let strategy = match (self.rest, self.socket) {
            (Some(rest), None) => FetchStrategy::Rest(rest),
            (None, Some(socket)) => FetchStrategy::Socket(socket),
            (None, None) => {
                return Err(ProviderError::Configuration(
                    "a rest or socket strategy is required".to_string(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(ProviderError::Configuration(
                    "rest and socket strategies are mutually exclusive".to_string(),
                ));
            }
        };
        strategy.check()?;
        if self.channel_capacity == 0 {
            return Err(ProviderError::Configuration(
                "channel capacity must be at least 1".to_string(),
            ));
        }

        let metrics = GuardedMetrics::new(self.name.as_str(), self.sink);
        metrics.tracked_ids(self.ids.len());
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        Ok(Provider {
            name: self.name,
            state: RwLock::new(ProviderState {
                ids: self.ids,
                strategy,
                snapshot: Snapshot::new(),
                last_update: None,
            }),
            updates_tx,
            updates_rx: Mutex::new(updates_rx),
            backoff: Backoff::new(self.backoff),
            channel_capacity: self.channel_capacity,
            metrics,
        })
    }
}
