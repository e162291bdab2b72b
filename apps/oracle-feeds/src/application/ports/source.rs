//! Response Source Port
//!
//! The capability shared by both fetch strategies: produce Responses onto a
//! channel until the scope is cancelled.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::response::{ProviderId, ProviderValue, Response};

/// Which strategy a provider runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Periodic REST polling.
    Rest,
    /// Long-lived socket session.
    Socket,
}

impl StrategyKind {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Socket => "socket",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces Responses for a set of ids.
#[async_trait]
pub trait ResponseSource<K: ProviderId, V: ProviderValue>: Send + Sync {
    /// Stream Responses for `ids` onto `responses` until `cancel` fires.
    ///
    /// Returns `Ok(())` immediately when `ids` is empty.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Cancelled`] when the scope ends, or the error
    /// that terminated the session.
    async fn run(
        &self,
        cancel: CancellationToken,
        ids: Vec<K>,
        responses: mpsc::Sender<Response<K, V>>,
    ) -> Result<(), FetchError>;

    /// The strategy this source implements, when it is tied to one.
    /// Sources returning `None` may run under either strategy.
    fn kind(&self) -> Option<StrategyKind> {
        None
    }
}

/// Errors that end a fetch strategy run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The governing scope was cancelled.
    #[error("fetch cancelled")]
    Cancelled,

    /// The socket could not be dialed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// The subscription builder failed.
    #[error("cannot build subscription: {0}")]
    BuildSubscription(String),

    /// Writing the subscription failed.
    #[error("write failed: {0}")]
    Write(String),

    /// The remote end closed the session.
    #[error("connection closed: {0}")]
    Closed(String),

    /// Too many consecutive read errors.
    #[error("{0} consecutive read errors")]
    ReadErrorLimit(u32),

    /// The handler task panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Read-only view of a provider, for health reporting.
pub trait ProviderStatus: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;
    /// Strategy in use.
    fn strategy_kind(&self) -> StrategyKind;
    /// Number of ids currently requested.
    fn tracked_ids(&self) -> usize;
    /// Number of ids with a value.
    fn snapshot_len(&self) -> usize;
    /// When the snapshot last changed.
    fn last_update(&self) -> Option<DateTime<Utc>>;
}

/// Send `response` unless `cancel` has fired, racing the send against it.
///
/// Returns whether the response was delivered. A cancelled scope never
/// receives a late write, even when the send could complete immediately.
pub async fn deliver<T>(
    responses: &mpsc::Sender<T>,
    response: T,
    cancel: &CancellationToken,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = responses.send(response) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_sends_when_live() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        assert!(deliver(&tx, 7, &cancel).await);
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn deliver_skips_after_cancel() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!deliver(&tx, 7, &cancel).await);
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn deliver_does_not_block_on_full_channel_after_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        assert!(deliver(&tx, 1, &cancel).await);

        let pending = tokio::spawn({
            let tx = tx.clone();
            let cancel = cancel.clone();
            async move { deliver(&tx, 2, &cancel).await }
        });
        tokio::task::yield_now().await;
        cancel.cancel();

        let delivered = tokio::time::timeout(std::time::Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(!delivered);
    }

    #[test]
    fn strategy_kind_names() {
        assert_eq!(StrategyKind::Rest.as_str(), "rest");
        assert_eq!(StrategyKind::Socket.to_string(), "socket");
        assert_eq!(
            serde_json::to_string(&StrategyKind::Socket).unwrap(),
            "\"socket\""
        );
    }
}
