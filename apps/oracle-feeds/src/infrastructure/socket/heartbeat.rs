//! Heartbeat Timer
//!
//! Emits liveness ticks for a socket session on its own timer, in parallel
//! with the receive loop. The session turns each tick into frames.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One heartbeat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTick {
    /// Ticks emitted so far in this session, starting at 1.
    pub sequence: u64,
}

/// Periodic tick source for one session.
#[derive(Debug)]
pub struct HeartbeatTimer {
    period: Duration,
    tick_tx: mpsc::Sender<HeartbeatTick>,
    cancel: CancellationToken,
}

impl HeartbeatTimer {
    /// Create a timer. The first tick fires one `period` after `run` starts.
    #[must_use]
    pub const fn new(
        period: Duration,
        tick_tx: mpsc::Sender<HeartbeatTick>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            period,
            tick_tx,
            cancel,
        }
    }

    /// Tick until cancelled or the session drops its receiver.
    ///
    /// A session that has not consumed the previous tick skips this one.
    pub async fn run(self) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    sequence += 1;
                    match self.tick_tx.try_send(HeartbeatTick { sequence }) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::debug!(sequence, "session busy, heartbeat skipped");
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            }
        }
        tracing::trace!(sequence, "heartbeat timer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_on_period_and_not_immediately() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let handle = tokio::spawn(HeartbeatTimer::new(Duration::from_secs(5), tx, cancel.clone()).run());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert!(started.elapsed() >= Duration::from_secs(5));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.sequence, 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = tokio::spawn(
            HeartbeatTimer::new(Duration::from_millis(10), tx, CancellationToken::new()).run(),
        );
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unconsumed_ticks_are_skipped() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(HeartbeatTimer::new(Duration::from_millis(10), tx, cancel.clone()).run());

        tokio::time::sleep(Duration::from_millis(55)).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
