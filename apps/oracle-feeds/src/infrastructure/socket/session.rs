//! Socket Session Handler
//!
//! Owns one websocket connection from dial to close:
//!
//! ```text
//! Idle ──► Connecting ──► Subscribing ──► Receiving ──► Closing ──► Closed
//!              │               │              │
//!              └───────────────┴──────────────┴──────► Unhealthy
//! ```
//!
//! Dial and initial subscription failures end the session with every id
//! marked unresolved. Once receiving, bad reads, undecodable frames and
//! failed heartbeat or follow-up writes are logged and the loop carries on.
//! Reconnecting is the provider's job.

use std::fmt;
use std::sync::{Arc, Once};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::heartbeat::{HeartbeatTick, HeartbeatTimer};
use crate::application::ports::{
    DecodedFrame, FetchError, Frame, FrameDecoder, GuardedMetrics, HeartbeatBuilder,
    ResponseSource, StrategyKind, SubscriptionBuilder, deliver,
};
use crate::application::services::provider::FetchStrategy;
use crate::domain::response::{ErrorCode, ErrorWithCode, ProviderId, ProviderValue, Response};
use crate::infrastructure::config::SocketSettings;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the ring crypto provider for `wss://` dials, once per process.
fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Err means the host process already installed one.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a socket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session has started.
    #[default]
    Idle,
    /// Dialing the remote.
    Connecting,
    /// Writing subscription frames.
    Subscribing,
    /// Reading frames.
    Receiving,
    /// Writing the close frame.
    Closing,
    /// The session ended cleanly or the remote closed it.
    Closed,
    /// The session ended on a failure.
    Unhealthy,
}

impl SessionState {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Receiving => "receiving",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::Text(text.into()),
            Frame::Binary(bytes) => Self::Binary(bytes.into()),
        }
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Streams Responses decoded from one websocket connection.
pub struct SocketSessionHandler<K: ProviderId, V: ProviderValue> {
    settings: SocketSettings,
    subscriptions: Arc<dyn SubscriptionBuilder<K>>,
    decoder: Arc<dyn FrameDecoder<K, V>>,
    heartbeat: Option<Arc<dyn HeartbeatBuilder>>,
    state: RwLock<SessionState>,
    metrics: GuardedMetrics,
}

impl<K: ProviderId, V: ProviderValue> SocketSessionHandler<K, V> {
    /// Create a handler. Without a heartbeat builder, liveness is kept with
    /// websocket ping control frames.
    pub fn new(
        settings: SocketSettings,
        subscriptions: Arc<dyn SubscriptionBuilder<K>>,
        decoder: Arc<dyn FrameDecoder<K, V>>,
        metrics: GuardedMetrics,
    ) -> Self {
        Self {
            settings,
            subscriptions,
            decoder,
            heartbeat: None,
            state: RwLock::new(SessionState::Idle),
            metrics,
        }
    }

    /// Use protocol-level heartbeat frames instead of ping control frames.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn HeartbeatBuilder>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// The settings in use.
    #[must_use]
    pub const fn settings(&self) -> &SocketSettings {
        &self.settings
    }

    fn set_state(&self, state: SessionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "session state changed");
        }
    }

    /// Run one session for `ids` until it fails or `cancel` fires.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Cancelled`] when the scope ends.
    /// - [`FetchError::Dial`], [`FetchError::BuildSubscription`] or
    ///   [`FetchError::Write`] when the session could not be set up. Every id
    ///   is reported unresolved on `responses` first.
    /// - [`FetchError::Closed`] when the remote ends the connection.
    /// - [`FetchError::ReadErrorLimit`] when consecutive reads keep failing.
    pub async fn start(
        &self,
        cancel: CancellationToken,
        ids: Vec<K>,
        responses: mpsc::Sender<Response<K, V>>,
    ) -> Result<(), FetchError> {
        if ids.is_empty() {
            return Ok(());
        }

        let session_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "socket_session",
            provider = %self.metrics.provider(),
            session_id = %session_id,
        );
        self.session(&cancel, &ids, &responses).instrument(span).await
    }

    async fn session(
        &self,
        cancel: &CancellationToken,
        ids: &[K],
        responses: &mpsc::Sender<Response<K, V>>,
    ) -> Result<(), FetchError> {
        ensure_crypto_provider();

        self.set_state(SessionState::Connecting);
        let stream = match self.dial(cancel).await {
            Ok(stream) => stream,
            Err(FetchError::Cancelled) => {
                self.set_state(SessionState::Closed);
                return Err(FetchError::Cancelled);
            }
            Err(e) => {
                tracing::warn!(url = %self.settings.url, error = %e, "socket dial failed");
                self.set_state(SessionState::Unhealthy);
                self.metrics.socket_event("dial_failed");
                self.fail_all(ids, ErrorCode::DialFailed, &e, responses, cancel)
                    .await;
                return Err(e);
            }
        };
        tracing::info!(url = %self.settings.url, ids = ids.len(), "socket connected");
        self.metrics.socket_event("connected");

        let (mut sink, mut source) = stream.split();

        self.set_state(SessionState::Subscribing);
        match self.subscribe(&mut sink, ids, cancel).await {
            Ok(()) => {}
            Err(FetchError::Cancelled) => {
                self.close(&mut sink).await;
                self.set_state(SessionState::Closed);
                return Err(FetchError::Cancelled);
            }
            Err(e) => {
                let code = match e {
                    FetchError::BuildSubscription(_) => ErrorCode::BuildSubscription,
                    _ => ErrorCode::WriteFailed,
                };
                tracing::warn!(error = %e, "socket subscription failed");
                self.metrics.socket_event(&code.label());
                self.fail_all(ids, code, &e, responses, cancel).await;
                self.close(&mut sink).await;
                self.set_state(SessionState::Unhealthy);
                return Err(e);
            }
        }
        self.metrics.socket_event("subscribed");

        self.set_state(SessionState::Receiving);
        let outcome = self
            .receive(&mut sink, &mut source, cancel, responses)
            .await;

        match &outcome {
            Err(FetchError::Closed(reason)) => {
                tracing::info!(reason = %reason, "socket closed by remote");
                self.metrics.socket_event("closed");
                self.set_state(SessionState::Closed);
            }
            Err(FetchError::Cancelled) => {
                self.close(&mut sink).await;
                self.set_state(SessionState::Closed);
            }
            _ => {
                self.close(&mut sink).await;
                self.set_state(SessionState::Unhealthy);
            }
        }
        outcome
    }

    async fn dial(&self, cancel: &CancellationToken) -> Result<WsStream, FetchError> {
        let timeout = self.settings.reconnect_timeout;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            dialed = tokio::time::timeout(timeout, connect_async(self.settings.url.as_str())) => {
                match dialed {
                    Ok(Ok((stream, _response))) => Ok(stream),
                    Ok(Err(e)) => Err(FetchError::Dial(e.to_string())),
                    Err(_) => Err(FetchError::Dial(format!(
                        "no handshake within {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
        }
    }

    /// Write subscription frames chunk by chunk.
    async fn subscribe(
        &self,
        sink: &mut WsSink,
        ids: &[K],
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let chunk_size = self.settings.max_subscriptions_per_batch.max(1);
        for (index, chunk) in ids.chunks(chunk_size).enumerate() {
            if index > 0 && !self.settings.write_interval.is_zero() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(FetchError::Cancelled),
                    () = tokio::time::sleep(self.settings.write_interval) => {}
                }
            }

            let frames = self
                .subscriptions
                .build(chunk)
                .map_err(|e| FetchError::BuildSubscription(format!("{e:#}")))?;
            tracing::debug!(chunk = index, ids = chunk.len(), frames = frames.len(), "subscribing");
            for frame in frames {
                self.write(sink, frame.into(), cancel).await?;
            }
        }
        Ok(())
    }

    async fn receive(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
        cancel: &CancellationToken,
        responses: &mpsc::Sender<Response<K, V>>,
    ) -> Result<(), FetchError> {
        let heartbeat_scope = cancel.child_token();
        let _heartbeat_guard = heartbeat_scope.clone().drop_guard();
        let (tick_tx, mut tick_rx) = mpsc::channel::<HeartbeatTick>(1);
        let heartbeat_enabled = !self.settings.ping_interval.is_zero();
        if heartbeat_enabled {
            tokio::spawn(
                HeartbeatTimer::new(self.settings.ping_interval, tick_tx, heartbeat_scope)
                    .run()
                    .in_current_span(),
            );
        }

        let read_timeout = self.settings.read_timeout;
        let reads_bounded = !read_timeout.is_zero();
        let mut deadline = Instant::now() + read_timeout;
        let mut read_errors = 0u32;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(FetchError::Cancelled),
                Some(tick) = tick_rx.recv(), if heartbeat_enabled => {
                    self.send_heartbeat(sink, tick, cancel).await;
                }
                () = tokio::time::sleep_until(deadline), if reads_bounded => {
                    deadline = Instant::now() + read_timeout;
                    let error = format!("no frame within {}ms", read_timeout.as_millis());
                    self.read_failed(&mut read_errors, &error)?;
                }
                message = source.next() => {
                    deadline = Instant::now() + read_timeout;
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            read_errors = 0;
                            self.dispatch(Frame::Text(text.as_str().to_owned()), sink, cancel, responses)
                                .await?;
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            read_errors = 0;
                            self.dispatch(Frame::Binary(bytes.to_vec()), sink, cancel, responses)
                                .await?;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            read_errors = 0;
                            if let Err(e) = self.write(sink, Message::Pong(payload), cancel).await {
                                if e == FetchError::Cancelled {
                                    return Err(e);
                                }
                                tracing::warn!(error = %e, "pong write failed");
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map_or_else(
                                || "close frame without reason".to_string(),
                                |f| format!("{} {}", u16::from(f.code), f.reason.as_str()),
                            );
                            return Err(FetchError::Closed(reason));
                        }
                        Some(Ok(_)) => read_errors = 0,
                        Some(Err(e)) if is_fatal(&e) => {
                            return Err(FetchError::Closed(e.to_string()));
                        }
                        Some(Err(e)) => self.read_failed(&mut read_errors, &e)?,
                        None => return Err(FetchError::Closed("stream ended".to_string())),
                    }
                }
            }
        }
    }

    /// Decode one frame, emit its Response and write any follow-ups.
    async fn dispatch(
        &self,
        frame: Frame,
        sink: &mut WsSink,
        cancel: &CancellationToken,
        responses: &mpsc::Sender<Response<K, V>>,
    ) -> Result<(), FetchError> {
        let DecodedFrame { response, follow_up } = match self.decoder.decode(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(
                    error = %format!("{e:#}"),
                    bytes = frame.as_bytes().len(),
                    "cannot decode frame"
                );
                self.metrics.socket_event("decode_failed");
                return Ok(());
            }
        };

        self.metrics.record_response(&response);
        if !deliver(responses, response, cancel).await {
            if cancel.is_cancelled() {
                return Ok(());
            }
            return Err(FetchError::Closed("response channel closed".to_string()));
        }

        for frame in follow_up {
            match self.write(sink, frame.into(), cancel).await {
                Ok(()) => {}
                Err(FetchError::Cancelled) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "follow-up write failed");
                    self.metrics.socket_event("follow_up_failed");
                }
            }
        }
        Ok(())
    }

    async fn send_heartbeat(&self, sink: &mut WsSink, tick: HeartbeatTick, cancel: &CancellationToken) {
        let messages = match &self.heartbeat {
            Some(builder) => match builder.build() {
                Ok(frames) => frames.into_iter().map(Message::from).collect(),
                Err(e) => {
                    tracing::warn!(error = %format!("{e:#}"), sequence = tick.sequence, "cannot build heartbeat");
                    self.metrics.socket_event("heartbeat_failed");
                    return;
                }
            },
            None => vec![Message::Ping(Vec::<u8>::new().into())],
        };

        for message in messages {
            if let Err(e) = self.write(sink, message, cancel).await {
                if e != FetchError::Cancelled {
                    tracing::warn!(error = %e, sequence = tick.sequence, "heartbeat write failed");
                    self.metrics.socket_event("heartbeat_failed");
                }
                return;
            }
        }
        tracing::trace!(sequence = tick.sequence, "heartbeat sent");
    }

    /// Count a transient read failure, ending the session past the limit.
    fn read_failed(&self, consecutive: &mut u32, error: &dyn fmt::Display) -> Result<(), FetchError> {
        *consecutive = consecutive.saturating_add(1);
        tracing::warn!(error = %error, consecutive = *consecutive, "socket read failed");
        self.metrics.socket_event("read_failed");

        let limit = self.settings.max_read_errors;
        if limit > 0 && *consecutive > limit {
            return Err(FetchError::ReadErrorLimit(*consecutive));
        }
        Ok(())
    }

    async fn write(
        &self,
        sink: &mut WsSink,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let timeout = self.settings.write_timeout;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            sent = tokio::time::timeout(timeout, sink.send(message)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(FetchError::Write(e.to_string())),
                Err(_) => Err(FetchError::Write(format!(
                    "write not flushed within {}ms",
                    timeout.as_millis()
                ))),
            },
        }
    }

    /// Send a close frame and close the sink. Failures are logged only.
    async fn close(&self, sink: &mut WsSink) {
        self.set_state(SessionState::Closing);
        let timeout = self.settings.write_timeout;
        let closed = tokio::time::timeout(timeout, async {
            match sink.send(Message::Close(None)).await {
                Ok(()) => sink.close().await,
                Err(e) => Err(e),
            }
        })
        .await;

        let failure = match closed {
            Ok(Ok(())) => return,
            Ok(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("close not flushed within {}ms", timeout.as_millis()),
        };
        tracing::warn!(error = %failure, "socket close failed");
        self.metrics.socket_event(&ErrorCode::CloseFailed.label());
    }

    async fn fail_all(
        &self,
        ids: &[K],
        code: ErrorCode,
        error: &FetchError,
        responses: &mpsc::Sender<Response<K, V>>,
        cancel: &CancellationToken,
    ) {
        let response = Response::failed(ids, &ErrorWithCode::new(code, error.clone()));
        self.metrics.record_response(&response);
        deliver(responses, response, cancel).await;
    }
}

/// Errors after which the stream yields nothing useful.
const fn is_fatal(error: &tungstenite::Error) -> bool {
    matches!(
        error,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Io(_)
    )
}

#[async_trait]
impl<K: ProviderId, V: ProviderValue> ResponseSource<K, V> for SocketSessionHandler<K, V> {
    async fn run(
        &self,
        cancel: CancellationToken,
        ids: Vec<K>,
        responses: mpsc::Sender<Response<K, V>>,
    ) -> Result<(), FetchError> {
        self.start(cancel, ids, responses).await
    }

    fn kind(&self) -> Option<StrategyKind> {
        Some(StrategyKind::Socket)
    }
}

impl<K: ProviderId, V: ProviderValue> From<SocketSessionHandler<K, V>> for FetchStrategy<K, V> {
    fn from(handler: SocketSessionHandler<K, V>) -> Self {
        Self::Socket(Arc::new(handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::response::PriceResult;

    struct EchoDecoder;

    impl FrameDecoder<String, i64> for EchoDecoder {
        fn decode(&self, frame: &Frame) -> anyhow::Result<DecodedFrame<String, i64>> {
            let text = std::str::from_utf8(frame.as_bytes())?;
            let (id, value) = text
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("malformed frame {text:?}"))?;
            Ok(DecodedFrame::new(
                Response::new().with_resolved(id.to_string(), PriceResult::now(value.parse()?)),
            ))
        }
    }

    fn handler(url: &str) -> SocketSessionHandler<String, i64> {
        let subscriptions = |ids: &[String]| -> anyhow::Result<Vec<Frame>> {
            Ok(vec![Frame::from(format!("subscribe:{}", ids.join(",")))])
        };
        SocketSessionHandler::new(
            SocketSettings::with_url(url),
            Arc::new(subscriptions),
            Arc::new(EchoDecoder),
            GuardedMetrics::noop("test"),
        )
    }

    #[test]
    fn frames_convert_to_messages() {
        assert_eq!(Message::from(Frame::from("hi")), Message::Text("hi".into()));
        assert_eq!(
            Message::from(Frame::from(vec![1u8, 2])),
            Message::Binary(vec![1u8, 2].into())
        );
    }

    #[test]
    fn fatal_errors() {
        assert!(is_fatal(&tungstenite::Error::ConnectionClosed));
        assert!(is_fatal(&tungstenite::Error::AlreadyClosed));
        assert!(!is_fatal(&tungstenite::Error::AttackAttempt));
    }

    #[tokio::test]
    async fn empty_ids_are_a_no_op() {
        let (tx, _rx) = mpsc::channel(1);
        let handler = handler("ws://127.0.0.1:9");
        let result = handler.start(CancellationToken::new(), Vec::new(), tx).await;
        assert_eq!(result, Ok(()));
        assert_eq!(handler.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn cancelled_before_dial() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let handler = handler("ws://127.0.0.1:9");
        let result = handler.start(cancel, vec!["A".to_string()], tx).await;
        assert_eq!(result, Err(FetchError::Cancelled));
        assert_eq!(handler.state(), SessionState::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn decoder_rejects_malformed() {
        assert!(EchoDecoder.decode(&Frame::from("garbage")).is_err());
        let decoded = EchoDecoder.decode(&Frame::from("BTC=5")).unwrap();
        assert_eq!(decoded.response.resolved().get("BTC").map(|r| r.value), Some(5));
    }
}
