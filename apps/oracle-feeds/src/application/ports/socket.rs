//! Socket Ports
//!
//! Collaborators of the socket session: subscription and heartbeat message
//! builders plus the frame decoder.

use crate::domain::response::{ProviderId, ProviderValue, Response};

/// A data frame exchanged over the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl Frame {
    /// Frame payload as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

/// Output of decoding one inbound frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame<K: ProviderId, V> {
    /// Results carried by the frame. May be empty (acks, status messages).
    pub response: Response<K, V>,
    /// Frames to write back (protocol acks, subscription retries).
    pub follow_up: Vec<Frame>,
}

impl<K: ProviderId, V> DecodedFrame<K, V> {
    /// A decoded frame with no follow-up.
    #[must_use]
    pub const fn new(response: Response<K, V>) -> Self {
        Self {
            response,
            follow_up: Vec::new(),
        }
    }

    /// Attach follow-up frames.
    #[must_use]
    pub fn with_follow_up(mut self, frames: Vec<Frame>) -> Self {
        self.follow_up = frames;
        self
    }
}

/// Builds subscription messages for a chunk of ids.
pub trait SubscriptionBuilder<K>: Send + Sync {
    /// Frames subscribing to `ids`, written in order.
    ///
    /// # Errors
    ///
    /// Any error ends the session with every id marked `BuildSubscription`.
    fn build(&self, ids: &[K]) -> anyhow::Result<Vec<Frame>>;
}

/// Decodes inbound frames.
pub trait FrameDecoder<K: ProviderId, V: ProviderValue>: Send + Sync {
    /// Decode one frame.
    ///
    /// # Errors
    ///
    /// Errors are logged and the frame is skipped.
    fn decode(&self, frame: &Frame) -> anyhow::Result<DecodedFrame<K, V>>;
}

/// Builds protocol-level liveness messages.
pub trait HeartbeatBuilder: Send + Sync {
    /// Frames to send on every heartbeat tick.
    ///
    /// # Errors
    ///
    /// Errors are logged and the tick is skipped.
    fn build(&self) -> anyhow::Result<Vec<Frame>>;
}

impl<K, F> SubscriptionBuilder<K> for F
where
    F: Fn(&[K]) -> anyhow::Result<Vec<Frame>> + Send + Sync,
{
    fn build(&self, ids: &[K]) -> anyhow::Result<Vec<Frame>> {
        self(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes() {
        assert_eq!(Frame::from("ping").as_bytes(), b"ping");
        assert_eq!(Frame::from(vec![1u8, 2]).as_bytes(), &[1, 2]);
    }

    #[test]
    fn closures_build_subscriptions() {
        let builder = |ids: &[&str]| -> anyhow::Result<Vec<Frame>> {
            Ok(vec![Frame::Text(format!("subscribe:{}", ids.join(",")))])
        };
        let frames = SubscriptionBuilder::build(&builder, &["A", "B"]).unwrap();
        assert_eq!(frames, vec![Frame::Text("subscribe:A,B".to_string())]);
    }
}
