//! Fetch Results
//!
//! Result types shared by every fetch strategy: a timestamped value per id,
//! coded errors, and the resolved/unresolved partition of one batch.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

// =============================================================================
// Id / Value bounds
// =============================================================================

/// Key identifying one requested instrument (e.g. a trading pair).
///
/// Blanket-implemented for every type meeting the bounds.
pub trait ProviderId: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> ProviderId for T where T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{}

/// Opaque payload produced for an id.
///
/// Blanket-implemented for every type meeting the bounds.
pub trait ProviderValue: Clone + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> ProviderValue for T where T: Clone + fmt::Debug + fmt::Display + Send + Sync + 'static {}

// =============================================================================
// PriceResult
// =============================================================================

/// A value together with the time it became true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceResult<V> {
    /// The fetched value.
    pub value: V,
    /// Source-reported update time, or fetch time when the source has none.
    pub timestamp: DateTime<Utc>,
}

impl<V> PriceResult<V> {
    /// Create a result, normalizing the timestamp to UTC.
    #[must_use]
    pub fn new<Tz: TimeZone>(value: V, timestamp: DateTime<Tz>) -> Self {
        Self {
            value,
            timestamp: timestamp.with_timezone(&Utc),
        }
    }

    /// Create a result stamped with the current time.
    #[must_use]
    pub fn now(value: V) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }

    /// Whether this result is strictly newer than `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.timestamp > other.timestamp
    }
}

// =============================================================================
// Error codes
// =============================================================================

/// Closed set of failure classes used for metrics tagging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The request builder could not produce a request.
    BuildRequest,
    /// The HTTP call failed before a usable response arrived.
    RequestFailed {
        /// HTTP status, when the failure carried one.
        status: Option<u16>,
    },
    /// The source answered 429.
    RateLimited,
    /// The source answered with a non-2xx status.
    UnexpectedStatus(u16),
    /// The per-fetch deadline elapsed.
    Timeout,
    /// The payload could not be decoded.
    Decode,
    /// The payload had no entry for the id.
    NoResponse,
    /// The subscription builder failed.
    BuildSubscription,
    /// The socket could not be dialed.
    DialFailed,
    /// A socket write failed.
    WriteFailed,
    /// A socket read failed.
    ReadFailed,
    /// Closing the socket failed.
    CloseFailed,
    /// The fetch task panicked.
    Panicked,
    /// Anything else.
    Unknown,
}

impl ErrorCode {
    /// Stable snake_case label for metrics and logs.
    #[must_use]
    pub fn label(&self) -> Cow<'static, str> {
        match self {
            Self::BuildRequest => Cow::Borrowed("build_request"),
            Self::RequestFailed { status: None } => Cow::Borrowed("request_failed"),
            Self::RequestFailed {
                status: Some(status),
            } => Cow::Owned(format!("request_failed_{status}")),
            Self::RateLimited => Cow::Borrowed("rate_limited"),
            Self::UnexpectedStatus(status) => Cow::Owned(format!("unexpected_status_{status}")),
            Self::Timeout => Cow::Borrowed("timeout"),
            Self::Decode => Cow::Borrowed("decode"),
            Self::NoResponse => Cow::Borrowed("no_response"),
            Self::BuildSubscription => Cow::Borrowed("build_subscription"),
            Self::DialFailed => Cow::Borrowed("dial_failed"),
            Self::WriteFailed => Cow::Borrowed("write_failed"),
            Self::ReadFailed => Cow::Borrowed("read_failed"),
            Self::CloseFailed => Cow::Borrowed("close_failed"),
            Self::Panicked => Cow::Borrowed("panicked"),
            Self::Unknown => Cow::Borrowed("unknown"),
        }
    }

    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed { .. }
            | Self::RateLimited
            | Self::Timeout
            | Self::NoResponse
            | Self::DialFailed
            | Self::ReadFailed => true,
            Self::UnexpectedStatus(status) => *status >= 500,
            Self::BuildRequest
            | Self::Decode
            | Self::BuildSubscription
            | Self::WriteFailed
            | Self::CloseFailed
            | Self::Panicked
            | Self::Unknown => false,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// An error tagged with its [`ErrorCode`].
///
/// Cheap to clone so one batch failure can be attributed to every id.
#[derive(Debug, Clone)]
pub struct ErrorWithCode {
    code: ErrorCode,
    cause: Arc<anyhow::Error>,
}

impl ErrorWithCode {
    /// Wrap an error with a code.
    pub fn new(code: ErrorCode, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            code,
            cause: Arc::new(cause.into()),
        }
    }

    /// Build an error from a plain message.
    pub fn msg(code: ErrorCode, message: impl fmt::Display) -> Self {
        Self::new(code, anyhow::anyhow!("{message}"))
    }

    /// The failure class.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// The underlying cause.
    #[must_use]
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }
}

impl fmt::Display for ErrorWithCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.code, self.cause)
    }
}

impl std::error::Error for ErrorWithCode {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let cause: &anyhow::Error = &self.cause;
        let source: &(dyn std::error::Error + 'static) = cause.as_ref();
        Some(source)
    }
}

// =============================================================================
// Response
// =============================================================================

/// Resolved/unresolved partition of the results for one batch of ids.
///
/// An id is never present in both maps: resolving an id removes any error
/// recorded for it, and an error is ignored for an already resolved id.
#[derive(Debug, Clone)]
pub struct Response<K, V>
where
    K: Eq + Hash,
{
    resolved: HashMap<K, PriceResult<V>>,
    unresolved: HashMap<K, ErrorWithCode>,
}

impl<K: Eq + Hash, V> Default for Response<K, V> {
    fn default() -> Self {
        Self {
            resolved: HashMap::new(),
            unresolved: HashMap::new(),
        }
    }
}

impl<K, V> Response<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Create an empty response.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A response in which every id failed with the same error.
    #[must_use]
    pub fn failed(ids: &[K], error: &ErrorWithCode) -> Self {
        Self {
            resolved: HashMap::new(),
            unresolved: ids.iter().map(|id| (id.clone(), error.clone())).collect(),
        }
    }

    /// Builder form of [`Response::resolve`].
    #[must_use]
    pub fn with_resolved(mut self, id: K, result: PriceResult<V>) -> Self {
        self.resolve(id, result);
        self
    }

    /// Builder form of [`Response::fail`].
    #[must_use]
    pub fn with_unresolved(mut self, id: K, error: ErrorWithCode) -> Self {
        self.fail(id, error);
        self
    }

    /// Record a result for `id`, replacing any error recorded for it.
    pub fn resolve(&mut self, id: K, result: PriceResult<V>) {
        self.unresolved.remove(&id);
        self.resolved.insert(id, result);
    }

    /// Record an error for `id` unless it is already resolved.
    ///
    /// Returns whether the error was recorded.
    pub fn fail(&mut self, id: K, error: ErrorWithCode) -> bool {
        if self.resolved.contains_key(&id) {
            return false;
        }
        self.unresolved.insert(id, error);
        true
    }

    /// Fold another response into this one with the same precedence rules.
    pub fn extend(&mut self, other: Self) {
        for (id, result) in other.resolved {
            self.resolve(id, result);
        }
        for (id, error) in other.unresolved {
            self.fail(id, error);
        }
    }

    /// Mark every id in `ids` that has no outcome yet as [`ErrorCode::NoResponse`].
    ///
    /// Returns the number of ids that were missing.
    pub fn fill_missing(&mut self, ids: &[K]) -> usize {
        let mut missing = 0;
        for id in ids {
            if !self.contains(id) {
                self.unresolved.insert(
                    id.clone(),
                    ErrorWithCode::msg(ErrorCode::NoResponse, "no entry for id in response"),
                );
                missing += 1;
            }
        }
        missing
    }

    /// Whether `id` has any outcome.
    #[must_use]
    pub fn contains(&self, id: &K) -> bool {
        self.resolved.contains_key(id) || self.unresolved.contains_key(id)
    }

    /// Resolved results by id.
    #[must_use]
    pub const fn resolved(&self) -> &HashMap<K, PriceResult<V>> {
        &self.resolved
    }

    /// Errors by id.
    #[must_use]
    pub const fn unresolved(&self) -> &HashMap<K, ErrorWithCode> {
        &self.unresolved
    }

    /// Number of ids with an outcome.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resolved.len() + self.unresolved.len()
    }

    /// Whether no id has an outcome.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.unresolved.is_empty()
    }

    /// Split into the resolved and unresolved maps.
    #[must_use]
    pub fn into_parts(self) -> (HashMap<K, PriceResult<V>>, HashMap<K, ErrorWithCode>) {
        (self.resolved, self.unresolved)
    }
}

// =============================================================================
// Tests
// =============================================================================
