//! Provider Configuration Settings
//!
//! Configuration types for REST polling, socket sessions and backoff, loaded
//! from environment variables under a per-provider prefix.
//!
//! For a prefix `BINANCE` the REST interval is read from
//! `BINANCE_REST_INTERVAL_MS`, the socket URL from `BINANCE_SOCKET_URL`, and
//! so on. Unset or unparsable values fall back to the defaults.

use std::time::Duration;

/// REST polling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestSettings {
    /// Time between scheduling rounds.
    pub interval: Duration,
    /// Per-fetch deadline.
    pub timeout: Duration,
    /// Upper bound on in-flight fetches.
    pub max_concurrent_queries: usize,
    /// One request for all ids.
    pub atomic: bool,
    /// Ids per request when not atomic.
    pub batch_size: usize,
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
            max_concurrent_queries: 5,
            atomic: false,
            batch_size: 1,
        }
    }
}

impl RestSettings {
    /// Load from environment variables under `prefix`.
    #[must_use]
    pub fn from_env(prefix: &str) -> Self {
        Self::from_lookup(prefix, env_lookup)
    }

    /// Load through an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env::new(prefix, lookup);
        let defaults = Self::default();
        Self {
            interval: env.duration_millis("REST_INTERVAL_MS", defaults.interval),
            timeout: env.duration_millis("REST_TIMEOUT_MS", defaults.timeout),
            max_concurrent_queries: env
                .parse("REST_MAX_CONCURRENT_QUERIES", defaults.max_concurrent_queries),
            atomic: env.flag("REST_ATOMIC", defaults.atomic),
            batch_size: env.parse("REST_BATCH_SIZE", defaults.batch_size),
        }
    }

    /// Check the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for zero durations or sizes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero_duration("rest.interval", self.interval)?;
        non_zero_duration("rest.timeout", self.timeout)?;
        if self.max_concurrent_queries == 0 {
            return Err(ConfigError::invalid(
                "rest.max_concurrent_queries",
                "must be at least 1",
            ));
        }
        if !self.atomic && self.batch_size == 0 {
            return Err(ConfigError::invalid(
                "rest.batch_size",
                "must be at least 1 unless atomic",
            ));
        }
        Ok(())
    }
}

/// Socket session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSettings {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Longest wait for one frame before counting a read error.
    pub read_timeout: Duration,
    /// Deadline for one frame write.
    pub write_timeout: Duration,
    /// Heartbeat period (zero disables heartbeats).
    pub ping_interval: Duration,
    /// Deadline for dialing and the handshake.
    pub reconnect_timeout: Duration,
    /// Ids per subscription message.
    pub max_subscriptions_per_batch: usize,
    /// Pause between subscription chunks.
    pub write_interval: Duration,
    /// Consecutive read errors that end the session (0 = unlimited).
    pub max_read_errors: u32,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            read_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(20),
            reconnect_timeout: Duration::from_secs(10),
            max_subscriptions_per_batch: 50,
            write_interval: Duration::from_millis(100),
            max_read_errors: 0, // Unlimited
        }
    }
}

impl SocketSettings {
    /// Settings for `url` with default timings.
    #[must_use]
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Load from environment variables under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if `{prefix}_SOCKET_URL` is missing or empty.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, env_lookup)
    }

    /// Load through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL key is missing or empty.
    pub fn from_lookup(
        prefix: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = Env::new(prefix, lookup);
        let defaults = Self::default();
        let url = env.required("SOCKET_URL")?;

        Ok(Self {
            url,
            read_timeout: env.duration_millis("SOCKET_READ_TIMEOUT_MS", defaults.read_timeout),
            write_timeout: env.duration_millis("SOCKET_WRITE_TIMEOUT_MS", defaults.write_timeout),
            ping_interval: env.duration_millis("SOCKET_PING_INTERVAL_MS", defaults.ping_interval),
            reconnect_timeout: env.duration_millis(
                "SOCKET_RECONNECT_TIMEOUT_MS",
                defaults.reconnect_timeout,
            ),
            max_subscriptions_per_batch: env.parse(
                "SOCKET_MAX_SUBSCRIPTIONS_PER_BATCH",
                defaults.max_subscriptions_per_batch,
            ),
            write_interval: env
                .duration_millis("SOCKET_WRITE_INTERVAL_MS", defaults.write_interval),
            max_read_errors: env.parse("SOCKET_MAX_READ_ERRORS", defaults.max_read_errors),
        })
    }

    /// Check the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for a non-websocket URL, zero deadlines
    /// or a zero batch size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::invalid(
                "socket.url",
                format!("expected ws:// or wss:// url, got {:?}", self.url),
            ));
        }
        non_zero_duration("socket.read_timeout", self.read_timeout)?;
        non_zero_duration("socket.write_timeout", self.write_timeout)?;
        non_zero_duration("socket.reconnect_timeout", self.reconnect_timeout)?;
        if self.max_subscriptions_per_batch == 0 {
            return Err(ConfigError::invalid(
                "socket.max_subscriptions_per_batch",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Backoff settings between failed sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSettings {
    /// Smallest delay.
    pub base: Duration,
    /// Growth factor per failure.
    pub multiplier: f64,
    /// Largest delay.
    pub max: Duration,
    /// Exclusive upper bound of the random delay added per transition.
    pub jitter: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(100),
        }
    }
}

impl BackoffSettings {
    /// Load from environment variables under `prefix`.
    #[must_use]
    pub fn from_env(prefix: &str) -> Self {
        Self::from_lookup(prefix, env_lookup)
    }

    /// Load through an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env::new(prefix, lookup);
        let defaults = Self::default();
        Self {
            base: env.duration_millis("BACKOFF_BASE_MS", defaults.base),
            multiplier: env.parse("BACKOFF_MULTIPLIER", defaults.multiplier),
            max: env.duration_secs("BACKOFF_MAX_SECS", defaults.max),
            jitter: env.duration_millis("BACKOFF_JITTER_MS", defaults.jitter),
        }
    }

    /// Check the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for a zero base, `base > max` or a
    /// multiplier below 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero_duration("backoff.base", self.base)?;
        if self.base > self.max {
            return Err(ConfigError::invalid(
                "backoff.max",
                format!("{:?} is below base {:?}", self.max, self.base),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoff.multiplier",
                format!("must be a finite value >= 1, got {}", self.multiplier),
            ));
        }
        Ok(())
    }
}

/// Provider-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    /// Provider name used in logs and metric labels.
    pub name: String,
    /// Capacity of the handler-to-provider response channel.
    pub response_buffer: usize,
    /// Restart backoff.
    pub backoff: BackoffSettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: "provider".to_string(),
            response_buffer: 256,
            backoff: BackoffSettings::default(),
        }
    }
}

impl ProviderSettings {
    /// Load from environment variables under `prefix`.
    ///
    /// The name defaults to the lowercased prefix.
    #[must_use]
    pub fn from_env(prefix: &str) -> Self {
        Self::from_lookup(prefix, env_lookup)
    }

    /// Load through an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env::new(prefix, &lookup);
        let defaults = Self::default();
        Self {
            name: env
                .get("NAME")
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| prefix.to_lowercase()),
            response_buffer: env.parse("RESPONSE_BUFFER", defaults.response_buffer),
            backoff: BackoffSettings::from_lookup(prefix, &lookup),
        }
    }

    /// Check the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an empty name, a zero buffer or invalid
    /// backoff settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("provider.name", "cannot be empty"));
        }
        if self.response_buffer == 0 {
            return Err(ConfigError::invalid(
                "provider.response_buffer",
                "must be at least 1",
            ));
        }
        self.backoff.validate()
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// A setting is out of range.
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

fn non_zero_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::invalid(field, "must be greater than zero"));
    }
    Ok(())
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Prefixed key lookup with typed accessors.
struct Env<'a, F> {
    prefix: &'a str,
    lookup: F,
}

impl<'a, F> Env<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    const fn new(prefix: &'a str, lookup: F) -> Self {
        Self { prefix, lookup }
    }

    fn key(&self, suffix: &str) -> String {
        if self.prefix.is_empty() {
            suffix.to_string()
        } else {
            format!("{}_{suffix}", self.prefix.to_uppercase())
        }
    }

    fn get(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&self.key(suffix)).map(|v| v.trim().to_string())
    }

    fn required(&self, suffix: &str) -> Result<String, ConfigError> {
        let key = self.key(suffix);
        let value = (self.lookup)(&key).ok_or_else(|| ConfigError::MissingEnvVar(key.clone()))?;
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key));
        }
        Ok(value.trim().to_string())
    }

    fn parse<T: std::str::FromStr>(&self, suffix: &str, default: T) -> T {
        self.get(suffix)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn flag(&self, suffix: &str, default: bool) -> bool {
        self.get(suffix)
            .map_or(default, |v| match v.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => default,
            })
    }

    fn duration_millis(&self, suffix: &str, default: Duration) -> Duration {
        self.get(suffix)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    fn duration_secs(&self, suffix: &str, default: Duration) -> Duration {
        self.get(suffix)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }
}
