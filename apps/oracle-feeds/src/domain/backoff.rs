//! Backoff Controller
//!
//! Exponential backoff with additive jitter. The current delay always stays
//! within `[base, max]`; failures grow it by `multiplier`, a success drops
//! it back to `base`.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

/// Configuration for backoff behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Smallest delay, and the delay after [`Backoff::reset`].
    pub base: Duration,
    /// Growth factor per failure (e.g., 2.0 doubles the delay).
    pub multiplier: f64,
    /// Largest delay.
    pub max: Duration,
    /// Upper bound (exclusive) of the random delay added on every transition.
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(100),
        }
    }
}

impl BackoffConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(base: Duration, multiplier: f64, max: Duration, jitter: Duration) -> Self {
        Self {
            base,
            multiplier,
            max,
            jitter,
        }
    }

    /// Create configuration from `BackoffSettings`.
    #[must_use]
    pub const fn from_settings(settings: &crate::BackoffSettings) -> Self {
        Self {
            base: settings.base,
            multiplier: settings.multiplier,
            max: settings.max,
            jitter: settings.jitter,
        }
    }
}

/// Thread-safe backoff state.
///
/// # Example
///
/// ```rust
/// use oracle_feeds::{Backoff, BackoffConfig};
/// use std::time::Duration;
///
/// let backoff = Backoff::new(BackoffConfig::new(
///     Duration::from_millis(100),
///     2.0,
///     Duration::from_secs(10),
///     Duration::ZERO,
/// ));
///
/// assert_eq!(backoff.backoff(false), Duration::from_millis(200));
/// assert_eq!(backoff.backoff(true), Duration::from_millis(100));
/// ```
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Mutex<Duration>,
}

impl Backoff {
    /// Create a controller positioned at `base`.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        let current = clamp(config.base, &config);
        Self {
            config,
            current: Mutex::new(current),
        }
    }

    /// Go back to `base`.
    pub fn reset(&self) {
        *self.current.lock() = clamp(self.config.base, &self.config);
    }

    /// Apply one success/failure signal and return the new delay.
    ///
    /// A failure multiplies the current delay. A success drops it to
    /// `base / multiplier`, which the clamp lifts back to `base`.
    pub fn backoff(&self, success: bool) -> Duration {
        let mut current = self.current.lock();
        let scaled = if success {
            scale(self.config.base, self.config.multiplier.recip())
        } else {
            scale(*current, self.config.multiplier)
        };
        let jittered = scaled.saturating_add(self.jitter());
        *current = clamp(jittered, &self.config);
        *current
    }

    /// The current delay.
    #[must_use]
    pub fn current(&self) -> Duration {
        *self.current.lock()
    }

    /// A single-fire timer that elapses after the current delay.
    #[must_use]
    pub fn tick(&self) -> tokio::time::Sleep {
        tokio::time::sleep(self.current())
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    fn jitter(&self) -> Duration {
        let bound = u64::try_from(self.config.jitter.as_nanos()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::rng().random_range(0..bound))
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn scale(duration: Duration, factor: f64) -> Duration {
    let scaled = (duration.as_nanos() as f64 * factor).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        return Duration::ZERO;
    }
    if scaled >= u64::MAX as f64 {
        return Duration::MAX;
    }
    Duration::from_nanos(scaled as u64)
}

fn clamp(duration: Duration, config: &BackoffConfig) -> Duration {
    let upper = config.max.max(config.base);
    duration.max(config.base).min(upper)
}
