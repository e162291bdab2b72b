//! Configuration Module
//!
//! Settings for REST polling, socket sessions and provider restarts.

mod settings;

pub use settings::{BackoffSettings, ConfigError, ProviderSettings, RestSettings, SocketSettings};
