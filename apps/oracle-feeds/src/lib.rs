#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::default_trait_access
    )
)]

//! Oracle Feeds - Price Provider Runtime
//!
//! Keeps, per price source, a last-known-good snapshot of the freshest value
//! for each requested id. A provider runs exactly one fetch strategy:
//! interval-driven REST polling with bounded concurrency, or a long-lived
//! WebSocket session.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: results, coded errors, snapshot merging, backoff
//! - **Application**: collaborator ports and the provider runtime
//! - **Infrastructure**: REST and socket strategies, HTTP transports,
//!   config, metrics, telemetry and the health endpoint
//!
//! # Data Flow
//!
//! ```text
//!                 ┌──────────────────────┐
//! REST endpoints ─►  RestQueryHandler    ├──┐
//!                 └──────────────────────┘  │   ┌──────────┐    ┌──────────┐
//!                                           ├──►│ Response ├───►│ Provider │──► snapshot()
//!                 ┌──────────────────────┐  │   │ channel  │    │  merge   │
//! WebSocket ──────►  SocketSessionHandler├──┘   └──────────┘    └──────────┘
//!                 └──────────────────────┘
//! ```
//!
//! Collaborators that know an exchange's wire format (request builders,
//! response parsers, subscription builders, frame decoders) are supplied by
//! the caller through the traits in [`application::ports`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Results, snapshot and backoff with no I/O.
pub mod domain;

/// Application layer - Ports and the provider runtime.
pub mod application;

/// Infrastructure layer - Strategies, transports and ambient services.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::backoff::{Backoff, BackoffConfig};
pub use domain::response::{
    ErrorCode, ErrorWithCode, PriceResult, ProviderId, ProviderValue, Response,
};
pub use domain::snapshot::{MergeOutcome, Snapshot};

// Ports
pub use application::ports::{
    DecodedFrame, FetchError, Frame, FrameDecoder, GuardedMetrics, HeartbeatBuilder,
    HttpTransport, MetricsSink, NoopSink, PreparedRequest, ProviderStatus, RawResponse,
    RequestBuilder, ResponseParser, ResponseSource, StrategyKind, SubscriptionBuilder,
    TransportError,
};

// Provider runtime
pub use application::services::provider::{
    FetchStrategy, Provider, ProviderBuilder, ProviderError, ProviderUpdate,
};

// Strategies and transports
pub use infrastructure::rest::{
    DirectTransport, FanOutTransport, ResponseFilter, RestFetcher, RestQueryHandler,
    first_response, freshest_by_header,
};
pub use infrastructure::socket::{SessionState, SocketSessionHandler};

// Infrastructure config
pub use infrastructure::config::{
    BackoffSettings, ConfigError, ProviderSettings, RestSettings, SocketSettings,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::{PrometheusSink, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
