//! Port Interfaces
//!
//! Defines the interfaces (ports) between the provider runtime and its
//! collaborators, following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `RequestBuilder` / `ResponseParser` / `HttpTransport`: REST fetching
//! - `SubscriptionBuilder` / `FrameDecoder` / `HeartbeatBuilder`: socket sessions
//! - `MetricsSink`: observations
//!
//! ## Driver Ports (Inbound)
//!
//! - `ResponseSource`: a fetch strategy the provider runs
//! - `ProviderStatus`: read-only provider view for health reporting

mod http;
mod metrics;
mod socket;
mod source;

pub use http::{
    HttpTransport, PreparedRequest, RawResponse, RequestBuilder, ResponseParser, TransportError,
};
#[cfg(test)]
pub use http::{MockRequestBuilder, MockResponseParser};
pub use metrics::{GuardedMetrics, MetricsSink, NoopSink, STATUS_SUCCESS};
#[cfg(test)]
pub use metrics::MockMetricsSink;
pub use socket::{DecodedFrame, Frame, FrameDecoder, HeartbeatBuilder, SubscriptionBuilder};
pub use source::{FetchError, ProviderStatus, ResponseSource, StrategyKind, deliver};
