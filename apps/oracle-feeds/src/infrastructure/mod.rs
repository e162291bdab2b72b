//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete fetch strategies and transports, plus the ambient services a
//! host process wires around its providers.

/// Configuration loaded from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// REST polling strategy and HTTP transports.
pub mod rest;

/// WebSocket session strategy.
pub mod socket;

/// Tracing subscriber and OpenTelemetry export.
pub mod telemetry;
