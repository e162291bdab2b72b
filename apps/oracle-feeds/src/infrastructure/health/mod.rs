//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint reporting per-provider freshness, plus Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status of every registered provider
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - ready when every provider has fresh data
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ProviderStatus, StrategyKind};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Crate version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Per-provider status.
    pub providers: Vec<ProviderInfo>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every provider has fresh data.
    Healthy,
    /// Some providers are stale.
    Degraded,
    /// No provider has fresh data.
    Unhealthy,
}

/// Status of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    /// Provider name.
    pub name: String,
    /// Strategy in use.
    pub strategy: StrategyKind,
    /// Ids requested.
    pub tracked_ids: usize,
    /// Ids with a value.
    pub snapshot_len: usize,
    /// When the snapshot last changed.
    pub last_update: Option<DateTime<Utc>>,
    /// Whether the last update is older than the staleness window.
    pub stale: bool,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    stale_after: Duration,
    providers: RwLock<Vec<Arc<dyn ProviderStatus>>>,
}

impl HealthServerState {
    /// Create state. Providers whose last update is older than
    /// `stale_after` are reported stale.
    #[must_use]
    pub fn new(version: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            version: version.into(),
            started_at: Instant::now(),
            stale_after,
            providers: RwLock::new(Vec::new()),
        }
    }

    /// Report on `provider`.
    pub fn register(&self, provider: Arc<dyn ProviderStatus>) {
        self.providers.write().push(provider);
    }

    /// Build the current health report.
    #[must_use]
    pub fn report(&self) -> HealthResponse {
        let now = Utc::now();
        let providers: Vec<ProviderInfo> = self
            .providers
            .read()
            .iter()
            .map(|provider| provider_info(provider.as_ref(), now, self.stale_after))
            .collect();

        HealthResponse {
            status: determine_health_status(&providers),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: now,
            providers,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    addr: SocketAddr,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a server bound to `addr` once run.
    #[must_use]
    pub const fn new(
        addr: SocketAddr,
        state: Arc<HealthServerState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            state,
            cancel,
        }
    }

    /// Serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.addr, e.to_string()))?;

        tracing::info!(addr = %self.addr, "health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("health server stopped");
        Ok(())
    }
}

/// Routes served by [`HealthServer`].
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = state.report();
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.report().status == HealthStatus::Healthy {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn provider_info(provider: &dyn ProviderStatus, now: DateTime<Utc>, stale_after: Duration) -> ProviderInfo {
    let last_update = provider.last_update();
    let stale = last_update.is_none_or(|at| {
        now.signed_duration_since(at)
            .to_std()
            .is_ok_and(|age| age > stale_after)
    });

    ProviderInfo {
        name: provider.name().to_string(),
        strategy: provider.strategy_kind(),
        tracked_ids: provider.tracked_ids(),
        snapshot_len: provider.snapshot_len(),
        last_update,
        stale,
    }
}

fn determine_health_status(providers: &[ProviderInfo]) -> HealthStatus {
    let fresh = providers.iter().filter(|p| !p.stale).count();
    match fresh {
        0 => HealthStatus::Unhealthy,
        n if n == providers.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
