//! Prometheus Metrics Module
//!
//! [`MetricsSink`] implementation on top of the `metrics` facade, exported in
//! Prometheus format.
//!
//! # Metrics
//!
//! - `oracle_provider_responses_total{provider,id,status}`: per-id outcomes
//! - `oracle_provider_fetch_duration_seconds{provider}`: fetch latency
//! - `oracle_provider_snapshot_updates_total{provider}`: snapshot replacements
//! - `oracle_provider_socket_events_total{provider,event}`: socket lifecycle
//! - `oracle_provider_restarts_total{provider,reason}`: run-loop restarts
//! - `oracle_provider_tracked_ids{provider}`: ids currently requested
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::application::ports::MetricsSink;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and describe every series.
///
/// Later calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

const RESPONSES_TOTAL: &str = "oracle_provider_responses_total";
const FETCH_DURATION_SECONDS: &str = "oracle_provider_fetch_duration_seconds";
const SNAPSHOT_UPDATES_TOTAL: &str = "oracle_provider_snapshot_updates_total";
const SOCKET_EVENTS_TOTAL: &str = "oracle_provider_socket_events_total";
const RESTARTS_TOTAL: &str = "oracle_provider_restarts_total";
const TRACKED_IDS: &str = "oracle_provider_tracked_ids";

fn register_metrics() {
    describe_counter!(RESPONSES_TOTAL, "Per-id fetch outcomes by status");
    describe_histogram!(FETCH_DURATION_SECONDS, "Latency of one REST fetch");
    describe_counter!(
        SNAPSHOT_UPDATES_TOTAL,
        "Snapshot entries replaced by newer results"
    );
    describe_counter!(SOCKET_EVENTS_TOTAL, "Socket session lifecycle events");
    describe_counter!(RESTARTS_TOTAL, "Provider handler restarts by reason");
    describe_gauge!(TRACKED_IDS, "Number of ids a provider requests");
}

// =============================================================================
// Sink
// =============================================================================

/// Sink recording through the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn record_outcome(&self, provider: &str, id: &str, status: &str) {
        counter!(
            RESPONSES_TOTAL,
            "provider" => provider.to_string(),
            "id" => id.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    fn observe_fetch_duration(&self, provider: &str, duration: Duration) {
        histogram!(FETCH_DURATION_SECONDS, "provider" => provider.to_string())
            .record(duration.as_secs_f64());
    }

    fn record_snapshot_updates(&self, provider: &str, count: u64) {
        counter!(SNAPSHOT_UPDATES_TOTAL, "provider" => provider.to_string()).increment(count);
    }

    fn record_socket_event(&self, provider: &str, event: &str) {
        counter!(
            SOCKET_EVENTS_TOTAL,
            "provider" => provider.to_string(),
            "event" => event.to_string()
        )
        .increment(1);
    }

    fn record_restart(&self, provider: &str, reason: &str) {
        counter!(
            RESTARTS_TOTAL,
            "provider" => provider.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    #[allow(clippy::cast_precision_loss)]
    fn set_tracked_ids(&self, provider: &str, count: usize) {
        gauge!(TRACKED_IDS, "provider" => provider.to_string()).set(count as f64);
    }
}

// =============================================================================
// Tests
// =============================================================================
