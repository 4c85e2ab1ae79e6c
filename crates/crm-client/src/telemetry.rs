//! Logging and metrics setup for applications embedding the client
//!
//! Both functions install process-global state and are meant to be called
//! once at startup. The client itself only emits through `tracing` and
//! `metrics`; without these it stays silent.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// JSON logs filtered by `LOG_LEVEL`, then `RUST_LOG`, then `info`.
pub fn init_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .map_err(|e| Error::Telemetry(format!("failed to install log subscriber: {e}")))
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `crm_http_request_duration_seconds` gets explicit buckets so it renders
/// as a histogram rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .map_err(|e| Error::Telemetry(format!("failed to install Prometheus recorder: {e}")))
}

fn builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(crm_http::metrics::REQUEST_DURATION_METRIC.to_string()),
            crm_http::metrics::DURATION_BUCKETS,
        )
        .map_err(|e| Error::Telemetry(format!("failed to set histogram buckets: {e}")))
}
