//! Logging and metrics setup.
//!
//! Components emit `tracing` events and `metrics` counters unconditionally;
//! whether anything collects them is decided once, here, by the binary.

use std::net::SocketAddr;

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

/// Metric names emitted by the factory.
pub mod metric_names {
    /// Tasks handed to a worker mailbox. Labels: `op`.
    pub const TASKS_DISPATCHED: &str = "darkroom_tasks_dispatched_total";
    /// Operations skipped because no worker was registered. Labels: `op`.
    pub const TASKS_SKIPPED: &str = "darkroom_tasks_skipped_total";
    /// Deliveries that failed or timed out. Labels: `op`.
    pub const DELIVERY_FAILURES: &str = "darkroom_delivery_failures_total";
    /// Payloads that failed to decode and were discarded. Labels: `mailbox`.
    pub const MALFORMED_MESSAGES: &str = "darkroom_malformed_messages_total";
    /// Outcomes a worker could not report. Labels: `op`.
    pub const REPORT_FAILURES: &str = "darkroom_report_failures_total";
    /// Outcomes applied to aggregate state. Labels: `op`, `result`.
    pub const OUTCOMES_RECORDED: &str = "darkroom_outcomes_recorded_total";
    /// Snapshots not delivered to a lagging subscriber.
    pub const SNAPSHOTS_DROPPED: &str = "darkroom_snapshots_dropped_total";
    /// Failed registry listings. Labels: `op`.
    pub const REGISTRY_LIST_ERRORS: &str = "darkroom_registry_list_errors_total";
    /// Live workers as seen by the aggregator. Labels: `op`.
    pub const WORKERS_ACTIVE: &str = "darkroom_workers_active";
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, for terminals.
    #[default]
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()?,
    }
    Ok(())
}

/// Installs the global metrics recorder and serves Prometheus text format
/// on `addr`.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or a recorder is already
/// installed.
pub fn install_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_share_prefix() {
        for name in [
            metric_names::TASKS_DISPATCHED,
            metric_names::TASKS_SKIPPED,
            metric_names::DELIVERY_FAILURES,
            metric_names::MALFORMED_MESSAGES,
            metric_names::REPORT_FAILURES,
            metric_names::OUTCOMES_RECORDED,
            metric_names::SNAPSHOTS_DROPPED,
            metric_names::REGISTRY_LIST_ERRORS,
            metric_names::WORKERS_ACTIVE,
        ] {
            assert!(name.starts_with("darkroom_"), "{name}");
        }
    }
}
