//! Observability infrastructure: tracing and metrics.
//!
//! Logging goes through `tracing` with an `EnvFilter` (`RUST_LOG` wins over
//! the configured level). A Prometheus exporter is installed only when a
//! metrics port is configured.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize the global observability infrastructure.
///
/// Must be called once at startup; a second call fails because the global
/// subscriber is already set.
pub fn init(log_level: &str, metrics_port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()?;

    match metrics_port {
        Some(port) => {
            PrometheusBuilder::new().with_http_listener(([0, 0, 0, 0], port)).install()?;
            metrics::register_plugin_metrics();
            tracing::info!(port, "Observability initialized with Prometheus exporter");
        }
        None => {
            tracing::info!("Observability initialized (metrics exporter disabled)");
        }
    }

    Ok(())
}
