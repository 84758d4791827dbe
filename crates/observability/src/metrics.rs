//! Prometheus exporter for the `metrics` facade.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

#[derive(Debug, thiserror::Error)]
#[error("failed to install prometheus exporter on {addr}: {source}")]
pub struct MetricsError {
    pub addr: SocketAddr,
    #[source]
    pub source: BuildError,
}

/// Install the global recorder and serve `/metrics` on `addr`.
///
/// Must run inside a Tokio runtime. Fails if a recorder is already installed.
pub fn install_prometheus(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|source| MetricsError { addr, source })?;
    ::tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}
