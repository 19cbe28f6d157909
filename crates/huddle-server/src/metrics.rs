//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup, before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Upgrade requests refused before the WebSocket handshake (counter, labels: reason).
pub const WS_HANDSHAKE_REJECTIONS_TOTAL: &str = "ws_handshake_rejections_total";
/// Upgrades refused because the hub had shut down (counter).
pub const WS_UPGRADES_REFUSED_TOTAL: &str = "ws_upgrades_refused_total";
