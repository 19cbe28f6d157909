//! Server startup errors.

use metrics_exporter_prometheus::BuildError;
use thiserror::Error;

/// Errors raised while starting the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Other listener I/O failure.
    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The global metrics recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] BuildError),
}
