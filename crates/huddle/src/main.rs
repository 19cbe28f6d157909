//! # huddle
//!
//! huddle server binary: loads settings, starts the hub and serves the
//! HTTP/WebSocket endpoints until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_core::logging::init_subscriber;
use huddle_hub::Hub;
use huddle_server::{HuddleServer, ServerConfig, hub_config};
use huddle_settings::HuddleSettings;

/// huddle real-time hub.
#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Real-time board and chat hub")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.huddle/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter directive (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Settings file, then environment, then command-line flags.
    fn resolve_settings(&self) -> Result<HuddleSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(huddle_settings::settings_path);
        let mut settings = huddle_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;

        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.resolve_settings()?;

    init_subscriber(&settings.logging.level, settings.logging.format);

    let metrics_handle =
        huddle_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let hub = Arc::new(Hub::builder(hub_config(&settings.hub)).start());
    let server = HuddleServer::new(ServerConfig::from(&settings.server), hub, metrics_handle);

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("huddle listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown()
        .graceful_shutdown(server.hub(), vec![handle], None)
        .await;

    tracing::info!("Shutdown complete");
    Ok(())
}
