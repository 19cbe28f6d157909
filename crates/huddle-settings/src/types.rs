//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a partial
//! JSON file only needs the keys it overrides.

use huddle_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HuddleSettings {
    /// Settings schema version.
    pub version: String,
    /// HTTP / WebSocket listener settings.
    pub server: ServerSettings,
    /// Connection hub tuning.
    pub hub: HubSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for HuddleSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            server: ServerSettings::default(),
            hub: HubSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl HuddleSettings {
    /// Reject combinations the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        let hub = &self.hub;
        if hub.outbound_queue_capacity == 0 {
            return Err(SettingsError::invalid(
                "hub.outboundQueueCapacity",
                "must be greater than 0",
            ));
        }
        if hub.keepalive_interval_ms == 0 {
            return Err(SettingsError::invalid(
                "hub.keepaliveIntervalMs",
                "must be greater than 0",
            ));
        }
        if hub.heartbeat_interval_ms == 0 {
            return Err(SettingsError::invalid(
                "hub.heartbeatIntervalMs",
                "must be greater than 0",
            ));
        }
        if hub.heartbeat_timeout_ms < hub.heartbeat_interval_ms {
            return Err(SettingsError::invalid(
                "hub.heartbeatTimeoutMs",
                format!(
                    "({}) must be at least hub.heartbeatIntervalMs ({})",
                    hub.heartbeat_timeout_ms, hub.heartbeat_interval_ms
                ),
            ));
        }
        if self.server.max_message_size == 0 {
            return Err(SettingsError::invalid(
                "server.maxMessageSize",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Network listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Largest accepted inbound WebSocket message in bytes.
    pub max_message_size: usize,
    /// Header carrying the authenticated user id.
    pub user_id_header: String,
    /// Header carrying the authenticated user's display name.
    pub username_header: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 64 * 1024,
            user_id_header: "x-user-id".to_string(),
            username_header: "x-user-name".to_string(),
        }
    }
}

/// Connection hub tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Capacity of each session's outbound queue.
    pub outbound_queue_capacity: usize,
    /// Interval between keepalive frames sent by each writer.
    pub keepalive_interval_ms: u64,
    /// Interval between heartbeat supervisor sweeps.
    pub heartbeat_interval_ms: u64,
    /// Sessions silent for longer than this are evicted.
    pub heartbeat_timeout_ms: u64,
    /// Rebroadcast inbound board frames to the sender's board.
    pub board_echo: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            keepalive_interval_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            board_echo: true,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
