//! Server configuration.

use std::time::Duration;

use huddle_hub::HubConfig;
use huddle_settings::{HubSettings, ServerSettings};
use serde::{Deserialize, Serialize};

/// Configuration for the huddle server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Header carrying the authenticated user id.
    pub user_id_header: String,
    /// Header carrying the authenticated user's display name.
    pub username_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 64 * 1024,
            user_id_header: "x-user-id".into(),
            username_header: "x-user-name".into(),
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_message_size: settings.max_message_size,
            user_id_header: settings.user_id_header.clone(),
            username_header: settings.username_header.clone(),
        }
    }
}

/// Translate hub settings (milliseconds) into a [`HubConfig`].
pub fn hub_config(settings: &HubSettings) -> HubConfig {
    HubConfig {
        queue_capacity: settings.outbound_queue_capacity,
        keepalive_interval: Duration::from_millis(settings.keepalive_interval_ms),
        heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
        heartbeat_timeout: Duration::from_millis(settings.heartbeat_timeout_ms),
        board_echo: settings.board_echo,
    }
}
