// Metric name constants to avoid typos across crates.

/// WebSocket sessions registered total (counter, labels: protocol).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Sessions unregistered total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live sessions (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Frames dropped because an outbound queue was full (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Sessions evicted by the hub (counter, labels: reason).
pub const WS_EVICTIONS_TOTAL: &str = "ws_evictions_total";
/// Session lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// DDP method calls total (counter, labels: method).
pub const DDP_METHOD_CALLS_TOTAL: &str = "ddp_method_calls_total";
/// DDP method errors total (counter, labels: method, reason).
pub const DDP_METHOD_ERRORS_TOTAL: &str = "ddp_method_errors_total";
/// DDP method duration seconds (histogram, labels: method).
pub const DDP_METHOD_DURATION_SECONDS: &str = "ddp_method_duration_seconds";
