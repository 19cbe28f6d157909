//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HuddleSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `HUDDLE_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use huddle_core::logging::LogFormat;
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::HuddleSettings;

/// Resolve the path to the settings file (`~/.huddle/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".huddle").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<HuddleSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a combination rejected by
/// [`HuddleSettings::validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<HuddleSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the settings file, without env overrides.
fn load_file_layer(path: &Path) -> Result<HuddleSettings> {
    let malformed = |source| SettingsError::Malformed {
        path: path.to_path_buf(),
        source,
    };
    let defaults = serde_json::to_value(HuddleSettings::default()).map_err(malformed)?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(malformed)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    serde_json::from_value(merged).map_err(malformed)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (fall back to file/default).
pub fn apply_env_overrides(settings: &mut HuddleSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
fn apply_overrides(settings: &mut HuddleSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read("HUDDLE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("HUDDLE_PORT").and_then(|v| checked("HUDDLE_PORT", &v, |s| parse_u16_range(s, 1, 65535))) {
        settings.server.port = v;
    }

    // ── Hub ─────────────────────────────────────────────────────────
    if let Some(v) = read("HUDDLE_QUEUE_CAPACITY")
        .and_then(|v| checked("HUDDLE_QUEUE_CAPACITY", &v, |s| parse_usize_range(s, 1, 1 << 20)))
    {
        settings.hub.outbound_queue_capacity = v;
    }
    if let Some(v) = read("HUDDLE_KEEPALIVE_INTERVAL_MS").and_then(|v| {
        checked("HUDDLE_KEEPALIVE_INTERVAL_MS", &v, |s| parse_u64_range(s, 100, 600_000))
    }) {
        settings.hub.keepalive_interval_ms = v;
    }
    if let Some(v) = read("HUDDLE_HEARTBEAT_INTERVAL_MS").and_then(|v| {
        checked("HUDDLE_HEARTBEAT_INTERVAL_MS", &v, |s| parse_u64_range(s, 100, 600_000))
    }) {
        settings.hub.heartbeat_interval_ms = v;
    }
    if let Some(v) = read("HUDDLE_HEARTBEAT_TIMEOUT_MS").and_then(|v| {
        checked("HUDDLE_HEARTBEAT_TIMEOUT_MS", &v, |s| parse_u64_range(s, 100, 3_600_000))
    }) {
        settings.hub.heartbeat_timeout_ms = v;
    }
    if let Some(v) = read("HUDDLE_BOARD_ECHO").and_then(|v| checked("HUDDLE_BOARD_ECHO", &v, parse_bool)) {
        settings.hub.board_echo = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read("HUDDLE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("HUDDLE_LOG_FORMAT")
        .and_then(|v| checked("HUDDLE_LOG_FORMAT", &v, |s| s.parse::<LogFormat>().ok()))
    {
        settings.logging.format = v;
    }
}

fn checked<T>(name: &str, raw: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let result = parse(raw);
    if result.is_none() {
        tracing::warn!(key = name, value = %raw, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
