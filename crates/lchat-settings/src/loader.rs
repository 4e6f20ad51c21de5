//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ChatSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `LCHAT_*` environment variable overrides
//! 4. Validate the result

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::ChatSettings;

/// Resolve the path to the settings file (`~/.lchat/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".lchat").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ChatSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ChatSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

fn load_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<ChatSettings> {
    let defaults = serde_json::to_value(ChatSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ChatSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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

/// Apply environment overrides through `env`. Invalid values are ignored
/// with a warning.
fn apply_env_overrides(settings: &mut ChatSettings, env: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| env(name).filter(|v| !v.is_empty());
    let parsed = |name: &str, parse: &dyn Fn(&str) -> Option<u64>| {
        let val = string(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    };

    if let Some(v) = string("LCHAT_HUB_URL") {
        settings.hub_url = v;
    }
    if let Some(v) = string("LCHAT_RECONNECT_DELAYS_MS") {
        match parse_delay_list(&v) {
            Some(delays) => settings.reconnect_delays_ms = delays,
            None => warn!(key = "LCHAT_RECONNECT_DELAYS_MS", value = %v, "invalid delay list, ignoring"),
        }
    }
    if let Some(v) = string("LCHAT_SKIP_NEGOTIATION") {
        match parse_bool(&v) {
            Some(b) => settings.skip_negotiation = b,
            None => warn!(key = "LCHAT_SKIP_NEGOTIATION", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = parsed("LCHAT_HANDSHAKE_TIMEOUT_MS", &|s| parse_u64_range(s, 100, 600_000)) {
        settings.handshake_timeout_ms = v;
    }
    if let Some(v) = parsed("LCHAT_KEEP_ALIVE_MS", &|s| parse_u64_range(s, 100, 600_000)) {
        settings.keep_alive_interval_ms = v;
    }
    if let Some(v) = parsed("LCHAT_SERVER_TIMEOUT_MS", &|s| parse_u64_range(s, 200, 3_600_000)) {
        settings.server_timeout_ms = v;
    }
    if let Some(v) = parsed("LCHAT_EVENT_CAPACITY", &|s| parse_u64_range(s, 1, 65_536)) {
        settings.event_capacity = v as usize;
    }
    if let Some(v) = string("LCHAT_LOG_LEVEL") {
        settings.log_level = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

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

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a comma-separated list of millisecond delays, e.g. `0,2000,10000`.
pub fn parse_delay_list(val: &str) -> Option<Vec<u64>> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}
