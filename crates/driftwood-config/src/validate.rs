//! Per-option parsing, diffing and scoping.

use std::path::PathBuf;

use serde_json::Value;

use crate::error::{ConfigError, ConfigResult};
use crate::model::{SettingChange, Settings};

/// Options that running downloads must be told about when they change.
const DOWNLOAD_SCOPED: &[&str] = &[
    "rerequest_interval_secs",
    "min_interval_floor_secs",
    "announce_interval_secs",
    "max_announce_retry_interval_secs",
    "min_peers",
    "max_initiate",
    "tracker_timeout_secs",
    "tracker_proxy",
    "ip",
    "listen_port",
    "max_upload_rate",
    "max_download_rate",
    "error_window_secs",
    "keep_token_multiplier",
];

/// Whether changes to `key` propagate to active downloads.
#[must_use]
pub fn is_download_scoped(key: &str) -> bool {
    DOWNLOAD_SCOPED.contains(&key)
}

/// Validate `value` and store it in `settings` under `key`.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownField`] for unrecognised keys and
/// [`ConfigError::InvalidField`] when the value has the wrong shape or range.
pub fn apply_option(settings: &mut Settings, key: &str, value: &Value) -> ConfigResult<()> {
    match key {
        "watch_dir" => settings.watch_dir = parse_path(key, value)?,
        "download_dir" => settings.download_dir = parse_path(key, value)?,
        "socket_path" => settings.socket_path = parse_path(key, value)?,
        "scan_interval_secs" => settings.scan_interval_secs = parse_positive(key, value)?,
        "display_interval_secs" => settings.display_interval_secs = parse_positive(key, value)?,
        "announce_tick_secs" => settings.announce_tick_secs = parse_positive(key, value)?,
        "rerequest_interval_secs" => {
            settings.rerequest_interval_secs = parse_positive(key, value)?;
        }
        "min_interval_floor_secs" => settings.min_interval_floor_secs = parse_u64(key, value)?,
        "announce_interval_secs" => settings.announce_interval_secs = parse_positive(key, value)?,
        "max_announce_retry_interval_secs" => {
            settings.max_announce_retry_interval_secs = parse_positive(key, value)?;
        }
        "min_peers" => settings.min_peers = parse_u32(key, value)?,
        "max_initiate" => settings.max_initiate = parse_u32(key, value)?,
        "tracker_timeout_secs" => settings.tracker_timeout_secs = parse_positive(key, value)?,
        "tracker_proxy" => settings.tracker_proxy = parse_optional_string(key, value)?,
        "ip" => settings.ip = parse_optional_string(key, value)?,
        "listen_port" => settings.listen_port = parse_port(key, value)?,
        "max_upload_rate" => settings.max_upload_rate = parse_u64(key, value)?,
        "max_download_rate" => settings.max_download_rate = parse_u64(key, value)?,
        "shutdown_deadline_ms" => settings.shutdown_deadline_ms = parse_positive(key, value)?,
        "error_window_secs" => settings.error_window_secs = parse_u64(key, value)?,
        "keep_token_multiplier" => settings.keep_token_multiplier = parse_multiplier(key, value)?,
        "log_level" => {
            settings.log_level = parse_optional_string(key, value)?
                .ok_or_else(|| ConfigError::invalid(key, value, "must be a non-empty string"))?;
        }
        "log_format" => {
            let format = parse_optional_string(key, value)?;
            if let Some(name) = format.as_deref()
                && name != "json"
                && name != "pretty"
            {
                return Err(ConfigError::invalid(key, value, "must be json or pretty"));
            }
            settings.log_format = format;
        }
        _ => {
            return Err(ConfigError::UnknownField {
                field: key.to_string(),
            });
        }
    }
    Ok(())
}

/// Options whose values differ between `old` and `new`, in key order.
///
/// # Errors
///
/// Returns an error if either document fails to serialize.
pub fn diff(old: &Settings, new: &Settings) -> ConfigResult<Vec<SettingChange>> {
    let before = old.to_document()?;
    Ok(new
        .to_document()?
        .into_iter()
        .filter(|(key, value)| before.get(key) != Some(value))
        .map(|(key, value)| SettingChange { key, value })
        .collect())
}

fn parse_u64(field: &str, value: &Value) -> ConfigResult<u64> {
    value
        .as_u64()
        .ok_or_else(|| ConfigError::invalid(field, value, "must be a non-negative integer"))
}

fn parse_positive(field: &str, value: &Value) -> ConfigResult<u64> {
    match parse_u64(field, value)? {
        0 => Err(ConfigError::invalid(field, value, "must be greater than zero")),
        parsed => Ok(parsed),
    }
}

fn parse_u32(field: &str, value: &Value) -> ConfigResult<u32> {
    u32::try_from(parse_u64(field, value)?)
        .map_err(|_| ConfigError::invalid(field, value, "must fit in 32 bits"))
}

fn parse_port(field: &str, value: &Value) -> ConfigResult<u16> {
    match value.as_u64().map(u16::try_from) {
        Some(Ok(port)) if port > 0 => Ok(port),
        _ => Err(ConfigError::invalid(
            field,
            value,
            "must be between 1 and 65535",
        )),
    }
}

fn parse_multiplier(field: &str, value: &Value) -> ConfigResult<f64> {
    match value.as_f64() {
        Some(parsed) if parsed.is_finite() && parsed > 0.0 => Ok(parsed),
        _ => Err(ConfigError::invalid(
            field,
            value,
            "must be a positive number",
        )),
    }
}

fn parse_path(field: &str, value: &Value) -> ConfigResult<PathBuf> {
    match value.as_str() {
        Some(raw) if !raw.trim().is_empty() => Ok(PathBuf::from(raw)),
        _ => Err(ConfigError::invalid(field, value, "must be a non-empty path")),
    }
}

fn parse_optional_string(field: &str, value: &Value) -> ConfigResult<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(raw) if raw.trim().is_empty() => Ok(None),
        Value::String(raw) => Ok(Some(raw.trim().to_string())),
        _ => Err(ConfigError::invalid(field, value, "must be a string or null")),
    }
}
