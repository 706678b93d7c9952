//! Typed settings document.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::defaults;
use crate::error::{ConfigError, ConfigResult};

/// Every tunable the daemon reads. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory scanned for descriptor files.
    pub watch_dir: PathBuf,
    /// Directory downloads are stored under.
    pub download_dir: PathBuf,
    /// Unix socket the daemon serves the command channel on.
    pub socket_path: PathBuf,
    /// Seconds between directory scans.
    pub scan_interval_secs: u64,
    /// Seconds between status renders.
    pub display_interval_secs: u64,
    /// Seconds between rerequester checks.
    pub announce_tick_secs: u64,
    /// Local minimum seconds between announces before the tracker says otherwise.
    pub rerequest_interval_secs: u64,
    /// Lower clamp for a tracker-advertised minimum interval.
    pub min_interval_floor_secs: u64,
    /// Maximum seconds between announces before the tracker says otherwise.
    pub announce_interval_secs: u64,
    /// Cap for the failure backoff.
    pub max_announce_retry_interval_secs: u64,
    /// Peer count below which the swarm counts as quiet.
    pub min_peers: u32,
    /// Peer count at which no more peers are requested.
    pub max_initiate: u32,
    /// Tracker request timeout in seconds.
    pub tracker_timeout_secs: u64,
    /// HTTP proxy for tracker requests.
    pub tracker_proxy: Option<String>,
    /// Address reported to trackers.
    pub ip: Option<String>,
    /// Port reported to trackers.
    pub listen_port: u16,
    /// Upload cap in kB/s, `0` for unlimited.
    pub max_upload_rate: u64,
    /// Download cap in kB/s, `0` for unlimited.
    pub max_download_rate: u64,
    /// Milliseconds granted to workers during shutdown.
    pub shutdown_deadline_ms: u64,
    /// Seconds an error stays visible in status rows.
    pub error_window_secs: u64,
    /// Swarm-size multiplier used to decide whether a continuation token is kept.
    pub keep_token_multiplier: f64,
    /// Log level when `RUST_LOG` is not set.
    pub log_level: String,
    /// `json` or `pretty`; inferred from the build when absent.
    pub log_format: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            watch_dir: PathBuf::from(defaults::WATCH_DIR),
            download_dir: PathBuf::from(defaults::DOWNLOAD_DIR),
            socket_path: PathBuf::from(defaults::SOCKET_PATH),
            scan_interval_secs: defaults::SCAN_INTERVAL_SECS,
            display_interval_secs: defaults::DISPLAY_INTERVAL_SECS,
            announce_tick_secs: defaults::ANNOUNCE_TICK_SECS,
            rerequest_interval_secs: defaults::REREQUEST_INTERVAL_SECS,
            min_interval_floor_secs: defaults::MIN_INTERVAL_FLOOR_SECS,
            announce_interval_secs: defaults::ANNOUNCE_INTERVAL_SECS,
            max_announce_retry_interval_secs: defaults::MAX_ANNOUNCE_RETRY_INTERVAL_SECS,
            min_peers: defaults::MIN_PEERS,
            max_initiate: defaults::MAX_INITIATE,
            tracker_timeout_secs: defaults::TRACKER_TIMEOUT_SECS,
            tracker_proxy: None,
            ip: None,
            listen_port: defaults::LISTEN_PORT,
            max_upload_rate: 0,
            max_download_rate: 0,
            shutdown_deadline_ms: defaults::SHUTDOWN_DEADLINE_MS,
            error_window_secs: defaults::ERROR_WINDOW_SECS,
            keep_token_multiplier: defaults::KEEP_TOKEN_MULTIPLIER,
            log_level: defaults::LOG_LEVEL.to_string(),
            log_format: None,
        }
    }
}

impl Settings {
    /// Settings rendered as a flat JSON object keyed by option name.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_document(&self) -> ConfigResult<Map<String, Value>> {
        match serde_json::to_value(self).map_err(|source| ConfigError::Json {
            operation: "config.settings.encode",
            source,
        })? {
            Value::Object(map) => Ok(map),
            _ => Err(ConfigError::InvalidField {
                field: "settings".to_string(),
                value: None,
                reason: "settings must encode as an object",
            }),
        }
    }

    /// Read a single option by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownField`] when `key` is not an option.
    pub fn get(&self, key: &str) -> ConfigResult<Value> {
        self.to_document()?
            .remove(key)
            .ok_or_else(|| ConfigError::UnknownField {
                field: key.to_string(),
            })
    }

    /// Check every field against the per-option rules.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut scratch = Self::default();
        for (key, value) in self.to_document()? {
            crate::validate::apply_option(&mut scratch, &key, &value)?;
        }
        Ok(())
    }

    /// Interval between directory scans.
    #[must_use]
    pub const fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Interval between status renders.
    #[must_use]
    pub const fn display_interval(&self) -> Duration {
        Duration::from_secs(self.display_interval_secs)
    }

    /// Interval between rerequester checks.
    #[must_use]
    pub const fn announce_tick(&self) -> Duration {
        Duration::from_secs(self.announce_tick_secs)
    }

    /// Deadline granted to workers during shutdown.
    #[must_use]
    pub const fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    /// Window during which a download's last error is shown.
    #[must_use]
    pub const fn error_window(&self) -> Duration {
        Duration::from_secs(self.error_window_secs)
    }
}

/// One option whose value differs between two settings documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingChange {
    /// Option name.
    pub key: String,
    /// New value.
    pub value: Value,
}
