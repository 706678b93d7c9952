//! Default values for the settings document.
//!
//! # Design
//! - Tracker timings mirror long-standing BitTorrent client defaults.

pub(crate) const WATCH_DIR: &str = "watch";
pub(crate) const DOWNLOAD_DIR: &str = "downloads";
pub(crate) const SOCKET_PATH: &str = "driftwood.sock";
pub(crate) const SCAN_INTERVAL_SECS: u64 = 60;
pub(crate) const DISPLAY_INTERVAL_SECS: u64 = 5;
pub(crate) const ANNOUNCE_TICK_SECS: u64 = 5;
pub(crate) const REREQUEST_INTERVAL_SECS: u64 = 300;
pub(crate) const MIN_INTERVAL_FLOOR_SECS: u64 = 30;
pub(crate) const ANNOUNCE_INTERVAL_SECS: u64 = 1800;
pub(crate) const MAX_ANNOUNCE_RETRY_INTERVAL_SECS: u64 = 1800;
pub(crate) const MIN_PEERS: u32 = 20;
pub(crate) const MAX_INITIATE: u32 = 40;
pub(crate) const TRACKER_TIMEOUT_SECS: u64 = 60;
pub(crate) const LISTEN_PORT: u16 = 6881;
pub(crate) const SHUTDOWN_DEADLINE_MS: u64 = 3000;
pub(crate) const ERROR_WINDOW_SECS: u64 = 300;
pub(crate) const KEEP_TOKEN_MULTIPLIER: f64 = 1.2;
pub(crate) const LOG_LEVEL: &str = "info";
