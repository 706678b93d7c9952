//! Core download domain types shared across the workspace.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DownloadError;

/// Length in bytes of a content identifier (an infohash).
pub const CONTENT_ID_LEN: usize = 20;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Identifier of the content a download serves, equivalent to an infohash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId([u8; CONTENT_ID_LEN]);

impl ContentId {
    /// Wrap raw identifier bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; CONTENT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw identifier bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CONTENT_ID_LEN] {
        &self.0
    }

    /// Leading eight hex characters, handy for compact log lines.
    #[must_use]
    pub fn short(&self) -> String {
        let mut full = self.to_string();
        full.truncate(8);
        full
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::with_capacity(CONTENT_ID_LEN * 2);
        for byte in self.0 {
            out.push(char::from(HEX[usize::from(byte >> 4)]));
            out.push(char::from(HEX[usize::from(byte & 0x0f)]));
        }
        formatter.write_str(&out)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "ContentId({self})")
    }
}

impl FromStr for ContentId {
    type Err = DownloadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || DownloadError::InvalidContentId {
            value: value.to_string(),
        };
        let raw = value.trim().as_bytes();
        if raw.len() != CONTENT_ID_LEN * 2 {
            return Err(invalid());
        }
        let mut bytes = [0_u8; CONTENT_ID_LEN];
        for (slot, pair) in bytes.iter_mut().zip(raw.chunks_exact(2)) {
            let high = hex_value(pair[0]).ok_or_else(invalid)?;
            let low = hex_value(pair[1]).ok_or_else(invalid)?;
            *slot = (high << 4) | low;
        }
        Ok(Self(bytes))
    }
}

const fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier the application process uses for one of its download items.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(pub String);

impl ConsumerId {
    /// Build a consumer id from anything string-like.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Validated description of something to download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Content identifier the descriptor resolves to.
    pub id: ContentId,
    /// Display name.
    pub name: String,
    /// Declared total length in bytes.
    pub length: u64,
    /// Tracker announce URL.
    pub announce: String,
    /// File the descriptor was read from, when discovered by a directory scan.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

/// Lifecycle state reported by a running download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    /// Initial on-disk verification in progress.
    #[default]
    Verifying,
    /// Transferring data.
    Downloading,
    /// Complete and serving the swarm.
    Seeding,
    /// Halted on request of the application.
    Paused,
    /// Shut down.
    Stopped,
    /// Aborted by a fatal error.
    Failed,
}

impl DownloadState {
    /// Render the state as its snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verifying => "verifying",
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// Error text recorded by a download together with when it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentError {
    /// Human-readable message.
    pub message: String,
    /// Time the error was observed.
    pub at: DateTime<Utc>,
}

/// Point-in-time status pulled from a download handle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Current lifecycle state.
    pub state: DownloadState,
    /// Completed share of the content in `0.0..=1.0`.
    pub fraction_done: f64,
    /// Connected or known peers.
    pub peers: u32,
    /// Peers that hold the complete content.
    pub seeds: u32,
    /// Download rate in bytes per second.
    pub download_bps: u64,
    /// Upload rate in bytes per second.
    pub upload_bps: u64,
    /// Cumulative bytes downloaded.
    pub downloaded_total: u64,
    /// Cumulative bytes uploaded.
    pub uploaded_total: u64,
    /// Estimated seconds until completion.
    pub eta_seconds: Option<u64>,
    /// Most recent error, if any.
    pub last_error: Option<RecentError>,
}

impl StatusSnapshot {
    /// Whether all content is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.fraction_done >= 1.0
    }

    /// The last error when it happened within `window` of `now`.
    #[must_use]
    pub fn recent_error(&self, now: DateTime<Utc>, window: Duration) -> Option<&RecentError> {
        let error = self.last_error.as_ref()?;
        let age = now.signed_duration_since(error.at).to_std().ok()?;
        (age <= window).then_some(error)
    }
}
