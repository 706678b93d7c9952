//! Typed command envelope exchanged between the daemon and the application.
//!
//! # Design
//! - Every command kind is a variant of [`CommandPayload`]; the kind string on
//!   the wire is the variant's snake-case name.
//! - Request/response is modelled by sending a different kind that carries
//!   `in_reply_to`, never by a synchronous return.

use std::fmt;
use std::str::FromStr;

use driftwood_core::{ConsumerId, ContentId, Descriptor, StatusSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Protocol version carried by the `Hello` handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Collision-resistant command identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

/// Discriminator selecting a command's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Protocol handshake.
    Hello,
    /// Application asks the daemon to start a download.
    StartDownload,
    /// Application asks the daemon to pause a download.
    PauseDownload,
    /// Application asks the daemon to stop a download.
    StopDownload,
    /// Application asks for one download's status.
    GetDownloadStatus,
    /// Application changes one persisted option.
    UpdateConfig,
    /// Re-read persisted configuration.
    ReloadConfig,
    /// Daemon reports one download's status.
    UpdateDownloadStatus,
    /// Daemon reports every download's status at once.
    BatchUpdateDownloadStatus,
    /// Daemon reports a download error.
    DownloaderError,
    /// Daemon reports that two downloads serve the same content.
    DuplicateTorrent,
    /// Begin the shutdown handshake.
    Shutdown,
    /// Shutdown finished on the receiving side.
    ShutdownAck,
}

impl CommandKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 13] = [
        Self::Hello,
        Self::StartDownload,
        Self::PauseDownload,
        Self::StopDownload,
        Self::GetDownloadStatus,
        Self::UpdateConfig,
        Self::ReloadConfig,
        Self::UpdateDownloadStatus,
        Self::BatchUpdateDownloadStatus,
        Self::DownloaderError,
        Self::DuplicateTorrent,
        Self::Shutdown,
        Self::ShutdownAck,
    ];

    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::StartDownload => "start_download",
            Self::PauseDownload => "pause_download",
            Self::StopDownload => "stop_download",
            Self::GetDownloadStatus => "get_download_status",
            Self::UpdateConfig => "update_config",
            Self::ReloadConfig => "reload_config",
            Self::UpdateDownloadStatus => "update_download_status",
            Self::BatchUpdateDownloadStatus => "batch_update_download_status",
            Self::DownloaderError => "downloader_error",
            Self::DuplicateTorrent => "duplicate_torrent",
            Self::Shutdown => "shutdown",
            Self::ShutdownAck => "shutdown_ack",
        }
    }

    /// High-frequency kinds whose traffic is logged at `trace`.
    #[must_use]
    pub const fn is_spammy(self) -> bool {
        matches!(
            self,
            Self::GetDownloadStatus | Self::UpdateDownloadStatus | Self::BatchUpdateDownloadStatus
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or(())
    }
}

/// One row of a batched status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Application-side item ids served by the download.
    pub consumers: Vec<ConsumerId>,
    /// Content the download serves.
    pub content_id: ContentId,
    /// Display name.
    pub name: String,
    /// Status snapshot.
    pub status: StatusSnapshot,
}

/// Arguments of every command kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "kwargs", rename_all = "snake_case")]
pub enum CommandPayload {
    /// Protocol handshake.
    Hello {
        /// Sender's protocol version.
        version: u32,
    },
    /// Start (or attach to) a download.
    StartDownload {
        /// Application item requesting the content.
        consumer: ConsumerId,
        /// What to download.
        descriptor: Descriptor,
    },
    /// Pause the download serving `consumer`.
    PauseDownload {
        /// Application item.
        consumer: ConsumerId,
    },
    /// Stop the download serving `consumer`.
    StopDownload {
        /// Application item.
        consumer: ConsumerId,
    },
    /// Ask for the status of the download serving `consumer`.
    GetDownloadStatus {
        /// Application item.
        consumer: ConsumerId,
    },
    /// Persist one option and apply it.
    UpdateConfig {
        /// Option name.
        key: String,
        /// New value.
        value: Value,
    },
    /// Re-read persisted configuration.
    ReloadConfig,
    /// Status of one download.
    UpdateDownloadStatus {
        /// Status row.
        update: StatusUpdate,
    },
    /// Status of every active download.
    BatchUpdateDownloadStatus {
        /// Status rows.
        updates: Vec<StatusUpdate>,
    },
    /// A download (or a request about one) failed.
    DownloaderError {
        /// Affected application item, when known.
        consumer: Option<ConsumerId>,
        /// Affected content, when known.
        content_id: Option<ContentId>,
        /// Human-readable reason.
        message: String,
    },
    /// `duplicate` serves the same content as `original` and was merged.
    DuplicateTorrent {
        /// Surviving content id.
        original: ContentId,
        /// Dropped content id.
        duplicate: ContentId,
    },
    /// Begin the shutdown handshake.
    Shutdown,
    /// Shutdown finished.
    ShutdownAck,
}

impl CommandPayload {
    /// Kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::Hello { .. } => CommandKind::Hello,
            Self::StartDownload { .. } => CommandKind::StartDownload,
            Self::PauseDownload { .. } => CommandKind::PauseDownload,
            Self::StopDownload { .. } => CommandKind::StopDownload,
            Self::GetDownloadStatus { .. } => CommandKind::GetDownloadStatus,
            Self::UpdateConfig { .. } => CommandKind::UpdateConfig,
            Self::ReloadConfig => CommandKind::ReloadConfig,
            Self::UpdateDownloadStatus { .. } => CommandKind::UpdateDownloadStatus,
            Self::BatchUpdateDownloadStatus { .. } => CommandKind::BatchUpdateDownloadStatus,
            Self::DownloaderError { .. } => CommandKind::DownloaderError,
            Self::DuplicateTorrent { .. } => CommandKind::DuplicateTorrent,
            Self::Shutdown => CommandKind::Shutdown,
            Self::ShutdownAck => CommandKind::ShutdownAck,
        }
    }
}

/// Message envelope sent across the process boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Unique id.
    pub id: CommandId,
    /// Kind and keyword arguments.
    pub payload: CommandPayload,
    /// Positional arguments, kept for peers that send them.
    pub args: Vec<Value>,
    /// `true` when built in this process, `false` once decoded from the wire.
    pub originated_here: bool,
    /// Optional result payload.
    pub result: Option<Value>,
    /// High-frequency command whose logging is suppressed.
    pub spammy: bool,
    /// Command this one answers.
    pub in_reply_to: Option<CommandId>,
}

impl Command {
    /// Build a command for sending.
    #[must_use]
    pub fn new(payload: CommandPayload) -> Self {
        Self {
            id: CommandId::new(),
            spammy: payload.kind().is_spammy(),
            payload,
            args: Vec::new(),
            originated_here: true,
            result: None,
            in_reply_to: None,
        }
    }

    /// Build the answer to `self`, carried by a (possibly different) kind.
    #[must_use]
    pub fn reply(&self, payload: CommandPayload) -> Self {
        Self {
            in_reply_to: Some(self.id),
            ..Self::new(payload)
        }
    }

    /// Attach a result payload.
    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Handler-selecting kind.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_names_round_trip() {
        for kind in CommandKind::ALL {
            assert_eq!(kind.as_str().parse::<CommandKind>(), Ok(kind));
        }
        assert!("teleport".parse::<CommandKind>().is_err());
    }

    #[test]
    fn status_kinds_are_spammy() {
        let command = Command::new(CommandPayload::BatchUpdateDownloadStatus {
            updates: Vec::new(),
        });
        assert!(command.spammy);
        assert!(command.originated_here);
        assert!(!Command::new(CommandPayload::Shutdown).spammy);
    }

    #[test]
    fn reply_correlates_with_request() {
        let request = Command::new(CommandPayload::Shutdown);
        let ack = request
            .reply(CommandPayload::ShutdownAck)
            .with_result(json!({ "abandoned": 0 }));
        assert_eq!(ack.in_reply_to, Some(request.id));
        assert_ne!(ack.id, request.id);
        assert_eq!(ack.kind(), CommandKind::ShutdownAck);
        assert!(ack.result.is_some());
    }
}
