//! Download runtime collaborator traits and the supervisor hand-off.
//!
//! # Design
//! - Runtimes start downloads and hand back a [`DownloadHandle`]; handles are
//!   only ever touched from the scheduler that owns them.
//! - Anything a download learns off the scheduler thread (verification
//!   results, tracker responses) travels back as a [`SupervisorEvent`] through
//!   the [`Supervisor`] channel and is applied on the scheduler's next turn.
//! - Every start of a download gets a fresh generation. Posts are stamped
//!   with it so the scheduler can drop results from a handle it already
//!   replaced.

use std::path::PathBuf;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::DownloadResult;
use crate::model::{ContentId, Descriptor, StatusSnapshot};

/// Live download owned by the orchestrator.
pub trait DownloadHandle: Send {
    /// Stop the download. Best-effort tracker notification is allowed.
    fn shutdown(&mut self);

    /// Apply a single option update to the running download.
    ///
    /// # Errors
    ///
    /// Returns an error when the option is unknown or the value is invalid.
    fn set_option(&mut self, name: &str, value: &Value) -> DownloadResult<()>;

    /// Pull a status snapshot.
    fn status(&self) -> StatusSnapshot;

    /// Periodic housekeeping driven by the scheduler tick.
    fn poll(&mut self, now: Instant) {
        let _ = now;
    }

    /// Apply a result produced off the scheduler thread.
    fn deliver(&mut self, message: RuntimeMessage, now: Instant) {
        let _ = (message, now);
    }
}

/// Factory for running downloads.
pub trait DownloadRuntime: Send {
    /// Configuration type handed to every started download.
    type Config;

    /// Start verification and transfer for `descriptor`, storing data under `target`.
    ///
    /// # Errors
    ///
    /// Returns an error when the runtime cannot start the download at all.
    fn start(
        &mut self,
        descriptor: Descriptor,
        config: &Self::Config,
        supervisor: Supervisor,
        target: PathBuf,
    ) -> DownloadResult<Box<dyn DownloadHandle>>;
}

/// Results produced by download workers, applied on the scheduler thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeMessage {
    /// Initial on-disk verification finished.
    VerificationFinished {
        /// Bytes already present and valid.
        bytes_present: u64,
    },
    /// A tracker announce round trip completed.
    AnnounceFinished {
        /// Peer identity the announce was sent with.
        identity: [u8; 20],
        /// Raw response body, or the transport error text.
        body: Result<Vec<u8>, String>,
    },
}

/// Callbacks a started download delivers to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// Verification finished and the download is running.
    Started {
        /// Download that started.
        id: ContentId,
    },
    /// The download terminated.
    Failed {
        /// Download that failed.
        id: ContentId,
        /// Whether the failure originated outside the download itself.
        external: bool,
    },
    /// The download hit a non-terminal error worth logging.
    Exception {
        /// Download that reported the error.
        id: ContentId,
        /// Error text.
        text: String,
    },
    /// The download turned out to serve content that is already tracked.
    Duplicate {
        /// Content id already known to the supervisor.
        original: ContentId,
        /// Content id the duplicate was started under.
        duplicate: ContentId,
    },
    /// A worker result that must be applied to the download on the scheduler.
    Runtime {
        /// Download the message belongs to.
        id: ContentId,
        /// Worker result.
        message: RuntimeMessage,
    },
}

/// A [`SupervisorEvent`] stamped with the generation of the handle whose
/// supervisor posted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorEnvelope {
    /// Generation handed to [`Supervisor::new`].
    pub generation: u64,
    /// The callback itself.
    pub event: SupervisorEvent,
}

impl SupervisorEvent {
    /// Content id the event concerns.
    #[must_use]
    pub const fn id(&self) -> ContentId {
        match self {
            Self::Started { id }
            | Self::Failed { id, .. }
            | Self::Exception { id, .. }
            | Self::Runtime { id, .. } => *id,
            Self::Duplicate { duplicate, .. } => *duplicate,
        }
    }
}

/// Per-download sender that posts supervisor events to the scheduler queue.
///
/// Sends never block; once the scheduler is gone they are dropped.
#[derive(Debug, Clone)]
pub struct Supervisor {
    id: ContentId,
    generation: u64,
    tx: mpsc::UnboundedSender<SupervisorEnvelope>,
}

impl Supervisor {
    /// Bind a supervisor channel to one start of one download.
    #[must_use]
    pub const fn new(
        id: ContentId,
        generation: u64,
        tx: mpsc::UnboundedSender<SupervisorEnvelope>,
    ) -> Self {
        Self { id, generation, tx }
    }

    /// Download this supervisor reports for.
    #[must_use]
    pub const fn id(&self) -> ContentId {
        self.id
    }

    /// Generation every post is stamped with.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that verification finished and the download is running.
    pub fn started(&self) {
        self.post(SupervisorEvent::Started { id: self.id });
    }

    /// Report a terminal failure.
    pub fn failed(&self, external: bool) {
        self.post(SupervisorEvent::Failed {
            id: self.id,
            external,
        });
    }

    /// Report a non-terminal error.
    pub fn exception(&self, text: impl Into<String>) {
        self.post(SupervisorEvent::Exception {
            id: self.id,
            text: text.into(),
        });
    }

    /// Report that this download duplicates `original`.
    ///
    /// Runtimes that discover the real content identity only after starting
    /// (from peers or a tracker redirect) call this once they know it; the
    /// scheduler then merges the two records.
    pub fn duplicate(&self, original: ContentId) {
        self.post(SupervisorEvent::Duplicate {
            original,
            duplicate: self.id,
        });
    }

    /// Hand a worker result back to the scheduler.
    pub fn deliver(&self, message: RuntimeMessage) {
        self.post(SupervisorEvent::Runtime {
            id: self.id,
            message,
        });
    }

    fn post(&self, event: SupervisorEvent) {
        let _ = self.tx.send(SupervisorEnvelope {
            generation: self.generation,
            event,
        });
    }
}
