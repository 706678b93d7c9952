//! Recording fakes shared by the daemon's unit tests.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use driftwood_config::Settings;
use driftwood_core::{
    ContentId, Descriptor, DownloadError, DownloadHandle, DownloadResult, DownloadRuntime,
    DownloadState, RuntimeMessage, StatusSnapshot, Supervisor, SupervisorEnvelope,
};
use driftwood_ipc::{CommandSender, spawn_transport};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::render::LogRenderer;
use crate::scan::{DirectoryScanner, ScanCache, ScanDiff};

pub(crate) fn id(byte: u8) -> ContentId {
    ContentId::from_bytes([byte; 20])
}

pub(crate) fn descriptor(byte: u8) -> Descriptor {
    Descriptor {
        id: id(byte),
        name: format!("item-{byte}"),
        length: 4096,
        announce: "http://tracker.test/announce".into(),
        source: None,
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Started(ContentId),
    Shutdown(ContentId),
    Option(ContentId, String, Value),
    Delivered(ContentId),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<Entry>>>);

impl Journal {
    fn record(&self, entry: Entry) {
        if let Ok(mut entries) = self.0.lock() {
            entries.push(entry);
        }
    }

    fn entries(&self) -> Vec<Entry> {
        self.0.lock().map(|entries| entries.clone()).unwrap_or_default()
    }

    pub(crate) fn started(&self) -> Vec<ContentId> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Started(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn shutdowns(&self) -> Vec<ContentId> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Shutdown(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn options(&self) -> Vec<(ContentId, String, Value)> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Option(id, key, value) => Some((id, key, value)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn deliveries(&self) -> Vec<ContentId> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Delivered(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

pub(crate) struct FakeRuntime {
    journal: Journal,
    refused: HashSet<ContentId>,
    reject_options: HashSet<ContentId>,
    verify_on_start: bool,
}

impl FakeRuntime {
    pub(crate) fn new() -> (Self, Journal) {
        let journal = Journal::default();
        (
            Self {
                journal: journal.clone(),
                refused: HashSet::new(),
                reject_options: HashSet::new(),
                verify_on_start: false,
            },
            journal,
        )
    }

    pub(crate) fn refuse(&mut self, id: ContentId) {
        self.refused.insert(id);
    }

    pub(crate) fn reject_options_for(&mut self, id: ContentId) {
        self.reject_options.insert(id);
    }

    /// Post a verification result as soon as a download starts.
    pub(crate) fn verify_on_start(&mut self) {
        self.verify_on_start = true;
    }
}

impl DownloadRuntime for FakeRuntime {
    type Config = Settings;

    fn start(
        &mut self,
        descriptor: Descriptor,
        _config: &Settings,
        supervisor: Supervisor,
        _target: PathBuf,
    ) -> DownloadResult<Box<dyn DownloadHandle>> {
        if self.refused.contains(&descriptor.id) {
            return Err(DownloadError::StartFailed {
                content_id: descriptor.id,
                source: "refused by test".into(),
            });
        }
        self.journal.record(Entry::Started(descriptor.id));
        if self.verify_on_start {
            supervisor.deliver(RuntimeMessage::VerificationFinished {
                bytes_present: descriptor.length,
            });
        }
        Ok(Box::new(FakeHandle {
            id: descriptor.id,
            journal: self.journal.clone(),
            reject_options: self.reject_options.contains(&descriptor.id),
            supervisor,
            state: DownloadState::Verifying,
        }))
    }
}

struct FakeHandle {
    id: ContentId,
    journal: Journal,
    reject_options: bool,
    supervisor: Supervisor,
    state: DownloadState,
}

impl DownloadHandle for FakeHandle {
    fn shutdown(&mut self) {
        self.state = DownloadState::Stopped;
        self.journal.record(Entry::Shutdown(self.id));
    }

    fn set_option(&mut self, name: &str, value: &Value) -> DownloadResult<()> {
        if self.reject_options {
            return Err(DownloadError::InvalidOption {
                name: name.to_string(),
                reason: "rejected_by_test",
            });
        }
        self.journal
            .record(Entry::Option(self.id, name.to_string(), value.clone()));
        Ok(())
    }

    fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state,
            fraction_done: if self.state == DownloadState::Seeding {
                1.0
            } else {
                0.0
            },
            ..StatusSnapshot::default()
        }
    }

    fn deliver(&mut self, message: RuntimeMessage, _now: Instant) {
        self.journal.record(Entry::Delivered(self.id));
        if let RuntimeMessage::VerificationFinished { .. } = message {
            self.state = DownloadState::Seeding;
            self.supervisor.started();
        }
    }
}

pub(crate) struct ScriptedScanner {
    rounds: Mutex<VecDeque<(Vec<Descriptor>, Vec<ContentId>)>>,
}

impl ScriptedScanner {
    pub(crate) fn new(rounds: Vec<(Vec<Descriptor>, Vec<ContentId>)>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
        }
    }
}

impl DirectoryScanner for ScriptedScanner {
    fn scan(&self, _dir: &Path, previous: ScanCache) -> (ScanCache, ScanDiff) {
        let round = self
            .rounds
            .lock()
            .ok()
            .and_then(|mut rounds| rounds.pop_front());
        match round {
            Some((added, removed)) => (previous, ScanDiff { added, removed }),
            None => (previous, ScanDiff::default()),
        }
    }
}

pub(crate) fn orchestrator(
    runtime: FakeRuntime,
) -> (
    Orchestrator<FakeRuntime>,
    mpsc::UnboundedReceiver<SupervisorEnvelope>,
) {
    let (events, rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(OrchestratorDeps {
        runtime,
        scanner: Box::new(ScriptedScanner::new(Vec::new())),
        renderer: Box::new(LogRenderer),
        settings: Settings::default(),
        events,
    });
    (orchestrator, rx)
}

/// Sender wired to an in-memory application; frames it receives arrive on
/// the returned queue. Needs a running Tokio runtime.
pub(crate) fn connected_app() -> (CommandSender, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (daemon_side, app_side) = tokio::io::duplex(64 * 1024);
    let (daemon_read, daemon_write) = tokio::io::split(daemon_side);
    let (app_read, app_write) = tokio::io::split(app_side);
    let (daemon_inbound, _) = mpsc::unbounded_channel();
    let (sender, _daemon_tasks) = spawn_transport(daemon_read, daemon_write, daemon_inbound);
    let (app_inbound, app_rx) = mpsc::unbounded_channel();
    let (_app_sender, _app_tasks) = spawn_transport(app_read, app_write, app_inbound);
    (sender, app_rx)
}
