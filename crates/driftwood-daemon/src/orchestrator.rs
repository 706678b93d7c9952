//! Download orchestrator.
//!
//! # Design
//! - Sole owner of download records, the admission queue and every live
//!   [`DownloadHandle`]; it runs on the scheduler loop and never locks.
//! - Verification is single-flight: a download holds the admission slot from
//!   `start` until its `started` callback (or its removal).
//! - Each start gets a new generation; callbacks stamped with any other
//!   generation come from a handle that was since replaced and are dropped.
//! - Errors local to one download are logged and reported to the application;
//!   they never fail the orchestrator itself.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use driftwood_config::{ConfigResult, Settings, diff, is_download_scoped};
use driftwood_core::{
    ConsumerId, ContentId, Descriptor, DownloadHandle, DownloadRuntime, DownloadState,
    StatusSnapshot, Supervisor, SupervisorEnvelope, SupervisorEvent,
};
use driftwood_ipc::{Command, CommandPayload, CommandSender, StatusUpdate};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::admission::{AdmissionQueue, Removal};
use crate::render::{RenderControl, StatusRenderer};
use crate::scan::{DirectoryScanner, ScanCache};

/// Collaborators the orchestrator is built from.
pub struct OrchestratorDeps<R> {
    /// Starts downloads.
    pub runtime: R,
    /// Diffs the watch directory.
    pub scanner: Box<dyn DirectoryScanner>,
    /// Consumes status rows.
    pub renderer: Box<dyn StatusRenderer>,
    /// Settings in effect at start.
    pub settings: Settings,
    /// Queue every supervisor callback is posted to.
    pub events: mpsc::UnboundedSender<SupervisorEnvelope>,
}

/// Coarse lifecycle of a record, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Waiting for (or holding) the admission slot without a handle.
    Queued,
    /// Bound to a running download.
    Active,
    /// Halted on request; kept so it can be resumed.
    Paused,
}

/// Summary of one configuration reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Keys whose values changed.
    pub changed: Vec<String>,
    /// Per-download option applications that failed.
    pub failures: usize,
}

enum Slot {
    Queued,
    Active {
        handle: Box<dyn DownloadHandle>,
        generation: u64,
    },
    Paused,
}

struct DownloadRecord {
    descriptor: Descriptor,
    consumers: BTreeSet<ConsumerId>,
    slot: Slot,
}

impl DownloadRecord {
    fn queued(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            consumers: BTreeSet::new(),
            slot: Slot::Queued,
        }
    }

    const fn state(&self) -> RecordState {
        match self.slot {
            Slot::Queued => RecordState::Queued,
            Slot::Active { .. } => RecordState::Active,
            Slot::Paused => RecordState::Paused,
        }
    }

    fn status(&self) -> StatusSnapshot {
        match &self.slot {
            Slot::Active { handle, .. } => handle.status(),
            Slot::Queued => StatusSnapshot::default(),
            Slot::Paused => StatusSnapshot {
                state: DownloadState::Paused,
                ..StatusSnapshot::default()
            },
        }
    }

    fn shutdown(&mut self) {
        if let Slot::Active { handle, .. } = &mut self.slot {
            handle.shutdown();
        }
    }

    fn handle_mut(&mut self) -> Option<&mut dyn DownloadHandle> {
        match &mut self.slot {
            Slot::Active { handle, .. } => Some(handle.as_mut()),
            Slot::Queued | Slot::Paused => None,
        }
    }
}

/// Supervises every download of the daemon.
pub struct Orchestrator<R> {
    runtime: R,
    scanner: Box<dyn DirectoryScanner>,
    renderer: Box<dyn StatusRenderer>,
    settings: Settings,
    events: mpsc::UnboundedSender<SupervisorEnvelope>,
    next_generation: u64,
    scan_cache: ScanCache,
    downloads: HashMap<ContentId, DownloadRecord>,
    admission: AdmissionQueue,
    outbound: Option<CommandSender>,
}

impl<R> Orchestrator<R>
where
    R: DownloadRuntime<Config = Settings>,
{
    /// Orchestrator with no downloads and no application attached.
    #[must_use]
    pub fn new(deps: OrchestratorDeps<R>) -> Self {
        Self {
            runtime: deps.runtime,
            scanner: deps.scanner,
            renderer: deps.renderer,
            settings: deps.settings,
            events: deps.events,
            next_generation: 0,
            scan_cache: ScanCache::default(),
            downloads: HashMap::new(),
            admission: AdmissionQueue::new(),
            outbound: None,
        }
    }

    /// Settings currently in effect.
    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Admission queue, for inspection.
    #[must_use]
    pub const fn admission(&self) -> &AdmissionQueue {
        &self.admission
    }

    /// Lifecycle of `id`, `None` when unknown.
    #[must_use]
    pub fn state_of(&self, id: ContentId) -> Option<RecordState> {
        self.downloads.get(&id).map(DownloadRecord::state)
    }

    /// Consumers attached to `id`.
    #[must_use]
    pub fn consumers_of(&self, id: ContentId) -> Vec<ConsumerId> {
        self.downloads
            .get(&id)
            .map(|record| record.consumers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of known downloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.downloads.len()
    }

    /// Whether no download is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }

    /// Route outbound commands to a newly connected application.
    pub fn attach(&mut self, sender: CommandSender) {
        if let Some(previous) = self.outbound.replace(sender) {
            previous.close();
            info!("application reconnected; previous channel closed");
        }
    }

    /// Take the application channel, if any.
    pub fn detach(&mut self) -> Option<CommandSender> {
        self.outbound.take()
    }

    /// Send `command` to the application. Lost silently when none is attached.
    pub fn send(&self, command: &Command) {
        match &self.outbound {
            Some(outbound) => {
                outbound.send(command);
            }
            None => trace!(kind = %command.kind(), "no application attached; command dropped"),
        }
    }

    /// Diff the watch directory and apply the result.
    pub fn scan(&mut self) {
        let previous = std::mem::take(&mut self.scan_cache);
        let (next, diff) = self.scanner.scan(&self.settings.watch_dir, previous);
        self.scan_cache = next;
        if diff.is_empty() {
            return;
        }
        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "watch directory changed"
        );
        for id in diff.removed {
            if let Some(record) = self.forget(id) {
                info!(content_id = %id.short(), name = %record.descriptor.name, "descriptor gone; download removed");
                if !record.consumers.is_empty() {
                    self.report_error(&record.consumers, id, "descriptor removed");
                }
            }
        }
        for descriptor in diff.added {
            self.add(descriptor);
        }
        self.admit();
    }

    /// Track `descriptor` and queue it for verification.
    pub fn add(&mut self, descriptor: Descriptor) {
        let id = descriptor.id;
        let record = self
            .downloads
            .entry(id)
            .or_insert_with(|| DownloadRecord::queued(descriptor.clone()));
        if record.descriptor.source.is_none() && descriptor.source.is_some() {
            record.descriptor.source.clone_from(&descriptor.source);
            debug!(content_id = %id.short(), "download now backed by a watched descriptor");
        }
        if !matches!(record.slot, Slot::Queued) {
            return;
        }
        if self.admission.push(id, descriptor) {
            info!(content_id = %id.short(), queued = self.admission.len(), "download queued for verification");
        }
        self.admit();
    }

    /// Start the head of the admission queue unless a verification is running.
    pub fn admit(&mut self) {
        while let Some((id, descriptor)) = self.admission.next_admission() {
            if !self.downloads.contains_key(&id) {
                self.admission.finish(id);
                continue;
            }
            let target = self.target_path(&descriptor);
            self.next_generation += 1;
            let generation = self.next_generation;
            let supervisor = Supervisor::new(id, generation, self.events.clone());
            match self
                .runtime
                .start(descriptor, &self.settings, supervisor, target)
            {
                Ok(handle) => {
                    if let Some(record) = self.downloads.get_mut(&id) {
                        record.slot = Slot::Active { handle, generation };
                    }
                    info!(content_id = %id.short(), generation, "download admitted for verification");
                    return;
                }
                Err(err) => {
                    warn!(content_id = %id.short(), error = %err, detail = ?err, "download could not be started");
                    self.admission.finish(id);
                    if let Some(record) = self.downloads.remove(&id) {
                        self.report_error(&record.consumers, id, "download could not be started");
                    }
                }
            }
        }
    }

    /// Verification for `id` finished; admit the next download.
    pub fn on_started(&mut self, id: ContentId) {
        info!(content_id = %id.short(), "download running");
        if self.admission.finish(id) {
            self.admit();
        }
    }

    /// Cancel `id` if it is queued, or free the admission slot if it holds it.
    pub fn remove_before_admission(&mut self, id: ContentId) -> Removal {
        let removal = self.admission.remove(id);
        if removal == Removal::WasCurrent {
            debug!(content_id = %id.short(), "verification abandoned; admitting next");
            self.admit();
        }
        removal
    }

    /// Stop and forget `id`.
    pub fn remove(&mut self, id: ContentId) {
        if let Some(record) = self.forget(id) {
            info!(content_id = %id.short(), name = %record.descriptor.name, "download removed");
            self.admit();
        }
    }

    fn forget(&mut self, id: ContentId) -> Option<DownloadRecord> {
        let mut record = self.downloads.remove(&id)?;
        record.shutdown();
        self.admission.remove(id);
        Some(record)
    }

    /// Let every active download run its periodic checks.
    pub fn tick(&mut self, now: Instant) {
        for handle in self.downloads.values_mut().filter_map(DownloadRecord::handle_mut) {
            handle.poll(now);
        }
    }

    /// Render status rows for every active download and push them to the
    /// application.
    pub fn stats(&mut self, now: DateTime<Utc>) -> RenderControl {
        let mut rows: Vec<StatusUpdate> = self
            .downloads
            .iter()
            .filter(|(_, record)| matches!(record.slot, Slot::Active { .. }))
            .map(|(id, record)| self.status_row(*id, record, now))
            .collect();
        rows.sort_by(|left, right| left.name.cmp(&right.name));
        let control = self.renderer.render(&rows, now);
        if !rows.is_empty() {
            self.send(&Command::new(CommandPayload::BatchUpdateDownloadStatus {
                updates: rows,
            }));
        }
        if control == RenderControl::Stop && !self.admission.is_empty() {
            debug!(queued = self.admission.len(), "downloads still waiting for admission");
            return RenderControl::Continue;
        }
        control
    }

    /// Apply a supervisor callback or worker result posted by the current
    /// handle of its download. Posts from replaced handles are dropped.
    pub fn handle_event(&mut self, posted: SupervisorEnvelope, now: Instant) {
        let SupervisorEnvelope { generation, event } = posted;
        let id = event.id();
        if self.generation_of(id) != Some(generation) {
            trace!(content_id = %id.short(), generation, "dropping callback from a replaced handle");
            return;
        }
        match event {
            SupervisorEvent::Started { id } => self.on_started(id),
            SupervisorEvent::Failed { id, external } => self.failed(id, external),
            SupervisorEvent::Exception { id, text } => self.error(id, &text),
            SupervisorEvent::Duplicate {
                original,
                duplicate,
            } => self.duplicate(original, duplicate),
            SupervisorEvent::Runtime { id, message } => {
                if let Some(handle) = self
                    .downloads
                    .get_mut(&id)
                    .and_then(DownloadRecord::handle_mut)
                {
                    handle.deliver(message, now);
                }
            }
        }
    }

    /// Generation of the handle currently serving `id`.
    fn generation_of(&self, id: ContentId) -> Option<u64> {
        match self.downloads.get(&id)?.slot {
            Slot::Active { generation, .. } => Some(generation),
            Slot::Queued | Slot::Paused => None,
        }
    }

    /// The download ended on its own; stop tracking it.
    pub fn failed(&mut self, id: ContentId, external: bool) {
        let Some(mut record) = self.downloads.remove(&id) else {
            return;
        };
        warn!(content_id = %id.short(), name = %record.descriptor.name, external, "download failed");
        record.shutdown();
        self.remove_before_admission(id);
        let message = if external {
            "download stopped externally"
        } else {
            "download failed"
        };
        self.report_error(&record.consumers, id, message);
    }

    /// Log a non-terminal download error.
    pub fn error(&self, id: ContentId, text: &str) {
        warn!(content_id = %id.short(), error = text, "download reported an error");
    }

    /// `duplicate` serves the same content as `original`.
    pub fn duplicate(&mut self, original: ContentId, duplicate: ContentId) {
        if original == duplicate || !self.downloads.contains_key(&duplicate) {
            return;
        }
        if self.downloads.contains_key(&original) {
            let Some(mut dropped) = self.downloads.remove(&duplicate) else {
                return;
            };
            dropped.shutdown();
            self.remove_before_admission(duplicate);
            if let Some(survivor) = self.downloads.get_mut(&original) {
                survivor.consumers.append(&mut dropped.consumers);
            }
            info!(original = %original.short(), duplicate = %duplicate.short(), "duplicate download merged");
            self.send(&Command::new(CommandPayload::DuplicateTorrent {
                original,
                duplicate,
            }));
            return;
        }

        info!(original = %original.short(), duplicate = %duplicate.short(), "original vanished; restarting duplicate");
        let descriptor = match self.downloads.get_mut(&duplicate) {
            Some(record) => {
                record.shutdown();
                record.slot = Slot::Queued;
                record.descriptor.clone()
            }
            None => return,
        };
        self.remove_before_admission(duplicate);
        self.add(descriptor);
    }

    /// Attach `consumer` to `descriptor`, starting or resuming it.
    pub fn start_download(&mut self, consumer: ConsumerId, descriptor: Descriptor) {
        let id = descriptor.id;
        if let Some(existing) = self.id_for(&consumer)
            && existing != id
        {
            self.stop_download(&consumer);
        }
        match self.downloads.get_mut(&id) {
            Some(record) => {
                record.consumers.insert(consumer);
                if matches!(record.slot, Slot::Paused) {
                    record.slot = Slot::Queued;
                    let descriptor = record.descriptor.clone();
                    info!(content_id = %id.short(), "resuming paused download");
                    self.add(descriptor);
                }
            }
            None => {
                let mut record = DownloadRecord::queued(descriptor.clone());
                record.consumers.insert(consumer);
                self.downloads.insert(id, record);
                self.add(descriptor);
            }
        }
    }

    /// Halt the download serving `consumer`, keeping its record.
    pub fn pause_download(&mut self, consumer: &ConsumerId) -> bool {
        let Some(id) = self.id_for(consumer) else {
            return false;
        };
        if let Some(record) = self.downloads.get_mut(&id) {
            record.shutdown();
            record.slot = Slot::Paused;
        }
        self.remove_before_admission(id);
        info!(content_id = %id.short(), consumer = %consumer, "download paused");
        true
    }

    /// Detach `consumer`; the download stops once nothing needs it.
    pub fn stop_download(&mut self, consumer: &ConsumerId) -> bool {
        let Some(id) = self.id_for(consumer) else {
            return false;
        };
        let orphaned = match self.downloads.get_mut(&id) {
            Some(record) => {
                record.consumers.remove(consumer);
                record.consumers.is_empty() && record.descriptor.source.is_none()
            }
            None => false,
        };
        if orphaned {
            self.remove(id);
        }
        true
    }

    /// Status row of the download serving `consumer`.
    #[must_use]
    pub fn download_status(&self, consumer: &ConsumerId, now: DateTime<Utc>) -> Option<StatusUpdate> {
        let id = self.id_for(consumer)?;
        let record = self.downloads.get(&id)?;
        Some(self.status_row(id, record, now))
    }

    /// Adopt `settings`, pushing changed download options to every active
    /// download. A failure on one download does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns an error only when the settings cannot be compared at all.
    pub fn reload_config(&mut self, settings: Settings) -> ConfigResult<ReloadReport> {
        let changes = diff(&self.settings, &settings)?;
        let mut report = ReloadReport::default();
        for change in &changes {
            report.changed.push(change.key.clone());
            if !is_download_scoped(&change.key) {
                continue;
            }
            for (id, record) in &mut self.downloads {
                let Some(handle) = record.handle_mut() else {
                    continue;
                };
                if let Err(err) = handle.set_option(&change.key, &change.value) {
                    report.failures += 1;
                    warn!(
                        content_id = %id.short(),
                        option = %change.key,
                        error = %err,
                        "download rejected option update"
                    );
                }
            }
        }
        self.settings = settings;
        info!(
            changed = report.changed.len(),
            failures = report.failures,
            "configuration reloaded"
        );
        Ok(report)
    }

    /// Shut every download down and forget them.
    pub fn shutdown_downloads(&mut self) {
        let count = self.downloads.len();
        for record in self.downloads.values_mut() {
            record.shutdown();
        }
        self.downloads.clear();
        self.admission = AdmissionQueue::new();
        info!(downloads = count, "downloads shut down");
    }

    fn id_for(&self, consumer: &ConsumerId) -> Option<ContentId> {
        self.downloads
            .iter()
            .find(|(_, record)| record.consumers.contains(consumer))
            .map(|(id, _)| *id)
    }

    fn status_row(&self, id: ContentId, record: &DownloadRecord, now: DateTime<Utc>) -> StatusUpdate {
        let mut status = record.status();
        status.last_error = status
            .recent_error(now, self.settings.error_window())
            .cloned();
        StatusUpdate {
            consumers: record.consumers.iter().cloned().collect(),
            content_id: id,
            name: record.descriptor.name.clone(),
            status,
        }
    }

    fn target_path(&self, descriptor: &Descriptor) -> PathBuf {
        let name: String = descriptor
            .name
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
            .collect();
        let name = name.trim();
        if name.is_empty() || name == "." || name == ".." {
            self.settings.download_dir.join(descriptor.id.to_string())
        } else {
            self.settings.download_dir.join(name)
        }
    }

    fn report_error(&self, consumers: &BTreeSet<ConsumerId>, id: ContentId, message: &str) {
        if consumers.is_empty() {
            self.send(&Command::new(CommandPayload::DownloaderError {
                consumer: None,
                content_id: Some(id),
                message: message.to_string(),
            }));
            return;
        }
        for consumer in consumers {
            self.send(&Command::new(CommandPayload::DownloaderError {
                consumer: Some(consumer.clone()),
                content_id: Some(id),
                message: message.to_string(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakeRuntime, ScriptedScanner, connected_app, descriptor, id, orchestrator,
    };
    use driftwood_core::RuntimeMessage;
    use driftwood_ipc::{Decoded, decode};
    use serde_json::json;

    /// Stamp `event` the way the current handle of its download would.
    fn posted(
        orchestrator: &Orchestrator<FakeRuntime>,
        event: SupervisorEvent,
    ) -> SupervisorEnvelope {
        let generation = orchestrator.generation_of(event.id()).unwrap_or_default();
        SupervisorEnvelope { generation, event }
    }

    fn watched(byte: u8) -> Descriptor {
        Descriptor {
            source: Some(PathBuf::from(format!("/watch/{byte}.dl.json"))),
            ..descriptor(byte)
        }
    }

    #[test]
    fn admission_is_single_flight_and_fifo() {
        let (runtime, journal) = FakeRuntime::new();
        let (mut orchestrator, _events) = orchestrator(runtime);

        orchestrator.add(descriptor(1));
        orchestrator.add(descriptor(2));
        assert_eq!(journal.started(), vec![id(1)]);
        assert_eq!(orchestrator.admission().current(), Some(id(1)));
        assert_eq!(orchestrator.admission().queued().collect::<Vec<_>>(), vec![id(2)]);
        assert_eq!(orchestrator.state_of(id(2)), Some(RecordState::Queued));

        orchestrator.on_started(id(1));
        assert_eq!(journal.started(), vec![id(1), id(2)]);
        assert_eq!(orchestrator.admission().current(), Some(id(2)));
        assert!(orchestrator.admission().is_empty());

        orchestrator.on_started(id(1));
        assert_eq!(orchestrator.admission().current(), Some(id(2)));
    }

    #[test]
    fn removing_the_current_download_admits_the_next_at_once() {
        let (runtime, journal) = FakeRuntime::new();
        let (mut orchestrator, _events) = orchestrator(runtime);
        orchestrator.add(descriptor(1));
        orchestrator.add(descriptor(2));

        assert_eq!(orchestrator.remove_before_admission(id(1)), Removal::WasCurrent);
        assert_eq!(orchestrator.admission().current(), Some(id(2)));
        assert_eq!(journal.started(), vec![id(1), id(2)]);
        assert_eq!(orchestrator.remove_before_admission(id(9)), Removal::Absent);
    }

    #[test]
    fn refused_start_moves_on_to_the_next_download() {
        let (mut runtime, journal) = FakeRuntime::new();
        runtime.refuse(id(1));
        let (mut orchestrator, _events) = orchestrator(runtime);
        orchestrator.add(descriptor(1));
        orchestrator.add(descriptor(2));

        assert_eq!(orchestrator.state_of(id(1)), None);
        assert_eq!(orchestrator.admission().current(), Some(id(2)));
        assert_eq!(journal.started(), vec![id(2)]);
    }

    #[test]
    fn scan_diff_drives_add_and_remove() {
        let (runtime, journal) = FakeRuntime::new();
        let (mut orchestrator, _events) = orchestrator(runtime);
        let scanner = ScriptedScanner::new(vec![
            (vec![descriptor(1), descriptor(2)], vec![]),
            (vec![], vec![id(1), id(2)]),
        ]);
        orchestrator.scanner = Box::new(scanner);

        orchestrator.scan();
        assert_eq!(orchestrator.len(), 2);
        assert_eq!(orchestrator.state_of(id(1)), Some(RecordState::Active));

        orchestrator.scan();
        assert!(orchestrator.is_empty());
        assert_eq!(journal.shutdowns(), vec![id(1)]);
        assert!(orchestrator.admission().is_consistent());
        assert_eq!(orchestrator.admission().current(), None);
        assert_eq!(journal.started(), vec![id(1)]);
    }

    #[test]
    fn reload_isolates_per_download_failures() {
        let (mut runtime, journal) = FakeRuntime::new();
        runtime.reject_options_for(id(1));
        let (mut orchestrator, _events) = orchestrator(runtime);
        orchestrator.add(descriptor(1));
        orchestrator.on_started(id(1));
        orchestrator.add(descriptor(2));
        orchestrator.on_started(id(2));

        let mut settings = orchestrator.settings().clone();
        settings.min_peers = 5;
        settings.scan_interval_secs = 90;
        let report = orchestrator.reload_config(settings);
        let Ok(report) = report else {
            panic!("reload failed: {report:?}");
        };

        assert_eq!(report.failures, 1);
        assert_eq!(report.changed, vec!["min_peers".to_string(), "scan_interval_secs".to_string()]);
        assert_eq!(journal.options(), vec![(id(2), "min_peers".to_string(), json!(5))]);
        assert_eq!(orchestrator.settings().scan_interval_secs, 90);
    }

    #[test]
    fn failure_stops_tracking_and_frees_admission() {
        let (runtime, journal) = FakeRuntime::new();
        let (mut orchestrator, _events) = orchestrator(runtime);
        orchestrator.add(descriptor(1));
        orchestrator.add(descriptor(2));

        let failed = posted(
            &orchestrator,
            SupervisorEvent::Failed {
                id: id(1),
                external: false,
            },
        );
        orchestrator.handle_event(failed, Instant::now());
        assert_eq!(orchestrator.state_of(id(1)), None);
        assert_eq!(orchestrator.admission().current(), Some(id(2)));
        assert_eq!(journal.started(), vec![id(1), id(2)]);

        let exception = posted(
            &orchestrator,
            SupervisorEvent::Exception {
                id: id(2),
                text: "tracker said no".into(),
            },
        );
        orchestrator.handle_event(exception, Instant::now());
        assert_eq!(orchestrator.state_of(id(2)), Some(RecordState::Active));
    }

    #[test]
    fn duplicates_merge_into_the_original() {
        let (runtime, journal) = FakeRuntime::new();
        let (mut orchestrator, _events) = orchestrator(runtime);
        orchestrator.start_download(ConsumerId::new("a"), descriptor(1));
        orchestrator.on_started(id(1));
        orchestrator.start_download(ConsumerId::new("b"), descriptor(2));

        orchestrator.duplicate(id(1), id(2));
        assert_eq!(orchestrator.state_of(id(2)), None);
        assert_eq!(
            orchestrator.consumers_of(id(1)),
            vec![ConsumerId::new("a"), ConsumerId::new("b")]
        );
        assert_eq!(journal.shutdowns(), vec![id(2)]);
        assert_eq!(orchestrator.admission().current(), None);
    }

    #[test]
    fn duplicate_of_a_vanished_original_is_restarted() {
        let (runtime, journal) = FakeRuntime::new();
        let (mut orchestrator, _events) = orchestrator(runtime);
        orchestrator.add(descriptor(2));
        orchestrator.on_started(id(2));

        orchestrator.duplicate(id(1), id(2));
        assert_eq!(orchestrator.state_of(id(2)), Some(RecordState::Active));
        assert_eq!(journal.started(), vec![id(2), id(2)]);
        assert_eq!(journal.shutdowns(), vec![id(2)]);
        assert_eq!(orchestrator.admission().current(), Some(id(2)));
    }

    #[test]
    fn consumers_pause_resume_and_stop() {
        let (runtime, journal) = FakeRuntime::new();
        let (mut orchestrator, _events) = orchestrator(runtime);
        let consumer = ConsumerId::new("item-7");

        orchestrator.start_download(consumer.clone(), descriptor(7));
        orchestrator.on_started(id(7));
        assert!(orchestrator.pause_download(&consumer));
        assert_eq!(orchestrator.state_of(id(7)), Some(RecordState::Paused));
        let paused = orchestrator.download_status(&consumer, Utc::now());
        assert_eq!(
            paused.map(|row| row.status.state),
            Some(DownloadState::Paused)
        );

        orchestrator.start_download(consumer.clone(), descriptor(7));
        assert_eq!(orchestrator.state_of(id(7)), Some(RecordState::Active));
        assert_eq!(journal.started(), vec![id(7), id(7)]);

        assert!(orchestrator.stop_download(&consumer));
        assert_eq!(orchestrator.state_of(id(7)), None);
        assert!(!orchestrator.stop_download(&consumer));
        assert_eq!(journal.shutdowns(), vec![id(7), id(7)]);
    }

    #[test]
    fn runtime_results_reach_only_active_handles() {
        let (runtime, journal) = FakeRuntime::new();
        let (mut orchestrator, _events) = orchestrator(runtime);
        orchestrator.add(descriptor(1));
        let message = RuntimeMessage::VerificationFinished { bytes_present: 10 };

        let active = posted(
            &orchestrator,
            SupervisorEvent::Runtime {
                id: id(1),
                message: message.clone(),
            },
        );
        let unknown = posted(
            &orchestrator,
            SupervisorEvent::Runtime {
                id: id(5),
                message,
            },
        );
        orchestrator.handle_event(active, Instant::now());
        orchestrator.handle_event(unknown, Instant::now());
        assert_eq!(journal.deliveries(), vec![id(1)]);
    }

    #[test]
    fn results_from_a_replaced_handle_are_dropped() {
        let (mut runtime, journal) = FakeRuntime::new();
        runtime.verify_on_start();
        let (mut orchestrator, mut events) = orchestrator(runtime);
        let consumer = ConsumerId::new("item-1");

        orchestrator.start_download(consumer.clone(), descriptor(1));
        let Ok(first) = events.try_recv() else {
            panic!("first start posted no verification result");
        };
        assert!(orchestrator.pause_download(&consumer));
        orchestrator.start_download(consumer, descriptor(1));
        let Ok(second) = events.try_recv() else {
            panic!("restart posted no verification result");
        };
        orchestrator.add(descriptor(3));

        orchestrator.handle_event(first.clone(), Instant::now());
        orchestrator.handle_event(
            SupervisorEnvelope {
                generation: first.generation,
                event: SupervisorEvent::Failed {
                    id: id(1),
                    external: false,
                },
            },
            Instant::now(),
        );
        assert!(journal.deliveries().is_empty());
        assert!(events.try_recv().is_err());
        assert_eq!(orchestrator.state_of(id(1)), Some(RecordState::Active));
        assert_eq!(orchestrator.admission().current(), Some(id(1)));
        assert_eq!(journal.started(), vec![id(1), id(1)]);

        orchestrator.handle_event(second, Instant::now());
        let Ok(started) = events.try_recv() else {
            panic!("verification did not report the download as started");
        };
        orchestrator.handle_event(started, Instant::now());
        assert_eq!(journal.deliveries(), vec![id(1)]);
        assert_eq!(orchestrator.admission().current(), Some(id(3)));
        assert_eq!(journal.started(), vec![id(1), id(1), id(3)]);
    }

    #[test]
    fn watched_descriptor_outlives_its_last_consumer() {
        let (runtime, _journal) = FakeRuntime::new();
        let (mut orchestrator, _events) = orchestrator(runtime);
        orchestrator.scanner = Box::new(ScriptedScanner::new(vec![
            (vec![watched(1)], vec![]),
            (vec![], vec![id(1)]),
        ]));
        let consumer = ConsumerId::new("item-1");

        orchestrator.start_download(consumer.clone(), descriptor(1));
        orchestrator.scan();
        assert!(orchestrator.stop_download(&consumer));
        assert_eq!(orchestrator.state_of(id(1)), Some(RecordState::Active));

        orchestrator.scan();
        assert_eq!(orchestrator.state_of(id(1)), None);
    }

    #[tokio::test]
    async fn removed_descriptor_is_reported_to_its_consumers() -> anyhow::Result<()> {
        let (runtime, journal) = FakeRuntime::new();
        let (mut orchestrator, _events) = orchestrator(runtime);
        orchestrator.scanner = Box::new(ScriptedScanner::new(vec![
            (vec![watched(1)], vec![]),
            (vec![], vec![id(1)]),
        ]));
        let (sender, mut app_rx) = connected_app();
        orchestrator.attach(sender);
        let consumer = ConsumerId::new("item-1");

        orchestrator.scan();
        orchestrator.start_download(consumer.clone(), descriptor(1));
        orchestrator.scan();
        assert!(orchestrator.is_empty());
        assert_eq!(journal.shutdowns(), vec![id(1)]);

        let Some(frame) = app_rx.recv().await else {
            anyhow::bail!("no error reported");
        };
        let Decoded::Known(command) = decode(&frame)? else {
            anyhow::bail!("unexpected kind");
        };
        let CommandPayload::DownloaderError {
            consumer: reported,
            content_id,
            message,
        } = command.payload
        else {
            anyhow::bail!("unexpected payload");
        };
        assert_eq!(reported, Some(consumer));
        assert_eq!(content_id, Some(id(1)));
        assert_eq!(message, "descriptor removed");
        Ok(())
    }

    #[test]
    fn stats_render_active_downloads_only() {
        let (runtime, _journal) = FakeRuntime::new();
        let (mut orchestrator, _events) = orchestrator(runtime);
        orchestrator.add(descriptor(1));
        orchestrator.add(descriptor(2));
        assert_eq!(orchestrator.stats(Utc::now()), RenderControl::Continue);

        orchestrator.shutdown_downloads();
        assert!(orchestrator.is_empty());
        assert_eq!(orchestrator.admission().current(), None);
    }
}
