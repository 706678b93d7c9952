//! Tracker-backed download runtime.
//!
//! # Design
//! - `start` hands on-disk verification to a blocking worker and returns the
//!   handle immediately; the verification result comes back through the
//!   supervisor queue and only then is the download reported as started.
//! - After verification each download owns a [`Rerequester`] whose peer book
//!   collects announced peers. Announce round trips run on the shared
//!   [`WorkerSet`] and post their raw result back to the scheduler.
//! - Two downloads never share a target path: a start whose target is held
//!   by another live download is reported as a duplicate of it and skips
//!   verification.
//! - Peer-wire transfer is not part of this runtime; transfer counters stay at
//!   zero and the peer book only records addresses.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use driftwood_config::{ConfigError, Settings, apply_option, is_download_scoped};
use driftwood_core::{
    ContentId, Descriptor, DownloadError, DownloadHandle, DownloadResult, DownloadRuntime,
    DownloadState, RecentError, RuntimeMessage, StatusSnapshot, Supervisor,
};
use driftwood_ipc::WorkerSet;
use driftwood_tracker::{
    AnnounceOutcome, AnnounceRequest, PeerAddr, Rerequester, RerequesterConfig, SwarmHooks,
    TrackerClient,
};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::Value;
use tokio::task::JoinError;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Client prefix of every generated peer id.
pub const PEER_ID_PREFIX: &[u8; 8] = b"-DW0100-";

/// Starts [`TrackedDownload`]s whose background work runs on a shared worker set.
#[derive(Debug, Clone)]
pub struct TrackerRuntime {
    workers: WorkerSet,
    claims: TargetClaims,
}

impl TrackerRuntime {
    /// Runtime spawning its verification and announce work on `workers`.
    #[must_use]
    pub fn new(workers: WorkerSet) -> Self {
        Self {
            workers,
            claims: TargetClaims::default(),
        }
    }
}

/// Which live download owns each target path.
#[derive(Debug, Clone, Default)]
struct TargetClaims(Arc<Mutex<HashMap<PathBuf, ContentId>>>);

impl TargetClaims {
    /// Claim `target` for `id`, or name the download already holding it.
    fn claim(&self, target: &Path, id: ContentId) -> Option<ContentId> {
        let Ok(mut claims) = self.0.lock() else {
            return None;
        };
        match claims.get(target) {
            Some(owner) if *owner != id => Some(*owner),
            _ => {
                claims.insert(target.to_path_buf(), id);
                None
            }
        }
    }

    fn release(&self, target: &Path, id: ContentId) {
        if let Ok(mut claims) = self.0.lock()
            && claims.get(target) == Some(&id)
        {
            claims.remove(target);
        }
    }
}

impl DownloadRuntime for TrackerRuntime {
    type Config = Settings;

    fn start(
        &mut self,
        descriptor: Descriptor,
        config: &Settings,
        supervisor: Supervisor,
        target: PathBuf,
    ) -> DownloadResult<Box<dyn DownloadHandle>> {
        let content_id = descriptor.id;
        let client = tracker_client(config).map_err(|err| DownloadError::StartFailed {
            content_id,
            source: Box::new(err),
        })?;

        let download = TrackedDownload {
            descriptor,
            settings: config.clone(),
            supervisor: supervisor.clone(),
            workers: self.workers.clone(),
            claims: self.claims.clone(),
            target: target.clone(),
            client,
            peer_id: fresh_peer_id(),
            state: DownloadState::Verifying,
            bytes_present: 0,
            rerequester: None,
            last_error: None,
        };

        if let Some(original) = self.claims.claim(&target, content_id) {
            info!(
                content_id = %content_id.short(),
                original = %original.short(),
                target = %target.display(),
                "target already served by another download"
            );
            supervisor.duplicate(original);
            return Ok(Box::new(download));
        }

        let length = download.descriptor.length;
        let verify_target = target.clone();
        let spawned = self.workers.spawn("verify", move |_stop| async move {
            let joined =
                tokio::task::spawn_blocking(move || bytes_present(&verify_target, length)).await;
            let bytes_present = verified_bytes(content_id, joined);
            supervisor.deliver(RuntimeMessage::VerificationFinished { bytes_present });
        });
        if !spawned {
            self.claims.release(&target, content_id);
            return Err(DownloadError::StartFailed {
                content_id,
                source: "worker set closed".into(),
            });
        }

        debug!(content_id = %content_id.short(), target = %target.display(), "verification started");
        Ok(Box::new(download))
    }
}

/// Peers announced for one download.
#[derive(Debug, Default)]
pub struct PeerBook {
    peers: HashSet<PeerAddr>,
    left: u64,
}

impl PeerBook {
    /// Empty book for a download still missing `left` bytes.
    #[must_use]
    pub fn new(left: u64) -> Self {
        Self {
            peers: HashSet::new(),
            left,
        }
    }

    /// Number of distinct peers seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer was announced yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl SwarmHooks for PeerBook {
    fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn ever_got_incoming(&self) -> bool {
        false
    }

    fn amount_left(&self) -> u64 {
        self.left
    }

    fn uploaded(&self) -> u64 {
        0
    }

    fn downloaded(&self) -> u64 {
        0
    }

    fn connect(&mut self, peers: Vec<PeerAddr>) {
        self.peers.extend(peers);
    }
}

/// Running download that keeps a tracker announcing for it.
pub struct TrackedDownload {
    descriptor: Descriptor,
    settings: Settings,
    supervisor: Supervisor,
    workers: WorkerSet,
    claims: TargetClaims,
    target: PathBuf,
    client: TrackerClient,
    peer_id: [u8; 20],
    state: DownloadState,
    bytes_present: u64,
    rerequester: Option<Rerequester<PeerBook>>,
    last_error: Option<RecentError>,
}

impl TrackedDownload {
    fn verified(&mut self, bytes_present: u64, now: Instant) {
        if self.state != DownloadState::Verifying {
            return;
        }
        self.bytes_present = bytes_present.min(self.descriptor.length);
        let left = self.descriptor.length - self.bytes_present;
        self.state = if left == 0 {
            DownloadState::Seeding
        } else {
            DownloadState::Downloading
        };
        self.rerequester = Some(Rerequester::new(
            self.descriptor.announce.clone(),
            *self.descriptor.id.as_bytes(),
            self.peer_id,
            self.settings.listen_port,
            rerequester_config(&self.settings),
            PeerBook::new(left),
        ));
        info!(
            content_id = %self.descriptor.id.short(),
            bytes_present = self.bytes_present,
            state = self.state.as_str(),
            "verification finished"
        );
        self.supervisor.started();
        self.poll(now);
    }

    fn announced(&mut self, identity: [u8; 20], body: Result<Vec<u8>, String>, now: Instant) {
        let Some(rerequester) = self.rerequester.as_mut() else {
            return;
        };
        let content_id = self.descriptor.id.short();
        match rerequester.handle_outcome(identity, body, now) {
            AnnounceOutcome::Success { peers, warning } => {
                if let Some(warning) = warning {
                    warn!(content_id = %content_id, warning = %warning, "tracker warning");
                }
                debug!(content_id = %content_id, peers, "announce succeeded");
            }
            AnnounceOutcome::Failed { message } => {
                debug!(content_id = %content_id, error = %message, "announce failed");
            }
            AnnounceOutcome::Fatal { reason } => {
                self.abort(reason);
                return;
            }
            AnnounceOutcome::Ignored => trace!(content_id = %content_id, "stale announce result"),
        }
        self.poll(now);
    }

    fn abort(&mut self, reason: String) {
        warn!(content_id = %self.descriptor.id.short(), reason = %reason, "tracker rejected download");
        if let Some(mut rerequester) = self.rerequester.take() {
            rerequester.cleanup();
        }
        self.state = DownloadState::Failed;
        self.last_error = Some(RecentError {
            message: reason.clone(),
            at: Utc::now(),
        });
        self.supervisor.exception(reason);
        self.supervisor.failed(false);
    }

    fn spawn_announce(&self, request: AnnounceRequest, last_word: bool) {
        let AnnounceRequest {
            url,
            identity,
            event,
        } = request;
        let client = self.client.clone();
        let supervisor = self.supervisor.clone();
        trace!(content_id = %self.descriptor.id.short(), event = ?event, "announcing");
        let spawned = self.workers.spawn("announce", move |mut stop| async move {
            let result = if last_word {
                client.announce(&url).await
            } else {
                tokio::select! {
                    result = client.announce(&url) => result,
                    () = stop.wait() => return,
                }
            };
            let body = result.map_err(|err| describe(&err));
            supervisor.deliver(RuntimeMessage::AnnounceFinished { identity, body });
        });
        if !spawned {
            debug!(content_id = %self.descriptor.id.short(), "announce skipped; shutting down");
        }
    }
}

impl DownloadHandle for TrackedDownload {
    fn shutdown(&mut self) {
        if matches!(self.state, DownloadState::Stopped) {
            return;
        }
        self.state = DownloadState::Stopped;
        self.claims.release(&self.target, self.descriptor.id);
        if let Some(mut rerequester) = self.rerequester.take()
            && let Some(request) = rerequester.announce_stop(Instant::now())
        {
            self.spawn_announce(request, true);
        }
        debug!(content_id = %self.descriptor.id.short(), "download shut down");
    }

    fn set_option(&mut self, name: &str, value: &Value) -> DownloadResult<()> {
        if !is_download_scoped(name) {
            return Err(DownloadError::UnknownOption {
                name: name.to_string(),
            });
        }
        let mut next = self.settings.clone();
        apply_option(&mut next, name, value).map_err(|err| option_error(name, err))?;

        match name {
            "tracker_timeout_secs" | "tracker_proxy" => {
                self.client = tracker_client(&next).map_err(|_| DownloadError::InvalidOption {
                    name: name.to_string(),
                    reason: "tracker_client",
                })?;
            }
            "listen_port" => {
                if let Some(rerequester) = self.rerequester.as_mut() {
                    rerequester.change_identity(self.peer_id, next.listen_port);
                }
            }
            _ => {}
        }
        self.settings = next;
        if let Some(rerequester) = self.rerequester.as_mut() {
            rerequester.set_config(rerequester_config(&self.settings));
        }
        Ok(())
    }

    fn status(&self) -> StatusSnapshot {
        let length = self.descriptor.length;
        #[allow(clippy::cast_precision_loss)]
        let fraction_done = if length == 0 {
            1.0
        } else {
            self.bytes_present as f64 / length as f64
        };
        let peers = self
            .rerequester
            .as_ref()
            .and_then(Rerequester::hooks)
            .map_or(0, PeerBook::len);
        StatusSnapshot {
            state: self.state,
            fraction_done,
            peers: u32::try_from(peers).unwrap_or(u32::MAX),
            eta_seconds: (self.state == DownloadState::Seeding).then_some(0),
            last_error: self.last_error.clone(),
            ..StatusSnapshot::default()
        }
    }

    fn poll(&mut self, now: Instant) {
        if !matches!(
            self.state,
            DownloadState::Downloading | DownloadState::Seeding
        ) {
            return;
        }
        let request = self
            .rerequester
            .as_mut()
            .and_then(|rerequester| rerequester.check(now));
        if let Some(request) = request {
            self.spawn_announce(request, false);
        }
    }

    fn deliver(&mut self, message: RuntimeMessage, now: Instant) {
        match message {
            RuntimeMessage::VerificationFinished { bytes_present } => {
                self.verified(bytes_present, now);
            }
            RuntimeMessage::AnnounceFinished { identity, body } => {
                self.announced(identity, body, now);
            }
        }
    }
}

fn tracker_client(settings: &Settings) -> driftwood_tracker::TrackerResult<TrackerClient> {
    TrackerClient::new(
        Duration::from_secs(settings.tracker_timeout_secs),
        settings.tracker_proxy.as_deref(),
    )
}

fn rerequester_config(settings: &Settings) -> RerequesterConfig {
    RerequesterConfig {
        min_peers: settings.min_peers,
        max_initiate: settings.max_initiate,
        rerequest_interval: Duration::from_secs(settings.rerequest_interval_secs),
        min_interval_floor: Duration::from_secs(settings.min_interval_floor_secs),
        announce_interval: Duration::from_secs(settings.announce_interval_secs),
        max_retry_interval: Duration::from_secs(settings.max_announce_retry_interval_secs),
        keep_token_multiplier: settings.keep_token_multiplier,
        ip: settings.ip.clone(),
    }
}

fn option_error(name: &str, err: ConfigError) -> DownloadError {
    match err {
        ConfigError::UnknownField { .. } => DownloadError::UnknownOption {
            name: name.to_string(),
        },
        ConfigError::InvalidField { reason, .. } => DownloadError::InvalidOption {
            name: name.to_string(),
            reason,
        },
        ConfigError::Io { .. } | ConfigError::Json { .. } => DownloadError::InvalidOption {
            name: name.to_string(),
            reason: "unusable",
        },
    }
}

/// Outcome of a verification task; a task that died counts as nothing present.
fn verified_bytes(content_id: ContentId, joined: Result<u64, JoinError>) -> u64 {
    joined.unwrap_or_else(|err| {
        warn!(
            content_id = %content_id.short(),
            error = %err,
            "verification task failed; assuming no data present"
        );
        0
    })
}

/// Bytes already on disk under `target`, capped at `length`.
fn bytes_present(target: &Path, length: u64) -> u64 {
    let total: u64 = WalkDir::new(target)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum();
    total.min(length)
}

fn fresh_peer_id() -> [u8; 20] {
    let mut id = [0_u8; 20];
    id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::rng();
    for slot in &mut id[PEER_ID_PREFIX.len()..] {
        *slot = rng.sample(Alphanumeric);
    }
    id
}

fn describe(err: &dyn Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftwood_core::{SupervisorEnvelope, SupervisorEvent};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn descriptor(length: u64) -> Descriptor {
        Descriptor {
            id: ContentId::from_bytes([6; 20]),
            name: "show".into(),
            length,
            announce: "http://127.0.0.1:9/announce".into(),
            source: None,
        }
    }

    #[test]
    fn peer_ids_carry_the_client_prefix() {
        let first = fresh_peer_id();
        let second = fresh_peer_id();
        assert_eq!(&first[..8], PEER_ID_PREFIX);
        assert!(first[8..].iter().all(u8::is_ascii_alphanumeric));
        assert_ne!(first, second);
    }

    #[test]
    fn present_bytes_are_summed_and_capped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a.bin"), vec![0_u8; 300])?;
        std::fs::create_dir(dir.path().join("nested"))?;
        std::fs::write(dir.path().join("nested/b.bin"), vec![0_u8; 200])?;

        assert_eq!(bytes_present(dir.path(), 10_000), 500);
        assert_eq!(bytes_present(dir.path(), 450), 450);
        assert_eq!(bytes_present(&dir.path().join("a.bin"), 10_000), 300);
        assert_eq!(bytes_present(&dir.path().join("missing"), 10_000), 0);
        Ok(())
    }

    #[tokio::test]
    async fn verification_result_starts_the_download() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("part"), vec![1_u8; 512])?;
        let workers = WorkerSet::new();
        let mut runtime = TrackerRuntime::new(workers.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let descriptor = descriptor(1024);
        let supervisor = Supervisor::new(descriptor.id, 1, tx);

        let mut handle = runtime.start(
            descriptor,
            &Settings::default(),
            supervisor,
            dir.path().to_path_buf(),
        )?;
        assert_eq!(handle.status().state, DownloadState::Verifying);

        let Some(SupervisorEvent::Runtime { message, .. }) = rx.recv().await.map(|posted| posted.event)
        else {
            anyhow::bail!("expected a verification result");
        };
        assert_eq!(
            message,
            RuntimeMessage::VerificationFinished { bytes_present: 512 }
        );
        handle.deliver(message, Instant::now());

        let status = handle.status();
        assert_eq!(status.state, DownloadState::Downloading);
        assert!((status.fraction_done - 0.5).abs() < f64::EPSILON);
        assert!(matches!(
            rx.recv().await.map(|posted| posted.event),
            Some(SupervisorEvent::Started { .. })
        ));

        handle.shutdown();
        assert_eq!(handle.status().state, DownloadState::Stopped);
        workers.close();
        let _ = workers.join_with_deadline(Duration::from_millis(200)).await;
        Ok(())
    }

    #[tokio::test]
    async fn second_download_into_a_held_target_is_a_duplicate() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let workers = WorkerSet::new();
        let mut runtime = TrackerRuntime::new(workers.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let settings = Settings::default();
        let original = descriptor(1024);
        let copy = Descriptor {
            id: ContentId::from_bytes([8; 20]),
            ..original.clone()
        };
        let target = dir.path().to_path_buf();

        let mut first = runtime.start(
            original.clone(),
            &settings,
            Supervisor::new(original.id, 1, tx.clone()),
            target.clone(),
        )?;
        let mut second = runtime.start(
            copy.clone(),
            &settings,
            Supervisor::new(copy.id, 2, tx.clone()),
            target.clone(),
        )?;
        assert_eq!(
            rx.try_recv().ok(),
            Some(SupervisorEnvelope {
                generation: 2,
                event: SupervisorEvent::Duplicate {
                    original: original.id,
                    duplicate: copy.id,
                },
            })
        );
        assert_eq!(second.status().state, DownloadState::Verifying);

        second.shutdown();
        assert_eq!(runtime.claims.claim(&target, copy.id), Some(original.id));
        first.shutdown();
        let _restarted = runtime.start(
            copy.clone(),
            &settings,
            Supervisor::new(copy.id, 3, tx),
            target,
        )?;
        assert!(rx.try_recv().is_err());

        workers.close();
        let _ = workers.join_with_deadline(Duration::from_millis(200)).await;
        Ok(())
    }

    #[tokio::test]
    async fn failed_verification_task_counts_as_nothing_present() {
        let id = ContentId::from_bytes([6; 20]);
        let joined = tokio::task::spawn_blocking(|| -> u64 { panic!("disk read failed") }).await;
        assert!(joined.is_err());
        assert_eq!(verified_bytes(id, joined), 0);
        assert_eq!(verified_bytes(id, Ok(77)), 77);
    }

    #[tokio::test]
    async fn options_are_validated_and_scoped() -> anyhow::Result<()> {
        let workers = WorkerSet::new();
        let mut runtime = TrackerRuntime::new(workers.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let descriptor = descriptor(1024);
        let supervisor = Supervisor::new(descriptor.id, 1, tx);
        let mut handle = runtime.start(
            descriptor,
            &Settings::default(),
            supervisor,
            PathBuf::from("/nonexistent/driftwood"),
        )?;

        handle.set_option("min_peers", &json!(3))?;
        handle.set_option("listen_port", &json!(7000))?;
        assert!(matches!(
            handle.set_option("scan_interval_secs", &json!(10)),
            Err(DownloadError::UnknownOption { .. })
        ));
        assert!(matches!(
            handle.set_option("min_peers", &json!("many")),
            Err(DownloadError::InvalidOption { .. })
        ));
        workers.close();
        Ok(())
    }

    #[tokio::test]
    async fn closed_worker_set_refuses_new_downloads() {
        let workers = WorkerSet::new();
        workers.close();
        let mut runtime = TrackerRuntime::new(workers);
        let (tx, _rx) = mpsc::unbounded_channel();
        let descriptor = descriptor(1);
        let supervisor = Supervisor::new(descriptor.id, 1, tx);
        let started = runtime.start(
            descriptor,
            &Settings::default(),
            supervisor,
            PathBuf::from("unused"),
        );
        assert!(matches!(started, Err(DownloadError::StartFailed { .. })));
    }

    #[test]
    fn error_descriptions_include_sources() {
        let err = ConfigError::Io {
            operation: "read",
            path: PathBuf::from("x"),
            source: std::io::Error::other("disk gone"),
        };
        assert_eq!(describe(&err), "filesystem operation failed: disk gone");
    }
}
