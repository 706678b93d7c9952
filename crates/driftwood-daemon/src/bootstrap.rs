//! Daemon wiring and the scheduler loop.
//!
//! # Design
//! - One task owns the orchestrator. Connections, inbound frames, supervisor
//!   events, timers and signals are all queues drained by a single `select!`.
//! - Handlers only record asynchronous follow-ups; the loop runs them between
//!   turns so no handler ever awaits.
//! - A shutdown, whether requested by the application or local, runs the same
//!   sequence: stop downloads, join workers with a deadline, acknowledge.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use driftwood_config::{ConfigStore, FileConfigStore, Settings};
use driftwood_core::{DownloadRuntime, SupervisorEnvelope};
use driftwood_ipc::{
    Command, CommandPayload, CommandSender, JoinReport, WorkerSet, acknowledge_shutdown,
};
use driftwood_telemetry::{GlobalContextGuard, LogFormat, LoggingConfig, init_logging};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::handlers::{DaemonContext, ShutdownRequest, daemon_dispatcher};
use crate::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::render::{LogRenderer, RenderControl, StatusRenderer, UntilDoneRenderer};
use crate::runtime::TrackerRuntime;
use crate::scan::WatchDirScanner;
use crate::signals::{DaemonSignal, spawn_signal_listener};

/// Environment flag selecting until-done mode.
pub const UNTIL_DONE_ENV: &str = "DRIFTWOOD_UNTIL_DONE";
/// Command-line flag selecting until-done mode.
pub const UNTIL_DONE_FLAG: &str = "--until-done";

/// Queues the scheduler loop drains.
pub struct DaemonChannels {
    /// Newly connected applications.
    pub connections: mpsc::UnboundedReceiver<CommandSender>,
    /// Raw frames from every connection.
    pub inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Supervisor callbacks and worker results.
    pub events: mpsc::UnboundedReceiver<SupervisorEnvelope>,
    /// Process signals.
    pub signals: mpsc::UnboundedReceiver<DaemonSignal>,
}

/// Entry point for the daemon boot sequence.
///
/// # Errors
///
/// Returns an error if configuration, logging or the control socket cannot be
/// set up.
pub async fn run_daemon() -> DaemonResult<()> {
    let store = FileConfigStore::from_env();
    let settings = store
        .load()
        .await
        .map_err(|err| DaemonError::config("config.load", err))?;

    init_logging(&LoggingConfig {
        level: &settings.log_level,
        format: LogFormat::from_config_value(settings.log_format.as_deref()),
        build_id: env!("CARGO_PKG_VERSION"),
    })
    .map_err(|err| DaemonError::telemetry("telemetry.init", err))?;
    let _context = GlobalContextGuard::new("daemon");

    info!(
        config = %store.path().display(),
        watch_dir = %settings.watch_dir.display(),
        download_dir = %settings.download_dir.display(),
        "driftwood daemon starting"
    );

    driftwood_tracker::TrackerClient::new(
        Duration::from_secs(settings.tracker_timeout_secs),
        settings.tracker_proxy.as_deref(),
    )
    .map_err(|err| DaemonError::tracker("tracker.client.new", err))?;

    let workers = WorkerSet::new();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (connections_tx, connections) = mpsc::unbounded_channel();

    let listener = spawn_listener(&settings.socket_path, inbound_tx, connections_tx)?;
    let signals = spawn_signal_listener();

    let orchestrator = Orchestrator::new(OrchestratorDeps {
        runtime: TrackerRuntime::new(workers.clone()),
        scanner: Box::new(WatchDirScanner::default()),
        renderer: select_renderer(until_done_requested()),
        settings,
        events: events_tx,
    });

    let report = serve(
        orchestrator,
        &store,
        &workers,
        DaemonChannels {
            connections,
            inbound,
            events,
            signals,
        },
    )
    .await;

    listener.abort();
    info!(
        finished = report.finished,
        abandoned = report.abandoned,
        "driftwood daemon stopped"
    );
    Ok(())
}

/// Run the scheduler loop until a shutdown completes.
pub async fn serve<R, S>(
    orchestrator: Orchestrator<R>,
    store: &S,
    workers: &WorkerSet,
    mut channels: DaemonChannels,
) -> JoinReport
where
    R: DownloadRuntime<Config = Settings> + 'static,
    S: ConfigStore + ?Sized,
{
    let dispatcher = daemon_dispatcher::<R>();
    let mut ctx = DaemonContext::new(orchestrator);
    let mut timers = Timers::new(ctx.orchestrator.settings());

    loop {
        tokio::select! {
            biased;
            Some(sender) = channels.connections.recv() => {
                info!("application connected");
                ctx.orchestrator.attach(sender);
            }
            Some(frame) = channels.inbound.recv() => {
                dispatcher.dispatch(&mut ctx, &frame);
            }
            Some(event) = channels.events.recv() => {
                ctx.orchestrator.handle_event(event, Instant::now());
            }
            Some(signal) = channels.signals.recv() => match signal {
                DaemonSignal::Reload => {
                    info!("reload signal received");
                    dispatcher.dispatch_command(&mut ctx, Command::new(CommandPayload::ReloadConfig));
                }
                DaemonSignal::Interrupt => {
                    info!("interrupt received");
                    ctx.pending.request_shutdown(ShutdownRequest::Local);
                }
            },
            _ = timers.scan.tick() => ctx.orchestrator.scan(),
            _ = timers.stats.tick() => {
                if ctx.orchestrator.stats(Utc::now()) == RenderControl::Stop {
                    ctx.pending.request_shutdown(ShutdownRequest::Local);
                }
            }
            _ = timers.announce.tick() => ctx.orchestrator.tick(Instant::now()),
        }

        persist_updates(&mut ctx, store).await;
        if std::mem::take(&mut ctx.pending.reload) {
            reload(&mut ctx, store, &mut timers).await;
        }
        if let Some(request) = ctx.pending.shutdown.take() {
            return shut_down(&mut ctx, &request, workers).await;
        }
    }
}

struct Timers {
    scan: Interval,
    stats: Interval,
    announce: Interval,
}

impl Timers {
    fn new(settings: &Settings) -> Self {
        Self {
            scan: ticker(settings.scan_interval()),
            stats: ticker(settings.display_interval()),
            announce: ticker(settings.announce_tick()),
        }
    }

    fn periods(settings: &Settings) -> [Duration; 3] {
        [
            settings.scan_interval(),
            settings.display_interval(),
            settings.announce_tick(),
        ]
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn persist_updates<R, S>(ctx: &mut DaemonContext<R>, store: &S)
where
    R: DownloadRuntime<Config = Settings>,
    S: ConfigStore + ?Sized,
{
    for update in std::mem::take(&mut ctx.pending.config_updates) {
        match store.set(&update.key, update.value.clone()).await {
            Ok(()) => {
                info!(option = %update.key, "option persisted");
                ctx.pending.reload = true;
            }
            Err(err) => {
                warn!(option = %update.key, error = %err, detail = ?err, "option rejected");
                ctx.orchestrator
                    .send(&update.request.reply(CommandPayload::DownloaderError {
                        consumer: None,
                        content_id: None,
                        message: format!("option {} rejected: {err}", update.key),
                    }));
            }
        }
    }
}

async fn reload<R, S>(ctx: &mut DaemonContext<R>, store: &S, timers: &mut Timers)
where
    R: DownloadRuntime<Config = Settings>,
    S: ConfigStore + ?Sized,
{
    let settings = match store.load().await {
        Ok(settings) => settings,
        Err(err) => {
            warn!(error = %err, detail = ?err, "configuration reload failed; keeping current settings");
            return;
        }
    };
    let before = Timers::periods(ctx.orchestrator.settings());
    match ctx.orchestrator.reload_config(settings) {
        Ok(report) => {
            if !report.changed.is_empty() {
                debug!(changed = ?report.changed, "options changed");
            }
        }
        Err(err) => {
            warn!(error = %err, detail = ?err, "configuration reload failed; keeping current settings");
            return;
        }
    }
    if Timers::periods(ctx.orchestrator.settings()) != before {
        *timers = Timers::new(ctx.orchestrator.settings());
        debug!("scheduler intervals rebuilt");
    }
}

async fn shut_down<R>(
    ctx: &mut DaemonContext<R>,
    request: &ShutdownRequest,
    workers: &WorkerSet,
) -> JoinReport
where
    R: DownloadRuntime<Config = Settings>,
{
    info!("daemon shutting down");
    ctx.orchestrator.shutdown_downloads();
    let deadline = ctx.orchestrator.settings().shutdown_deadline();
    match ctx.orchestrator.detach() {
        Some(sender) => acknowledge_shutdown(request.command(), workers, &sender, deadline).await,
        None => {
            workers.close();
            workers.join_with_deadline(deadline).await
        }
    }
}

fn until_done_requested() -> bool {
    std::env::args().skip(1).any(|arg| arg == UNTIL_DONE_FLAG)
        || env_flag_value(std::env::var(UNTIL_DONE_ENV).ok().as_deref())
}

fn env_flag_value(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn select_renderer(until_done: bool) -> Box<dyn StatusRenderer> {
    if until_done {
        info!("until-done mode: exiting once every download is complete");
        Box::new(UntilDoneRenderer::default())
    } else {
        Box::new(LogRenderer)
    }
}

#[cfg(unix)]
fn prepare_listener(path: &Path) -> DaemonResult<tokio::net::UnixListener> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|err| DaemonError::io("socket.create_dir", Some(parent.to_path_buf()), err))?;
    }
    if std::fs::symlink_metadata(path).is_ok() {
        std::fs::remove_file(path)
            .map_err(|err| DaemonError::io("socket.remove_stale", Some(path.to_path_buf()), err))?;
    }
    tokio::net::UnixListener::bind(path)
        .map_err(|err| DaemonError::io("socket.bind", Some(path.to_path_buf()), err))
}

#[cfg(unix)]
fn spawn_listener(
    path: &Path,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    connections: mpsc::UnboundedSender<CommandSender>,
) -> DaemonResult<tokio::task::JoinHandle<()>> {
    let listener = prepare_listener(path)?;
    info!(socket = %path.display(), "control socket listening");
    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let (reader, writer) = stream.into_split();
                    let (sender, _tasks) =
                        driftwood_ipc::spawn_transport(reader, writer, inbound.clone());
                    if connections.send(sender).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "control socket accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_listener(
    path: &Path,
    _inbound: mpsc::UnboundedSender<Vec<u8>>,
    _connections: mpsc::UnboundedSender<CommandSender>,
) -> DaemonResult<tokio::task::JoinHandle<()>> {
    warn!(socket = %path.display(), "control socket unsupported on this platform");
    Ok(tokio::spawn(async {}))
}
