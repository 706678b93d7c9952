//! Command handlers of the daemon side of the channel.
//!
//! Handlers run synchronously on the scheduler. Anything that needs to await
//! (persisting an option, reloading from the store, the shutdown handshake)
//! is recorded in [`PendingWork`] and picked up by the scheduler loop right
//! after dispatch.

use anyhow::anyhow;
use chrono::Utc;
use driftwood_config::Settings;
use driftwood_core::DownloadRuntime;
use driftwood_ipc::{Command, CommandKind, CommandPayload, Dispatcher, PROTOCOL_VERSION};
use tracing::{info, warn};

use crate::orchestrator::Orchestrator;

/// Why the daemon is shutting down.
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownRequest {
    /// The application sent `Shutdown`.
    Remote(Command),
    /// Interrupt signal or a finished until-done run.
    Local,
}

impl ShutdownRequest {
    /// Command the ack answers, if any.
    #[must_use]
    pub const fn command(&self) -> Option<&Command> {
        match self {
            Self::Remote(command) => Some(command),
            Self::Local => None,
        }
    }
}

/// Option update waiting to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigUpdate {
    /// Command that asked for it.
    pub request: Command,
    /// Option name.
    pub key: String,
    /// New value.
    pub value: serde_json::Value,
}

/// Asynchronous follow-ups recorded by handlers.
#[derive(Debug, Default)]
pub struct PendingWork {
    /// Shutdown to run; later requests do not replace the first.
    pub shutdown: Option<ShutdownRequest>,
    /// Re-read the configuration store.
    pub reload: bool,
    /// Options to persist, in arrival order.
    pub config_updates: Vec<ConfigUpdate>,
}

impl PendingWork {
    /// Record a shutdown unless one is already pending.
    pub fn request_shutdown(&mut self, request: ShutdownRequest) {
        if self.shutdown.is_none() {
            self.shutdown = Some(request);
        }
    }
}

/// State the daemon's handlers operate on.
pub struct DaemonContext<R> {
    /// Download orchestrator.
    pub orchestrator: Orchestrator<R>,
    /// Work for the scheduler loop.
    pub pending: PendingWork,
}

impl<R> DaemonContext<R> {
    /// Context around `orchestrator` with nothing pending.
    #[must_use]
    pub fn new(orchestrator: Orchestrator<R>) -> Self {
        Self {
            orchestrator,
            pending: PendingWork::default(),
        }
    }
}

/// Handler table for commands the application sends to the daemon.
///
/// Status, error, duplicate and ack kinds flow the other way and are left
/// unregistered, so receiving one is logged and ignored.
#[must_use]
pub fn daemon_dispatcher<R>() -> Dispatcher<DaemonContext<R>>
where
    R: DownloadRuntime<Config = Settings> + 'static,
{
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .register(CommandKind::Hello, |ctx: &mut DaemonContext<R>, command| {
            let CommandPayload::Hello { version } = &command.payload else {
                return Err(anyhow!("payload does not match hello"));
            };
            let version = *version;
            if version != PROTOCOL_VERSION {
                warn!(peer = version, local = PROTOCOL_VERSION, "protocol version differs");
            }
            info!(peer = version, "application said hello");
            ctx.orchestrator.send(&command.reply(CommandPayload::Hello {
                version: PROTOCOL_VERSION,
            }));
            Ok(())
        })
        .register(CommandKind::StartDownload, |ctx, command| {
            let CommandPayload::StartDownload {
                consumer,
                descriptor,
            } = command.payload
            else {
                return Err(anyhow!("payload does not match start_download"));
            };
            ctx.orchestrator.start_download(consumer, descriptor);
            Ok(())
        })
        .register(CommandKind::PauseDownload, |ctx, command| {
            let CommandPayload::PauseDownload { consumer } = &command.payload else {
                return Err(anyhow!("payload does not match pause_download"));
            };
            if !ctx.orchestrator.pause_download(consumer) {
                unknown_consumer(ctx, &command, consumer);
            }
            Ok(())
        })
        .register(CommandKind::StopDownload, |ctx, command| {
            let CommandPayload::StopDownload { consumer } = &command.payload else {
                return Err(anyhow!("payload does not match stop_download"));
            };
            if !ctx.orchestrator.stop_download(consumer) {
                unknown_consumer(ctx, &command, consumer);
            }
            Ok(())
        })
        .register(CommandKind::GetDownloadStatus, |ctx, command| {
            let CommandPayload::GetDownloadStatus { consumer } = &command.payload else {
                return Err(anyhow!("payload does not match get_download_status"));
            };
            match ctx.orchestrator.download_status(consumer, Utc::now()) {
                Some(update) => ctx.orchestrator.send(
                    &command.reply(CommandPayload::UpdateDownloadStatus { update }),
                ),
                None => unknown_consumer(ctx, &command, consumer),
            }
            Ok(())
        })
        .register(CommandKind::UpdateConfig, |ctx, command| {
            let CommandPayload::UpdateConfig { key, value } = &command.payload else {
                return Err(anyhow!("payload does not match update_config"));
            };
            ctx.pending.config_updates.push(ConfigUpdate {
                key: key.clone(),
                value: value.clone(),
                request: command,
            });
            Ok(())
        })
        .register(CommandKind::ReloadConfig, |ctx, _command| {
            ctx.pending.reload = true;
            Ok(())
        })
        .register(CommandKind::Shutdown, |ctx, command| {
            info!(command_id = %command.id, "shutdown requested by application");
            ctx.pending
                .request_shutdown(ShutdownRequest::Remote(command));
            Ok(())
        });
    dispatcher
}

fn unknown_consumer<R>(
    ctx: &DaemonContext<R>,
    command: &Command,
    consumer: &driftwood_core::ConsumerId,
) where
    R: DownloadRuntime<Config = Settings>,
{
    ctx.orchestrator
        .send(&command.reply(CommandPayload::DownloaderError {
            consumer: Some(consumer.clone()),
            content_id: None,
            message: "no download for consumer".into(),
        }));
}
