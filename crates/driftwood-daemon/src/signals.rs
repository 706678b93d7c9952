//! Process signals, forwarded to the scheduler queue.

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Signal delivered to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// Re-read the configuration (SIGHUP).
    Reload,
    /// Shut down (Ctrl-C).
    Interrupt,
}

/// Start listening for process signals.
///
/// Listeners that cannot be installed are logged and skipped; the returned
/// queue then simply never yields that signal.
#[must_use]
pub fn spawn_signal_listener() -> mpsc::UnboundedReceiver<DaemonSignal> {
    let (tx, rx) = mpsc::unbounded_channel();

    let interrupt = tx.clone();
    tokio::spawn(async move {
        loop {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "interrupt handler unavailable");
                return;
            }
            if interrupt.send(DaemonSignal::Interrupt).is_err() {
                return;
            }
        }
    });

    spawn_reload_listener(tx);
    rx
}

#[cfg(unix)]
fn spawn_reload_listener(tx: mpsc::UnboundedSender<DaemonSignal>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(err) => {
            warn!(error = %err, "reload signal handler unavailable");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            debug!("reload signal received");
            if tx.send(DaemonSignal::Reload).is_err() {
                return;
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(tx: mpsc::UnboundedSender<DaemonSignal>) {
    drop(tx);
    debug!("reload signal not available on this platform");
}
