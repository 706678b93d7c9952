//! Both sides of the shutdown handshake.
//!
//! The receiving side stops admitting work, signals workers, joins them with a
//! deadline, sends `ShutdownAck` and returns only after the ack was flushed
//! (or the transport is gone). The initiating side waits a bounded time for
//! the matching ack.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::channel::CommandSender;
use crate::command::{Command, CommandKind, CommandPayload};
use crate::wire::{Decoded, decode};
use crate::workers::{JoinReport, WorkerSet};

/// Grace period for flushing the ack after workers were joined.
const ACK_FLUSH_GRACE: Duration = Duration::from_millis(500);

/// How a [`request_shutdown`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The peer answered with a matching `ShutdownAck`.
    Acknowledged,
    /// No ack arrived in time.
    TimedOut,
    /// The inbound queue closed before an ack arrived.
    ChannelClosed,
}

/// Run the receiving side of the handshake for `request`.
///
/// `request` is `None` for a locally initiated shutdown (Ctrl-C); the ack is
/// still sent so a connected peer is not left waiting.
pub async fn acknowledge_shutdown(
    request: Option<&Command>,
    workers: &WorkerSet,
    sender: &CommandSender,
    deadline: Duration,
) -> JoinReport {
    workers.close();
    let report = workers.join_with_deadline(deadline).await;
    info!(
        finished = report.finished,
        abandoned = report.abandoned,
        "workers joined for shutdown"
    );

    let ack = match request {
        Some(request) => request.reply(CommandPayload::ShutdownAck),
        None => Command::new(CommandPayload::ShutdownAck),
    }
    .with_result(serde_json::json!({
        "finished": report.finished,
        "abandoned": report.abandoned,
    }));
    let receipt = sender.send_with_receipt(&ack);
    sender.close();
    match tokio::time::timeout(ACK_FLUSH_GRACE, receipt.wait()).await {
        Ok(true) => debug!("shutdown ack delivered"),
        Ok(false) => debug!("shutdown ack lost; peer already gone"),
        Err(_) => warn!("shutdown ack not flushed within grace period"),
    }
    report
}

/// Ask the peer to shut down and wait up to `timeout` for its ack.
///
/// Frames other than the matching ack are dropped; the caller is exiting.
pub async fn request_shutdown(
    sender: &CommandSender,
    inbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    timeout: Duration,
) -> ShutdownOutcome {
    let request = Command::new(CommandPayload::Shutdown);
    sender.send(&request);
    let wait_for_ack = async {
        while let Some(frame) = inbound.recv().await {
            match decode(&frame) {
                Ok(Decoded::Known(reply))
                    if reply.kind() == CommandKind::ShutdownAck
                        && reply.in_reply_to == Some(request.id) =>
                {
                    return ShutdownOutcome::Acknowledged;
                }
                Ok(_) => trace!("dropping frame while waiting for shutdown ack"),
                Err(err) => debug!(error = %err, "dropping malformed frame during shutdown"),
            }
        }
        ShutdownOutcome::ChannelClosed
    };
    tokio::time::timeout(timeout, wait_for_ack)
        .await
        .unwrap_or(ShutdownOutcome::TimedOut)
}
