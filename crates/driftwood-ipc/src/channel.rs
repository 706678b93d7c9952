//! Length-prefixed framing, the non-blocking sender and transport tasks.
//!
//! # Design
//! - A frame is a 4-byte big-endian length followed by a JSON command body.
//! - Reader and writer run as their own tasks; the reader hands every frame to
//!   an inbound queue drained by the owning scheduler.
//! - Sending never blocks and never fails the caller. A gone peer means the
//!   message is lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::command::Command;
use crate::error::{ChannelError, ChannelResult};
use crate::wire::encode;

/// Largest frame body accepted or produced.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Read one frame. `Ok(None)` means the peer closed at a frame boundary.
///
/// # Errors
///
/// Returns an error on IO failure, on EOF inside a frame, or when the peer
/// announces a frame larger than [`MAX_FRAME_LEN`].
pub async fn read_frame<R>(reader: &mut R) -> ChannelResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0_u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(source) => {
            return Err(ChannelError::Io {
                operation: "channel.read_header",
                source,
            });
        }
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge { len });
    }
    let mut body = vec![0_u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|source| ChannelError::Io {
            operation: "channel.read_body",
            source,
        })?;
    Ok(Some(body))
}

/// Write one frame and flush it.
///
/// # Errors
///
/// Returns an error on IO failure or when `body` exceeds [`MAX_FRAME_LEN`].
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> ChannelResult<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or(ChannelError::FrameTooLarge { len: body.len() })?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(io_error("channel.write_header"))?;
    writer
        .write_all(body)
        .await
        .map_err(io_error("channel.write_body"))?;
    writer.flush().await.map_err(io_error("channel.flush"))
}

fn io_error(operation: &'static str) -> impl FnOnce(std::io::Error) -> ChannelError {
    move |source| ChannelError::Io { operation, source }
}

struct Outbound {
    frame: Vec<u8>,
    receipt: Option<oneshot::Sender<()>>,
}

/// Resolves once a frame has been written and flushed, or its transport is gone.
#[derive(Debug)]
pub struct Receipt(Option<oneshot::Receiver<()>>);

impl Receipt {
    /// Wait for delivery. Returns `true` if the frame reached the stream.
    pub async fn wait(self) -> bool {
        match self.0 {
            Some(rx) => rx.await.is_ok(),
            None => false,
        }
    }
}

/// Cloneable, non-blocking handle for sending commands to the peer process.
#[derive(Debug, Clone)]
pub struct CommandSender {
    outbound: mpsc::UnboundedSender<Outbound>,
    closing: Arc<AtomicBool>,
}

impl CommandSender {
    /// Queue `command` for delivery. Returns `false` when it was dropped
    /// because the channel is shutting down, the transport is gone or the
    /// command could not be encoded.
    pub fn send(&self, command: &Command) -> bool {
        self.enqueue(command, None)
    }

    /// Queue `command` and obtain a delivery [`Receipt`].
    pub fn send_with_receipt(&self, command: &Command) -> Receipt {
        let (tx, rx) = oneshot::channel();
        if self.enqueue(command, Some(tx)) {
            Receipt(Some(rx))
        } else {
            Receipt(None)
        }
    }

    /// Enter the shutting-down state; later sends are dropped silently.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Whether [`CommandSender::close`] has been called.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn enqueue(&self, command: &Command, receipt: Option<oneshot::Sender<()>>) -> bool {
        if self.is_closing() {
            trace!(command_id = %command.id, kind = %command.kind(), "channel closing; send dropped");
            return false;
        }
        let frame = match encode(command) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(command_id = %command.id, kind = %command.kind(), error = %err, "failed to encode command");
                return false;
            }
        };
        if command.spammy {
            trace!(command_id = %command.id, kind = %command.kind(), "sending command");
        } else {
            debug!(command_id = %command.id, kind = %command.kind(), "sending command");
        }
        self.outbound.send(Outbound { frame, receipt }).is_ok()
    }
}

/// Reader and writer task handles of one transport.
#[derive(Debug)]
pub struct TransportTasks {
    /// Task forwarding inbound frames.
    pub reader: JoinHandle<()>,
    /// Task writing outbound frames.
    pub writer: JoinHandle<()>,
}

impl TransportTasks {
    /// Stop both tasks immediately.
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Start transport tasks over a split byte stream.
///
/// Inbound frames are pushed to `inbound`; the reader stops at EOF, on a
/// transport error, or once `inbound` is dropped.
pub fn spawn_transport<R, W>(
    mut reader: R,
    mut writer: W,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
) -> (CommandSender, TransportTasks)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if inbound.send(frame).is_err() {
                        debug!("inbound queue closed; reader stopping");
                        break;
                    }
                }
                Ok(None) => {
                    debug!("peer closed command channel");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, detail = ?err, "command channel read failed");
                    break;
                }
            }
        }
    });

    let writer_task = tokio::spawn(async move {
        let mut broken = false;
        while let Some(Outbound { frame, receipt }) = outbound_rx.recv().await {
            if broken {
                trace!("transport gone; message lost");
                continue;
            }
            match write_frame(&mut writer, &frame).await {
                Ok(()) => {
                    if let Some(receipt) = receipt {
                        let _ = receipt.send(());
                    }
                }
                Err(err) => {
                    warn!(error = %err, "command channel write failed; message lost");
                    broken = true;
                }
            }
        }
    });

    let sender = CommandSender {
        outbound,
        closing: Arc::new(AtomicBool::new(false)),
    };
    (
        sender,
        TransportTasks {
            reader: reader_task,
            writer: writer_task,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPayload;
    use crate::wire::{Decoded, decode};

    #[tokio::test]
    async fn frames_round_trip_and_eof_is_clean() -> anyhow::Result<()> {
        let (mut left, mut right) = tokio::io::duplex(1024);
        write_frame(&mut left, b"hello").await?;
        drop(left);
        assert_eq!(read_frame(&mut right).await?, Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut right).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() -> anyhow::Result<()> {
        let (mut left, mut right) = tokio::io::duplex(64);
        left.write_all(&u32::MAX.to_be_bytes()).await?;
        assert!(matches!(
            read_frame(&mut right).await,
            Err(ChannelError::FrameTooLarge { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn sends_after_close_are_dropped() -> anyhow::Result<()> {
        let (stream, peer) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(stream);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let (sender, tasks) = spawn_transport(read_half, write_half, inbound_tx);

        let receipt = sender.send_with_receipt(&Command::new(CommandPayload::ReloadConfig));
        assert!(receipt.wait().await);
        sender.close();
        assert!(!sender.send(&Command::new(CommandPayload::ReloadConfig)));
        assert!(!sender
            .send_with_receipt(&Command::new(CommandPayload::ShutdownAck))
            .wait()
            .await);

        let (mut peer_read, _peer_write) = tokio::io::split(peer);
        let frame = read_frame(&mut peer_read).await?;
        let Some(frame) = frame else {
            anyhow::bail!("expected a frame");
        };
        assert!(matches!(decode(&frame)?, Decoded::Known(_)));
        tasks.abort();
        Ok(())
    }

    #[tokio::test]
    async fn lost_peer_never_fails_the_sender() {
        let (stream, peer) = tokio::io::duplex(64);
        drop(peer);
        let (read_half, write_half) = tokio::io::split(stream);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let (sender, tasks) = spawn_transport(read_half, write_half, inbound_tx);
        let receipt = sender.send_with_receipt(&Command::new(CommandPayload::Shutdown));
        assert!(!receipt.wait().await);
        sender.send(&Command::new(CommandPayload::Shutdown));
        tasks.abort();
    }
}
