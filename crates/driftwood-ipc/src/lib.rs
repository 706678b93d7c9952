#![forbid(unsafe_code)]
#![warn(
    unused,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]

//! Cross-process command channel.
//!
//! Layout: `command.rs` (typed envelope), `wire.rs` (versioned JSON codec),
//! `dispatch.rs` (kind→handler table), `channel.rs` (framed transport and
//! sender), `workers.rs` (short-lived worker tasks with a deadline join),
//! `shutdown.rs` (both sides of the shutdown handshake).

pub mod channel;
pub mod command;
pub mod dispatch;
pub mod error;
pub mod shutdown;
pub mod wire;
pub mod workers;

pub use channel::{
    CommandSender, MAX_FRAME_LEN, Receipt, TransportTasks, read_frame, spawn_transport,
    write_frame,
};
pub use command::{Command, CommandId, CommandKind, CommandPayload, PROTOCOL_VERSION, StatusUpdate};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::{ChannelError, ChannelResult, WireError, WireResult};
pub use shutdown::{ShutdownOutcome, acknowledge_shutdown, request_shutdown};
pub use wire::{Decoded, WIRE_VERSION, decode, encode};
pub use workers::{JoinReport, ShutdownSignal, WorkerSet};
