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

//! Driftwood download daemon.
//!
//! Layout: `scan.rs` (watch-directory diffing), `admission.rs` (single-flight
//! verification queue), `orchestrator.rs` (download lifecycle), `runtime.rs`
//! (tracker-backed downloads), `render.rs` (status rows), `handlers.rs`
//! (command handlers), `signals.rs` (process signals), `bootstrap.rs`
//! (wiring and the scheduler loop).

pub mod admission;
pub mod bootstrap;
pub mod error;
pub mod handlers;
pub mod orchestrator;
pub mod render;
pub mod runtime;
pub mod scan;
pub mod signals;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionQueue, Removal};
pub use bootstrap::{DaemonChannels, run_daemon, serve};
pub use error::{DaemonError, DaemonResult};
pub use handlers::{DaemonContext, PendingWork, ShutdownRequest, daemon_dispatcher};
pub use orchestrator::{Orchestrator, OrchestratorDeps, RecordState, ReloadReport};
pub use render::{LogRenderer, RenderControl, StatusRenderer, UntilDoneRenderer};
pub use runtime::{PeerBook, TrackedDownload, TrackerRuntime};
pub use scan::{
    DescriptorParser, DirectoryScanner, JsonDescriptorParser, ScanCache, ScanDiff,
    WatchDirScanner,
};
pub use signals::{DaemonSignal, spawn_signal_listener};
