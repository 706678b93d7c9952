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

//! Binary entrypoint for the Driftwood daemon.

use driftwood_daemon::{DaemonResult, run_daemon};

/// Boots the daemon and blocks until it has shut down.
#[tokio::main]
async fn main() -> DaemonResult<()> {
    run_daemon().await
}
