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

//! Tracker rerequest protocol.
//!
//! Layout: `rerequester.rs` (announce state machine, driven by the owning
//! scheduler), `backoff.rs`, `query.rs` (announce URL building),
//! `response.rs` (tracker response decoding), `client.rs`
//! (HTTP round trip, run on worker tasks).

pub mod backoff;
pub mod client;
pub mod error;
pub mod query;
pub mod rerequester;
pub mod response;

pub use backoff::{BASE_FAIL_WAIT, Backoff};
pub use client::TrackerClient;
pub use error::{ResponseError, TrackerError, TrackerResult};
pub use query::{AnnounceEvent, AnnounceQuery};
pub use rerequester::{
    AnnounceOutcome, AnnounceRequest, Phase, Rerequester, RerequesterConfig, STALL_WARNING,
    SwarmHooks,
};
pub use response::{AnnounceSuccess, PeerAddr, TrackerResponse, parse_response};
