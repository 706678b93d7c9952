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

//! Download domain types and runtime collaborator traits.
//!
//! Layout: `model/` (content ids, descriptors, status snapshots), `service/`
//! (download runtime and supervisor hand-off), `error.rs`.

pub mod error;
pub mod model;
pub mod service;

pub use error::{DownloadError, DownloadResult};
pub use model::{
    CONTENT_ID_LEN, ConsumerId, ContentId, Descriptor, DownloadState, RecentError, StatusSnapshot,
};
pub use service::{
    DownloadHandle, DownloadRuntime, RuntimeMessage, Supervisor, SupervisorEnvelope,
    SupervisorEvent,
};
