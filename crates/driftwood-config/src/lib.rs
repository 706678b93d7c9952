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

//! File-backed configuration for the Driftwood daemon.
//!
//! Layout: `model.rs` (typed settings), `validate.rs` (per-option parsing,
//! diffing, scoping), `store.rs` (`ConfigStore` + `FileConfigStore`).

mod defaults;
pub mod error;
pub mod model;
pub mod store;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use model::{SettingChange, Settings};
pub use store::{CONFIG_PATH_ENV, ConfigStore, DEFAULT_CONFIG_PATH, FileConfigStore};
pub use validate::{apply_option, diff, is_download_scoped};
