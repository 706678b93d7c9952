//! Error types for tracker communication.

use thiserror::Error;

/// Tracker responses that cannot be used.
#[derive(Debug, Error)]
pub enum ResponseError {
    /// Body was not a bencoded response dictionary.
    #[error("tracker response is not valid bencode")]
    Bencode(#[from] serde_bencode::Error),
    /// Neither a peer list nor a failure reason was present.
    #[error("tracker response has no peer list")]
    MissingPeers,
    /// The peer list had an unusable shape.
    #[error("tracker peer list is malformed")]
    MalformedPeers,
}

/// Failures while talking to a tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Announce URL could not be built.
    #[error("invalid tracker url")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Source parse error.
        source: url::ParseError,
    },
    /// HTTP client could not be configured.
    #[error("failed to build tracker http client")]
    Client {
        /// Source client error.
        source: reqwest::Error,
    },
    /// Request failed in transit.
    #[error("tracker request failed")]
    Request {
        /// Source request error.
        source: reqwest::Error,
    },
    /// Tracker answered with a non-success HTTP status.
    #[error("tracker returned an error status")]
    Status {
        /// HTTP status code.
        status: u16,
    },
}

/// Convenience alias for tracker results.
pub type TrackerResult<T> = Result<T, TrackerError>;
