//! Error types for the command channel.

use std::io;

use thiserror::Error;

/// Failures while encoding or decoding a command.
#[derive(Debug, Error)]
pub enum WireError {
    /// Bytes were not a command document.
    #[error("malformed command frame")]
    Malformed {
        /// Source JSON error.
        source: serde_json::Error,
    },
    /// The kind is known but its arguments do not match.
    #[error("command arguments do not match kind")]
    Payload {
        /// Kind named on the wire.
        kind: String,
        /// Source JSON error.
        source: serde_json::Error,
    },
    /// A command could not be encoded.
    #[error("failed to encode command")]
    Encode {
        /// Source JSON error.
        source: serde_json::Error,
    },
}

/// Convenience alias for wire codec results.
pub type WireResult<T> = Result<T, WireError>;

/// Failures on the framed byte transport.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Reading or writing the stream failed.
    #[error("transport io failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Source IO error.
        source: io::Error,
    },
    /// Peer announced a frame beyond the size cap.
    #[error("frame exceeds size limit")]
    FrameTooLarge {
        /// Announced frame length.
        len: usize,
    },
}

/// Convenience alias for transport results.
pub type ChannelResult<T> = Result<T, ChannelError>;
