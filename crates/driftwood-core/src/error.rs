//! Error types for download runtime operations.

use std::error::Error;

use thiserror::Error;

use crate::model::ContentId;

/// Primary error type for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Content identifier was not 40 hexadecimal characters.
    #[error("invalid content identifier")]
    InvalidContentId {
        /// Offending input.
        value: String,
    },
    /// Option name is not understood by the download.
    #[error("unknown download option")]
    UnknownOption {
        /// Option name supplied by the caller.
        name: String,
    },
    /// Option value had the wrong shape or range.
    #[error("invalid download option value")]
    InvalidOption {
        /// Option name supplied by the caller.
        name: String,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// Runtime refused to start the download.
    #[error("download could not be started")]
    StartFailed {
        /// Content identifier of the rejected download.
        content_id: ContentId,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

/// Convenience alias for download operation results.
pub type DownloadResult<T> = Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn messages_stay_constant_and_sources_are_kept() {
        let err = DownloadError::StartFailed {
            content_id: ContentId::from_bytes([7; 20]),
            source: Box::new(io::Error::other("disk gone")),
        };
        assert_eq!(err.to_string(), "download could not be started");
        assert!(err.source().is_some());

        let err = DownloadError::UnknownOption {
            name: "turbo".into(),
        };
        assert_eq!(err.to_string(), "unknown download option");
    }
}
