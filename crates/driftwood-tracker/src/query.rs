//! Announce URL construction.

use url::Url;
use url::form_urlencoded::byte_serialize;

use crate::error::{TrackerError, TrackerResult};

/// Event token attached to state-transition announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// First announce for an identity.
    Started,
    /// The download just finished.
    Completed,
    /// The identity is going away.
    Stopped,
}

impl AnnounceEvent {
    /// Query value of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }
}

/// Parameters of one announce.
#[derive(Debug, Clone)]
pub struct AnnounceQuery<'a> {
    /// Content infohash.
    pub info_hash: &'a [u8; 20],
    /// Local peer id.
    pub peer_id: &'a [u8; 20],
    /// Listening port.
    pub port: u16,
    /// Per-identity random key.
    pub key: &'a str,
    /// Bytes uploaded since the identity was adopted.
    pub uploaded: u64,
    /// Bytes downloaded since the identity was adopted.
    pub downloaded: u64,
    /// Bytes still missing.
    pub left: u64,
    /// Continuation token.
    pub last: Option<&'a str>,
    /// Tracker session token.
    pub tracker_id: Option<&'a str>,
    /// Ask for a compact peer list instead of `numwant=0`.
    pub want_peers: bool,
    /// Transition event.
    pub event: Option<AnnounceEvent>,
    /// Address to report instead of the connection's source address.
    pub ip: Option<&'a str>,
}

impl AnnounceQuery<'_> {
    /// Encoded query string, without a leading separator.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&key={}&uploaded={}&downloaded={}&left={}",
            percent(self.info_hash),
            percent(self.peer_id),
            self.port,
            percent(self.key.as_bytes()),
            self.uploaded,
            self.downloaded,
            self.left,
        );
        if let Some(last) = self.last {
            query.push_str("&last=");
            query.push_str(&percent(last.as_bytes()));
        }
        if let Some(tracker_id) = self.tracker_id {
            query.push_str("&trackerid=");
            query.push_str(&percent(tracker_id.as_bytes()));
        }
        if self.want_peers {
            query.push_str("&compact=1");
        } else {
            query.push_str("&numwant=0");
        }
        if let Some(ip) = self.ip {
            query.push_str("&ip=");
            query.push_str(&percent(ip.as_bytes()));
        }
        if let Some(event) = self.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }
        query
    }

    /// Full announce URL below `base`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::InvalidUrl`] if the result is not a valid URL.
    pub fn url(&self, base: &str) -> TrackerResult<String> {
        let separator = if base.contains('?') { '&' } else { '?' };
        let full = format!("{base}{separator}{}", self.encode());
        Url::parse(&full)
            .map(String::from)
            .map_err(|source| TrackerError::InvalidUrl { url: full, source })
    }
}

fn percent(bytes: &[u8]) -> String {
    byte_serialize(bytes).collect()
}
