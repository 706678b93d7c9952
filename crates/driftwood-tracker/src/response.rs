//! Tracker announce response decoding.

use std::net::Ipv4Addr;

use serde::Deserialize;

use crate::error::ResponseError;

/// Peer address announced by a tracker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

/// Successful announce.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnnounceSuccess {
    /// Server-advertised re-announce interval in seconds.
    pub interval: Option<u64>,
    /// Server-advertised minimum interval in seconds.
    pub min_interval: Option<u64>,
    /// Tracker session token.
    pub tracker_id: Option<String>,
    /// Continuation token.
    pub last: Option<String>,
    /// Returned peers.
    pub peers: Vec<PeerAddr>,
    /// Warning text, logged only.
    pub warning: Option<String>,
    /// Reported swarm size.
    pub num_peers: Option<u64>,
    /// Reported count of peers holding everything.
    pub done_peers: Option<u64>,
}

/// Decoded tracker response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerResponse {
    /// The tracker rejected the announce.
    Failure {
        /// Reason given by the tracker.
        reason: String,
    },
    /// The tracker accepted the announce.
    Success(AnnounceSuccess),
}

/// Wire shape of an announce response. Every key is optional so a bare
/// failure dictionary decodes too.
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(rename = "warning message", default)]
    warning_message: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(rename = "min interval", default)]
    min_interval: Option<u64>,
    #[serde(rename = "tracker id", default)]
    tracker_id: Option<String>,
    #[serde(default)]
    last: Option<Continuation>,
    #[serde(default)]
    complete: Option<u64>,
    #[serde(default)]
    incomplete: Option<u64>,
    #[serde(rename = "num peers", default)]
    num_peers: Option<u64>,
    #[serde(rename = "done peers", default)]
    done_peers: Option<u64>,
    #[serde(default)]
    peers: Option<Peers>,
}

/// Trackers send the continuation token as either an integer or a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Continuation {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(#[serde(with = "serde_bytes")] Vec<u8>),
    Dicts(Vec<PeerDict>),
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

/// Decode a tracker response body.
///
/// # Errors
///
/// Returns an error for undecodable bodies and for responses that carry
/// neither a failure reason nor a usable peer list.
pub fn parse_response(body: &[u8]) -> Result<TrackerResponse, ResponseError> {
    let raw: RawResponse = serde_bencode::from_bytes(body)?;

    if let Some(reason) = raw.failure_reason {
        return Ok(TrackerResponse::Failure { reason });
    }

    let peers = match raw.peers.ok_or(ResponseError::MissingPeers)? {
        Peers::Compact(compact) => compact_peers(&compact)?,
        Peers::Dicts(entries) => entries
            .into_iter()
            .map(|entry| PeerAddr {
                host: entry.ip,
                port: entry.port,
            })
            .collect(),
    };

    let num_peers = raw.num_peers.or_else(|| {
        raw.complete
            .zip(raw.incomplete)
            .map(|(done, rest)| done.saturating_add(rest))
    });

    Ok(TrackerResponse::Success(AnnounceSuccess {
        interval: raw.interval,
        min_interval: raw.min_interval,
        tracker_id: raw.tracker_id,
        last: raw.last.map(|last| match last {
            Continuation::Number(number) => number.to_string(),
            Continuation::Text(text) => text,
        }),
        peers,
        warning: raw.warning_message,
        num_peers,
        done_peers: raw.done_peers.or(raw.complete),
    }))
}

fn compact_peers(compact: &[u8]) -> Result<Vec<PeerAddr>, ResponseError> {
    if compact.len() % 6 != 0 {
        return Err(ResponseError::MalformedPeers);
    }
    Ok(compact
        .chunks_exact(6)
        .map(|chunk| PeerAddr {
            host: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]).to_string(),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_success_is_decoded() -> Result<(), ResponseError> {
        let mut body = b"d8:completei3e10:incompletei7e8:intervali900e12:min intervali60e5:peers12:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1, 192, 168, 1, 2, 0x00, 0x50]);
        body.extend_from_slice(b"10:tracker id3:abc15:warning message4:slowe");
        let TrackerResponse::Success(success) = parse_response(&body)? else {
            return Err(ResponseError::MissingPeers);
        };
        assert_eq!(success.interval, Some(900));
        assert_eq!(success.min_interval, Some(60));
        assert_eq!(success.tracker_id.as_deref(), Some("abc"));
        assert_eq!(success.warning.as_deref(), Some("slow"));
        assert_eq!(success.num_peers, Some(10));
        assert_eq!(success.done_peers, Some(3));
        assert_eq!(
            success.peers,
            vec![
                PeerAddr {
                    host: "10.0.0.1".into(),
                    port: 6881
                },
                PeerAddr {
                    host: "192.168.1.2".into(),
                    port: 80
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn dictionary_peers_and_integer_last() -> Result<(), ResponseError> {
        let body = b"d4:lasti42e9:num peersi50e5:peersld2:ip9:peer.test7:peer id20:aaaaaaaaaaaaaaaaaaaa4:porti51413eeee";
        let TrackerResponse::Success(success) = parse_response(body)? else {
            return Err(ResponseError::MissingPeers);
        };
        assert_eq!(success.last.as_deref(), Some("42"));
        assert_eq!(success.num_peers, Some(50));
        assert_eq!(success.done_peers, None);
        assert_eq!(
            success.peers,
            vec![PeerAddr {
                host: "peer.test".into(),
                port: 51413
            }]
        );
        Ok(())
    }

    #[test]
    fn text_last_is_kept_verbatim() -> Result<(), ResponseError> {
        let TrackerResponse::Success(success) = parse_response(b"d4:last5:page25:peers0:e")? else {
            return Err(ResponseError::MissingPeers);
        };
        assert_eq!(success.last.as_deref(), Some("page2"));
        assert!(success.peers.is_empty());
        Ok(())
    }

    #[test]
    fn failure_reason_wins_over_missing_peers() -> Result<(), ResponseError> {
        assert_eq!(
            parse_response(b"d14:failure reason12:unregisterede")?,
            TrackerResponse::Failure {
                reason: "unregistered".into()
            }
        );
        Ok(())
    }

    #[test]
    fn unusable_responses_are_errors() {
        assert!(matches!(
            parse_response(b"d8:intervali60ee"),
            Err(ResponseError::MissingPeers)
        ));
        assert!(matches!(
            parse_response(b"d5:peers5:abcdee"),
            Err(ResponseError::MalformedPeers)
        ));
        assert!(matches!(
            parse_response(b"<html>"),
            Err(ResponseError::Bencode(_))
        ));
        assert!(parse_response(b"li1ee").is_err());
    }
}
