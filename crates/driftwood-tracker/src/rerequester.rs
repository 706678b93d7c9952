//! Per-download tracker announce state machine.
//!
//! # Design
//! - The rerequester is sans-IO: [`Rerequester::check`] yields the next
//!   [`AnnounceRequest`], a worker performs the HTTP round trip, and the
//!   owning scheduler feeds the result back through
//!   [`Rerequester::handle_outcome`]. All state changes happen on the
//!   scheduler.
//! - The swarm is reached through [`SwarmHooks`], owned by the rerequester
//!   until [`Rerequester::cleanup`] hands them back.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::error::ResponseError;
use crate::query::{AnnounceEvent, AnnounceQuery};
use crate::response::{AnnounceSuccess, PeerAddr, TrackerResponse, parse_response};

/// How long an announce may be outstanding before a stall warning is logged.
pub const STALL_WARNING: Duration = Duration::from_secs(58);

/// Swarm size assumed when the tracker does not report one.
const DEFAULT_NUM_PEERS: u64 = 1000;

/// View of the swarm the rerequester announces for.
pub trait SwarmHooks {
    /// Peers currently known or connected.
    fn peer_count(&self) -> usize;
    /// Whether an inbound connection was ever accepted.
    fn ever_got_incoming(&self) -> bool;
    /// Bytes still missing.
    fn amount_left(&self) -> u64;
    /// Cumulative bytes uploaded.
    fn uploaded(&self) -> u64;
    /// Cumulative bytes downloaded.
    fn downloaded(&self) -> u64;
    /// Whether all content is present.
    fn is_complete(&self) -> bool {
        self.amount_left() == 0
    }
    /// Hand announced peers to the connector.
    fn connect(&mut self, peers: Vec<PeerAddr>);
    /// Called after every successful announce for the current identity.
    fn on_announce_success(&mut self) {}
}

/// Tunables shared by every rerequester of a process.
#[derive(Debug, Clone, PartialEq)]
pub struct RerequesterConfig {
    /// Peer count below which the swarm counts as quiet.
    pub min_peers: u32,
    /// Peer count at which no more peers are requested.
    pub max_initiate: u32,
    /// Minimum interval until the tracker advertises one.
    pub rerequest_interval: Duration,
    /// Lower clamp for a tracker-advertised minimum interval.
    pub min_interval_floor: Duration,
    /// Maximum interval until the tracker advertises one.
    pub announce_interval: Duration,
    /// Cap for the failure backoff.
    pub max_retry_interval: Duration,
    /// Continuation-token heuristic multiplier.
    pub keep_token_multiplier: f64,
    /// Address reported to the tracker.
    pub ip: Option<String>,
}

impl Default for RerequesterConfig {
    fn default() -> Self {
        Self {
            min_peers: 20,
            max_initiate: 40,
            rerequest_interval: Duration::from_secs(300),
            min_interval_floor: Duration::from_secs(30),
            announce_interval: Duration::from_secs(1800),
            max_retry_interval: Duration::from_secs(1800),
            keep_token_multiplier: 1.2,
            ip: None,
        }
    }
}

/// Visible state of the announce protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No identity has been announced.
    Idle,
    /// The `started` announce is outstanding or being retried.
    Started,
    /// Periodic announces without event.
    Steady,
    /// The one-shot `completed` announce is outstanding.
    Completing,
    /// The `stopped` announce for a retired identity is outstanding.
    Stopping,
}

/// Announce the caller must perform off the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    /// Full announce URL.
    pub url: String,
    /// Peer id the announce is sent with.
    pub identity: [u8; 20],
    /// Transition event, if any.
    pub event: Option<AnnounceEvent>,
}

/// What a finished announce did to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// Peers were merged; the tracker may have attached a warning.
    Success {
        /// Peers handed to the connector.
        peers: usize,
        /// Tracker warning text.
        warning: Option<String>,
    },
    /// Transport, protocol or rejection failure; backoff entered.
    Failed {
        /// Error text.
        message: String,
    },
    /// The tracker rejected an announce for an empty swarm.
    Fatal {
        /// Reason given by the tracker.
        reason: String,
    },
    /// Nothing was outstanding or the rerequester was cleaned up.
    Ignored,
}

#[derive(Debug, Clone)]
struct InFlight {
    identity: [u8; 20],
    event: Option<AnnounceEvent>,
    sent_at: Instant,
    warned: bool,
}

/// Announce state for one download.
pub struct Rerequester<H> {
    url: String,
    info_hash: [u8; 20],
    peer_id: Option<[u8; 20]>,
    port: u16,
    wanted_peer_id: [u8; 20],
    wanted_port: u16,
    key: String,
    last: Option<String>,
    tracker_id: Option<String>,
    min_interval: Duration,
    announce_interval: Duration,
    backoff: Backoff,
    retry_at: Option<Instant>,
    last_announce: Option<Instant>,
    in_flight: Option<InFlight>,
    previous_up: u64,
    previous_down: u64,
    finish_pending: bool,
    phase: Phase,
    config: RerequesterConfig,
    hooks: Option<H>,
    jitter: Box<dyn FnMut() -> f64 + Send>,
}

impl<H: SwarmHooks> Rerequester<H> {
    /// New rerequester in [`Phase::Idle`]; the first check announces `started`.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        port: u16,
        config: RerequesterConfig,
        hooks: H,
    ) -> Self {
        Self {
            url: url.into(),
            info_hash,
            peer_id: None,
            port,
            wanted_peer_id: peer_id,
            wanted_port: port,
            key: fresh_key(),
            last: None,
            tracker_id: None,
            min_interval: config.rerequest_interval,
            announce_interval: config.announce_interval,
            backoff: Backoff::new(config.max_retry_interval),
            retry_at: None,
            last_announce: None,
            in_flight: None,
            previous_up: 0,
            previous_down: 0,
            finish_pending: false,
            phase: Phase::Idle,
            config,
            hooks: Some(hooks),
            jitter: Box::new(rand::random::<f64>),
        }
    }

    /// Replace the jitter source used for backoff growth.
    #[must_use]
    pub fn with_jitter(mut self, jitter: impl FnMut() -> f64 + Send + 'static) -> Self {
        self.jitter = Box::new(jitter);
        self
    }

    /// Current protocol phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Current failure wait; `None` while healthy.
    #[must_use]
    pub const fn fail_wait(&self) -> Option<Duration> {
        self.backoff.current()
    }

    /// Whether an announce is outstanding.
    #[must_use]
    pub const fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Continuation token currently held.
    #[must_use]
    pub fn last_token(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// Effective minimum interval between announces.
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Swarm hooks, until cleanup.
    #[must_use]
    pub const fn hooks(&self) -> Option<&H> {
        self.hooks.as_ref()
    }

    /// Mutable swarm hooks, until cleanup.
    pub const fn hooks_mut(&mut self) -> Option<&mut H> {
        self.hooks.as_mut()
    }

    /// Swap in new tunables. Intervals already adopted from the tracker stay.
    pub fn set_config(&mut self, config: RerequesterConfig) {
        self.backoff.set_max(config.max_retry_interval);
        self.min_interval = self.min_interval.max(config.min_interval_floor);
        self.config = config;
    }

    /// Request an identity switch; the next check announces `stopped` for the
    /// old identity, then `started` for the new one.
    pub fn change_identity(&mut self, peer_id: [u8; 20], port: u16) {
        self.wanted_peer_id = peer_id;
        self.wanted_port = port;
    }

    /// Queue the one-shot `completed` announce.
    pub const fn announce_finish(&mut self) {
        self.finish_pending = true;
    }

    /// Decide whether to announce now.
    pub fn check(&mut self, now: Instant) -> Option<AnnounceRequest> {
        self.hooks.as_ref()?;
        if let Some(in_flight) = self.in_flight.as_mut() {
            if !in_flight.warned && now.duration_since(in_flight.sent_at) >= STALL_WARNING {
                in_flight.warned = true;
                warn!(url = %self.url, "tracker announce outstanding for 58 seconds");
            }
            return None;
        }
        if self.retry_at.is_some_and(|retry_at| now < retry_at) {
            return None;
        }

        let current = self.peer_id;
        match current {
            None => {
                self.peer_id = Some(self.wanted_peer_id);
                self.port = self.wanted_port;
                self.phase = Phase::Started;
                return self.announce(Some(AnnounceEvent::Started), now);
            }
            Some(current) if current != self.wanted_peer_id || self.port != self.wanted_port => {
                let request = self.announce(Some(AnnounceEvent::Stopped), now);
                self.retire_identity();
                return request;
            }
            Some(_) => {}
        }

        if self.finish_pending {
            self.finish_pending = false;
            self.phase = Phase::Completing;
            return self.announce(Some(AnnounceEvent::Completed), now);
        }

        if self.retry_at.is_some() {
            return self.announce(None, now);
        }

        let since_last = self
            .last_announce
            .map_or(Duration::MAX, |last| now.duration_since(last));
        if since_last < self.min_interval {
            return None;
        }
        if self.wants_more_peers() || since_last >= self.announce_interval {
            return self.announce(None, now);
        }
        None
    }

    /// Apply the result of the announce sent with `identity`.
    ///
    /// A result that does not belong to the request in flight is ignored and
    /// leaves that request outstanding.
    pub fn handle_outcome(
        &mut self,
        identity: [u8; 20],
        body: Result<Vec<u8>, String>,
        now: Instant,
    ) -> AnnounceOutcome {
        if self.hooks.is_none() {
            return AnnounceOutcome::Ignored;
        }
        let Some(in_flight) = self
            .in_flight
            .take_if(|in_flight| in_flight.identity == identity)
        else {
            if self.in_flight.is_some() {
                debug!(url = %self.url, "announce result for a different identity");
            }
            return AnnounceOutcome::Ignored;
        };
        self.last_announce = Some(now);

        let parsed = body.and_then(|bytes| {
            parse_response(&bytes).map_err(|err: ResponseError| err.to_string())
        });
        match parsed {
            Err(message) => {
                self.fail(&in_flight, now);
                AnnounceOutcome::Failed { message }
            }
            Ok(TrackerResponse::Failure { reason }) => {
                let swarm_empty = self.hooks.as_ref().is_some_and(|h| h.peer_count() == 0);
                self.fail(&in_flight, now);
                if swarm_empty {
                    AnnounceOutcome::Fatal { reason }
                } else {
                    AnnounceOutcome::Failed { message: reason }
                }
            }
            Ok(TrackerResponse::Success(success)) => self.succeed(&in_flight, success),
        }
    }

    /// Build a best-effort `stopped` announce for shutdown, then clean up.
    pub fn announce_stop(&mut self, now: Instant) -> Option<AnnounceRequest> {
        let request = if self.peer_id.is_some() {
            self.in_flight = None;
            self.announce(Some(AnnounceEvent::Stopped), now)
        } else {
            None
        };
        self.cleanup();
        request
    }

    /// Drop every outstanding request and hand back the swarm hooks. The
    /// rerequester is inert afterwards.
    pub fn cleanup(&mut self) -> Option<H> {
        self.in_flight = None;
        self.finish_pending = false;
        self.phase = Phase::Idle;
        self.hooks.take()
    }

    fn wants_more_peers(&self) -> bool {
        let Some(hooks) = self.hooks.as_ref() else {
            return false;
        };
        let peers = hooks.peer_count();
        let min_peers = self.config.min_peers as usize;
        if hooks.ever_got_incoming() {
            peers <= min_peers / 3
        } else {
            peers < min_peers
        }
    }

    fn announce(&mut self, event: Option<AnnounceEvent>, now: Instant) -> Option<AnnounceRequest> {
        let hooks = self.hooks.as_ref()?;
        let identity = self.peer_id?;
        let want_peers = event != Some(AnnounceEvent::Stopped)
            && hooks.peer_count() < self.config.max_initiate as usize;
        let query = AnnounceQuery {
            info_hash: &self.info_hash,
            peer_id: &identity,
            port: self.port,
            key: &self.key,
            uploaded: hooks.uploaded().saturating_sub(self.previous_up),
            downloaded: hooks.downloaded().saturating_sub(self.previous_down),
            left: hooks.amount_left(),
            last: self.last.as_deref(),
            tracker_id: self.tracker_id.as_deref(),
            want_peers,
            event,
            ip: self.config.ip.as_deref(),
        };
        let url = match query.url(&self.url) {
            Ok(url) => url,
            Err(err) => {
                warn!(url = %self.url, error = %err, "cannot build announce url");
                return None;
            }
        };
        self.in_flight = Some(InFlight {
            identity,
            event,
            sent_at: now,
            warned: false,
        });
        Some(AnnounceRequest {
            url,
            identity,
            event,
        })
    }

    fn retire_identity(&mut self) {
        if let Some(hooks) = self.hooks.as_ref() {
            self.previous_up = hooks.uploaded();
            self.previous_down = hooks.downloaded();
        }
        self.peer_id = None;
        self.last = None;
        self.key = fresh_key();
        self.phase = Phase::Stopping;
    }

    fn fail(&mut self, in_flight: &InFlight, now: Instant) {
        let wait = self.backoff.fail((self.jitter)());
        self.retry_at = Some(now + wait);
        match in_flight.event {
            Some(AnnounceEvent::Started) if self.peer_id == Some(in_flight.identity) => {
                self.peer_id = None;
            }
            Some(AnnounceEvent::Completed) => {
                self.finish_pending = true;
                self.phase = Phase::Steady;
            }
            Some(AnnounceEvent::Stopped) => self.phase = Phase::Idle,
            _ => {}
        }
        debug!(url = %self.url, wait_secs = wait.as_secs(), "announce failed; backing off");
    }

    fn succeed(&mut self, in_flight: &InFlight, success: AnnounceSuccess) -> AnnounceOutcome {
        self.backoff.reset();
        self.retry_at = None;
        if let Some(interval) = success.interval {
            self.announce_interval = Duration::from_secs(interval);
        }
        if let Some(min_interval) = success.min_interval {
            self.min_interval = Duration::from_secs(min_interval).max(self.config.min_interval_floor);
        }
        if success.tracker_id.is_some() {
            self.tracker_id = success.tracker_id;
        }
        self.last = success.last;

        let current = self.peer_id == Some(in_flight.identity)
            && in_flight.event != Some(AnnounceEvent::Stopped);
        self.phase = if current { Phase::Steady } else { Phase::Idle };
        if !current {
            return AnnounceOutcome::Success {
                peers: 0,
                warning: success.warning,
            };
        }

        let Some(hooks) = self.hooks.as_mut() else {
            return AnnounceOutcome::Ignored;
        };
        let found = success.peers.len();
        let known = found + hooks.peer_count();
        if known < self.config.max_initiate as usize {
            #[allow(clippy::cast_precision_loss)]
            let threshold = known as f64 * self.config.keep_token_multiplier;
            let num_peers = success.num_peers.unwrap_or(DEFAULT_NUM_PEERS);
            #[allow(clippy::cast_precision_loss)]
            let larger_swarm = if hooks.is_complete() {
                num_peers.saturating_sub(success.done_peers.unwrap_or(0)) as f64 > threshold
            } else {
                num_peers as f64 > threshold
            };
            if larger_swarm {
                self.last = None;
            }
        }
        if found > 0 {
            hooks.connect(success.peers);
        }
        hooks.on_announce_success();
        AnnounceOutcome::Success {
            peers: found,
            warning: success.warning,
        }
    }
}

fn fresh_key() -> String {
    format!("{:08x}", rand::random::<u32>())
}
