//! Session handshake and keepalive state machine
//!
//! The machine performs no I/O. Callers feed it inbound packages and the
//! current time, and carry out the [`Output`]s it returns in order.
//!
//! ```text
//! Unauthenticated --start--> AwaitingHelloEcho --Hello(id|name)--> Authorized
//!        ^                         |                                   |
//!        +------- Expired <--------+-- handshake timeout   udp timeout-+
//! ```
//!
//! `Closed` is terminal and only entered through [`Session::close`].

use bytes::Bytes;
use intouch_core::datas::Datas;
use intouch_core::{Package, PackageContent, HELLO_DELIMITER, SESSION_KEY_PREFIX};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Consecutive failed handshakes before the peer is reported unreachable
pub const DEFAULT_UNREACHABLE_AFTER: u32 = 5;

/// Generate a session key shaped like the ones companion apps use
pub fn new_session_key() -> Bytes {
    Bytes::from(format!("{}{}", SESSION_KEY_PREFIX, Uuid::new_v4().hyphenated()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    AwaitingHelloEcho,
    Authorized,
    Expired,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::AwaitingHelloEcho => "awaiting hello",
            SessionState::Authorized => "authorized",
            SessionState::Expired => "expired",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Timing parameters of a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub udp_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Send our own pings at this interval while authorized
    pub ping_interval: Option<Duration>,
    pub unreachable_after: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            udp_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Some(Duration::from_secs(3)),
            unreachable_after: DEFAULT_UNREACHABLE_AFTER,
        }
    }
}

/// Something that happened to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake completed
    Authorized { peer: Bytes, name: Bytes },
    /// Opaque payload addressed to this session
    Data {
        source: Option<Bytes>,
        payload: Bytes,
    },
    /// Hello answer without a delimiter; still waiting
    MalformedHandshake(Bytes),
    /// Session timed out in `from`; a new handshake follows
    Expired { from: SessionState },
    /// Handshake failed `attempts` times in a row
    Unreachable { attempts: u32 },
}

/// Action requested by the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Send this package to the peer
    Transmit(Package),
    Event(SessionEvent),
}

pub struct Session {
    config: SessionConfig,
    key: Bytes,
    pinned_key: bool,
    peer_destination: Option<Bytes>,
    device_name: Option<Bytes>,
    state: SessionState,
    state_since: Instant,
    last_activity: Instant,
    last_ping: Option<Instant>,
    failed_handshakes: u32,
    seq: u8,
}

impl Session {
    /// New session with a fresh random key for every handshake
    pub fn new(config: SessionConfig) -> Self {
        Self::build(config, new_session_key(), false)
    }

    /// New session that keeps `key` across handshakes
    pub fn with_key(config: SessionConfig, key: impl Into<Bytes>) -> Self {
        Self::build(config, key.into(), true)
    }

    fn build(config: SessionConfig, key: Bytes, pinned_key: bool) -> Self {
        let now = Instant::now();
        Self {
            config,
            key,
            pinned_key,
            peer_destination: None,
            device_name: None,
            state: SessionState::Unauthenticated,
            state_since: now,
            last_activity: now,
            last_ping: None,
            failed_handshakes: 0,
            seq: 0,
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_destination(&self) -> Option<&Bytes> {
        self.peer_destination.as_ref()
    }

    pub fn device_name(&self) -> Option<&Bytes> {
        self.device_name.as_ref()
    }

    pub fn is_authorized(&self) -> bool {
        self.state == SessionState::Authorized
    }

    pub fn idle_duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Offer our key to the peer
    pub fn start(&mut self, now: Instant) -> Vec<Output> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        self.peer_destination = None;
        self.device_name = None;
        self.last_ping = None;
        self.set_state(SessionState::AwaitingHelloEcho, now);
        self.last_activity = now;
        vec![Output::Transmit(Package::Hello(self.key.clone()))]
    }

    /// Process one inbound package
    pub fn handle(&mut self, package: Package, now: Instant) -> Vec<Output> {
        match package {
            Package::Hello(payload) => self.handle_hello(payload, now),
            Package::Authorized {
                source,
                destination,
                content,
            } => {
                if self.state != SessionState::Authorized {
                    return Vec::new();
                }
                if matches!(destination, Some(ref d) if *d != self.key) {
                    return Vec::new();
                }
                self.last_activity = now;
                match content {
                    PackageContent::Ping => self
                        .frame(PackageContent::Pong)
                        .map(Output::Transmit)
                        .into_iter()
                        .collect(),
                    PackageContent::Pong => Vec::new(),
                    PackageContent::Unknown(payload) => {
                        vec![Output::Event(SessionEvent::Data { source, payload })]
                    }
                }
            }
        }
    }

    fn handle_hello(&mut self, payload: Bytes, now: Instant) -> Vec<Output> {
        if self.state != SessionState::AwaitingHelloEcho {
            return Vec::new();
        }
        let Some(split) = payload.iter().position(|&b| b == HELLO_DELIMITER) else {
            return vec![Output::Event(SessionEvent::MalformedHandshake(payload))];
        };

        let peer = payload.slice(..split);
        let name = payload.slice(split + 1..);
        self.peer_destination = Some(peer.clone());
        self.device_name = Some(name.clone());
        self.failed_handshakes = 0;
        self.last_activity = now;
        self.last_ping = Some(now);
        self.set_state(SessionState::Authorized, now);

        let seq = self.next_seq();
        let mut outputs = vec![Output::Event(SessionEvent::Authorized { peer, name })];
        if let Some(query) = self.frame(PackageContent::Unknown(
            Datas::VersionQuery { seq }.compose(),
        )) {
            outputs.push(Output::Transmit(query));
        }
        outputs
    }

    /// Advance timers
    pub fn poll(&mut self, now: Instant) -> Vec<Output> {
        match self.state {
            SessionState::AwaitingHelloEcho
                if now.saturating_duration_since(self.state_since)
                    >= self.config.handshake_timeout =>
            {
                self.failed_handshakes += 1;
                let mut outputs = self.expire(now);
                let threshold = self.config.unreachable_after;
                if threshold > 0 && self.failed_handshakes % threshold == 0 {
                    // reported between the expiry and the next hello
                    outputs.insert(
                        1,
                        Output::Event(SessionEvent::Unreachable {
                            attempts: self.failed_handshakes,
                        }),
                    );
                }
                outputs
            }
            SessionState::Authorized if self.idle_duration(now) >= self.config.udp_timeout => {
                self.expire(now)
            }
            SessionState::Authorized => match self.ping_due() {
                Some(due) if now >= due => {
                    self.last_ping = Some(now);
                    self.frame(PackageContent::Ping)
                        .map(Output::Transmit)
                        .into_iter()
                        .collect()
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Earliest instant at which [`Session::poll`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            SessionState::AwaitingHelloEcho => Some(self.state_since + self.config.handshake_timeout),
            SessionState::Authorized => {
                let expiry = self.last_activity + self.config.udp_timeout;
                Some(match self.ping_due() {
                    Some(due) => due.min(expiry),
                    None => expiry,
                })
            }
            _ => None,
        }
    }

    /// Wrap `content` for the peer; `None` unless authorized
    pub fn frame(&self, content: PackageContent) -> Option<Package> {
        if self.state != SessionState::Authorized {
            return None;
        }
        Some(Package::Authorized {
            source: Some(self.key.clone()),
            destination: self.peer_destination.clone(),
            content,
        })
    }

    /// Enter the terminal state
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.peer_destination = None;
    }

    fn expire(&mut self, now: Instant) -> Vec<Output> {
        let from = self.state;
        self.set_state(SessionState::Expired, now);
        if !self.pinned_key {
            self.key = new_session_key();
        }
        let mut outputs = vec![Output::Event(SessionEvent::Expired { from })];
        self.set_state(SessionState::Unauthenticated, now);
        outputs.extend(self.start(now));
        outputs
    }

    fn ping_due(&self) -> Option<Instant> {
        let interval = self.config.ping_interval?;
        self.last_ping.map(|last| last + interval)
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn set_state(&mut self, state: SessionState, now: Instant) {
        self.state = state;
        self.state_since = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            udp_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            ping_interval: Some(Duration::from_secs(3)),
            unreachable_after: 2,
        }
    }

    fn authorized(now: Instant) -> Session {
        let mut session = Session::with_key(config(), &b"IOSkey"[..]);
        session.start(now);
        session.handle(Package::hello(&b"A|DeviceX"[..]), now);
        session
    }

    #[test]
    fn test_start_sends_hello() {
        let now = Instant::now();
        let mut session = Session::with_key(config(), &b"IOSkey"[..]);
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert_eq!(
            session.start(now),
            vec![Output::Transmit(Package::hello(&b"IOSkey"[..]))]
        );
        assert_eq!(session.state(), SessionState::AwaitingHelloEcho);
    }

    #[test]
    fn test_generated_key_shape() {
        let key = new_session_key();
        assert!(key.starts_with(b"IOS"));
        assert_eq!(key.len(), 3 + 36);
    }

    #[test]
    fn test_handshake_primes_with_version_query() {
        let now = Instant::now();
        let mut session = Session::with_key(config(), &b"IOSkey"[..]);
        session.start(now);
        let outputs = session.handle(Package::hello(&b"A|DeviceX"[..]), now);

        assert_eq!(session.state(), SessionState::Authorized);
        assert_eq!(session.peer_destination().map(|p| p.as_ref()), Some(&b"A"[..]));
        assert_eq!(
            outputs,
            vec![
                Output::Event(SessionEvent::Authorized {
                    peer: Bytes::from_static(b"A"),
                    name: Bytes::from_static(b"DeviceX"),
                }),
                Output::Transmit(Package::authorized(
                    &b"IOSkey"[..],
                    &b"A"[..],
                    PackageContent::Unknown(Bytes::from_static(b"AVERS\x00")),
                )),
            ]
        );
    }

    #[test]
    fn test_name_may_contain_delimiter() {
        let now = Instant::now();
        let mut session = Session::with_key(config(), &b"k"[..]);
        session.start(now);
        session.handle(Package::hello(&b"A|B|C"[..]), now);
        assert_eq!(session.device_name().map(|n| n.as_ref()), Some(&b"B|C"[..]));
    }

    #[test]
    fn test_malformed_hello_keeps_waiting() {
        let now = Instant::now();
        let mut session = Session::with_key(config(), &b"k"[..]);
        session.start(now);
        let outputs = session.handle(Package::hello(&b"nodelimiter"[..]), now);
        assert_eq!(
            outputs,
            vec![Output::Event(SessionEvent::MalformedHandshake(
                Bytes::from_static(b"nodelimiter")
            ))]
        );
        assert_eq!(session.state(), SessionState::AwaitingHelloEcho);

        session.handle(Package::hello(&b"A|X"[..]), now);
        assert!(session.is_authorized());
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let now = Instant::now();
        let mut session = authorized(now);
        let outputs = session.handle(
            Package::Authorized {
                source: Some(Bytes::from_static(b"sender-id")),
                destination: None,
                content: PackageContent::Ping,
            },
            now,
        );
        assert_eq!(
            outputs,
            vec![Output::Transmit(Package::authorized(
                &b"IOSkey"[..],
                &b"A"[..],
                PackageContent::Pong
            ))]
        );
    }

    #[test]
    fn test_other_session_is_ignored() {
        let now = Instant::now();
        let mut session = authorized(now);
        let outputs = session.handle(
            Package::authorized(&b"A"[..], &b"IOSother"[..], PackageContent::Ping),
            now,
        );
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_data_before_authorization_is_ignored() {
        let now = Instant::now();
        let mut session = Session::with_key(config(), &b"k"[..]);
        session.start(now);
        let outputs = session.handle(
            Package::authorized(&b"A"[..], &b"k"[..], PackageContent::Ping),
            now,
        );
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_keepalive_pings_and_expiry() {
        let start = Instant::now();
        let mut session = authorized(start);

        assert!(session.poll(start + Duration::from_secs(1)).is_empty());
        let outputs = session.poll(start + Duration::from_secs(3));
        assert!(matches!(
            outputs.as_slice(),
            [Output::Transmit(Package::Authorized {
                content: PackageContent::Ping,
                ..
            })]
        ));

        let outputs = session.poll(start + Duration::from_secs(31));
        assert_eq!(
            outputs,
            vec![
                Output::Event(SessionEvent::Expired {
                    from: SessionState::Authorized
                }),
                Output::Transmit(Package::hello(&b"IOSkey"[..])),
            ]
        );
        assert_eq!(session.state(), SessionState::AwaitingHelloEcho);
    }

    #[test]
    fn test_handshake_timeout_reports_unreachable() {
        let start = Instant::now();
        let mut session = Session::with_key(config(), &b"k"[..]);
        session.start(start);

        let first = session.poll(start + Duration::from_secs(5));
        assert_eq!(first.len(), 2);

        let second = session.poll(start + Duration::from_secs(10));
        assert_eq!(
            second[1],
            Output::Event(SessionEvent::Unreachable { attempts: 2 })
        );
        assert!(matches!(second.last(), Some(Output::Transmit(Package::Hello(_)))));
    }

    #[test]
    fn test_closed_is_terminal() {
        let now = Instant::now();
        let mut session = authorized(now);
        session.close();
        assert!(session.start(now).is_empty());
        assert!(session
            .handle(Package::hello(&b"A|X"[..]), now)
            .is_empty());
        assert!(session.poll(now + Duration::from_secs(600)).is_empty());
        assert!(session.frame(PackageContent::Ping).is_none());
        assert_eq!(session.next_deadline(), None);
    }

    #[test]
    fn test_fresh_key_after_expiry() {
        let start = Instant::now();
        let mut session = Session::new(config());
        let first_key = session.key().clone();
        session.start(start);
        session.poll(start + Duration::from_secs(5));
        assert_ne!(session.key(), &first_key);
    }
}
