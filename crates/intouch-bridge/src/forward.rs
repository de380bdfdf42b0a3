//! Client session id to peer mapping used by the relay

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Where frames for a client session id are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Peer {
    /// The bridge's own session
    Local,
    /// A controller app on the forward listen socket
    #[serde(untagged)]
    Client(SocketAddr),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Local => write!(f, "bridge"),
            Peer::Client(addr) => write!(f, "{}", addr),
        }
    }
}

#[derive(Debug, Clone)]
struct ForwardEntry {
    peer: Peer,
    last_forward: Instant,
    last_reply: Option<Instant>,
}

impl ForwardEntry {
    /// Entries that never saw a reply expire after the handshake timeout
    fn expires_at(&self, handshake_timeout: Duration, udp_timeout: Duration) -> Instant {
        match self.last_reply {
            Some(last_reply) => last_reply.max(self.last_forward) + udp_timeout,
            None => self.last_forward + handshake_timeout,
        }
    }
}

/// One-to-one mapping between client session ids and peers
#[derive(Debug, Default)]
pub struct ForwardTable {
    by_id: DashMap<Bytes, ForwardEntry>,
    by_peer: DashMap<Peer, Bytes>,
}

impl ForwardTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `id` to `peer`, dropping older mappings of either side.
    /// An existing identical mapping only records the forward.
    /// Returns true if the mapping is new.
    pub fn insert(&self, peer: Peer, id: Bytes, now: Instant) -> bool {
        if let Some(mut entry) = self.by_id.get_mut(&id) {
            if entry.peer == peer {
                entry.last_forward = now;
                return false;
            }
        }

        if let Some((_, old)) = self.by_id.remove(&id) {
            self.by_peer.remove(&old.peer);
        }
        if let Some((_, old_id)) = self.by_peer.remove(&peer) {
            self.by_id.remove(&old_id);
        }

        self.by_id.insert(
            id.clone(),
            ForwardEntry {
                peer,
                last_forward: now,
                last_reply: None,
            },
        );
        self.by_peer.insert(peer, id);
        true
    }

    /// Record a spa reply for `id` and return where it goes
    pub fn got_reply(&self, id: &[u8], now: Instant) -> Option<Peer> {
        let mut entry = self.by_id.get_mut(id)?;
        entry.last_reply = Some(now);
        Some(entry.peer)
    }

    pub fn peer(&self, id: &[u8]) -> Option<Peer> {
        self.by_id.get(id).map(|entry| entry.peer)
    }

    pub fn id(&self, peer: &Peer) -> Option<Bytes> {
        self.by_peer.get(peer).map(|id| id.clone())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Remove expired mappings. Returns the removed ones and the next
    /// instant at which another mapping expires.
    pub fn sweep(
        &self,
        now: Instant,
        handshake_timeout: Duration,
        udp_timeout: Duration,
    ) -> (Vec<(Bytes, Peer)>, Option<Instant>) {
        let mut expired = Vec::new();
        let mut next = None::<Instant>;

        for entry in self.by_id.iter() {
            let expires_at = entry.expires_at(handshake_timeout, udp_timeout);
            if expires_at <= now {
                expired.push((entry.key().clone(), entry.peer));
            } else {
                next = Some(next.map_or(expires_at, |next| next.min(expires_at)));
            }
        }

        for (id, peer) in &expired {
            self.by_id.remove(id);
            self.by_peer.remove_if(peer, |_, mapped| mapped == id);
        }

        (expired, next)
    }
}
