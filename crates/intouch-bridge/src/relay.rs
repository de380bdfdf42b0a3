//! UDP relay between the spa, controller apps and the bridge's own session
//!
//! The relay owns the only socket talking to the spa. Controller apps send
//! to the forward listen socket; the bridge's own session attaches through
//! [`Relay::local_link`]. Frames addressed to the spa are forwarded verbatim,
//! spa frames are routed back by their destination id.

use bytes::Bytes;
use futures::future::try_join_all;
use intouch_core::{
    decode_datagram, encode, printable, Package, PackageContent, HELLO_DELIMITER,
};
use intouch_transport::{
    resolve, TransportEvent, TransportSender, UdpReceiver, UdpSender, UdpTransport,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::forward::{ForwardTable, Peer};
use crate::spa::is_status_push;
use crate::{BridgeConfig, BridgeError, Link, Result};

/// Payload of the hello the relay sends to discover the spa
pub const GREETING: &[u8] = b"1";
/// Hello attempts before giving up on the spa
pub const GREETING_ATTEMPTS: u32 = 5;
/// Time to wait for the spa after each hello
pub const GREETING_WINDOW: Duration = Duration::from_secs(1);

const DUMP_CAPACITY: usize = 1024;
const LOCAL_CAPACITY: usize = 256;

/// Direction of a relayed package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficSource {
    /// Sent by the spa to this peer
    To(Peer),
    /// Sent by this peer to the spa
    From(Peer),
}

impl fmt::Display for TrafficSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficSource::To(peer) => write!(f, "spa -> {}", peer),
            TrafficSource::From(peer) => write!(f, "{} -> spa", peer),
        }
    }
}

/// One relayed package as published on the dump channel
pub type DumpedPackage = (TrafficSource, PackageContent);

struct LocalEnd {
    to_local: mpsc::Sender<Package>,
    from_local: mpsc::Receiver<Package>,
}

/// State shared by the relay tasks
struct Shared {
    spa_addr: SocketAddr,
    spa: UdpSender,
    clients: Option<Arc<UdpTransport>>,
    hello: RwLock<Bytes>,
    forwards: ForwardTable,
    dump: broadcast::Sender<DumpedPackage>,
    to_local: Option<mpsc::Sender<Package>>,
    dump_traffic: bool,
    handshake_timeout: Duration,
    udp_timeout: Duration,
}

pub struct Relay {
    spa_addr: SocketAddr,
    spa: UdpTransport,
    spa_rx: UdpReceiver,
    clients: Option<UdpTransport>,
    hello: Bytes,
    dump: broadcast::Sender<DumpedPackage>,
    local: Option<LocalEnd>,
    dump_traffic: bool,
    handshake_timeout: Duration,
    udp_timeout: Duration,
}

impl Relay {
    /// Resolve and greet the spa, then bind the forward listen socket.
    ///
    /// Fails with [`BridgeError::SpaTimeout`] if the spa never answers.
    pub async fn bind(config: &BridgeConfig) -> Result<Relay> {
        let spa_addr = resolve(&config.spa_target_with_port()).await?;
        let bind_addr = if spa_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let spa = UdpTransport::bind(bind_addr).await?;
        let mut spa_rx = spa.start_receiver();

        let hello = greet(&spa, &mut spa_rx, spa_addr).await?;
        let (id, name) = split_hello(&hello)
            .ok_or_else(|| BridgeError::InvalidSpaHello(printable(&hello)))?;
        info!(
            "Found spa {} ({}) at {}",
            printable(name),
            printable(id),
            spa_addr
        );

        let clients = match config.spa_forward_listen {
            Some(listen) => {
                let transport = UdpTransport::bind(&listen.to_string()).await?;
                info!("Forwarding clients from {}", transport.local_addr()?);
                Some(transport)
            }
            None => None,
        };

        let (dump, _) = broadcast::channel(DUMP_CAPACITY);
        Ok(Relay {
            spa_addr,
            spa,
            spa_rx,
            clients,
            hello,
            dump,
            local: None,
            dump_traffic: config.dump_traffic,
            handshake_timeout: config.handshake_timeout(),
            udp_timeout: config.udp_timeout(),
        })
    }

    /// Cached spa hello payload (`id|name`)
    pub fn spa_hello(&self) -> Bytes {
        self.hello.clone()
    }

    pub fn spa_addr(&self) -> SocketAddr {
        self.spa_addr
    }

    /// Bound address of the forward listen socket
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.clients
            .as_ref()
            .and_then(|transport| transport.local_addr().ok())
    }

    /// Subscribe to every relayed non-hello package
    pub fn dump_packages(&self) -> broadcast::Receiver<DumpedPackage> {
        self.dump.subscribe()
    }

    /// Attach the bridge's own session.
    ///
    /// A second call replaces the first link.
    pub fn local_link(&mut self) -> Link {
        let (to_local, local_rx) = mpsc::channel(LOCAL_CAPACITY);
        let (local_tx, from_local) = mpsc::channel(LOCAL_CAPACITY);
        self.local = Some(LocalEnd {
            to_local,
            from_local,
        });
        Link::new(Arc::new(local_tx), local_rx)
    }

    /// Relay until `shutdown` flips to true or a relay task fails
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (to_local, from_local) = match self.local {
            Some(local) => (Some(local.to_local), Some(local.from_local)),
            None => (None, None),
        };
        let clients = self.clients.map(Arc::new);
        let client_rx = clients.as_ref().map(|clients| clients.start_receiver());

        let shared = Arc::new(Shared {
            spa_addr: self.spa_addr,
            spa: self.spa.sender_to(self.spa_addr),
            clients,
            hello: RwLock::new(self.hello),
            forwards: ForwardTable::new(),
            dump: self.dump,
            to_local,
            dump_traffic: self.dump_traffic,
            handshake_timeout: self.handshake_timeout,
            udp_timeout: self.udp_timeout,
        });

        let mut handles = vec![tokio::spawn(spa_loop(shared.clone(), self.spa_rx))];
        if let Some(rx) = client_rx {
            handles.push(tokio::spawn(client_loop(shared.clone(), rx)));
        }
        if let Some(rx) = from_local {
            handles.push(tokio::spawn(local_loop(shared.clone(), rx)));
        }
        handles.push(tokio::spawn(sweep_loop(shared)));
        let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();

        // Wait for shutdown or the first failed task
        let result = tokio::select! {
            _ = shutdown.changed() => Ok(()),
            joined = try_join_all(handles) => joined
                .map(|_| ())
                .map_err(|e| BridgeError::Io(std::io::Error::other(e))),
        };
        for abort in aborts {
            abort.abort();
        }
        info!("Relay stopped");
        result
    }
}

/// Send hellos until the spa answers with its own
async fn greet(
    spa: &UdpTransport,
    rx: &mut UdpReceiver,
    spa_addr: SocketAddr,
) -> Result<Bytes> {
    let greeting = encode(&Package::hello(GREETING));

    for attempt in 1..=GREETING_ATTEMPTS {
        spa.send_to(&greeting, spa_addr).await?;
        let deadline = Instant::now() + GREETING_WINDOW;

        loop {
            match timeout_at(deadline, rx.recv_from()).await {
                Err(_) => break,
                Ok(None) => return Err(BridgeError::ChannelClosed),
                Ok(Some((TransportEvent::Data(data), from))) if from == spa_addr => {
                    if let Ok(Package::Hello(hello)) = decode_datagram(&data) {
                        return Ok(hello);
                    }
                }
                Ok(Some(_)) => {}
            }
        }
        debug!(
            "No hello from {} (attempt {}/{})",
            spa_addr, attempt, GREETING_ATTEMPTS
        );
    }

    Err(BridgeError::SpaTimeout(spa_addr.to_string()))
}

fn split_hello(hello: &[u8]) -> Option<(&[u8], &[u8])> {
    let split = hello.iter().position(|&b| b == HELLO_DELIMITER)?;
    Some((&hello[..split], &hello[split + 1..]))
}

impl Shared {
    fn spa_id(&self) -> Bytes {
        let hello = self.hello.read().clone();
        match hello.iter().position(|&b| b == HELLO_DELIMITER) {
            Some(split) => hello.slice(..split),
            None => hello,
        }
    }

    fn record(&self, source: TrafficSource, content: &PackageContent) {
        if self.dump_traffic && !content.is_keepalive() {
            info!("{}: {}", source, content);
        }
        let _ = self.dump.send((source, content.clone()));
    }

    fn deliver_local(&self, package: Package) {
        let Some(ref to_local) = self.to_local else {
            return;
        };
        if let Err(e) = to_local.try_send(package) {
            warn!("Bridge session is not keeping up: {}", e);
        }
    }

    async fn on_spa_datagram(&self, data: Bytes) {
        let package = match decode_datagram(&data) {
            Ok(package) => package,
            Err(e) => {
                debug!("Invalid datagram from spa: {}", e);
                return;
            }
        };

        match package {
            Package::Hello(hello) => {
                if hello != *self.hello.read() {
                    info!("Spa now answers as {}", printable(&hello));
                    *self.hello.write() = hello;
                }
            }
            Package::Authorized {
                destination: None, ..
            } => debug!("Spa package without destination"),
            Package::Authorized {
                destination: Some(ref destination),
                ref content,
                ..
            } => match self.forwards.got_reply(destination, Instant::now()) {
                Some(Peer::Local) => {
                    self.record(TrafficSource::To(Peer::Local), content);
                    self.deliver_local(package);
                }
                Some(peer @ Peer::Client(addr)) => {
                    self.record(TrafficSource::To(peer), content);
                    let sniffed =
                        matches!(content, PackageContent::Unknown(payload) if is_status_push(payload));
                    if let Some(ref clients) = self.clients {
                        if let Err(e) = clients.send_to(&data, addr).await {
                            warn!("Failed to forward to {}: {}", addr, e);
                        }
                    }
                    if sniffed {
                        self.deliver_local(package);
                    }
                }
                None => debug!("Spa package for unknown id {}", printable(destination)),
            },
        }
    }

    async fn on_client_datagram(&self, clients: &UdpTransport, data: Bytes, from: SocketAddr) {
        let package = match decode_datagram(&data) {
            Ok(package) => package,
            Err(e) => {
                debug!("Invalid datagram from {}: {}", from, e);
                return;
            }
        };

        let peer = Peer::Client(from);
        match package {
            Package::Hello(_) => {
                if self.forwards.id(&peer).is_none() {
                    info!("Hello from {}", from);
                }
                let hello = encode(&Package::Hello(self.hello.read().clone()));
                if let Err(e) = clients.send_to(&hello, from).await {
                    warn!("Failed to answer hello from {}: {}", from, e);
                }
            }
            Package::Authorized {
                source: Some(source),
                destination: Some(destination),
                content,
            } if destination == self.spa_id() => {
                if self.forwards.insert(peer, source.clone(), Instant::now()) {
                    info!("Client {} at {}", printable(&source), from);
                }
                self.record(TrafficSource::From(peer), &content);
                if let Err(e) = self.spa.send(data).await {
                    warn!("Failed to forward to spa: {}", e);
                }
            }
            Package::Authorized {
                destination: Some(destination),
                ..
            } => debug!(
                "Dropping package from {} for unknown id {}",
                from,
                printable(&destination)
            ),
            Package::Authorized { .. } => {
                debug!("Dropping unaddressed package from {}", from)
            }
        }
    }

    async fn on_local_package(&self, package: Package) {
        let now = Instant::now();
        match package {
            Package::Hello(key) => {
                self.forwards.insert(Peer::Local, key, now);
                let hello = self.hello.read().clone();
                self.deliver_local(Package::Hello(hello));
            }
            Package::Authorized {
                source: Some(ref source),
                ref content,
                ..
            } => {
                // the mapping is swept if the spa stayed silent
                if self.forwards.insert(Peer::Local, source.clone(), now) {
                    debug!("Mapped bridge session {} again", printable(source));
                }
                self.record(TrafficSource::From(Peer::Local), content);
                if let Err(e) = self.spa.send(encode(&package)).await {
                    warn!("Failed to send to spa: {}", e);
                }
            }
            other => warn!("Dropping package without source from bridge: {}", other),
        }
    }
}

async fn spa_loop(shared: Arc<Shared>, mut rx: UdpReceiver) {
    while let Some((event, from)) = rx.recv_from().await {
        let TransportEvent::Data(data) = event else {
            continue;
        };
        if from != shared.spa_addr {
            debug!("Dropping datagram from {} on spa socket", from);
            continue;
        }
        shared.on_spa_datagram(data).await;
    }
}

async fn client_loop(shared: Arc<Shared>, mut rx: UdpReceiver) {
    let Some(clients) = shared.clients.clone() else {
        return;
    };
    while let Some((event, from)) = rx.recv_from().await {
        if let TransportEvent::Data(data) = event {
            shared.on_client_datagram(&clients, data, from).await;
        }
    }
}

async fn local_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<Package>) {
    while let Some(package) = rx.recv().await {
        shared.on_local_package(package).await;
    }
    debug!("Bridge session detached");
}

async fn sweep_loop(shared: Arc<Shared>) {
    let idle = shared.handshake_timeout.min(shared.udp_timeout);
    loop {
        let now = Instant::now();
        let (expired, next) =
            shared
                .forwards
                .sweep(now, shared.handshake_timeout, shared.udp_timeout);
        for (id, peer) in expired {
            info!("Forward for {} ({}) timed out", printable(&id), peer);
        }
        sleep_until(next.unwrap_or(now + idle)).await;
    }
}
