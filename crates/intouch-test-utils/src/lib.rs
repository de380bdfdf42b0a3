//! Common test helpers and utilities for in.touch 2 tests
//!
//! This crate provides:
//! - Condition-based waiting (no hardcoded sleeps)
//! - A scripted fake spa on a local UDP socket
//! - A raw UDP client speaking the wire format

use bytes::Bytes;
use intouch_core::datas::{Datas, PackAction, StatusChange};
use intouch_core::{decode_datagram, encode, Package, PackageContent, Version};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Destination id the fake spa announces
pub const FAKE_SPA_ID: &[u8] = b"SPA-ID";

/// Device name the fake spa announces
pub const FAKE_SPA_NAME: &[u8] = b"Fake Spa";

/// Versions the fake spa reports
pub const FAKE_SPA_VERSION: Version = Version {
    en_build: 105,
    en_major: 11,
    en_minor: 0,
    co_build: 77,
    co_major: 2,
    co_minor: 1,
};

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

// ============================================================================
// Fake Spa - RAII wrapper with proper cleanup
// ============================================================================

struct FakeSpaState {
    socket: UdpSocket,
    memory: Mutex<Vec<u8>>,
    chunk_size: usize,
    silent: AtomicBool,
    hellos: AtomicU32,
    received: Mutex<Vec<(SocketAddr, Package)>>,
    /// Last session key seen from each address
    sessions: Mutex<Vec<(SocketAddr, Bytes)>>,
}

/// A spa stand-in answering hellos, pings, version queries and memory
/// downloads. Aborted on drop.
pub struct FakeSpa {
    addr: SocketAddr,
    state: Arc<FakeSpaState>,
    handle: Option<JoinHandle<()>>,
}

impl FakeSpa {
    /// Start a fake spa holding `memory`
    pub async fn start(memory: Vec<u8>) -> Self {
        Self::start_with_chunk_size(memory, 64).await
    }

    /// Start a fake spa that answers downloads in chunks of `chunk_size`
    pub async fn start_with_chunk_size(memory: Vec<u8>, chunk_size: usize) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let state = Arc::new(FakeSpaState {
            socket,
            memory: Mutex::new(memory),
            chunk_size: chunk_size.clamp(1, u8::MAX as usize),
            silent: AtomicBool::new(false),
            hellos: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        });

        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, from)) = task_state.socket.recv_from(&mut buf).await else {
                    continue;
                };
                let Ok(package) = decode_datagram(&buf[..len]) else {
                    debug!("Fake spa ignoring {} bytes from {}", len, from);
                    continue;
                };
                if matches!(package, Package::Hello(_)) {
                    task_state.hellos.fetch_add(1, Ordering::SeqCst);
                }
                task_state.received.lock().push((from, package.clone()));
                if !task_state.silent.load(Ordering::SeqCst) {
                    task_state.answer(package, from).await;
                }
            }
        });

        Self {
            addr,
            state,
            handle: Some(handle),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` target string for this spa
    pub fn target(&self) -> String {
        self.addr.to_string()
    }

    /// Stop answering (packages are still recorded)
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Number of hellos received
    pub fn hello_count(&self) -> u32 {
        self.state.hellos.load(Ordering::SeqCst)
    }

    /// All packages received so far
    pub fn received(&self) -> Vec<Package> {
        self.state
            .received
            .lock()
            .iter()
            .map(|(_, package)| package.clone())
            .collect()
    }

    /// Typed payloads received so far
    pub fn received_datas(&self) -> Vec<Datas> {
        self.received()
            .iter()
            .filter_map(|package| match package.content() {
                Some(PackageContent::Unknown(payload)) => Datas::parse(payload),
                _ => None,
            })
            .collect()
    }

    /// Senders of received packages, in arrival order
    pub fn received_from(&self) -> Vec<SocketAddr> {
        self.state
            .received
            .lock()
            .iter()
            .map(|(from, _)| *from)
            .collect()
    }

    pub fn memory(&self) -> Vec<u8> {
        self.state.memory.lock().clone()
    }

    /// Change memory and push the changes to every session seen so far
    pub async fn push_status(&self, changes: &[(u16, [u8; 2])]) {
        {
            let mut memory = self.state.memory.lock();
            for (pos, data) in changes {
                let pos = *pos as usize;
                if pos + 2 <= memory.len() {
                    memory[pos..pos + 2].copy_from_slice(data);
                }
            }
        }
        let push = Datas::StatusPush(
            changes
                .iter()
                .map(|(pos, data)| StatusChange {
                    pos: *pos,
                    data: *data,
                })
                .collect(),
        )
        .compose();

        let sessions = self.state.sessions.lock().clone();
        for (addr, key) in sessions {
            self.send_to(
                addr,
                Package::authorized(FAKE_SPA_ID, key, PackageContent::Unknown(push.clone())),
            )
            .await;
        }
    }

    /// Send an arbitrary package to `addr`
    pub async fn send_to(&self, addr: SocketAddr, package: Package) {
        self.state.send(&package, addr).await;
    }

    /// Stop the spa explicitly (also happens on drop)
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for FakeSpa {
    fn drop(&mut self) {
        self.stop();
    }
}

impl FakeSpaState {
    async fn send(&self, package: &Package, to: SocketAddr) {
        let _ = self.socket.send_to(&encode(package), to).await;
    }

    async fn answer(&self, package: Package, from: SocketAddr) {
        match package {
            Package::Hello(_) => {
                let mut hello = FAKE_SPA_ID.to_vec();
                hello.push(b'|');
                hello.extend_from_slice(FAKE_SPA_NAME);
                self.send(&Package::hello(hello), from).await;
            }
            Package::Authorized {
                source: Some(source),
                content,
                ..
            } => {
                self.remember(from, source.clone());
                let reply = |content| Package::authorized(FAKE_SPA_ID, source.clone(), content);
                match content {
                    PackageContent::Ping => self.send(&reply(PackageContent::Pong), from).await,
                    PackageContent::Pong => {}
                    PackageContent::Unknown(payload) => {
                        for answer in self.answer_datas(&payload) {
                            self.send(&reply(PackageContent::Unknown(answer)), from)
                                .await;
                        }
                    }
                }
            }
            Package::Authorized { .. } => {}
        }
    }

    fn answer_datas(&self, payload: &[u8]) -> Vec<Bytes> {
        match Datas::parse(payload) {
            Some(Datas::VersionQuery { .. }) => {
                vec![Datas::Version(FAKE_SPA_VERSION).compose()]
            }
            Some(Datas::StatusRequest { start, length, .. }) => {
                let memory = self.memory.lock();
                let start = (start as usize).min(memory.len());
                let end = (start + length as usize).min(memory.len());
                memory[start..end]
                    .chunks(self.chunk_size)
                    .enumerate()
                    .map(|(i, chunk)| {
                        Datas::StatusChunk {
                            seq: i as u8,
                            next: (i + 1) as u8,
                            data: Bytes::copy_from_slice(chunk),
                        }
                        .compose()
                    })
                    .collect()
            }
            Some(Datas::Pack {
                action: PackAction::Set { pos, data, .. },
                ..
            }) => {
                let mut memory = self.memory.lock();
                let start = pos as usize;
                if start + data.len() > memory.len() {
                    return Vec::new();
                }
                memory[start..start + data.len()].copy_from_slice(&data);
                data.chunks(2)
                    .enumerate()
                    .filter(|(_, chunk)| chunk.len() == 2)
                    .map(|(i, chunk)| {
                        Datas::StatusPush(vec![StatusChange {
                            pos: pos + 2 * i as u16,
                            data: [chunk[0], chunk[1]],
                        }])
                        .compose()
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    fn remember(&self, addr: SocketAddr, key: Bytes) {
        let mut sessions = self.sessions.lock();
        match sessions.iter_mut().find(|(known, _)| *known == addr) {
            Some(entry) => entry.1 = key,
            None => sessions.push((addr, key)),
        }
    }
}

// ============================================================================
// Test Client - raw wire access
// ============================================================================

/// A UDP socket speaking raw packages, standing in for a controller app
pub struct TestClient {
    socket: UdpSocket,
}

impl TestClient {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn send(&self, package: &Package, to: SocketAddr) {
        self.socket.send_to(&encode(package), to).await.unwrap();
    }

    /// Next decodable package, or `None` after `max_wait`
    pub async fn recv(&self, max_wait: Duration) -> Option<Package> {
        let mut buf = vec![0u8; 4096];
        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (len, _) = timeout(remaining, self.socket.recv_from(&mut buf))
                .await
                .ok()?
                .ok()?;
            if let Ok(package) = decode_datagram(&buf[..len]) {
                return Some(package);
            }
        }
    }
}
