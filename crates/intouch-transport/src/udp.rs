//! UDP transport implementation

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportSender};

/// UDP configuration
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Maximum datagram size accepted by the receive loop
    pub max_packet_size: usize,
    /// Capacity of the receive channel
    pub channel_capacity: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 65507, // Max UDP payload
            channel_capacity: 256,
        }
    }
}

/// Resolve a `host:port` string to its first socket address
pub async fn resolve(target: &str) -> Result<SocketAddr> {
    lookup_host(target)
        .await
        .map_err(|e| TransportError::Resolve(format!("{}: {}", target, e)))?
        .next()
        .ok_or_else(|| TransportError::Resolve(target.to_string()))
}

/// UDP transport (connectionless)
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    send_lock: Arc<Mutex<()>>,
    config: UdpConfig,
}

impl UdpTransport {
    /// Bind to a local address
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, UdpConfig::default()).await
    }

    /// Bind with config
    pub async fn bind_with_config(addr: &str, config: UdpConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{}: {}", addr, e)))?;

        info!("UDP bound to {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            send_lock: Arc::new(Mutex::new(())),
            config,
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    /// Create a sender for a specific remote address.
    ///
    /// All senders of one transport share a lock, so datagrams leave the
    /// socket in the order their `send` calls acquired it.
    pub fn sender_to(&self, remote: SocketAddr) -> UdpSender {
        UdpSender {
            socket: self.socket.clone(),
            send_lock: self.send_lock.clone(),
            remote,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Start receiving datagrams.
    ///
    /// The loop ends when the returned receiver is dropped.
    pub fn start_receiver(&self) -> UdpReceiver {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let socket = self.socket.clone();
        let max_size = self.config.max_packet_size;

        tokio::spawn(async move {
            let mut buf = vec![0u8; max_size];

            loop {
                let event = match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        debug!("UDP received {} bytes from {}", len, from);
                        (TransportEvent::Data(Bytes::copy_from_slice(&buf[..len])), from)
                    }
                    Err(e) => {
                        // ICMP port unreachable surfaces here on some platforms
                        warn!("UDP receive error: {}", e);
                        (
                            TransportEvent::Error(e.to_string()),
                            SocketAddr::from(([0, 0, 0, 0], 0)),
                        )
                    }
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        UdpReceiver { rx }
    }

    /// Send to a specific address
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        self.socket
            .send_to(data, target)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }
}

/// UDP sender (to a specific remote)
#[derive(Clone)]
pub struct UdpSender {
    socket: Arc<UdpSocket>,
    send_lock: Arc<Mutex<()>>,
    remote: SocketAddr,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSender for UdpSender {
    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let _guard = self.send_lock.lock().await;
        self.socket
            .send_to(&data, self.remote)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

/// UDP receiver
pub struct UdpReceiver {
    rx: mpsc::Receiver<(TransportEvent, SocketAddr)>,
}

impl UdpReceiver {
    /// Receive the next event with source address
    pub async fn recv_from(&mut self) -> Option<(TransportEvent, SocketAddr)> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_bind() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn test_closed_sender_rejects() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let sender = transport.sender_to(transport.local_addr().unwrap());
        sender.close().await.unwrap();
        assert!(matches!(
            sender.send(Bytes::from_static(b"x")).await,
            Err(TransportError::Closed)
        ));
    }
}
