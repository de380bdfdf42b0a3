//! Seams between the spa driver, its transport and its consumers

use async_trait::async_trait;
use intouch_core::{decode, encode, Command, Package};
use intouch_transport::{TransportEvent, TransportSender, UdpSender, UdpTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{BridgeError, CommandError, Result};

const LINK_CAPACITY: usize = 256;

/// Outbound half of a package link
#[async_trait]
pub trait PackageSender: Send + Sync {
    /// Send one package towards the spa
    async fn send(&self, package: Package) -> Result<()>;
}

/// Bidirectional package stream to a spa, direct or through a relay
pub struct Link {
    pub tx: Arc<dyn PackageSender>,
    pub rx: mpsc::Receiver<Package>,
}

impl Link {
    pub fn new(tx: Arc<dyn PackageSender>, rx: mpsc::Receiver<Package>) -> Self {
        Self { tx, rx }
    }
}

#[async_trait]
impl PackageSender for UdpSender {
    async fn send(&self, package: Package) -> Result<()> {
        TransportSender::send(self, encode(&package)).await?;
        Ok(())
    }
}

#[async_trait]
impl PackageSender for mpsc::Sender<Package> {
    async fn send(&self, package: Package) -> Result<()> {
        mpsc::Sender::send(self, package)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

/// Accepts write requests for the spa
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Submit a request; resolves once it was sent or rejected
    async fn submit(&self, command: Command) -> std::result::Result<(), CommandError>;
}

/// Link straight to a spa over a bound UDP socket.
///
/// Datagrams from other addresses are dropped. Every complete frame of a
/// datagram is delivered in order.
pub fn udp_link(transport: &UdpTransport, remote: SocketAddr) -> Link {
    let (tx, rx) = mpsc::channel(LINK_CAPACITY);
    let mut receiver = transport.start_receiver();

    tokio::spawn(async move {
        while let Some((event, from)) = receiver.recv_from().await {
            let data = match event {
                TransportEvent::Data(data) => data,
                TransportEvent::Error(e) => {
                    debug!("Ignoring receive error: {}", e);
                    continue;
                }
            };
            if from != remote {
                debug!("Dropping datagram from unexpected peer {}", from);
                continue;
            }

            let decoded = decode(&data);
            let dropped = decoded.discarded + (data.len() - decoded.consumed);
            if dropped > 0 {
                debug!("Dropped {} undecodable bytes from spa", dropped);
            }
            for package in decoded.packages {
                if tx.send(package).await.is_err() {
                    return;
                }
            }
        }
    });

    Link::new(Arc::new(transport.sender_to(remote)), rx)
}
