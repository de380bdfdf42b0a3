//! Transport trait definitions

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

use crate::error::Result;

/// Events produced by a receive loop
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Datagram received
    Data(Bytes),
    /// Receive error; the loop keeps running
    Error(String),
}

/// Trait for sending data to one peer
#[async_trait]
pub trait TransportSender: Send + Sync {
    /// Send one datagram
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Peer this sender writes to
    fn remote_addr(&self) -> SocketAddr;

    /// Check if the sender still accepts data
    fn is_connected(&self) -> bool;

    /// Close the sender; later sends fail with `Closed`
    async fn close(&self) -> Result<()>;
}
