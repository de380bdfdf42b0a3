//! in.touch 2 transport layer
//!
//! This crate provides the UDP plumbing used by the bridge:
//! - Bound sockets with a spawned receive loop
//! - Per-peer senders whose writes are serialized per socket
//! - Target resolution for `host:port` strings

pub mod error;
pub mod traits;
pub mod udp;

pub use error::{Result, TransportError};
pub use traits::{TransportEvent, TransportSender};
pub use udp::{resolve, UdpConfig, UdpReceiver, UdpSender, UdpTransport};
